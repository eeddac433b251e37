// Indicators backing the crossover detector: EMA/SMA for the cross itself,
// RSI for confirmation, ATR for the epsilon band and stop distances.

pub mod atr;
pub mod moving_average;
pub mod rsi;

pub use atr::{calculate_atr, calculate_atr_series};
pub use moving_average::{calculate_ema, calculate_ema_series, calculate_sma};
pub use rsi::calculate_rsi;
