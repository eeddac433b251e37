// Market signal detector: EMA fast/slow crossover on closed bars with an
// ATR-scaled epsilon band, a slope filter on the fast line, and RSI
// agreement on the confirmation timeframe.

use chrono::Utc;
use serde_json::json;

use crate::indicators::{calculate_atr, calculate_atr_series, calculate_ema_series, calculate_rsi};
use crate::models::{Candle, Signal, SignalKind, UserConfig};

pub const STRATEGY_NAME: &str = "ema_crossover";

/// Fraction of current ATR used as the crossover dead band. Suppresses
/// hairline re-crosses in quiet markets.
const EPSILON_ATR_FRACTION: f64 = 0.01;

pub struct SignalDetector {
    config: UserConfig,
}

impl SignalDetector {
    pub fn new(config: UserConfig) -> Self {
        Self { config }
    }

    /// Evaluate the last closed bar of `candles` for a crossover.
    ///
    /// `candles` is the fast timeframe, oldest first, closed bars only.
    /// `confirmation` is the slower confirmation timeframe. Returns None
    /// when history is insufficient, no cross occurred, or the confirmation
    /// indicator disagrees. Never returns an error: a quiet market is not a
    /// failure.
    pub fn detect(&self, candles: &[Candle], confirmation: &[Candle]) -> Option<Signal> {
        if candles.len() < self.config.min_bars_required() {
            return None;
        }

        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let fast = calculate_ema_series(&closes, self.config.fast_window)?;
        let slow = calculate_ema_series(&closes, self.config.slow_window)?;
        if fast.len() < 2 || slow.len() < 2 {
            return None;
        }

        let (curr_fast, prev_fast) = (fast[fast.len() - 1], fast[fast.len() - 2]);
        let (curr_slow, prev_slow) = (slow[slow.len() - 1], slow[slow.len() - 2]);

        let atr = calculate_atr(candles, self.config.atr_window);
        let eps = EPSILON_ATR_FRACTION * atr.unwrap_or(0.0);

        // Normalized slope of the fast line over the last bar.
        let fast_slope_pct = if prev_fast != 0.0 {
            (curr_fast - prev_fast) / prev_fast
        } else {
            0.0
        };

        let bullish_cross = prev_fast <= prev_slow + eps
            && curr_fast > curr_slow + eps
            && fast_slope_pct > 0.0;
        let bearish_cross = prev_fast >= prev_slow - eps
            && curr_fast < curr_slow - eps
            && fast_slope_pct < 0.0;

        let kind = if bullish_cross {
            SignalKind::EnterLong
        } else if bearish_cross {
            SignalKind::EnterShort
        } else {
            return None;
        };

        // Confirmation timeframe must agree with the cross direction.
        let confirm_closes: Vec<f64> = confirmation.iter().map(|c| c.close).collect();
        let rsi = calculate_rsi(&confirm_closes, self.config.confirmation_indicator_window)?;
        match kind {
            SignalKind::EnterLong if rsi <= 50.0 => return None,
            SignalKind::EnterShort if rsi >= 50.0 => return None,
            _ => {}
        }

        let last = candles.last()?;
        let separation_pct = if curr_slow != 0.0 {
            (curr_fast - curr_slow) / curr_slow
        } else {
            0.0
        };

        let atr_series = calculate_atr_series(candles, self.config.atr_window);
        let atr_avg = if atr_series.is_empty() {
            None
        } else {
            Some(atr_series.iter().sum::<f64>() / atr_series.len() as f64)
        };
        let avg_volume = candles.iter().map(|c| c.volume).sum::<f64>() / candles.len() as f64;

        let ema_metrics = json!({
            "fast_window": self.config.fast_window,
            "slow_window": self.config.slow_window,
            "fast": curr_fast,
            "slow": curr_slow,
            "prev_fast": prev_fast,
            "prev_slow": prev_slow,
            "epsilon": eps,
            "separation_pct": separation_pct,
            "fast_slope_pct": fast_slope_pct,
        });
        let confirmation_metrics = json!({
            "rsi_window": self.config.confirmation_indicator_window,
            "rsi": rsi,
            "atr": atr,
            "atr_avg": atr_avg,
            "avg_volume": avg_volume,
            "last_volume": last.volume,
        });

        Some(Signal {
            id: None,
            symbol_pair: last.symbol.clone(),
            kind,
            bar_ts: last.timestamp,
            price: last.close,
            atr,
            ema_metrics: ema_metrics.to_string(),
            confirmation_metrics: confirmation_metrics.to_string(),
            strategy: STRATEGY_NAME.to_string(),
            detected_at: Utc::now(),
            processed: false,
        })
    }
}
