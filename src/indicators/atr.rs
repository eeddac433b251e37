/// Average True Range with Wilder smoothing.
///
/// True range for a bar is the largest of the bar's own range and the gaps
/// from the previous close to the bar's high or low, so overnight jumps count
/// as volatility even when the bar itself is narrow.
use crate::models::Candle;

/// Latest ATR value, or `None` with fewer than `period + 1` candles.
pub fn calculate_atr(candles: &[Candle], period: usize) -> Option<f64> {
    calculate_atr_series(candles, period).last().copied()
}

/// Full ATR series. The first value corresponds to candle index `period`;
/// an empty vector means not enough candles.
pub fn calculate_atr_series(candles: &[Candle], period: usize) -> Vec<f64> {
    if period == 0 || candles.len() < period + 1 {
        return Vec::new();
    }

    let true_ranges: Vec<f64> = candles
        .windows(2)
        .map(|pair| {
            let (prev, cur) = (&pair[0], &pair[1]);
            (cur.high - cur.low)
                .max((cur.high - prev.close).abs())
                .max((cur.low - prev.close).abs())
        })
        .collect();

    // Seed with a simple average, then apply Wilder's recurrence
    let seed = true_ranges[..period].iter().sum::<f64>() / period as f64;
    let mut series = Vec::with_capacity(true_ranges.len() - period + 1);
    series.push(seed);

    let mut atr = seed;
    for tr in &true_ranges[period..] {
        atr = (atr * (period as f64 - 1.0) + tr) / period as f64;
        series.push(atr);
    }
    series
}
