/// Simple moving average of the trailing `period` prices.
pub fn calculate_sma(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }
    let window = &prices[prices.len() - period..];
    Some(window.iter().sum::<f64>() / period as f64)
}

/// Exponential moving average at the last bar.
///
/// Seeds with the SMA of the first `period` prices, then applies the
/// standard 2/(n+1) smoothing over the rest.
pub fn calculate_ema(prices: &[f64], period: usize) -> Option<f64> {
    calculate_ema_series(prices, period).and_then(|s| s.last().copied())
}

/// Full EMA series, aligned with `prices[period - 1..]`: element 0 is the
/// seed SMA at bar `period - 1`, the last element is the EMA at the final
/// bar. Crossover detection needs the previous bar's value as well as the
/// current one, so the whole series is exposed.
pub fn calculate_ema_series(prices: &[f64], period: usize) -> Option<Vec<f64>> {
    if period == 0 || prices.len() < period {
        return None;
    }

    let alpha = 2.0 / (period as f64 + 1.0);
    let seed = prices[..period].iter().sum::<f64>() / period as f64;

    let series = prices[period..]
        .iter()
        .scan(seed, |ema, price| {
            *ema += (price - *ema) * alpha;
            Some(*ema)
        })
        .collect::<Vec<_>>();

    let mut out = Vec::with_capacity(series.len() + 1);
    out.push(seed);
    out.extend(series);
    Some(out)
}
