/// Relative Strength Index over the last `period` price changes.
///
/// The detector uses this as a direction filter, not an overbought oscillator:
/// readings above 50 confirm long momentum, below 50 confirm short momentum.
/// Returns `None` when fewer than `period + 1` prices are available.
pub fn calculate_rsi(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period + 1 {
        return None;
    }

    // Only the trailing `period` changes matter
    let window = &prices[prices.len() - period - 1..];
    let (gain_sum, loss_sum) = window.windows(2).fold((0.0, 0.0), |(g, l), pair| {
        let change = pair[1] - pair[0];
        if change >= 0.0 {
            (g + change, l)
        } else {
            (g, l - change)
        }
    });

    let avg_gain = gain_sum / period as f64;
    let avg_loss = loss_sum / period as f64;

    if avg_loss == 0.0 {
        return Some(100.0);
    }

    let rs = avg_gain / avg_loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rsi_rising_series_reads_above_50() {
        let prices = vec![100.0, 101.0, 100.5, 102.0, 101.5, 103.0, 104.0];
        let rsi = calculate_rsi(&prices, 6).unwrap();
        assert!(rsi > 50.0 && rsi < 100.0, "got {}", rsi);
    }

    #[test]
    fn test_rsi_falling_series_reads_below_50() {
        let prices = vec![104.0, 103.0, 103.5, 102.0, 102.5, 101.0, 100.0];
        let rsi = calculate_rsi(&prices, 6).unwrap();
        assert!(rsi < 50.0 && rsi > 0.0, "got {}", rsi);
    }

    #[test]
    fn test_rsi_monotone_gains_saturate_at_100() {
        let prices = vec![100.0, 101.0, 102.0, 103.0, 104.0, 105.0];
        assert_eq!(calculate_rsi(&prices, 5), Some(100.0));
    }

    #[test]
    fn test_rsi_only_uses_trailing_window() {
        // A crash before the window must not leak into the reading
        let prices = vec![200.0, 150.0, 100.0, 101.0, 102.0, 103.0];
        assert_eq!(calculate_rsi(&prices, 3), Some(100.0));
    }

    #[test]
    fn test_rsi_needs_period_plus_one_prices() {
        assert!(calculate_rsi(&[100.0, 102.0, 101.0], 14).is_none());
        assert!(calculate_rsi(&[100.0, 102.0], 2).is_none());
        assert!(calculate_rsi(&[100.0, 102.0, 101.0], 0).is_none());
    }
}
