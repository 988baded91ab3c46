//! Relative Strength Index (RSI).

/// Neutral reading returned when there is not enough history.
pub const RSI_NEUTRAL: f64 = 50.0;

/// RSI over closing prices.
///
/// Average gain over average loss of the trailing `period` deltas, using
/// simple averages. Values range from 0-100:
/// - Below 30: Oversold
/// - Above 70: Overbought
pub struct Rsi {
    period: usize,
}

impl Default for Rsi {
    fn default() -> Self {
        Self { period: 14 }
    }
}

impl Rsi {
    pub fn new(period: usize) -> Self {
        Self { period }
    }

    /// Closes needed for a real reading.
    fn min_periods(&self) -> usize {
        self.period + 1
    }

    pub fn calculate(&self, closes: &[f64]) -> f64 {
        if self.period == 0 || closes.len() < self.min_periods() {
            return RSI_NEUTRAL;
        }

        let recent = &closes[closes.len() - self.min_periods()..];
        let (gains, losses) = recent
            .windows(2)
            .map(|pair| pair[1] - pair[0])
            .fold((0.0, 0.0), |(gains, losses), change| {
                if change > 0.0 {
                    (gains + change, losses)
                } else {
                    (gains, losses - change)
                }
            });

        let avg_gain = gains / self.period as f64;
        let avg_loss = losses / self.period as f64;
        if avg_loss == 0.0 {
            return 100.0;
        }

        let rs = avg_gain / avg_loss;
        100.0 - (100.0 / (1.0 + rs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uptrend(count: usize) -> Vec<f64> {
        (0..count).map(|i| 100.0 + i as f64 * 1.5).collect()
    }

    fn downtrend(count: usize) -> Vec<f64> {
        (0..count).map(|i| 200.0 - i as f64 * 1.5).collect()
    }

    #[test]
    fn test_rsi_insufficient_data() {
        let rsi = Rsi::default();
        assert_eq!(rsi.calculate(&uptrend(14)), 50.0);
        assert_eq!(rsi.calculate(&[]), 50.0);
    }

    #[test]
    fn test_rsi_uptrend() {
        let rsi = Rsi::default();
        assert_eq!(rsi.calculate(&uptrend(15)), 100.0);
        assert_eq!(rsi.calculate(&uptrend(50)), 100.0);
    }

    #[test]
    fn test_rsi_downtrend() {
        let rsi = Rsi::default();
        assert!(rsi.calculate(&downtrend(50)).abs() < 1e-9);
    }

    #[test]
    fn test_rsi_balanced_moves() {
        // Alternating +1 / -1 over 14 deltas
        let closes: Vec<f64> = (0..15).map(|i| if i % 2 == 0 { 100.0 } else { 101.0 }).collect();
        let value = Rsi::default().calculate(&closes);
        assert!((value - 50.0).abs() < 1e-9);
    }
}
