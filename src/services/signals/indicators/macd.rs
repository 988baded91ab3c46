//! MACD (Moving Average Convergence Divergence).

use crate::types::MacdValue;

use super::Ema;

/// Signal line as a fraction of the MACD value.
///
/// This is an approximation, not an EMA of the MACD series. Changing it
/// changes the numeric output consumers see.
pub const MACD_SIGNAL_APPROXIMATION: f64 = 0.9;

/// MACD indicator.
///
/// - MACD Line = EMA(12) - EMA(26), latest values
/// - Signal Line = MACD Line * [`MACD_SIGNAL_APPROXIMATION`]
/// - Histogram = MACD Line - Signal Line
pub struct Macd {
    fast_period: usize,
    slow_period: usize,
}

impl Default for Macd {
    fn default() -> Self {
        Self {
            fast_period: 12,
            slow_period: 26,
        }
    }
}

impl Macd {
    pub fn calculate(&self, closes: &[f64]) -> Option<MacdValue> {
        let fast = Ema::new(self.fast_period).latest(closes)?;
        let slow = Ema::new(self.slow_period).latest(closes)?;

        let macd = fast - slow;
        let signal = macd * MACD_SIGNAL_APPROXIMATION;
        Some(MacdValue {
            macd,
            signal,
            histogram: macd - signal,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_macd_insufficient_data() {
        assert!(Macd::default().calculate(&[100.0; 25]).is_none());
    }

    #[test]
    fn test_macd_signal_is_scaled_macd() {
        let closes: Vec<f64> = (0..60).map(|i| 100.0 + i as f64).collect();
        let value = Macd::default().calculate(&closes).unwrap();

        // Rising prices: fast EMA above slow EMA
        assert!(value.macd > 0.0);
        assert!((value.signal - value.macd * 0.9).abs() < 1e-12);
        assert!((value.histogram - value.macd * 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_macd_flat_series() {
        let value = Macd::default().calculate(&[42.0; 30]).unwrap();
        assert_eq!(value.macd, 0.0);
        assert_eq!(value.histogram, 0.0);
    }
}
