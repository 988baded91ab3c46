//! Exponential Moving Average (EMA).

/// EMA over closing prices.
///
/// Seeded with the SMA of the first `period` closes, then
/// `ema = (close - ema) * k + ema` with `k = 2 / (period + 1)`.
pub struct Ema {
    period: usize,
}

impl Ema {
    pub fn new(period: usize) -> Self {
        Self { period }
    }

    /// EMA from the seed onward, oldest first.
    pub fn series(&self, closes: &[f64]) -> Vec<f64> {
        if self.period == 0 || closes.len() < self.period {
            return Vec::new();
        }

        let multiplier = 2.0 / (self.period as f64 + 1.0);
        let seed = closes.iter().take(self.period).sum::<f64>() / self.period as f64;

        let mut ema = Vec::with_capacity(closes.len() - self.period + 1);
        ema.push(seed);
        let mut current = seed;
        for close in &closes[self.period..] {
            current = (close - current) * multiplier + current;
            ema.push(current);
        }
        ema
    }

    pub fn latest(&self, closes: &[f64]) -> Option<f64> {
        self.series(closes).last().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ema_seeded_with_sma() {
        let ema = Ema::new(3);
        let series = ema.series(&[2.0, 4.0, 6.0, 8.0]);
        assert_eq!(series.len(), 2);
        assert_eq!(series[0], 4.0);
        // k = 0.5: (8 - 4) * 0.5 + 4
        assert_eq!(series[1], 6.0);
    }

    #[test]
    fn test_ema_constant_series() {
        let ema = Ema::new(12);
        assert_eq!(ema.latest(&[50.0; 40]), Some(50.0));
    }

    #[test]
    fn test_ema_insufficient_data() {
        assert!(Ema::new(26).latest(&[1.0; 25]).is_none());
    }
}
