//! Simple Moving Average (SMA).

/// SMA over closing prices.
///
/// One output per full window: the arithmetic mean of the trailing
/// `period` closes.
pub struct Sma {
    period: usize,
}

impl Sma {
    pub fn new(period: usize) -> Self {
        Self { period }
    }

    /// SMA for every full window, oldest first.
    pub fn series(&self, closes: &[f64]) -> Vec<f64> {
        if self.period == 0 || closes.len() < self.period {
            return Vec::new();
        }
        closes
            .windows(self.period)
            .map(|window| window.iter().sum::<f64>() / self.period as f64)
            .collect()
    }

    /// SMA of the trailing window.
    pub fn latest(&self, closes: &[f64]) -> Option<f64> {
        if self.period == 0 || closes.len() < self.period {
            return None;
        }
        let window = &closes[closes.len() - self.period..];
        Some(window.iter().sum::<f64>() / self.period as f64)
    }
}
