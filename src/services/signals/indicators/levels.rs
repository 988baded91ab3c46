//! Naive support/resistance detection.

use crate::types::{Candle, SupportResistance};

/// Relative distance within which two extremes count as the same level.
const LEVEL_TOLERANCE: f64 = 0.002;

/// Local-extremum scan over candle lows and highs.
///
/// A bar is a support candidate when its low is the lowest within
/// `window` bars on each side, and a resistance candidate when its high is
/// the highest. Nearby candidates merge into one level. Levels rank by
/// touch count, then by how recently they were touched.
pub struct Levels {
    window: usize,
    max_levels: usize,
}

impl Default for Levels {
    fn default() -> Self {
        Self {
            window: 5,
            max_levels: 3,
        }
    }
}

struct Level {
    price: f64,
    touches: usize,
    last_index: usize,
}

impl Levels {
    pub fn calculate(&self, candles: &[Candle]) -> SupportResistance {
        if candles.len() < self.window * 2 + 1 {
            return SupportResistance::default();
        }

        let mut supports = Vec::new();
        let mut resistances = Vec::new();
        for i in self.window..candles.len() - self.window {
            let neighbourhood = &candles[i - self.window..=i + self.window];
            let low = candles[i].low;
            let high = candles[i].high;
            if neighbourhood.iter().all(|c| c.low >= low) {
                merge(&mut supports, low, i);
            }
            if neighbourhood.iter().all(|c| c.high <= high) {
                merge(&mut resistances, high, i);
            }
        }

        SupportResistance {
            support: self.strongest(supports),
            resistance: self.strongest(resistances),
        }
    }

    fn strongest(&self, mut levels: Vec<Level>) -> Vec<f64> {
        levels.sort_by(|a, b| {
            b.touches
                .cmp(&a.touches)
                .then(b.last_index.cmp(&a.last_index))
        });
        levels
            .into_iter()
            .take(self.max_levels)
            .map(|level| level.price)
            .collect()
    }
}

fn merge(levels: &mut Vec<Level>, price: f64, index: usize) {
    let existing = levels
        .iter_mut()
        .find(|level| (level.price - price).abs() <= level.price.abs() * LEVEL_TOLERANCE);
    match existing {
        Some(level) => {
            level.touches += 1;
            level.last_index = index;
            level.price = price;
        }
        None => levels.push(Level {
            price,
            touches: 1,
            last_index: index,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(epoch: i64, low: f64, high: f64) -> Candle {
        Candle {
            epoch,
            open: (low + high) / 2.0,
            high,
            low,
            close: (low + high) / 2.0,
        }
    }

    /// Oscillates between 90 and 110 with a period of 12 bars.
    fn oscillating(count: usize) -> Vec<Candle> {
        (0..count)
            .map(|i| {
                let phase = (i % 12) as f64;
                let mid = if phase < 6.0 { 90.0 + phase * 4.0 } else { 114.0 - (phase - 6.0) * 4.0 };
                candle(i as i64 * 60, mid - 1.0, mid + 1.0)
            })
            .collect()
    }

    #[test]
    fn test_levels_need_full_window() {
        let levels = Levels::default().calculate(&oscillating(10));
        assert!(levels.support.is_empty());
        assert!(levels.resistance.is_empty());
    }

    #[test]
    fn test_levels_find_repeated_extremes() {
        let levels = Levels::default().calculate(&oscillating(60));
        assert_eq!(levels.support.first().copied(), Some(89.0));
        assert_eq!(levels.resistance.first().copied(), Some(115.0));
        assert!(levels.support.len() <= 3);
        assert!(levels.resistance.len() <= 3);
    }

    #[test]
    fn test_monotonic_series_has_no_interior_extremes() {
        let candles: Vec<Candle> = (0..30).map(|i| candle(i, 100.0 + i as f64, 101.0 + i as f64)).collect();
        let levels = Levels::default().calculate(&candles);
        assert!(levels.support.is_empty());
        assert!(levels.resistance.is_empty());
    }
}
