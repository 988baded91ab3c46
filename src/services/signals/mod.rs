//! Technical analysis over historical candles.
//!
//! Indicators operate on closing prices pulled from candle history, not on
//! the live tick stream. [`analyze_candles`] composes them into one
//! [`MarketAnalysis`].

pub mod indicators;

use crate::error::{AppError, Result};
use crate::types::{Candle, MarketAnalysis, Trend};
use indicators::{Levels, Macd, Rsi, Sma};

/// Bars used for the rate-of-change momentum figure.
pub const MOMENTUM_PERIOD: usize = 10;

/// Compose trend, momentum, volatility and indicators for one symbol.
pub fn analyze_candles(symbol: &str, candles: &[Candle]) -> Result<MarketAnalysis> {
    let last = candles
        .last()
        .ok_or_else(|| AppError::Validation(format!("no candle history for {}", symbol)))?;
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

    let sma20 = Sma::new(20).latest(&closes);
    let sma50 = Sma::new(50).latest(&closes);

    Ok(MarketAnalysis {
        symbol: symbol.to_string(),
        price: last.close,
        trend: classify_trend(last.close, sma20, sma50),
        sma20,
        sma50,
        rsi: Rsi::default().calculate(&closes),
        macd: Macd::default().calculate(&closes),
        momentum: rate_of_change(&closes, MOMENTUM_PERIOD),
        volatility: return_volatility(&closes),
        levels: Levels::default().calculate(candles),
        timestamp: last.epoch,
    })
}

/// SMA20 vs SMA50 crossover, confirmed by price vs SMA20.
pub fn classify_trend(price: f64, sma20: Option<f64>, sma50: Option<f64>) -> Trend {
    match (sma20, sma50) {
        (Some(fast), Some(slow)) if fast > slow && price > fast => Trend::Bullish,
        (Some(fast), Some(slow)) if fast < slow && price < fast => Trend::Bearish,
        _ => Trend::Sideways,
    }
}

/// Percent change over the last `period` bars. Zero without enough history.
pub fn rate_of_change(closes: &[f64], period: usize) -> f64 {
    if closes.len() <= period {
        return 0.0;
    }
    let current = closes[closes.len() - 1];
    let base = closes[closes.len() - 1 - period];
    if base == 0.0 {
        return 0.0;
    }
    (current - base) / base * 100.0
}

/// Population standard deviation of 1-bar percent returns.
pub fn return_volatility(closes: &[f64]) -> f64 {
    let returns: Vec<f64> = closes
        .windows(2)
        .filter(|pair| pair[0] != 0.0)
        .map(|pair| (pair[1] - pair[0]) / pair[0] * 100.0)
        .collect();
    if returns.len() < 2 {
        return 0.0;
    }

    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candles_from(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, close)| Candle {
                epoch: 1_700_000_000 + i as i64 * 60,
                open: *close,
                high: close + 0.5,
                low: close - 0.5,
                close: *close,
            })
            .collect()
    }

    #[test]
    fn test_analyze_uptrend_is_bullish() {
        let closes: Vec<f64> = (0..80).map(|i| 100.0 + i as f64).collect();
        let analysis = analyze_candles("R_100", &candles_from(&closes)).unwrap();

        assert_eq!(analysis.trend, Trend::Bullish);
        assert_eq!(analysis.price, 179.0);
        assert_eq!(analysis.rsi, 100.0);
        assert!(analysis.momentum > 0.0);
        assert!(analysis.macd.is_some());
    }

    #[test]
    fn test_analyze_downtrend_is_bearish() {
        let closes: Vec<f64> = (0..80).map(|i| 300.0 - i as f64).collect();
        let analysis = analyze_candles("R_100", &candles_from(&closes)).unwrap();
        assert_eq!(analysis.trend, Trend::Bearish);
        assert!(analysis.momentum < 0.0);
    }

    #[test]
    fn test_short_history_is_sideways() {
        let analysis = analyze_candles("R_50", &candles_from(&[10.0, 11.0, 12.0])).unwrap();
        assert_eq!(analysis.trend, Trend::Sideways);
        assert_eq!(analysis.rsi, 50.0);
        assert!(analysis.sma20.is_none());
        assert!(analysis.macd.is_none());
    }

    #[test]
    fn test_empty_history_is_an_error() {
        assert!(analyze_candles("R_50", &[]).is_err());
    }

    #[test]
    fn test_rate_of_change() {
        let closes: Vec<f64> = (0..11).map(|i| 100.0 + i as f64).collect();
        assert!((rate_of_change(&closes, 10) - 10.0).abs() < 1e-9);
        assert_eq!(rate_of_change(&closes[..10], 10), 0.0);
    }

    #[test]
    fn test_volatility_of_constant_returns_is_zero() {
        let closes: Vec<f64> = (0..10).map(|i| 100.0 * 1.01f64.powi(i)).collect();
        assert!(return_volatility(&closes) < 1e-9);
        assert_eq!(return_volatility(&[1.0, 2.0]), 0.0);
    }
}
