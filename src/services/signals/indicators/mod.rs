//! Technical indicator implementations.

pub mod ema;
pub mod levels;
pub mod macd;
pub mod rsi;
pub mod sma;

pub use ema::Ema;
pub use levels::Levels;
pub use macd::{Macd, MACD_SIGNAL_APPROXIMATION};
pub use rsi::{Rsi, RSI_NEUTRAL};
pub use sma::Sma;
