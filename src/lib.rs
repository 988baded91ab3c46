//! Tradewire - realtime trading-session client for a binary-options broker

pub mod config;
pub mod context;
pub mod error;
pub mod services;
pub mod types;
pub mod websocket;

pub use config::{Config, ConnectionConfig};
pub use context::{RiskActionReport, TradingContext};
pub use error::{AppError, Result};
pub use services::{AccountService, MarketDataService, RiskManager, TradeEngine};
pub use websocket::{ApiClient, Connector, MemoryConnector, Subscription, WsConnector};
