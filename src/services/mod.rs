pub mod account;
pub mod contracts;
pub mod market_data;
pub mod risk;
pub mod signals;

pub use account::AccountService;
pub use contracts::TradeEngine;
pub use market_data::MarketDataService;
pub use risk::RiskManager;
pub use signals::analyze_candles;
