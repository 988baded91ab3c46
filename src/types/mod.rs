pub mod account;
pub mod connection;
pub mod contract;
pub mod market;
pub mod protocol;
pub mod risk;

pub use account::*;
pub use connection::*;
pub use contract::*;
pub use market::*;
pub use protocol::*;
pub use risk::*;
