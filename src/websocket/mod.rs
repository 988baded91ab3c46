pub mod connection;
pub mod correlator;
pub mod registry;
pub mod transport;

pub use connection::{ApiClient, Subscription};
pub use correlator::Correlator;
pub use registry::{PushHandler, SubscriptionRegistry};
pub use transport::{Connector, Frame, Link, LinkEvent, MemoryConnector, ServerLink, WsConnector};
