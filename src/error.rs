use thiserror::Error;

/// Application error types.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AppError {
    #[error("Connection not available")]
    ConnectionNotAvailable,

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    /// Structured error returned by the broker for a request.
    #[error("API error [{code}]: {message}")]
    Api { code: String, message: String },

    /// Broker rejected a buy or sell.
    #[error("Trade rejected [{code}]: {message}")]
    Trade { code: String, message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Disabled: {0}")]
    Disabled(String),

    #[error("Trading is halted by risk management")]
    TradingHalted,

    /// A pre-trade risk check declined the trade.
    #[error("Rejected by risk policy: {0}")]
    RiskRejected(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::Serialization(e.to_string())
    }
}

impl AppError {
    /// Plain reason string suitable for a user-facing notification.
    pub fn user_message(&self) -> String {
        match self {
            AppError::Api { message, .. } | AppError::Trade { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Broker error code, if this error came from the broker.
    pub fn code(&self) -> Option<&str> {
        match self {
            AppError::Api { code, .. } | AppError::Trade { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Re-tag a broker API error as a trade rejection.
    pub(crate) fn into_trade(self) -> Self {
        match self {
            AppError::Api { code, message } => AppError::Trade { code, message },
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
