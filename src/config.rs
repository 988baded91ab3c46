use crate::error::{AppError, Result};
use crate::types::RiskParameters;
use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Broker connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// WebSocket endpoint, without query string.
    pub endpoint: String,
    /// Application identifier appended as `app_id`.
    pub app_id: String,
    /// Reconnect attempts after an unexpected close (default: 5).
    pub max_reconnect_attempts: u32,
    /// First reconnect delay; doubles per attempt (default: 1s).
    pub reconnect_base_delay: Duration,
    /// Keep-alive ping interval (default: 30s).
    pub heartbeat_interval: Duration,
    /// Bound on establishing the transport (default: 10s).
    pub connect_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://ws.derivws.com/websockets/v3".to_string(),
            app_id: "1089".to_string(),
            max_reconnect_attempts: 5,
            reconnect_base_delay: Duration::from_millis(1000),
            heartbeat_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl ConnectionConfig {
    /// Full connection URL.
    pub fn url(&self) -> String {
        let separator = if self.endpoint.contains('?') { '&' } else { '?' };
        format!("{}{}app_id={}", self.endpoint, separator, self.app_id)
    }

    /// Delay before reconnect attempt `attempt` (zero-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.reconnect_base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.endpoint.starts_with("ws://") || self.endpoint.starts_with("wss://")) {
            return Err(AppError::Config(format!(
                "endpoint must be a ws:// or wss:// URL, got {}",
                self.endpoint
            )));
        }
        if self.app_id.trim().is_empty() {
            return Err(AppError::Config("app_id is required".to_string()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(AppError::Config("heartbeat interval must be non-zero".to_string()));
        }
        if self.connect_timeout.is_zero() {
            return Err(AppError::Config("connect timeout must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub connection: ConnectionConfig,
    pub risk: RiskParameters,
    /// Bearer token from the broker's OAuth flow.
    pub api_token: Option<String>,
    /// Extra per-account tokens, keyed by login id.
    pub account_tokens: HashMap<String, String>,
    /// Symbols to stream ticks for.
    pub symbols: Vec<String>,
    /// How often the binary runs the risk monitor.
    pub risk_monitor_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            risk: RiskParameters::default(),
            api_token: None,
            account_tokens: HashMap::new(),
            symbols: vec!["R_100".to_string()],
            risk_monitor_interval: Duration::from_secs(60),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| AppError::Config(format!("invalid value for {}: {:?}", key, raw))),
        Err(_) => Ok(default),
    }
}

fn env_opt<T: FromStr>(key: &str) -> Result<Option<T>> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| AppError::Config(format!("invalid value for {}: {:?}", key, raw))),
        _ => Ok(None),
    }
}

/// Parse `LOGINID:token,LOGINID2:token2`.
fn parse_account_tokens(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (login_id, token) = pair.split_once(':')?;
            let (login_id, token) = (login_id.trim(), token.trim());
            if login_id.is_empty() || token.is_empty() {
                None
            } else {
                Some((login_id.to_string(), token.to_string()))
            }
        })
        .collect()
}

/// Parse `SYMBOL:limit,SYMBOL2:limit2`.
fn parse_symbol_limits(raw: &str) -> Result<HashMap<String, f64>> {
    let mut limits = HashMap::new();
    for pair in raw.split(',').filter(|p| !p.trim().is_empty()) {
        let (symbol, limit) = pair
            .split_once(':')
            .ok_or_else(|| AppError::Config(format!("invalid symbol limit: {:?}", pair)))?;
        let limit: f64 = limit
            .trim()
            .parse()
            .map_err(|_| AppError::Config(format!("invalid symbol limit: {:?}", pair)))?;
        limits.insert(symbol.trim().to_string(), limit);
    }
    Ok(limits)
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = ConnectionConfig::default();
        let connection = ConnectionConfig {
            endpoint: env::var("BROKER_WS_URL").unwrap_or(defaults.endpoint),
            app_id: env::var("BROKER_APP_ID").unwrap_or(defaults.app_id),
            max_reconnect_attempts: env_or("RECONNECT_MAX_ATTEMPTS", defaults.max_reconnect_attempts)?,
            reconnect_base_delay: Duration::from_millis(env_or("RECONNECT_BASE_DELAY_MS", 1000u64)?),
            heartbeat_interval: Duration::from_secs(env_or("HEARTBEAT_INTERVAL_SECS", 30u64)?),
            connect_timeout: Duration::from_secs(env_or("CONNECT_TIMEOUT_SECS", 10u64)?),
        };
        connection.validate()?;

        let base = RiskParameters::default();
        let risk = RiskParameters {
            max_risk_per_trade_pct: env_or("RISK_MAX_PER_TRADE_PCT", base.max_risk_per_trade_pct)?,
            max_daily_loss: env_or("RISK_MAX_DAILY_LOSS", base.max_daily_loss)?,
            max_drawdown_pct: env_or("RISK_MAX_DRAWDOWN_PCT", base.max_drawdown_pct)?,
            max_open_positions: env_or("RISK_MAX_OPEN_POSITIONS", base.max_open_positions)?,
            max_risk_per_symbol: env_or("RISK_MAX_PER_SYMBOL", base.max_risk_per_symbol)?,
            symbol_limits: match env::var("RISK_SYMBOL_LIMITS") {
                Ok(raw) => parse_symbol_limits(&raw)?,
                Err(_) => HashMap::new(),
            },
            stop_loss_pct: env_opt("RISK_STOP_LOSS_PCT")?,
            take_profit_pct: env_opt("RISK_TAKE_PROFIT_PCT")?,
            min_risk_reward: env_opt("RISK_MIN_RISK_REWARD")?,
            max_margin_utilization_pct: env_or(
                "RISK_MAX_MARGIN_UTILIZATION_PCT",
                base.max_margin_utilization_pct,
            )?,
        };
        risk.validate()?;

        let symbols: Vec<String> = env::var("TRADING_SYMBOLS")
            .unwrap_or_else(|_| "R_100".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            connection,
            risk,
            api_token: env::var("BROKER_API_TOKEN").ok().filter(|t| !t.is_empty()),
            account_tokens: env::var("BROKER_ACCOUNT_TOKENS")
                .map(|raw| parse_account_tokens(&raw))
                .unwrap_or_default(),
            symbols,
            risk_monitor_interval: Duration::from_secs(env_or("RISK_MONITOR_INTERVAL_SECS", 60u64)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_appends_app_id() {
        let config = ConnectionConfig::default();
        assert_eq!(config.url(), "wss://ws.derivws.com/websockets/v3?app_id=1089");

        let config = ConnectionConfig {
            endpoint: "wss://example.test/ws?l=en".to_string(),
            ..ConnectionConfig::default()
        };
        assert_eq!(config.url(), "wss://example.test/ws?l=en&app_id=1089");
    }

    #[test]
    fn test_backoff_doubles() {
        let config = ConnectionConfig::default();
        let delays: Vec<u64> = (0..5).map(|a| config.backoff_delay(a).as_millis() as u64).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000]);
    }

    #[test]
    fn test_validate_rejects_http_endpoint() {
        let config = ConnectionConfig {
            endpoint: "https://example.test".to_string(),
            ..ConnectionConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_account_tokens() {
        let tokens = parse_account_tokens("CR1:abc, VRTC2:def,broken,:x");
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens["CR1"], "abc");
        assert_eq!(tokens["VRTC2"], "def");
    }

    #[test]
    fn test_parse_symbol_limits() {
        let limits = parse_symbol_limits("R_100:50,R_50:25.5").unwrap();
        assert_eq!(limits["R_50"], 25.5);
        assert!(parse_symbol_limits("R_100").is_err());
    }
}
