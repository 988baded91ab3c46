use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use super::Contract;

/// Risk limits applied to every trade validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskParameters {
    /// Share of balance risked per trade (default: 2%).
    pub max_risk_per_trade_pct: f64,
    /// Realized loss that stops trading for the day (default: 100).
    pub max_daily_loss: f64,
    /// Decline from peak balance that stops trading (default: 20%).
    pub max_drawdown_pct: f64,
    /// Maximum concurrently open positions (default: 5).
    pub max_open_positions: usize,
    /// Maximum total stake on one symbol (default: 200).
    pub max_risk_per_symbol: f64,
    /// Per-symbol overrides of `max_risk_per_symbol`.
    #[serde(default)]
    pub symbol_limits: HashMap<String, f64>,
    #[serde(default)]
    pub stop_loss_pct: Option<f64>,
    #[serde(default)]
    pub take_profit_pct: Option<f64>,
    /// Minimum (payout - stake) / stake when a payout is known.
    #[serde(default)]
    pub min_risk_reward: Option<f64>,
    /// Open stake as a share of balance that triggers alerts (default: 50%).
    pub max_margin_utilization_pct: f64,
}

impl Default for RiskParameters {
    fn default() -> Self {
        Self {
            max_risk_per_trade_pct: 2.0,
            max_daily_loss: 100.0,
            max_drawdown_pct: 20.0,
            max_open_positions: 5,
            max_risk_per_symbol: 200.0,
            symbol_limits: HashMap::new(),
            stop_loss_pct: None,
            take_profit_pct: None,
            min_risk_reward: None,
            max_margin_utilization_pct: 50.0,
        }
    }
}

impl RiskParameters {
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("max_risk_per_trade_pct", self.max_risk_per_trade_pct),
            ("max_daily_loss", self.max_daily_loss),
            ("max_drawdown_pct", self.max_drawdown_pct),
            ("max_risk_per_symbol", self.max_risk_per_symbol),
            ("max_margin_utilization_pct", self.max_margin_utilization_pct),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(AppError::Config(format!("{} must be positive, got {}", name, value)));
            }
        }
        for (name, value) in [
            ("max_risk_per_trade_pct", self.max_risk_per_trade_pct),
            ("max_drawdown_pct", self.max_drawdown_pct),
        ] {
            if value > 100.0 {
                return Err(AppError::Config(format!("{} cannot exceed 100, got {}", name, value)));
            }
        }
        if self.max_open_positions == 0 {
            return Err(AppError::Config("max_open_positions must be at least 1".to_string()));
        }
        for (symbol, limit) in &self.symbol_limits {
            if !(limit.is_finite() && *limit > 0.0) {
                return Err(AppError::Config(format!(
                    "risk limit for {} must be positive, got {}",
                    symbol, limit
                )));
            }
        }
        for (name, value) in [
            ("stop_loss_pct", self.stop_loss_pct),
            ("take_profit_pct", self.take_profit_pct),
            ("min_risk_reward", self.min_risk_reward),
        ] {
            if let Some(v) = value {
                if !(v.is_finite() && v > 0.0) {
                    return Err(AppError::Config(format!("{} must be positive, got {}", name, v)));
                }
            }
        }
        Ok(())
    }

    /// Exposure cap for a symbol, honouring overrides.
    pub fn symbol_limit(&self, symbol: &str) -> f64 {
        self.symbol_limits
            .get(symbol)
            .copied()
            .unwrap_or(self.max_risk_per_symbol)
    }
}

/// Output of position sizing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PositionSize {
    /// Suggested stake.
    pub stake: f64,
    /// Upper bound: min(2x recommended, 10% of balance).
    pub max_stake: f64,
    /// Budgeted loss for the trade.
    pub risk_amount: f64,
    /// Price distance to the stop, when one was given.
    pub risk_per_unit: Option<f64>,
}

/// A trade about to be submitted, as seen by the risk checks.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeRiskRequest {
    pub symbol: String,
    pub stake: f64,
    /// Quoted payout, when known.
    pub payout: Option<f64>,
}

impl TradeRiskRequest {
    pub fn new(symbol: &str, stake: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            stake,
            payout: None,
        }
    }
}

/// Snapshot of an open position for risk evaluation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OpenPosition {
    pub contract_id: String,
    pub symbol: String,
    pub stake: f64,
    pub profit: f64,
}

impl From<&Contract> for OpenPosition {
    fn from(contract: &Contract) -> Self {
        Self {
            contract_id: contract.id.clone(),
            symbol: contract.symbol.clone(),
            stake: contract.buy_price,
            profit: contract.profit,
        }
    }
}

/// Outcome of a pre-trade risk check. A rejection is guidance, not an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskValidation {
    pub valid: bool,
    pub reason: Option<String>,
    pub max_stake: f64,
}

impl RiskValidation {
    pub fn approved(max_stake: f64) -> Self {
        Self {
            valid: true,
            reason: None,
            max_stake,
        }
    }

    pub fn rejected(reason: String, max_stake: f64) -> Self {
        Self {
            valid: false,
            reason: Some(reason),
            max_stake,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// What a risk alert asks the caller to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    ReducePosition,
    ClosePosition,
    StopTrading,
}

/// The monitored quantity that raised an alert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskMetric {
    Drawdown,
    DailyLoss,
    SymbolExposure(String),
    MarginUtilization,
}

impl fmt::Display for RiskMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskMetric::Drawdown => write!(f, "drawdown"),
            RiskMetric::DailyLoss => write!(f, "daily loss"),
            RiskMetric::SymbolExposure(symbol) => write!(f, "{} exposure", symbol),
            RiskMetric::MarginUtilization => write!(f, "margin utilization"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskAlert {
    pub metric: RiskMetric,
    pub severity: AlertSeverity,
    pub action: RecommendedAction,
    pub value: f64,
    pub limit: f64,
    pub message: String,
    pub timestamp: i64,
}
