use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{BuyPayload, ProposalRequest};

const DURATION_UNITS: &[&str] = &["t", "s", "m", "h", "d"];
const BASES: &[&str] = &["stake", "payout"];

fn quote_key(symbol: &str, contract_type: &str, amount: f64, duration: u32, unit: &str) -> String {
    format!("{}|{}|{:.2}|{}|{}", symbol, contract_type, amount, duration, unit)
}

/// Parameters for quoting and buying a contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeParams {
    pub symbol: String,
    pub contract_type: String,
    /// Stake or payout amount, depending on `basis`.
    pub amount: f64,
    pub basis: String,
    pub currency: String,
    pub duration: u32,
    pub duration_unit: String,
    #[serde(default)]
    pub barrier: Option<String>,
    #[serde(default)]
    pub barrier2: Option<String>,
}

impl TradeParams {
    /// Stake-based parameters with no barriers.
    pub fn new(
        symbol: &str,
        contract_type: &str,
        amount: f64,
        duration: u32,
        duration_unit: &str,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            contract_type: contract_type.to_string(),
            amount,
            basis: "stake".to_string(),
            currency: "USD".to_string(),
            duration,
            duration_unit: duration_unit.to_string(),
            barrier: None,
            barrier2: None,
        }
    }

    pub fn with_currency(mut self, currency: &str) -> Self {
        self.currency = currency.to_string();
        self
    }

    pub fn with_barrier(mut self, barrier: &str) -> Self {
        self.barrier = Some(barrier.to_string());
        self
    }

    /// Check required fields before anything goes on the wire.
    pub fn validate(&self) -> Result<()> {
        if self.symbol.trim().is_empty() {
            return Err(AppError::Validation("symbol is required".to_string()));
        }
        if self.contract_type.trim().is_empty() {
            return Err(AppError::Validation("contract type is required".to_string()));
        }
        if !(self.amount.is_finite() && self.amount > 0.0) {
            return Err(AppError::Validation(format!(
                "amount must be positive, got {}",
                self.amount
            )));
        }
        if self.duration == 0 {
            return Err(AppError::Validation("duration must be positive".to_string()));
        }
        if !DURATION_UNITS.contains(&self.duration_unit.as_str()) {
            return Err(AppError::Validation(format!(
                "unsupported duration unit: {:?}",
                self.duration_unit
            )));
        }
        if !BASES.contains(&self.basis.as_str()) {
            return Err(AppError::Validation(format!(
                "unsupported basis: {:?}",
                self.basis
            )));
        }
        Ok(())
    }

    /// Key identifying quotes for the same (symbol, type, amount, duration, unit).
    pub fn fingerprint(&self) -> String {
        quote_key(
            &self.symbol,
            &self.contract_type,
            self.amount,
            self.duration,
            &self.duration_unit,
        )
    }

    pub fn to_request(&self, subscribe: bool) -> ProposalRequest {
        ProposalRequest {
            proposal: 1,
            amount: self.amount,
            basis: self.basis.clone(),
            contract_type: self.contract_type.clone(),
            currency: self.currency.clone(),
            duration: self.duration,
            duration_unit: self.duration_unit.clone(),
            symbol: self.symbol.clone(),
            barrier: self.barrier.clone(),
            barrier2: self.barrier2.clone(),
            subscribe: subscribe.then_some(1),
        }
    }
}

/// A broker quote for a contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: String,
    pub ask_price: f64,
    pub payout: f64,
    #[serde(default)]
    pub longcode: String,
    #[serde(default)]
    pub spot: Option<f64>,
    #[serde(default)]
    pub spot_time: Option<i64>,
}

/// Lifecycle of a quote-then-buy flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeStage {
    None,
    PendingQuote,
    Quoted,
    Buying,
    Active,
    Won,
    Lost,
    Sold,
}

/// Status of a bought contract. Terminal statuses never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractStatus {
    Pending,
    Active,
    Won,
    Lost,
    Sold,
}

impl ContractStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ContractStatus::Won | ContractStatus::Lost | ContractStatus::Sold)
    }

    fn from_broker(status: &str) -> Option<Self> {
        match status {
            "open" => Some(ContractStatus::Active),
            "won" => Some(ContractStatus::Won),
            "lost" => Some(ContractStatus::Lost),
            "sold" => Some(ContractStatus::Sold),
            _ => None,
        }
    }
}

impl From<ContractStatus> for TradeStage {
    fn from(status: ContractStatus) -> Self {
        match status {
            ContractStatus::Pending => TradeStage::Buying,
            ContractStatus::Active => TradeStage::Active,
            ContractStatus::Won => TradeStage::Won,
            ContractStatus::Lost => TradeStage::Lost,
            ContractStatus::Sold => TradeStage::Sold,
        }
    }
}

impl fmt::Display for ContractStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContractStatus::Pending => "pending",
            ContractStatus::Active => "active",
            ContractStatus::Won => "won",
            ContractStatus::Lost => "lost",
            ContractStatus::Sold => "sold",
        };
        f.write_str(s)
    }
}

/// `proposal_open_contract` push payload.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OpenContractUpdate {
    pub contract_id: u64,
    #[serde(default)]
    pub bid_price: Option<f64>,
    #[serde(default)]
    pub current_spot: Option<f64>,
    #[serde(default)]
    pub profit: Option<f64>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub is_sold: u8,
    #[serde(default)]
    pub sell_price: Option<f64>,
}

/// What the caller knows about the contract being bought.
#[derive(Debug, Clone)]
pub struct BuyMetadata {
    pub params: TradeParams,
    pub strategy: Option<String>,
    /// Login id of the account the buy is made on.
    pub account: Option<String>,
}

impl BuyMetadata {
    pub fn new(params: TradeParams) -> Self {
        Self {
            params,
            strategy: None,
            account: None,
        }
    }
}

/// An opened position, tracked from purchase to settlement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Contract {
    /// Locally generated id.
    pub id: String,
    pub broker_contract_id: Option<u64>,
    pub symbol: String,
    pub contract_type: String,
    pub stake: f64,
    pub duration: u32,
    pub duration_unit: String,
    pub barrier: Option<String>,
    pub barrier2: Option<String>,
    pub buy_price: f64,
    pub payout: f64,
    pub current_price: Option<f64>,
    pub profit: f64,
    pub sell_price: Option<f64>,
    pub status: ContractStatus,
    pub strategy: Option<String>,
    /// Account the contract was bought on, when known.
    pub account: Option<String>,
    pub longcode: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Contract {
    /// Build an active contract from a successful buy.
    pub fn from_purchase(metadata: &BuyMetadata, buy: &BuyPayload) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        let params = &metadata.params;
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            broker_contract_id: Some(buy.contract_id),
            symbol: params.symbol.clone(),
            contract_type: params.contract_type.clone(),
            stake: params.amount,
            duration: params.duration,
            duration_unit: params.duration_unit.clone(),
            barrier: params.barrier.clone(),
            barrier2: params.barrier2.clone(),
            buy_price: buy.buy_price,
            payout: buy.payout,
            current_price: None,
            profit: 0.0,
            sell_price: None,
            status: ContractStatus::Active,
            strategy: metadata.strategy.clone(),
            account: metadata.account.clone(),
            longcode: buy.longcode.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == ContractStatus::Active
    }

    /// Quote key of the parameters this contract was bought with.
    pub fn fingerprint(&self) -> String {
        quote_key(
            &self.symbol,
            &self.contract_type,
            self.stake,
            self.duration,
            &self.duration_unit,
        )
    }

    /// Apply a valuation push. Returns true when this update settled the contract.
    pub fn apply_update(&mut self, update: &OpenContractUpdate) -> bool {
        if self.status.is_terminal() {
            return false;
        }

        if let Some(bid) = update.bid_price {
            self.current_price = Some(bid);
        }
        if let Some(profit) = update.profit {
            self.profit = profit;
        }
        self.updated_at = chrono::Utc::now().timestamp_millis();

        let next = update
            .status
            .as_deref()
            .and_then(ContractStatus::from_broker)
            .unwrap_or(self.status);

        if next.is_terminal() {
            self.status = next;
            self.sell_price = update.sell_price.or(self.current_price);
            return true;
        }
        false
    }

    /// Record a confirmed sell. Returns false if the contract was already settled.
    pub fn mark_sold(&mut self, sold_for: f64) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = ContractStatus::Sold;
        self.sell_price = Some(sold_for);
        self.current_price = Some(sold_for);
        self.profit = sold_for - self.buy_price;
        self.updated_at = chrono::Utc::now().timestamp_millis();
        true
    }
}

/// Why an automated exit fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    MaxLoss,
    MaxProfit,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExitReason::StopLoss => "stop loss",
            ExitReason::TakeProfit => "take profit",
            ExitReason::MaxLoss => "max loss",
            ExitReason::MaxProfit => "max profit",
        };
        f.write_str(s)
    }
}

/// A named, reusable trade template with optional exit thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Strategy {
    pub name: String,
    pub params: TradeParams,
    pub enabled: bool,
    /// Loss as a percentage of the buy price.
    #[serde(default)]
    pub stop_loss_pct: Option<f64>,
    /// Profit as a percentage of the buy price.
    #[serde(default)]
    pub take_profit_pct: Option<f64>,
    #[serde(default)]
    pub max_loss: Option<f64>,
    #[serde(default)]
    pub max_profit: Option<f64>,
}

impl Strategy {
    pub fn new(name: &str, params: TradeParams) -> Self {
        Self {
            name: name.to_string(),
            params,
            enabled: true,
            stop_loss_pct: None,
            take_profit_pct: None,
            max_loss: None,
            max_profit: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(AppError::Validation("strategy name is required".to_string()));
        }
        self.params.validate()?;
        for (label, value) in [
            ("stop_loss_pct", self.stop_loss_pct),
            ("take_profit_pct", self.take_profit_pct),
            ("max_loss", self.max_loss),
            ("max_profit", self.max_profit),
        ] {
            if let Some(v) = value {
                if !(v.is_finite() && v > 0.0) {
                    return Err(AppError::Validation(format!(
                        "{} must be positive, got {}",
                        label, v
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn has_exit_rules(&self) -> bool {
        self.stop_loss_pct.is_some()
            || self.take_profit_pct.is_some()
            || self.max_loss.is_some()
            || self.max_profit.is_some()
    }

    /// First breached threshold for the contract's running profit, if any.
    pub fn exit_reason(&self, contract: &Contract) -> Option<ExitReason> {
        let profit = contract.profit;
        let basis = contract.buy_price;

        if let Some(pct) = self.stop_loss_pct {
            if profit <= -(basis * pct / 100.0) {
                return Some(ExitReason::StopLoss);
            }
        }
        if let Some(max_loss) = self.max_loss {
            if profit <= -max_loss {
                return Some(ExitReason::MaxLoss);
            }
        }
        if let Some(pct) = self.take_profit_pct {
            if profit >= basis * pct / 100.0 {
                return Some(ExitReason::TakeProfit);
            }
        }
        if let Some(max_profit) = self.max_profit {
            if profit >= max_profit {
                return Some(ExitReason::MaxProfit);
            }
        }
        None
    }
}
