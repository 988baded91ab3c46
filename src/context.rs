//! Trading context.
//!
//! Owns the broker connection and every service built on it, and wires the
//! cross-service flows: settled contracts feed the daily P&L, balance
//! updates feed the drawdown peak, and trades pass risk validation before
//! they are bought. Risk figures follow the active account.

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::services::{AccountService, MarketDataService, RiskManager, TradeEngine};
use crate::types::{
    Account, AuthSummary, BuyMetadata, Contract, OpenPosition, RecommendedAction, RiskAlert,
    TradeParams, TradeRiskRequest,
};
use crate::websocket::{ApiClient, Connector};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What `execute_risk_management` did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RiskActionReport {
    /// Local ids of contracts sold.
    pub closed: Vec<String>,
    pub halted: bool,
    /// Sells that failed, as (contract id, reason).
    pub failures: Vec<(String, String)>,
}

pub struct TradingContext {
    config: Config,
    client: ApiClient,
    accounts: AccountService,
    trades: TradeEngine,
    market: MarketDataService,
    risk: RiskManager,
    listeners: Vec<JoinHandle<()>>,
}

impl TradingContext {
    /// Build the services over one connection. Must be called within a Tokio runtime.
    pub fn new(config: Config, connector: Arc<dyn Connector>) -> Result<Self> {
        config.connection.validate()?;
        let risk = RiskManager::new(config.risk.clone())?;

        let client = ApiClient::new(config.connection.clone(), connector);
        let accounts = AccountService::new(client.clone());
        let trades = TradeEngine::new(client.clone());
        let market = MarketDataService::new(client.clone());
        for (login_id, token) in &config.account_tokens {
            accounts.register_account_token(login_id, token);
        }

        let listeners = vec![
            spawn_settlement_listener(&trades, risk.clone()),
            spawn_balance_listener(&accounts, risk.clone()),
        ];

        Ok(Self {
            config,
            client,
            accounts,
            trades,
            market,
            risk,
            listeners,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    pub fn accounts(&self) -> &AccountService {
        &self.accounts
    }

    pub fn trades(&self) -> &TradeEngine {
        &self.trades
    }

    pub fn market(&self) -> &MarketDataService {
        &self.market
    }

    pub fn risk(&self) -> &RiskManager {
        &self.risk
    }

    /// Connect, then authorize with the configured token if there is one.
    pub async fn connect(&self) -> Result<Option<AuthSummary>> {
        self.client.connect().await?;
        match self.config.api_token.as_deref() {
            Some(token) => {
                let summary = self.accounts.authenticate(token).await?;
                self.risk.set_active_account(&summary.active.login_id);
                Ok(Some(summary))
            }
            None => {
                info!("No API token configured, staying unauthorized");
                Ok(None)
            }
        }
    }

    /// Switch the active account and point the risk figures at it.
    pub async fn switch_account(&self, login_id: &str) -> Result<Account> {
        let account = self.accounts.switch_account(login_id).await?;
        self.risk.set_active_account(&account.login_id);
        Ok(account)
    }

    /// Match the risk book to the account the session is trading on.
    fn sync_risk_account(&self) -> Option<Account> {
        let active = self.accounts.active_account()?;
        self.risk.set_active_account(&active.login_id);
        Some(active)
    }

    pub async fn disconnect(&self) {
        self.client.disconnect().await;
    }

    /// Snapshot of active contracts for the risk checks.
    pub fn open_positions(&self) -> Vec<OpenPosition> {
        self.trades
            .active_contracts()
            .iter()
            .map(OpenPosition::from)
            .collect()
    }

    async fn current_balance(&self) -> Result<f64> {
        match self.sync_risk_account() {
            Some(active) => Ok(active.balance),
            None => self.accounts.fetch_balance().await,
        }
    }

    /// Quote, check the quote against the risk limits, then buy it.
    pub async fn place_trade(&self, params: &TradeParams, strategy: Option<&str>) -> Result<Contract> {
        params.validate()?;
        if self.trades.is_halted() {
            return Err(AppError::TradingHalted);
        }

        let balance = self.current_balance().await?;
        let proposal = self.trades.create_proposal(params).await?;

        let request = TradeRiskRequest {
            symbol: params.symbol.clone(),
            stake: proposal.ask_price,
            payout: Some(proposal.payout),
        };
        let validation = self
            .risk
            .validate_trade_risk(&request, balance, &self.open_positions());
        if !validation.valid {
            let reason = validation.reason.unwrap_or_default();
            info!("Trade on {} rejected: {}", params.symbol, reason);
            return Err(AppError::RiskRejected(reason));
        }

        let metadata = BuyMetadata {
            params: params.clone(),
            strategy: strategy.map(str::to_string),
            account: self.risk.active_account(),
        };
        self.trades
            .buy_contract(&proposal.id, proposal.ask_price, metadata)
            .await
    }

    /// Run the risk monitor on the active account's current figures.
    pub fn monitor_risk(&self) -> Vec<RiskAlert> {
        match self.sync_risk_account() {
            Some(active) => self.risk.monitor_risk(active.balance, &self.open_positions()),
            None => {
                debug!("Risk monitor skipped: no active account");
                Vec::new()
            }
        }
    }

    /// Act on each alert's recommended action.
    ///
    /// `close_position` sells the most-losing open contract, `reduce_position`
    /// sells half of the open contracts (rounded down) starting with the
    /// worst, and `stop_trading` halts new buys.
    pub async fn execute_risk_management(&self, alerts: &[RiskAlert]) -> RiskActionReport {
        let mut report = RiskActionReport::default();

        for alert in alerts {
            match alert.action {
                RecommendedAction::StopTrading => {
                    error!("Stopping trading: {}", alert.message);
                    self.trades.halt_trading();
                    report.halted = true;
                }
                RecommendedAction::ClosePosition => {
                    let worst = self.worst_first().into_iter().next();
                    if let Some(contract) = worst {
                        warn!("Closing {} on {}", contract.id, alert.message);
                        self.sell_into(&contract.id, &mut report).await;
                    }
                }
                RecommendedAction::ReducePosition => {
                    let open = self.worst_first();
                    let count = open.len() / 2;
                    if count > 0 {
                        warn!("Reducing {} of {} positions on {}", count, open.len(), alert.message);
                    }
                    for contract in open.into_iter().take(count) {
                        self.sell_into(&contract.id, &mut report).await;
                    }
                }
            }
        }
        report
    }

    /// Monitor and act in one step.
    pub async fn run_risk_cycle(&self) -> RiskActionReport {
        let alerts = self.monitor_risk();
        self.execute_risk_management(&alerts).await
    }

    /// Active contracts, most losing first.
    fn worst_first(&self) -> Vec<Contract> {
        let mut open = self.trades.active_contracts();
        open.sort_by(|a, b| a.profit.total_cmp(&b.profit));
        open
    }

    async fn sell_into(&self, contract_id: &str, report: &mut RiskActionReport) {
        match self.trades.sell_contract(contract_id).await {
            Ok(_) => report.closed.push(contract_id.to_string()),
            Err(e) => {
                warn!("Risk sell of {} failed: {}", contract_id, e);
                report.failures.push((contract_id.to_string(), e.user_message()));
            }
        }
    }
}

impl Drop for TradingContext {
    fn drop(&mut self) {
        for listener in &self.listeners {
            listener.abort();
        }
    }
}

fn spawn_settlement_listener(trades: &TradeEngine, risk: RiskManager) -> JoinHandle<()> {
    let mut settlements = trades.subscribe_settlements();
    tokio::spawn(async move {
        loop {
            match settlements.recv().await {
                Ok(contract) => {
                    debug!("Contract {} settled {} ({:.2})", contract.id, contract.status, contract.profit);
                    match contract.account.as_deref() {
                        Some(login_id) => risk.record_trade_result_for(login_id, contract.profit),
                        None => risk.record_trade_result(contract.profit),
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!("Settlement listener missed {} contracts", missed);
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn spawn_balance_listener(accounts: &AccountService, risk: RiskManager) -> JoinHandle<()> {
    let mut balances = accounts.subscribe_balances();
    tokio::spawn(async move {
        loop {
            match balances.recv().await {
                Ok(update) => match update.loginid.as_deref() {
                    Some(login_id) => risk.observe_balance_for(login_id, update.balance),
                    None => risk.observe_balance(update.balance),
                },
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    })
}
