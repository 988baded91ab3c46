//! Contract / trade engine.
//!
//! Drives the quote-then-buy flow and tracks every bought contract until it
//! settles:
//! - Quotes (one-off or streamed), staged per parameter fingerprint
//! - Buy and sell against the broker
//! - Open-contract valuation streams and settlement broadcast
//! - Named strategies with automated exit thresholds
//! - A halt flag that risk management can raise to refuse new buys

use crate::error::{AppError, Result};
use crate::types::{
    BuyMetadata, BuyPayload, BuyRequest, Contract, ExitReason, OpenContractRequest,
    OpenContractUpdate, Proposal, PushUpdate, Route, SellPayload, SellRequest, Strategy,
    TradeParams, TradeStage,
};
use crate::websocket::{ApiClient, PushHandler, Subscription};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Trade engine over the shared broker connection.
#[derive(Clone)]
pub struct TradeEngine {
    client: ApiClient,
    /// Contracts by local id
    contracts: Arc<DashMap<String, Contract>>,
    /// Broker contract id -> local id
    broker_ids: Arc<DashMap<u64, String>>,
    /// Latest quote per parameter fingerprint
    quotes: Arc<DashMap<String, Proposal>>,
    /// Flow stage per parameter fingerprint
    stages: Arc<DashMap<String, TradeStage>>,
    strategies: Arc<DashMap<String, Strategy>>,
    halted: Arc<AtomicBool>,
    /// Contracts reaching a terminal status, published once each
    settlement_tx: broadcast::Sender<Contract>,
}

impl TradeEngine {
    pub fn new(client: ApiClient) -> Self {
        let (settlement_tx, _) = broadcast::channel(256);
        Self {
            client,
            contracts: Arc::new(DashMap::new()),
            broker_ids: Arc::new(DashMap::new()),
            quotes: Arc::new(DashMap::new()),
            stages: Arc::new(DashMap::new()),
            strategies: Arc::new(DashMap::new()),
            halted: Arc::new(AtomicBool::new(false)),
            settlement_tx,
        }
    }

    // ========================================================================
    // Quotes
    // ========================================================================

    /// Request a one-off quote. Parameters are validated before anything is sent.
    pub async fn create_proposal(&self, params: &TradeParams) -> Result<Proposal> {
        params.validate()?;
        let fingerprint = params.fingerprint();
        self.stages.insert(fingerprint.clone(), TradeStage::PendingQuote);

        let result = self
            .client
            .send(&params.to_request(false))
            .await
            .and_then(|msg| msg.payload::<Proposal>("proposal"));
        match result {
            Ok(proposal) => {
                debug!(
                    "Quote {} for {}: ask {:.2}, payout {:.2}",
                    proposal.id, fingerprint, proposal.ask_price, proposal.payout
                );
                self.quotes.insert(fingerprint.clone(), proposal.clone());
                self.stages.insert(fingerprint, TradeStage::Quoted);
                Ok(proposal)
            }
            Err(e) => {
                self.stages.remove(&fingerprint);
                Err(e)
            }
        }
    }

    /// Stream quotes for a parameter set as market conditions change.
    pub async fn subscribe_to_proposal<F>(&self, params: &TradeParams, on_quote: F) -> Result<Subscription>
    where
        F: Fn(Proposal) + Send + Sync + 'static,
    {
        params.validate()?;
        let fingerprint = params.fingerprint();
        self.stages.insert(fingerprint.clone(), TradeStage::PendingQuote);

        let quotes = self.quotes.clone();
        let stages = self.stages.clone();
        let key = fingerprint.clone();
        let handler: PushHandler = Arc::new(move |update| {
            if let PushUpdate::Proposal(proposal) = update {
                quotes.insert(key.clone(), proposal.clone());
                stages.insert(key.clone(), TradeStage::Quoted);
                on_quote(proposal);
            }
        });

        let result = self
            .client
            .subscribe(Route::Proposal(fingerprint.clone()), &params.to_request(true), handler)
            .await;
        if result.is_err() {
            self.stages.remove(&fingerprint);
        }
        result
    }

    /// Stop a proposal stream.
    pub async fn unsubscribe_proposal(&self, params: &TradeParams) -> Result<()> {
        self.client
            .unsubscribe(&Route::Proposal(params.fingerprint()))
            .await
    }

    /// Latest quote for a parameter set.
    pub fn quote(&self, params: &TradeParams) -> Option<Proposal> {
        self.quotes.get(&params.fingerprint()).map(|q| q.value().clone())
    }

    /// Flow stage for a parameter fingerprint.
    pub fn stage(&self, fingerprint: &str) -> TradeStage {
        self.stages
            .get(fingerprint)
            .map(|s| *s.value())
            .unwrap_or(TradeStage::None)
    }

    // ========================================================================
    // Buy / Sell
    // ========================================================================

    /// Buy a quoted contract for at most `price`.
    pub async fn buy_contract(&self, quote_id: &str, price: f64, metadata: BuyMetadata) -> Result<Contract> {
        if self.is_halted() {
            return Err(AppError::TradingHalted);
        }
        if quote_id.trim().is_empty() {
            return Err(AppError::Validation("quote id is required".to_string()));
        }
        if !(price.is_finite() && price > 0.0) {
            return Err(AppError::Validation(format!("price must be positive, got {}", price)));
        }

        let fingerprint = metadata.params.fingerprint();
        let previous_stage = self.stage(&fingerprint);
        self.stages.insert(fingerprint.clone(), TradeStage::Buying);

        let request = BuyRequest {
            buy: quote_id.to_string(),
            price,
        };
        let buy = match self
            .client
            .send(&request)
            .await
            .and_then(|msg| msg.payload::<BuyPayload>("buy"))
        {
            Ok(buy) => buy,
            Err(e) => {
                self.stages.insert(fingerprint, previous_stage);
                warn!("Buy of quote {} rejected: {}", quote_id, e);
                return Err(e.into_trade());
            }
        };

        let contract = Contract::from_purchase(&metadata, &buy);
        self.contracts.insert(contract.id.clone(), contract.clone());
        self.broker_ids.insert(buy.contract_id, contract.id.clone());
        self.stages.insert(fingerprint, TradeStage::Active);
        info!(
            "Bought {} {} contract {} for {:.2}",
            contract.symbol, contract.contract_type, buy.contract_id, buy.buy_price
        );

        if let Err(e) = self.watch_contract(buy.contract_id).await {
            warn!("Open-contract stream for {} failed: {}", buy.contract_id, e);
        }
        Ok(self.contract(&contract.id).unwrap_or(contract))
    }

    /// Subscribe to valuation pushes for a bought contract.
    async fn watch_contract(&self, broker_id: u64) -> Result<()> {
        let engine = self.clone();
        let handler: PushHandler = Arc::new(move |update| {
            if let PushUpdate::OpenContract(update) = update {
                engine.apply_contract_update(broker_id, &update);
            }
        });
        self.client
            .subscribe(
                Route::OpenContract(broker_id),
                &OpenContractRequest::stream(broker_id),
                handler,
            )
            .await?;
        Ok(())
    }

    fn apply_contract_update(&self, broker_id: u64, update: &OpenContractUpdate) {
        let Some(local_id) = self.broker_ids.get(&broker_id).map(|id| id.value().clone()) else {
            debug!("Update for unknown contract {}", broker_id);
            return;
        };
        let settled = {
            let Some(mut contract) = self.contracts.get_mut(&local_id) else {
                return;
            };
            if contract.apply_update(update) {
                Some(contract.clone())
            } else {
                None
            }
        };
        if let Some(contract) = settled {
            self.settle(contract);
        }
    }

    /// Publish a terminal contract and drop its valuation stream.
    fn settle(&self, contract: Contract) {
        info!(
            "Contract {} settled: {} (profit {:.2})",
            contract.id, contract.status, contract.profit
        );
        self.stages
            .insert(contract.fingerprint(), TradeStage::from(contract.status));
        if let Some(broker_id) = contract.broker_contract_id {
            self.client.unsubscribe_detached(Route::OpenContract(broker_id));
        }
        let _ = self.settlement_tx.send(contract);
    }

    /// Sell an active contract at market.
    pub async fn sell_contract(&self, contract_id: &str) -> Result<Contract> {
        let contract = self
            .contract(contract_id)
            .ok_or_else(|| AppError::NotFound(format!("contract {}", contract_id)))?;
        if !contract.is_active() {
            return Err(AppError::Validation(format!(
                "contract {} is {}",
                contract_id, contract.status
            )));
        }
        let broker_id = contract.broker_contract_id.ok_or_else(|| {
            AppError::Validation(format!("contract {} has no broker id", contract_id))
        })?;

        let sold = self
            .client
            .send(&SellRequest {
                sell: broker_id,
                price: 0.0,
            })
            .await
            .and_then(|msg| msg.payload::<SellPayload>("sell"));
        let sold = match sold {
            Ok(sold) => sold,
            Err(e) => {
                warn!("Sell of contract {} failed: {}", broker_id, e);
                return Err(e.into_trade());
            }
        };

        let settled = {
            let Some(mut contract) = self.contracts.get_mut(contract_id) else {
                return Err(AppError::NotFound(format!("contract {}", contract_id)));
            };
            if contract.mark_sold(sold.sold_for) {
                Some(contract.clone())
            } else {
                None
            }
        };
        if let Some(contract) = settled {
            self.settle(contract);
        }
        self.contract(contract_id)
            .ok_or_else(|| AppError::NotFound(format!("contract {}", contract_id)))
    }

    pub fn contract(&self, contract_id: &str) -> Option<Contract> {
        self.contracts.get(contract_id).map(|c| c.value().clone())
    }

    /// All tracked contracts, newest first.
    pub fn contracts(&self) -> Vec<Contract> {
        let mut contracts: Vec<Contract> = self.contracts.iter().map(|c| c.value().clone()).collect();
        contracts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        contracts
    }

    pub fn active_contracts(&self) -> Vec<Contract> {
        self.contracts().into_iter().filter(Contract::is_active).collect()
    }

    /// Receive each contract once, when it settles.
    pub fn subscribe_settlements(&self) -> broadcast::Receiver<Contract> {
        self.settlement_tx.subscribe()
    }

    // ========================================================================
    // Halt flag
    // ========================================================================

    /// Refuse new buys until resumed.
    pub fn halt_trading(&self) {
        if !self.halted.swap(true, Ordering::SeqCst) {
            warn!("Trading halted");
        }
    }

    pub fn resume_trading(&self) {
        if self.halted.swap(false, Ordering::SeqCst) {
            info!("Trading resumed");
        }
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Strategies
    // ========================================================================

    pub fn create_strategy(&self, strategy: Strategy) -> Result<()> {
        strategy.validate()?;
        if self.strategies.contains_key(&strategy.name) {
            return Err(AppError::Validation(format!(
                "strategy {} already exists",
                strategy.name
            )));
        }
        info!("Created strategy {}", strategy.name);
        self.strategies.insert(strategy.name.clone(), strategy);
        Ok(())
    }

    pub fn update_strategy(&self, strategy: Strategy) -> Result<()> {
        strategy.validate()?;
        match self.strategies.get_mut(&strategy.name) {
            Some(mut existing) => {
                *existing = strategy;
                Ok(())
            }
            None => Err(AppError::NotFound(format!("strategy {}", strategy.name))),
        }
    }

    pub fn remove_strategy(&self, name: &str) -> Result<Strategy> {
        self.strategies
            .remove(name)
            .map(|(_, strategy)| strategy)
            .ok_or_else(|| AppError::NotFound(format!("strategy {}", name)))
    }

    pub fn set_strategy_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let mut strategy = self
            .strategies
            .get_mut(name)
            .ok_or_else(|| AppError::NotFound(format!("strategy {}", name)))?;
        strategy.enabled = enabled;
        Ok(())
    }

    pub fn strategy(&self, name: &str) -> Option<Strategy> {
        self.strategies.get(name).map(|s| s.value().clone())
    }

    /// Stored strategies, ordered by name.
    pub fn strategies(&self) -> Vec<Strategy> {
        let mut strategies: Vec<Strategy> = self.strategies.iter().map(|s| s.value().clone()).collect();
        strategies.sort_by(|a, b| a.name.cmp(&b.name));
        strategies
    }

    /// Quote then buy with a stored strategy's parameters.
    ///
    /// The two steps are separate broker requests. The quote can expire or
    /// reprice in between, in which case the buy fails with a trade error.
    pub async fn execute_strategy(&self, name: &str) -> Result<Contract> {
        let strategy = self
            .strategy(name)
            .ok_or_else(|| AppError::NotFound(format!("strategy {}", name)))?;
        if !strategy.enabled {
            return Err(AppError::Disabled(format!("strategy {}", name)));
        }
        if self.is_halted() {
            return Err(AppError::TradingHalted);
        }

        let proposal = self.create_proposal(&strategy.params).await?;
        let metadata = BuyMetadata {
            params: strategy.params.clone(),
            strategy: Some(strategy.name.clone()),
            account: None,
        };
        self.buy_contract(&proposal.id, proposal.ask_price, metadata)
            .await
    }

    /// Sell active contracts whose strategy thresholds are breached.
    ///
    /// Sell failures are logged and do not stop evaluation of the rest.
    /// Returns the contracts sold and why.
    pub async fn auto_manage_contracts(&self) -> Vec<(String, ExitReason)> {
        let mut exits = Vec::new();
        for contract in self.active_contracts() {
            let Some(strategy) = contract.strategy.as_deref().and_then(|name| self.strategy(name)) else {
                continue;
            };
            if !strategy.has_exit_rules() {
                continue;
            }
            let Some(reason) = strategy.exit_reason(&contract) else {
                continue;
            };

            info!(
                "Closing contract {} on {} (profit {:.2})",
                contract.id, reason, contract.profit
            );
            match self.sell_contract(&contract.id).await {
                Ok(_) => exits.push((contract.id.clone(), reason)),
                Err(e) => warn!("Auto-close of {} failed: {}", contract.id, e),
            }
        }
        exits
    }
}
