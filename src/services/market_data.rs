//! Market data and analysis service.
//!
//! Streams ticks per symbol into a bounded history, keeps the latest quote
//! per symbol, evaluates price alerts on every tick, and fetches candle
//! history for indicator analysis.

use crate::error::{AppError, Result};
use crate::services::signals::analyze_candles;
use crate::types::{
    AlertCondition, Candle, MarketAnalysis, PriceAlert, PushUpdate, Route, SymbolQuote, Tick,
    TicksHistoryRequest, TicksRequest,
};
use crate::websocket::{ApiClient, PushHandler, Subscription};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Ticks retained per symbol; older entries drop FIFO.
pub const TICK_HISTORY_LIMIT: usize = 1000;

/// Candle size used by `analyze_market`, in seconds.
pub const ANALYSIS_GRANULARITY: u32 = 60;

/// Candles fetched by `analyze_market`.
pub const ANALYSIS_CANDLES: u32 = 200;

/// Tick-driven state, shared with the subscription handlers.
struct TickState {
    history: DashMap<String, VecDeque<Tick>>,
    quotes: DashMap<String, SymbolQuote>,
    /// Alerts by id
    alerts: DashMap<String, PriceAlert>,
    alert_tx: broadcast::Sender<PriceAlert>,
}

impl TickState {
    fn record(&self, tick: &Tick) -> Vec<PriceAlert> {
        {
            let mut history = self.history.entry(tick.symbol.clone()).or_default();
            history.push_back(tick.clone());
            while history.len() > TICK_HISTORY_LIMIT {
                history.pop_front();
            }
        }

        let previous = match self.quotes.get_mut(&tick.symbol) {
            Some(mut quote) => {
                let previous = quote.last_price;
                quote.advance(tick);
                Some(previous)
            }
            None => {
                self.quotes.insert(tick.symbol.clone(), SymbolQuote::first(tick));
                None
            }
        };

        let mut fired = Vec::new();
        for mut alert in self.alerts.iter_mut() {
            if alert.symbol == tick.symbol && alert.evaluate(previous, tick.quote, tick.epoch) {
                fired.push(alert.clone());
            }
        }
        for alert in &fired {
            info!(
                "Alert {} fired: {} {:?} {} at {}",
                alert.id, alert.symbol, alert.condition, alert.target, tick.quote
            );
            let _ = self.alert_tx.send(alert.clone());
        }
        fired
    }
}

/// Market data service over the shared broker connection.
#[derive(Clone)]
pub struct MarketDataService {
    client: ApiClient,
    state: Arc<TickState>,
    /// Last fetched candles per symbol
    candles: Arc<DashMap<String, Vec<Candle>>>,
}

impl MarketDataService {
    pub fn new(client: ApiClient) -> Self {
        let (alert_tx, _) = broadcast::channel(256);
        Self {
            client,
            state: Arc::new(TickState {
                history: DashMap::new(),
                quotes: DashMap::new(),
                alerts: DashMap::new(),
                alert_tx,
            }),
            candles: Arc::new(DashMap::new()),
        }
    }

    // ========================================================================
    // Ticks
    // ========================================================================

    /// Stream ticks for a symbol. Each tick is recorded before `on_tick` runs.
    pub async fn subscribe_to_ticks<F>(&self, symbol: &str, on_tick: F) -> Result<Subscription>
    where
        F: Fn(Tick) + Send + Sync + 'static,
    {
        validate_symbol(symbol)?;
        let state = self.state.clone();
        let handler: PushHandler = Arc::new(move |update| {
            if let PushUpdate::Tick(tick) = update {
                state.record(&tick);
                on_tick(tick);
            }
        });

        let subscription = self
            .client
            .subscribe(Route::Ticks(symbol.to_string()), &TicksRequest::stream(symbol), handler)
            .await?;
        debug!("Streaming ticks for {}", symbol);
        Ok(subscription)
    }

    pub async fn unsubscribe_ticks(&self, symbol: &str) -> Result<()> {
        self.client.unsubscribe(&Route::Ticks(symbol.to_string())).await
    }

    /// Record a tick as if it arrived on the stream. Returns alerts it fired.
    pub fn record_tick(&self, tick: &Tick) -> Vec<PriceAlert> {
        self.state.record(tick)
    }

    /// Retained ticks for a symbol, oldest first.
    pub fn tick_history(&self, symbol: &str) -> Vec<Tick> {
        self.state
            .history
            .get(symbol)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn quote(&self, symbol: &str) -> Option<SymbolQuote> {
        self.state.quotes.get(symbol).map(|q| q.value().clone())
    }

    // ========================================================================
    // Alerts
    // ========================================================================

    pub fn add_alert(&self, symbol: &str, condition: AlertCondition, target: f64) -> Result<PriceAlert> {
        validate_symbol(symbol)?;
        if !target.is_finite() {
            return Err(AppError::Validation(format!("invalid alert target: {}", target)));
        }
        let alert = PriceAlert::new(symbol, condition, target);
        self.state.alerts.insert(alert.id.clone(), alert.clone());
        Ok(alert)
    }

    pub fn remove_alert(&self, alert_id: &str) -> Result<PriceAlert> {
        self.state
            .alerts
            .remove(alert_id)
            .map(|(_, alert)| alert)
            .ok_or_else(|| AppError::NotFound(format!("alert {}", alert_id)))
    }

    pub fn alert(&self, alert_id: &str) -> Option<PriceAlert> {
        self.state.alerts.get(alert_id).map(|a| a.value().clone())
    }

    /// Alerts, optionally for one symbol.
    pub fn alerts(&self, symbol: Option<&str>) -> Vec<PriceAlert> {
        self.state
            .alerts
            .iter()
            .filter(|a| symbol.map_or(true, |s| a.symbol == s))
            .map(|a| a.value().clone())
            .collect()
    }

    /// Receive alerts as they fire.
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<PriceAlert> {
        self.state.alert_tx.subscribe()
    }

    // ========================================================================
    // Candles and analysis
    // ========================================================================

    /// Fetch candle history and cache it per symbol.
    pub async fn fetch_candles(&self, symbol: &str, granularity: u32, count: u32) -> Result<Vec<Candle>> {
        validate_symbol(symbol)?;
        if granularity == 0 || count == 0 {
            return Err(AppError::Validation(
                "granularity and count must be positive".to_string(),
            ));
        }

        let msg = self
            .client
            .send(&TicksHistoryRequest::candles(symbol, granularity, count))
            .await?;
        let candles: Vec<Candle> = msg.payload("candles")?;
        debug!("Fetched {} candles for {}", candles.len(), symbol);
        self.candles.insert(symbol.to_string(), candles.clone());
        Ok(candles)
    }

    pub fn cached_candles(&self, symbol: &str) -> Option<Vec<Candle>> {
        self.candles.get(symbol).map(|c| c.value().clone())
    }

    /// Fetch fresh candles and run the indicator suite on them.
    pub async fn analyze_market(&self, symbol: &str) -> Result<MarketAnalysis> {
        let candles = self
            .fetch_candles(symbol, ANALYSIS_GRANULARITY, ANALYSIS_CANDLES)
            .await?;
        analyze_candles(symbol, &candles)
    }
}

fn validate_symbol(symbol: &str) -> Result<()> {
    if symbol.trim().is_empty() {
        return Err(AppError::Validation("symbol is required".to_string()));
    }
    Ok(())
}
