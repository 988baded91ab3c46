//! Risk manager.
//!
//! A policy layer over balance and open-position snapshots: position
//! sizing, pre-trade validation, realized daily P&L, drawdown from the
//! observed peak balance, and threshold alerts for the periodic monitor.
//! Daily P&L and the peak are kept per account; checks read the account
//! selected with [`RiskManager::set_active_account`].

use crate::error::{AppError, Result};
use crate::types::{
    AlertSeverity, OpenPosition, PositionSize, RecommendedAction, RiskAlert, RiskMetric,
    RiskParameters, RiskValidation, TradeRiskRequest,
};
use chrono::{NaiveDate, Utc};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Share of a threshold at which a warning is raised.
pub const WARNING_RATIO: f64 = 0.8;

/// Hard cap on any stake, as a share of balance.
pub const MAX_STAKE_BALANCE_SHARE: f64 = 0.10;

/// Smallest stake the sizer suggests.
pub const MIN_STAKE: f64 = 1.0;

struct DailyPnl {
    date: NaiveDate,
    realized: f64,
}

impl DailyPnl {
    fn today() -> Self {
        Self {
            date: Utc::now().date_naive(),
            realized: 0.0,
        }
    }

    /// Reset at the UTC date boundary.
    fn roll(&mut self) {
        let today = Utc::now().date_naive();
        if self.date != today {
            debug!("Daily P&L reset ({} -> {})", self.date, today);
            self.date = today;
            self.realized = 0.0;
        }
    }
}

/// Live figures of one account.
struct AccountBook {
    daily: DailyPnl,
    peak_balance: Option<f64>,
}

impl AccountBook {
    fn new() -> Self {
        Self {
            daily: DailyPnl::today(),
            peak_balance: None,
        }
    }
}

/// Book key used until an account is selected.
const UNASSIGNED: &str = "";

#[derive(Clone)]
pub struct RiskManager {
    params: Arc<RwLock<RiskParameters>>,
    /// Daily P&L and peak balance by login id.
    books: Arc<DashMap<String, AccountBook>>,
    active: Arc<RwLock<String>>,
}

impl RiskManager {
    pub fn new(params: RiskParameters) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            params: Arc::new(RwLock::new(params)),
            books: Arc::new(DashMap::new()),
            active: Arc::new(RwLock::new(UNASSIGNED.to_string())),
        })
    }

    pub fn parameters(&self) -> RiskParameters {
        self.params
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replace the limits. Invalid parameters leave the current ones in place.
    pub fn update_parameters(&self, params: RiskParameters) -> Result<()> {
        params.validate()?;
        let mut guard = self.params.write().unwrap_or_else(|e| e.into_inner());
        *guard = params;
        drop(guard);
        info!("Risk parameters updated");
        Ok(())
    }

    /// Select the account whose figures validation and monitoring read.
    pub fn set_active_account(&self, login_id: &str) {
        let mut active = self.active.write().unwrap_or_else(|e| e.into_inner());
        if *active != login_id {
            info!("Risk figures now tracking account {}", login_id);
            *active = login_id.to_string();
        }
    }

    pub fn active_account(&self) -> Option<String> {
        let active = self.active.read().unwrap_or_else(|e| e.into_inner());
        (active.as_str() != UNASSIGNED).then(|| active.clone())
    }

    fn active_key(&self) -> String {
        self.active.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn with_book<R>(&self, login_id: &str, f: impl FnOnce(&mut AccountBook) -> R) -> R {
        let mut book = self
            .books
            .entry(login_id.to_string())
            .or_insert_with(AccountBook::new);
        f(book.value_mut())
    }

    // ========================================================================
    // Sizing and validation
    // ========================================================================

    /// Suggest a stake for a trade.
    ///
    /// Without a stop the stake is the per-trade risk budget. With a stop
    /// it is the number of units whose loss at the stop equals that budget.
    /// The result is clamped to the symbol cap, floored at [`MIN_STAKE`] and
    /// never exceeds `max_stake`.
    pub fn calculate_position_size(
        &self,
        balance: f64,
        entry_price: f64,
        stop_loss: Option<f64>,
        symbol: Option<&str>,
    ) -> Result<PositionSize> {
        if !(balance.is_finite() && balance > 0.0) {
            return Err(AppError::Validation(format!("balance must be positive, got {}", balance)));
        }
        if !(entry_price.is_finite() && entry_price > 0.0) {
            return Err(AppError::Validation(format!(
                "entry price must be positive, got {}",
                entry_price
            )));
        }

        let params = self.parameters();
        let risk_amount = balance * params.max_risk_per_trade_pct / 100.0;

        let (mut stake, risk_per_unit) = match stop_loss {
            Some(stop) => {
                let per_unit = (entry_price - stop).abs();
                if !(per_unit.is_finite() && per_unit > 0.0) {
                    return Err(AppError::Validation(
                        "stop loss must differ from entry price".to_string(),
                    ));
                }
                (risk_amount / per_unit, Some(per_unit))
            }
            None => (risk_amount, None),
        };
        if let Some(symbol) = symbol {
            stake = stake.min(params.symbol_limit(symbol));
        }

        let max_stake = (stake * 2.0).min(balance * MAX_STAKE_BALANCE_SHARE);
        Ok(PositionSize {
            stake: stake.max(MIN_STAKE).min(max_stake),
            max_stake,
            risk_amount,
            risk_per_unit,
        })
    }

    /// Largest stake a single trade may carry at this balance.
    fn stake_cap(params: &RiskParameters, balance: f64) -> f64 {
        let recommended = balance * params.max_risk_per_trade_pct / 100.0;
        (recommended * 2.0).min(balance * MAX_STAKE_BALANCE_SHARE)
    }

    /// Check a proposed trade against every limit. A rejection is returned, never raised.
    pub fn validate_trade_risk(
        &self,
        request: &TradeRiskRequest,
        balance: f64,
        open: &[OpenPosition],
    ) -> RiskValidation {
        let params = self.parameters();
        if !(balance.is_finite() && balance > 0.0) {
            return RiskValidation::rejected("Account balance is not available".to_string(), 0.0);
        }
        let max_stake = Self::stake_cap(&params, balance);

        if !(request.stake.is_finite() && request.stake > 0.0) {
            return RiskValidation::rejected(format!("Invalid stake {}", request.stake), max_stake);
        }
        if open.len() >= params.max_open_positions {
            return RiskValidation::rejected(
                format!(
                    "Maximum open positions reached ({}/{})",
                    open.len(),
                    params.max_open_positions
                ),
                max_stake,
            );
        }

        let daily = self.daily_pnl();
        if daily <= -params.max_daily_loss {
            return RiskValidation::rejected(
                format!(
                    "Daily loss limit reached ({:.2} of {:.2})",
                    -daily, params.max_daily_loss
                ),
                max_stake,
            );
        }

        if request.stake > max_stake {
            return RiskValidation::rejected(
                format!("Stake {:.2} exceeds maximum {:.2}", request.stake, max_stake),
                max_stake,
            );
        }

        let exposure: f64 = open
            .iter()
            .filter(|p| p.symbol == request.symbol)
            .map(|p| p.stake)
            .sum();
        let limit = params.symbol_limit(&request.symbol);
        if exposure + request.stake > limit {
            return RiskValidation::rejected(
                format!(
                    "Exposure on {} would be {:.2}, above the {:.2} limit",
                    request.symbol,
                    exposure + request.stake,
                    limit
                ),
                max_stake,
            );
        }

        let drawdown = self.current_drawdown_pct(balance);
        if drawdown >= params.max_drawdown_pct {
            return RiskValidation::rejected(
                format!(
                    "Drawdown {:.1}% is at or above the {:.1}% limit",
                    drawdown, params.max_drawdown_pct
                ),
                max_stake,
            );
        }

        if let (Some(min_ratio), Some(payout)) = (params.min_risk_reward, request.payout) {
            let ratio = (payout - request.stake) / request.stake;
            if ratio < min_ratio {
                return RiskValidation::rejected(
                    format!("Risk/reward {:.2} is below the {:.2} minimum", ratio, min_ratio),
                    max_stake,
                );
            }
        }

        RiskValidation::approved(max_stake)
    }

    // ========================================================================
    // P&L and drawdown
    // ========================================================================

    /// Add a settled trade's profit to the active account's realized P&L.
    pub fn record_trade_result(&self, profit: f64) {
        self.record_trade_result_for(&self.active_key(), profit);
    }

    pub fn record_trade_result_for(&self, login_id: &str, profit: f64) {
        if !profit.is_finite() {
            warn!("Ignoring non-finite trade result");
            return;
        }
        let realized = self.with_book(login_id, |book| {
            book.daily.roll();
            book.daily.realized += profit;
            book.daily.realized
        });
        debug!("Realized P&L today on {}: {:.2}", login_id, realized);
    }

    /// Today's realized P&L (UTC) of the active account.
    pub fn daily_pnl(&self) -> f64 {
        self.daily_pnl_for(&self.active_key())
    }

    pub fn daily_pnl_for(&self, login_id: &str) -> f64 {
        self.with_book(login_id, |book| {
            book.daily.roll();
            book.daily.realized
        })
    }

    /// Track the active account's peak balance used for drawdown.
    pub fn observe_balance(&self, balance: f64) {
        self.observe_balance_for(&self.active_key(), balance);
    }

    pub fn observe_balance_for(&self, login_id: &str, balance: f64) {
        if !(balance.is_finite() && balance > 0.0) {
            return;
        }
        self.with_book(login_id, |book| {
            book.peak_balance = Some(book.peak_balance.map_or(balance, |p| p.max(balance)));
        });
    }

    pub fn peak_balance(&self) -> Option<f64> {
        self.peak_balance_for(&self.active_key())
    }

    pub fn peak_balance_for(&self, login_id: &str) -> Option<f64> {
        self.books.get(login_id).and_then(|book| book.peak_balance)
    }

    /// Decline from the active account's peak balance, percent. Observes `balance` first.
    pub fn current_drawdown_pct(&self, balance: f64) -> f64 {
        self.observe_balance(balance);
        match self.peak_balance() {
            Some(peak) if peak > 0.0 && balance.is_finite() => ((peak - balance) / peak * 100.0).max(0.0),
            _ => 0.0,
        }
    }

    // ========================================================================
    // Monitoring
    // ========================================================================

    /// Compare current figures to every threshold.
    ///
    /// Bad inputs are logged and skipped, so the list may be partial.
    pub fn monitor_risk(&self, balance: f64, open: &[OpenPosition]) -> Vec<RiskAlert> {
        if !(balance.is_finite() && balance > 0.0) {
            warn!("Risk monitor skipped: invalid balance {}", balance);
            return Vec::new();
        }
        let params = self.parameters();
        let mut alerts = Vec::new();

        let drawdown = self.current_drawdown_pct(balance);
        alerts.extend(evaluate(
            RiskMetric::Drawdown,
            drawdown,
            params.max_drawdown_pct,
            RecommendedAction::ClosePosition,
            RecommendedAction::StopTrading,
        ));

        let daily_loss = (-self.daily_pnl()).max(0.0);
        alerts.extend(evaluate(
            RiskMetric::DailyLoss,
            daily_loss,
            params.max_daily_loss,
            RecommendedAction::ReducePosition,
            RecommendedAction::StopTrading,
        ));

        let mut exposure: BTreeMap<&str, f64> = BTreeMap::new();
        for position in open {
            *exposure.entry(position.symbol.as_str()).or_default() += position.stake;
        }
        for (symbol, total) in &exposure {
            alerts.extend(evaluate(
                RiskMetric::SymbolExposure(symbol.to_string()),
                *total,
                params.symbol_limit(symbol),
                RecommendedAction::ReducePosition,
                RecommendedAction::ClosePosition,
            ));
        }

        let utilization = exposure.values().sum::<f64>() / balance * 100.0;
        alerts.extend(evaluate(
            RiskMetric::MarginUtilization,
            utilization,
            params.max_margin_utilization_pct,
            RecommendedAction::ReducePosition,
            RecommendedAction::ClosePosition,
        ));

        if !alerts.is_empty() {
            info!("Risk monitor raised {} alerts", alerts.len());
        }
        alerts
    }
}

/// Alert for one metric, if it is at or past the warning ratio.
fn evaluate(
    metric: RiskMetric,
    value: f64,
    limit: f64,
    warning_action: RecommendedAction,
    critical_action: RecommendedAction,
) -> Option<RiskAlert> {
    if !(value.is_finite() && limit.is_finite() && limit > 0.0) {
        warn!("Skipping {} check: value {} limit {}", metric, value, limit);
        return None;
    }

    let ratio = value / limit;
    let (severity, action) = if ratio >= 1.0 {
        (AlertSeverity::Critical, critical_action)
    } else if ratio >= WARNING_RATIO {
        (AlertSeverity::Warning, warning_action)
    } else {
        return None;
    };

    Some(RiskAlert {
        message: format!(
            "{} at {:.2} ({:.0}% of {:.2} limit)",
            metric,
            value,
            ratio * 100.0,
            limit
        ),
        metric,
        severity,
        action,
        value,
        limit,
        timestamp: Utc::now().timestamp_millis(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> RiskManager {
        RiskManager::new(RiskParameters::default()).unwrap()
    }

    fn position(symbol: &str, stake: f64, profit: f64) -> OpenPosition {
        OpenPosition {
            contract_id: uuid::Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            stake,
            profit,
        }
    }

    #[test]
    fn test_position_size_loses_budget_at_stop() {
        let size = manager()
            .calculate_position_size(1000.0, 100.0, Some(95.0), None)
            .unwrap();
        assert_eq!(size.risk_amount, 20.0);
        assert_eq!(size.risk_per_unit, Some(5.0));
        assert!((size.stake * 5.0 - 20.0).abs() < 1e-9);
        assert!(size.stake <= 100.0);
    }

    #[test]
    fn test_position_size_never_exceeds_ten_percent() {
        let risk = manager();
        for (balance, entry, stop) in [
            (1000.0, 100.0, Some(99.999)),
            (50.0, 10.0, None),
            (1_000_000.0, 1.0, Some(0.5)),
            (5.0, 100.0, None),
        ] {
            let size = risk.calculate_position_size(balance, entry, stop, None).unwrap();
            assert!(size.stake <= balance * 0.1 + 1e-9, "{:?}", size);
            assert!(size.max_stake <= balance * 0.1 + 1e-9);
        }
    }

    #[test]
    fn test_position_size_respects_symbol_cap() {
        let mut params = RiskParameters::default();
        params.symbol_limits.insert("R_10".to_string(), 3.0);
        let risk = RiskManager::new(params).unwrap();
        let size = risk
            .calculate_position_size(10_000.0, 100.0, None, Some("R_10"))
            .unwrap();
        assert_eq!(size.stake, 3.0);
    }

    #[test]
    fn test_position_size_rejects_bad_input() {
        let risk = manager();
        assert!(risk.calculate_position_size(0.0, 100.0, None, None).is_err());
        assert!(risk.calculate_position_size(1000.0, 100.0, Some(100.0), None).is_err());
    }

    #[test]
    fn test_validate_open_position_cap() {
        let risk = manager();
        let request = TradeRiskRequest::new("R_100", 10.0);
        let four: Vec<OpenPosition> = (0..4).map(|_| position("R_50", 5.0, 0.0)).collect();
        assert!(risk.validate_trade_risk(&request, 1000.0, &four).valid);

        let five: Vec<OpenPosition> = (0..5).map(|_| position("R_50", 5.0, 0.0)).collect();
        let result = risk.validate_trade_risk(&request, 1000.0, &five);
        assert!(!result.valid);
        assert!(result.reason.unwrap().contains("open positions"));
    }

    #[test]
    fn test_validate_daily_loss_and_stake() {
        let risk = manager();
        let request = TradeRiskRequest::new("R_100", 50.0);
        let result = risk.validate_trade_risk(&request, 1000.0, &[]);
        assert!(!result.valid);
        assert_eq!(result.max_stake, 40.0);

        risk.record_trade_result(-100.0);
        let result = risk.validate_trade_risk(&TradeRiskRequest::new("R_100", 10.0), 1000.0, &[]);
        assert!(result.reason.unwrap().contains("Daily loss"));
    }

    #[test]
    fn test_validate_symbol_exposure() {
        let risk = manager();
        let open = vec![position("R_100", 195.0, 0.0)];
        let result = risk.validate_trade_risk(&TradeRiskRequest::new("R_100", 10.0), 10_000.0, &open);
        assert!(!result.valid);
        assert!(result.reason.unwrap().contains("R_100"));
    }

    #[test]
    fn test_validate_drawdown() {
        let risk = manager();
        risk.observe_balance(1000.0);
        let result = risk.validate_trade_risk(&TradeRiskRequest::new("R_100", 5.0), 800.0, &[]);
        assert!(!result.valid);
        assert!(result.reason.unwrap().contains("Drawdown"));
    }

    #[test]
    fn test_validate_min_risk_reward() {
        let mut params = RiskParameters::default();
        params.min_risk_reward = Some(0.8);
        let risk = RiskManager::new(params).unwrap();

        let mut request = TradeRiskRequest::new("R_100", 10.0);
        request.payout = Some(17.0);
        assert!(!risk.validate_trade_risk(&request, 1000.0, &[]).valid);
        request.payout = Some(19.5);
        assert!(risk.validate_trade_risk(&request, 1000.0, &[]).valid);
    }

    #[test]
    fn test_figures_are_kept_per_account() {
        let risk = manager();
        risk.set_active_account("VRTC1");
        risk.observe_balance(10_000.0);
        risk.record_trade_result(-60.0);

        risk.set_active_account("CR1");
        assert_eq!(risk.active_account().as_deref(), Some("CR1"));
        assert_eq!(risk.peak_balance(), None);
        assert_eq!(risk.daily_pnl(), 0.0);
        assert_eq!(risk.current_drawdown_pct(1000.0), 0.0);
        assert!(risk.validate_trade_risk(&TradeRiskRequest::new("R_100", 10.0), 1000.0, &[]).valid);

        assert_eq!(risk.peak_balance_for("VRTC1"), Some(10_000.0));
        assert_eq!(risk.daily_pnl_for("VRTC1"), -60.0);
    }

    #[test]
    fn test_monitor_thresholds() {
        let risk = manager();
        risk.observe_balance(1000.0);

        // 17% drawdown: warning
        let alerts = risk.monitor_risk(830.0, &[]);
        let drawdown = alerts.iter().find(|a| a.metric == RiskMetric::Drawdown).unwrap();
        assert_eq!(drawdown.severity, AlertSeverity::Warning);
        assert_eq!(drawdown.action, RecommendedAction::ClosePosition);

        // 25% drawdown: critical
        let alerts = risk.monitor_risk(750.0, &[]);
        let drawdown = alerts.iter().find(|a| a.metric == RiskMetric::Drawdown).unwrap();
        assert_eq!(drawdown.severity, AlertSeverity::Critical);
        assert_eq!(drawdown.action, RecommendedAction::StopTrading);
    }

    #[test]
    fn test_monitor_exposure_and_margin() {
        let risk = manager();
        let open = vec![position("R_100", 170.0, -2.0), position("R_50", 10.0, 1.0)];
        let alerts = risk.monitor_risk(300.0, &open);

        let exposure = alerts
            .iter()
            .find(|a| a.metric == RiskMetric::SymbolExposure("R_100".to_string()))
            .unwrap();
        assert_eq!(exposure.severity, AlertSeverity::Warning);

        // 180 / 300 = 60% > 50%
        let margin = alerts
            .iter()
            .find(|a| a.metric == RiskMetric::MarginUtilization)
            .unwrap();
        assert_eq!(margin.severity, AlertSeverity::Critical);
        assert_eq!(margin.action, RecommendedAction::ClosePosition);
    }

    #[test]
    fn test_monitor_bad_balance_returns_empty() {
        assert!(manager().monitor_risk(f64::NAN, &[]).is_empty());
        assert!(manager().monitor_risk(0.0, &[]).is_empty());
    }

    #[test]
    fn test_update_parameters_validates() {
        let risk = manager();
        let mut params = RiskParameters::default();
        params.max_open_positions = 0;
        assert!(risk.update_parameters(params).is_err());
        assert_eq!(risk.parameters().max_open_positions, 5);
    }
}
