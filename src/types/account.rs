use serde::{Deserialize, Serialize};

use super::LinkedAccount;

/// A broker account linked to the authenticated identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub login_id: String,
    pub currency: String,
    pub balance: f64,
    pub is_virtual: bool,
    pub account_type: Option<String>,
    pub is_disabled: bool,
    /// Whether this is the session's active account.
    pub active: bool,
}

impl From<&LinkedAccount> for Account {
    fn from(linked: &LinkedAccount) -> Self {
        Self {
            login_id: linked.loginid.clone(),
            currency: linked.currency.clone(),
            balance: 0.0,
            is_virtual: linked.is_virtual != 0,
            account_type: linked.account_type.clone(),
            is_disabled: linked.is_disabled != 0,
            active: false,
        }
    }
}

/// Result of a successful authentication.
#[derive(Debug, Clone, Serialize)]
pub struct AuthSummary {
    pub accounts: Vec<Account>,
    pub active: Account,
    pub email: Option<String>,
    pub fullname: Option<String>,
}

/// A settled trade from the profit table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfitTableEntry {
    #[serde(default)]
    pub contract_id: Option<u64>,
    pub buy_price: f64,
    pub sell_price: f64,
    #[serde(default)]
    pub purchase_time: Option<i64>,
    #[serde(default)]
    pub sell_time: Option<i64>,
    #[serde(default)]
    pub shortcode: Option<String>,
    #[serde(default)]
    pub longcode: Option<String>,
}

impl ProfitTableEntry {
    pub fn profit(&self) -> f64 {
        self.sell_price - self.buy_price
    }
}

/// `profit_table` response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ProfitTablePayload {
    #[serde(default)]
    pub count: u32,
    #[serde(default)]
    pub transactions: Vec<ProfitTableEntry>,
}

/// Retrospective performance figures derived from settled trades.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AccountPerformance {
    pub total_trades: usize,
    pub wins: usize,
    pub losses: usize,
    /// Percentage of trades with positive profit.
    pub win_rate: f64,
    pub total_profit: f64,
    pub average_win: f64,
    /// Average losing trade, as a positive amount.
    pub average_loss: f64,
    /// Gross profit / gross loss. `None` when there are no losses.
    pub profit_factor: Option<f64>,
    /// Largest peak-to-trough decline of cumulative profit.
    pub max_drawdown: f64,
    /// Mean per-trade profit over its standard deviation, not annualized.
    pub sharpe_ratio: f64,
}

impl AccountPerformance {
    /// Compute performance from a settled-trade history (oldest first).
    pub fn from_trades(trades: &[ProfitTableEntry]) -> Self {
        if trades.is_empty() {
            return Self::default();
        }

        let profits: Vec<f64> = trades.iter().map(ProfitTableEntry::profit).collect();
        let wins: Vec<f64> = profits.iter().copied().filter(|p| *p > 0.0).collect();
        let losses: Vec<f64> = profits.iter().copied().filter(|p| *p < 0.0).collect();

        let gross_win: f64 = wins.iter().sum();
        let gross_loss: f64 = -losses.iter().sum::<f64>();
        let total_profit: f64 = profits.iter().sum();

        let average_win = if wins.is_empty() {
            0.0
        } else {
            gross_win / wins.len() as f64
        };
        let average_loss = if losses.is_empty() {
            0.0
        } else {
            gross_loss / losses.len() as f64
        };
        let profit_factor = if gross_loss > 0.0 {
            Some(gross_win / gross_loss)
        } else {
            None
        };

        let mut equity = 0.0;
        let mut peak = 0.0_f64;
        let mut max_drawdown = 0.0_f64;
        for p in &profits {
            equity += p;
            peak = peak.max(equity);
            max_drawdown = max_drawdown.max(peak - equity);
        }

        let n = profits.len() as f64;
        let mean = total_profit / n;
        let variance = profits.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / n;
        let std_dev = variance.sqrt();
        let sharpe_ratio = if std_dev > 0.0 { mean / std_dev } else { 0.0 };

        Self {
            total_trades: trades.len(),
            wins: wins.len(),
            losses: losses.len(),
            win_rate: wins.len() as f64 / n * 100.0,
            total_profit,
            average_win,
            average_loss,
            profit_factor,
            max_drawdown,
            sharpe_ratio,
        }
    }
}
