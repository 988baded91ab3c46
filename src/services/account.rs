//! Session and account state.
//!
//! Holds the authorized identity, its linked accounts and the active one.
//! Balances arrive from one-off fetches and from the balance push stream;
//! per account, whichever message arrived last wins, using the arrival
//! sequence stamped by the connection task.

use crate::error::{AppError, Result};
use crate::types::{
    Account, AccountPerformance, AuthSummary, AuthorizePayload, AuthorizeRequest, BalancePayload,
    BalanceRequest, BalanceUpdate, ProfitTablePayload, ProfitTableRequest, PushUpdate, Route,
};
use crate::websocket::{ApiClient, PushHandler};
use dashmap::DashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Settled trades fetched for performance analytics.
const PROFIT_TABLE_LIMIT: u32 = 500;

struct AccountState {
    /// Linked accounts by login id.
    accounts: DashMap<String, Account>,
    active: RwLock<Option<String>>,
    /// Arrival sequence of the last applied balance, by login id.
    last_balance_seq: DashMap<String, u64>,
    balance_tx: broadcast::Sender<BalanceUpdate>,
}

impl AccountState {
    fn active_login(&self) -> Option<String> {
        self.active.read().ok().and_then(|guard| guard.clone())
    }

    /// Apply a balance if it is newer than the last one seen.
    fn apply_balance(&self, update: &BalanceUpdate) -> bool {
        let Some(login_id) = update.loginid.clone().or_else(|| self.active_login()) else {
            return false;
        };
        {
            let mut last = self.last_balance_seq.entry(login_id.clone()).or_insert(0);
            if *last >= update.seq {
                debug!("Ignoring stale balance for {} (seq {} <= {})", login_id, update.seq, *last);
                return false;
            }
            *last = update.seq;
        }

        if let Some(mut account) = self.accounts.get_mut(&login_id) {
            account.balance = update.balance;
            if !update.currency.is_empty() {
                account.currency = update.currency.clone();
            }
        }
        let _ = self.balance_tx.send(BalanceUpdate {
            loginid: Some(login_id),
            ..update.clone()
        });
        true
    }

    /// Replace the account list from an authorize response.
    fn load(&self, payload: &AuthorizePayload) {
        self.accounts.clear();
        for linked in &payload.account_list {
            self.accounts.insert(linked.loginid.clone(), Account::from(linked));
        }
        self.accounts
            .entry(payload.loginid.clone())
            .or_insert_with(|| Account {
                login_id: payload.loginid.clone(),
                currency: payload.currency.clone(),
                balance: payload.balance,
                is_virtual: payload.loginid.starts_with("VR"),
                account_type: None,
                is_disabled: false,
                active: false,
            });
    }

    fn mark_active(&self, login_id: &str) {
        for mut account in self.accounts.iter_mut() {
            account.active = account.login_id == login_id;
        }
        if let Ok(mut active) = self.active.write() {
            *active = Some(login_id.to_string());
        }
    }
}

/// Account service over the shared broker connection.
#[derive(Clone)]
pub struct AccountService {
    client: ApiClient,
    state: Arc<AccountState>,
    /// Tokens by login id, used to switch accounts.
    tokens: Arc<DashMap<String, String>>,
}

impl AccountService {
    pub fn new(client: ApiClient) -> Self {
        let (balance_tx, _) = broadcast::channel(256);
        Self {
            client,
            state: Arc::new(AccountState {
                accounts: DashMap::new(),
                active: RwLock::new(None),
                last_balance_seq: DashMap::new(),
                balance_tx,
            }),
            tokens: Arc::new(DashMap::new()),
        }
    }

    /// Make a token known for an account so `switch_account` can use it.
    pub fn register_account_token(&self, login_id: &str, token: &str) {
        self.tokens.insert(login_id.to_string(), token.to_string());
    }

    /// Authorize the connection and load the linked accounts.
    pub async fn authenticate(&self, token: &str) -> Result<AuthSummary> {
        if token.trim().is_empty() {
            return Err(AppError::Validation("token is required".to_string()));
        }

        let request = AuthorizeRequest::new(token);
        let msg = self.client.send(&request).await?;
        let payload: AuthorizePayload = msg.payload("authorize")?;
        self.client.set_auth_request(&request)?;
        self.tokens.insert(payload.loginid.clone(), token.to_string());

        self.state.load(&payload);
        self.state.mark_active(&payload.loginid);
        self.state.apply_balance(&BalanceUpdate {
            seq: msg.seq,
            balance: payload.balance,
            currency: payload.currency.clone(),
            loginid: Some(payload.loginid.clone()),
        });
        info!(
            "Authorized as {} ({} linked accounts)",
            payload.loginid,
            self.state.accounts.len()
        );

        if let Err(e) = self.subscribe_balance().await {
            warn!("Balance subscription failed: {}", e);
        }

        let active = self
            .active_account()
            .ok_or_else(|| AppError::Protocol("authorized account missing".to_string()))?;
        Ok(AuthSummary {
            accounts: self.accounts(),
            active,
            email: payload.email,
            fullname: payload.fullname,
        })
    }

    /// Make another linked account the active one.
    ///
    /// The old balance stream is cancelled only once the broker accepts the
    /// new token, so a failed switch leaves the current account streaming.
    pub async fn switch_account(&self, login_id: &str) -> Result<Account> {
        let account = self
            .state
            .accounts
            .get(login_id)
            .map(|a| a.value().clone())
            .ok_or_else(|| AppError::NotFound(format!("account {}", login_id)))?;
        if account.is_disabled {
            return Err(AppError::Disabled(format!("account {}", login_id)));
        }
        if account.active {
            return Ok(account);
        }
        let token = self
            .tokens
            .get(login_id)
            .map(|t| t.value().clone())
            .ok_or_else(|| AppError::Validation(format!("no token known for account {}", login_id)))?;

        let request = AuthorizeRequest::new(&token);
        let msg = self.client.send(&request).await?;
        let payload: AuthorizePayload = msg.payload("authorize")?;
        self.client.set_auth_request(&request)?;

        if let Err(e) = self.client.unsubscribe(&Route::Balance).await {
            warn!("Failed to cancel balance stream: {}", e);
        }

        if !self.state.accounts.contains_key(&payload.loginid) {
            self.state.load(&payload);
        }
        self.state.mark_active(&payload.loginid);
        self.state.apply_balance(&BalanceUpdate {
            seq: msg.seq,
            balance: payload.balance,
            currency: payload.currency.clone(),
            loginid: Some(payload.loginid.clone()),
        });
        info!("Switched to account {}", payload.loginid);

        self.subscribe_balance().await?;
        self.active_account()
            .ok_or_else(|| AppError::Protocol("switched account missing".to_string()))
    }

    /// One-off balance fetch for the active account.
    pub async fn fetch_balance(&self) -> Result<f64> {
        let msg = self.client.send(&BalanceRequest::once()).await?;
        let payload: BalancePayload = msg.payload("balance")?;
        self.state.apply_balance(&BalanceUpdate {
            seq: msg.seq,
            balance: payload.balance,
            currency: payload.currency,
            loginid: payload.loginid,
        });
        Ok(payload.balance)
    }

    async fn subscribe_balance(&self) -> Result<()> {
        let state = self.state.clone();
        let handler: PushHandler = Arc::new(move |update| {
            if let PushUpdate::Balance(balance) = update {
                state.apply_balance(&balance);
            }
        });
        self.client
            .subscribe(Route::Balance, &BalanceRequest::stream(), handler)
            .await?;
        Ok(())
    }

    /// Retrospective analytics from the account's settled trades.
    pub async fn get_account_performance(&self, login_id: &str) -> Result<AccountPerformance> {
        if !self.state.accounts.contains_key(login_id) {
            return Err(AppError::NotFound(format!("account {}", login_id)));
        }
        let request = ProfitTableRequest::recent(PROFIT_TABLE_LIMIT, Some(login_id.to_string()));
        let msg = self.client.send(&request).await?;
        let mut table: ProfitTablePayload = msg.payload("profit_table")?;

        // Newest first on the wire
        table.transactions.reverse();
        let performance = AccountPerformance::from_trades(&table.transactions);
        debug!(
            "Performance for {}: {} trades, win rate {:.1}%",
            login_id, performance.total_trades, performance.win_rate
        );
        Ok(performance)
    }

    /// Balance of the active account.
    pub fn balance(&self) -> Option<f64> {
        self.active_account().map(|a| a.balance)
    }

    pub fn active_account(&self) -> Option<Account> {
        let login_id = self.state.active_login()?;
        self.state.accounts.get(&login_id).map(|a| a.value().clone())
    }

    /// Linked accounts, ordered by login id.
    pub fn accounts(&self) -> Vec<Account> {
        let mut accounts: Vec<Account> = self.state.accounts.iter().map(|a| a.value().clone()).collect();
        accounts.sort_by(|a, b| a.login_id.cmp(&b.login_id));
        accounts
    }

    /// Stream of applied balance updates.
    pub fn subscribe_balances(&self) -> broadcast::Receiver<BalanceUpdate> {
        self.state.balance_tx.subscribe()
    }
}
