//! In-memory broker used by the integration tests.
//!
//! Serves the request kinds the client sends over a `MemoryConnector`,
//! records every request, and lets a test push frames or drop the link.

#![allow(dead_code)]

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tradewire::websocket::{Frame, MemoryConnector, ServerLink};
use tradewire::ConnectionConfig;

pub const REAL_TOKEN: &str = "token-cr";
pub const VIRTUAL_TOKEN: &str = "token-vr";
pub const REAL_LOGIN: &str = "CR100";
pub const VIRTUAL_LOGIN: &str = "VRTC200";
pub const DISABLED_LOGIN: &str = "CR300";

#[derive(Debug, Clone, PartialEq)]
enum SubKind {
    Balance,
    Ticks(String),
    Proposal,
    OpenContract(u64),
}

enum Control {
    Push(Value),
    Close(String),
}

#[derive(Default)]
struct BrokerState {
    requests: Vec<Value>,
    login: Option<String>,
    balances: HashMap<String, f64>,
    subs: HashMap<String, SubKind>,
    /// Quote id -> (ask price, payout)
    quotes: HashMap<String, (f64, f64)>,
    next_id: u64,
    connections: usize,
    sell_fails: bool,
    buy_fails: bool,
    /// Record requests without answering them.
    silent: bool,
    control: Option<mpsc::UnboundedSender<Control>>,
    candles: Vec<Value>,
    profit_table: Vec<Value>,
}

impl BrokerState {
    fn next(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn subscribe(&mut self, prefix: &str, kind: SubKind) -> String {
        let id = format!("{}-{}", prefix, self.next());
        self.subs.insert(id.clone(), kind);
        id
    }

    fn balance(&self) -> f64 {
        self.login
            .as_ref()
            .and_then(|l| self.balances.get(l).copied())
            .unwrap_or(0.0)
    }
}

#[derive(Clone)]
pub struct FakeBroker {
    state: Arc<Mutex<BrokerState>>,
}

/// Connection settings with short timings for tests.
pub fn test_connection_config() -> ConnectionConfig {
    ConnectionConfig {
        endpoint: "ws://broker.test/websockets/v3".to_string(),
        app_id: "1089".to_string(),
        max_reconnect_attempts: 3,
        reconnect_base_delay: Duration::from_millis(100),
        heartbeat_interval: Duration::from_secs(30),
        connect_timeout: Duration::from_secs(5),
    }
}

impl FakeBroker {
    /// Start serving. Returns the connector to hand to the client.
    pub fn start() -> (Arc<MemoryConnector>, FakeBroker) {
        let (connector, mut accepted) = MemoryConnector::new();
        let mut state = BrokerState::default();
        state.balances.insert(REAL_LOGIN.to_string(), 1000.0);
        state.balances.insert(VIRTUAL_LOGIN.to_string(), 10000.0);
        let broker = FakeBroker {
            state: Arc::new(Mutex::new(state)),
        };

        let serving = broker.clone();
        tokio::spawn(async move {
            while let Some(link) = accepted.recv().await {
                let session = serving.clone();
                tokio::spawn(async move { session.serve(link).await });
            }
        });
        (connector, broker)
    }

    async fn serve(self, mut link: ServerLink) {
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        {
            let mut state = self.lock();
            state.connections += 1;
            state.subs.clear();
            state.login = None;
            state.control = Some(control_tx);
        }

        loop {
            tokio::select! {
                frame = link.incoming.recv() => match frame {
                    Some(Frame::Text(text)) => {
                        let Ok(request) = serde_json::from_str::<Value>(&text) else {
                            continue;
                        };
                        for reply in self.handle(request) {
                            link.send_json(&reply);
                        }
                    }
                    Some(Frame::Pong(_)) => {}
                    Some(Frame::Close) | None => break,
                },
                control = control_rx.recv() => match control {
                    Some(Control::Push(value)) => {
                        link.send_json(&value);
                    }
                    Some(Control::Close(reason)) => {
                        link.close(&reason);
                        break;
                    }
                    None => break,
                },
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap()
    }

    fn handle(&self, request: Value) -> Vec<Value> {
        let req_id = request["req_id"].clone();
        let mut state = self.lock();
        state.requests.push(request.clone());
        if state.silent {
            return Vec::new();
        }

        let mut reply = if let Some(token) = request.get("authorize").and_then(Value::as_str) {
            let login = match token {
                REAL_TOKEN => REAL_LOGIN,
                VIRTUAL_TOKEN => VIRTUAL_LOGIN,
                _ => {
                    return vec![error_reply("authorize", req_id, "InvalidToken", "The token is invalid.")];
                }
            };
            state.login = Some(login.to_string());
            json!({
                "msg_type": "authorize",
                "authorize": {
                    "loginid": login,
                    "currency": "USD",
                    "balance": state.balance(),
                    "email": "trader@example.com",
                    "fullname": "Test Trader",
                    "account_list": [
                        {"loginid": REAL_LOGIN, "currency": "USD", "is_virtual": 0, "account_type": "trading", "is_disabled": 0},
                        {"loginid": VIRTUAL_LOGIN, "currency": "USD", "is_virtual": 1, "account_type": "trading", "is_disabled": 0},
                        {"loginid": DISABLED_LOGIN, "currency": "USD", "is_virtual": 0, "is_disabled": 1}
                    ]
                }
            })
        } else if request.get("balance").is_some() {
            let mut reply = json!({
                "msg_type": "balance",
                "balance": {
                    "balance": state.balance(),
                    "currency": "USD",
                    "loginid": state.login.clone(),
                }
            });
            if request["subscribe"] == 1 {
                let id = state.subscribe("bal", SubKind::Balance);
                reply["subscription"] = json!({ "id": id });
            }
            reply
        } else if let Some(symbol) = request.get("ticks").and_then(Value::as_str) {
            let id = state.subscribe("tick", SubKind::Ticks(symbol.to_string()));
            json!({
                "msg_type": "tick",
                "tick": {"symbol": symbol, "quote": 100.0, "epoch": 1_700_000_000},
                "subscription": {"id": id}
            })
        } else if request.get("ticks_history").is_some() {
            json!({
                "msg_type": "candles",
                "candles": state.candles.clone(),
            })
        } else if request.get("proposal").is_some() {
            let amount = request["amount"].as_f64().unwrap_or(0.0);
            let quote_id = format!("prop-{}", state.next());
            let payout = (amount * 1.95 * 100.0).round() / 100.0;
            state.quotes.insert(quote_id.clone(), (amount, payout));
            let mut reply = json!({
                "msg_type": "proposal",
                "proposal": {
                    "id": quote_id,
                    "ask_price": amount,
                    "payout": payout,
                    "longcode": "Win payout if the exit spot is higher than the entry spot.",
                    "spot": 100.0,
                    "spot_time": 1_700_000_000
                }
            });
            if request["subscribe"] == 1 {
                let id = state.subscribe("prop-sub", SubKind::Proposal);
                reply["subscription"] = json!({ "id": id });
            }
            reply
        } else if let Some(quote_id) = request.get("buy").and_then(Value::as_str) {
            if state.buy_fails {
                return vec![error_reply("buy", req_id, "InsufficientBalance", "Your account balance is insufficient.")];
            }
            let Some((ask, payout)) = state.quotes.get(quote_id).copied() else {
                return vec![error_reply("buy", req_id, "InvalidContractProposal", "Unknown contract proposal.")];
            };
            let contract_id = 5000 + state.next();
            json!({
                "msg_type": "buy",
                "buy": {
                    "contract_id": contract_id,
                    "buy_price": ask,
                    "payout": payout,
                    "longcode": "Win payout if the exit spot is higher than the entry spot.",
                    "start_time": 1_700_000_000,
                    "transaction_id": contract_id * 10
                }
            })
        } else if request.get("proposal_open_contract").is_some() {
            let contract_id = request["contract_id"].as_u64().unwrap_or(0);
            let id = state.subscribe("poc", SubKind::OpenContract(contract_id));
            json!({
                "msg_type": "proposal_open_contract",
                "proposal_open_contract": {
                    "contract_id": contract_id,
                    "bid_price": 10.0,
                    "profit": 0.0,
                    "status": "open",
                    "is_sold": 0
                },
                "subscription": {"id": id}
            })
        } else if request.get("sell").is_some() {
            if state.sell_fails {
                return vec![error_reply("sell", req_id, "SellNotAvailable", "Resale of this contract is not offered.")];
            }
            json!({
                "msg_type": "sell",
                "sell": {"sold_for": 9.5, "transaction_id": 777, "balance_after": state.balance() + 9.5}
            })
        } else if let Some(id) = request.get("forget").and_then(Value::as_str) {
            let removed = state.subs.remove(id).is_some();
            json!({"msg_type": "forget", "forget": if removed { 1 } else { 0 }})
        } else if request.get("profit_table").is_some() {
            json!({
                "msg_type": "profit_table",
                "profit_table": {
                    "count": state.profit_table.len(),
                    "transactions": state.profit_table.clone()
                }
            })
        } else if request.get("ping").is_some() {
            json!({"msg_type": "ping", "ping": "pong"})
        } else {
            return vec![error_reply("error", req_id, "UnrecognisedRequest", "Unrecognised request.")];
        };

        reply["req_id"] = req_id;
        vec![reply]
    }

    // ========================================================================
    // Test controls
    // ========================================================================

    fn control(&self, control: Control) {
        if let Some(tx) = self.lock().control.as_ref() {
            let _ = tx.send(control);
        }
    }

    /// Push a raw frame on the current link.
    pub fn push(&self, value: Value) {
        self.control(Control::Push(value));
    }

    /// Push a tick on every live tick subscription for `symbol`.
    pub fn push_tick(&self, symbol: &str, quote: f64, epoch: i64) {
        for id in self.subscription_ids(&SubKind::Ticks(symbol.to_string())) {
            self.push(json!({
                "msg_type": "tick",
                "tick": {"symbol": symbol, "quote": quote, "epoch": epoch},
                "subscription": {"id": id}
            }));
        }
    }

    /// Push a tick with a subscription id the server no longer knows about.
    pub fn push_tick_as(&self, subscription_id: &str, symbol: &str, quote: f64) {
        self.push(json!({
            "msg_type": "tick",
            "tick": {"symbol": symbol, "quote": quote, "epoch": 1_700_000_100},
            "subscription": {"id": subscription_id}
        }));
    }

    pub fn set_balance(&self, login: &str, balance: f64) {
        self.lock().balances.insert(login.to_string(), balance);
    }

    /// Push a balance update on every live balance subscription.
    pub fn push_balance(&self, balance: f64) {
        let login = {
            let mut state = self.lock();
            let login = state.login.clone();
            if let Some(login) = &login {
                state.balances.insert(login.clone(), balance);
            }
            login
        };
        for id in self.subscription_ids(&SubKind::Balance) {
            self.push(json!({
                "msg_type": "balance",
                "balance": {"balance": balance, "currency": "USD", "loginid": login},
                "subscription": {"id": id}
            }));
        }
    }

    /// Push a valuation update for an open contract.
    pub fn push_contract_update(&self, contract_id: u64, profit: f64, status: &str) {
        for id in self.subscription_ids(&SubKind::OpenContract(contract_id)) {
            self.push(json!({
                "msg_type": "proposal_open_contract",
                "proposal_open_contract": {
                    "contract_id": contract_id,
                    "bid_price": 10.0 + profit,
                    "profit": profit,
                    "status": status,
                    "is_sold": if status == "open" { 0 } else { 1 },
                    "sell_price": if status == "open" { Value::Null } else { json!(10.0 + profit) }
                },
                "subscription": {"id": id}
            }));
        }
    }

    /// Drop the current link from the server side.
    pub fn drop_link(&self, reason: &str) {
        self.control(Control::Close(reason.to_string()));
    }

    pub fn set_sell_fails(&self, fails: bool) {
        self.lock().sell_fails = fails;
    }

    pub fn set_buy_fails(&self, fails: bool) {
        self.lock().buy_fails = fails;
    }

    pub fn set_silent(&self, silent: bool) {
        self.lock().silent = silent;
    }

    pub fn set_candles(&self, closes: &[f64]) {
        self.lock().candles = closes
            .iter()
            .enumerate()
            .map(|(i, close)| {
                json!({
                    "epoch": 1_700_000_000 + i as i64 * 60,
                    "open": close,
                    "high": close + 0.5,
                    "low": close - 0.5,
                    "close": close
                })
            })
            .collect();
    }

    /// Profit table rows, newest first as the broker sends them.
    pub fn set_profit_table(&self, rows: Vec<(f64, f64)>) {
        self.lock().profit_table = rows
            .into_iter()
            .enumerate()
            .map(|(i, (buy, sell))| {
                json!({
                    "contract_id": 9000 + i as u64,
                    "buy_price": buy,
                    "sell_price": sell,
                    "purchase_time": 1_700_000_000 - i as i64 * 60,
                    "sell_time": 1_700_000_030 - i as i64 * 60
                })
            })
            .collect();
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Requests carrying `key`, in arrival order.
    pub fn requests_with(&self, key: &str) -> Vec<Value> {
        self.lock()
            .requests
            .iter()
            .filter(|r| r.get(key).is_some())
            .cloned()
            .collect()
    }

    /// Every request, in arrival order.
    pub fn requests(&self) -> Vec<Value> {
        self.lock().requests.clone()
    }

    pub fn request_count(&self) -> usize {
        self.lock().requests.len()
    }

    pub fn connections(&self) -> usize {
        self.lock().connections
    }

    pub fn login(&self) -> Option<String> {
        self.lock().login.clone()
    }

    /// Server-side subscriptions still open on the current link.
    pub fn open_subscriptions(&self) -> usize {
        self.lock().subs.len()
    }

    pub fn balance_subscriptions(&self) -> usize {
        self.subscription_ids(&SubKind::Balance).len()
    }

    pub fn tick_subscription_ids(&self, symbol: &str) -> Vec<String> {
        self.subscription_ids(&SubKind::Ticks(symbol.to_string()))
    }

    fn subscription_ids(&self, kind: &SubKind) -> Vec<String> {
        let mut ids: Vec<String> = self
            .lock()
            .subs
            .iter()
            .filter(|(_, k)| *k == kind)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Wait until `count` requests carrying `key` have arrived.
    pub async fn wait_for_requests(&self, key: &str, count: usize) {
        for _ in 0..500 {
            if self.requests_with(key).len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {} `{}` requests", count, key);
    }
}

fn error_reply(msg_type: &str, req_id: Value, code: &str, message: &str) -> Value {
    json!({
        "msg_type": msg_type,
        "req_id": req_id,
        "error": {"code": code, "message": message}
    })
}

/// Poll `check` until it holds, yielding to other tasks in between.
pub async fn eventually<F: Fn() -> bool>(check: F) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}
