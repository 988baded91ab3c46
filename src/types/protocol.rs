//! Wire types for the broker's JSON-over-WebSocket API.
//!
//! Outbound frames are typed request structs serialized with an injected
//! `req_id`. Inbound frames are parsed into an [`InboundMessage`] envelope
//! that keeps the raw body next to the routing fields the client needs.

use crate::error::{AppError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::{OpenContractUpdate, Proposal, Tick};

/// Authorize the connection with an opaque bearer token.
#[derive(Debug, Clone, Serialize)]
pub struct AuthorizeRequest {
    pub authorize: String,
}

impl AuthorizeRequest {
    pub fn new(token: &str) -> Self {
        Self {
            authorize: token.to_string(),
        }
    }
}

/// Balance fetch, optionally as a push stream.
#[derive(Debug, Clone, Serialize)]
pub struct BalanceRequest {
    pub balance: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<u8>,
}

impl BalanceRequest {
    pub fn once() -> Self {
        Self {
            balance: 1,
            subscribe: None,
        }
    }

    pub fn stream() -> Self {
        Self {
            balance: 1,
            subscribe: Some(1),
        }
    }
}

/// Live tick stream for one symbol.
#[derive(Debug, Clone, Serialize)]
pub struct TicksRequest {
    pub ticks: String,
    pub subscribe: u8,
}

impl TicksRequest {
    pub fn stream(symbol: &str) -> Self {
        Self {
            ticks: symbol.to_string(),
            subscribe: 1,
        }
    }
}

/// Historical candles for one symbol.
#[derive(Debug, Clone, Serialize)]
pub struct TicksHistoryRequest {
    pub ticks_history: String,
    pub style: String,
    pub granularity: u32,
    pub count: u32,
    pub end: String,
    pub adjust_start_time: u8,
}

impl TicksHistoryRequest {
    pub fn candles(symbol: &str, granularity: u32, count: u32) -> Self {
        Self {
            ticks_history: symbol.to_string(),
            style: "candles".to_string(),
            granularity,
            count,
            end: "latest".to_string(),
            adjust_start_time: 1,
        }
    }
}

/// Price quote request for a contract.
#[derive(Debug, Clone, Serialize)]
pub struct ProposalRequest {
    pub proposal: u8,
    pub amount: f64,
    pub basis: String,
    pub contract_type: String,
    pub currency: String,
    pub duration: u32,
    pub duration_unit: String,
    pub symbol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub barrier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub barrier2: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<u8>,
}

/// Buy a previously quoted contract at no more than `price`.
#[derive(Debug, Clone, Serialize)]
pub struct BuyRequest {
    pub buy: String,
    pub price: f64,
}

/// Sell an open contract. A price of 0 sells at market.
#[derive(Debug, Clone, Serialize)]
pub struct SellRequest {
    pub sell: u64,
    pub price: f64,
}

/// Valuation stream for an open contract.
#[derive(Debug, Clone, Serialize)]
pub struct OpenContractRequest {
    pub proposal_open_contract: u8,
    pub contract_id: u64,
    pub subscribe: u8,
}

impl OpenContractRequest {
    pub fn stream(contract_id: u64) -> Self {
        Self {
            proposal_open_contract: 1,
            contract_id,
            subscribe: 1,
        }
    }
}

/// Settled trade history for the authorized account.
#[derive(Debug, Clone, Serialize)]
pub struct ProfitTableRequest {
    pub profit_table: u8,
    pub description: u8,
    pub limit: u32,
    pub sort: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loginid: Option<String>,
}

impl ProfitTableRequest {
    pub fn recent(limit: u32, loginid: Option<String>) -> Self {
        Self {
            profit_table: 1,
            description: 1,
            limit,
            sort: "DESC".to_string(),
            loginid,
        }
    }
}

/// Cancel a server-side subscription.
#[derive(Debug, Clone, Serialize)]
pub struct ForgetRequest {
    pub forget: String,
}

/// Keep-alive no-op.
#[derive(Debug, Clone, Serialize)]
pub struct PingRequest {
    pub ping: u8,
}

/// Serialize a request and attach its correlation id.
pub fn encode_request<T: Serialize>(request: &T, req_id: u64) -> Result<String> {
    let mut value = serde_json::to_value(request)?;
    match value.as_object_mut() {
        Some(map) => {
            map.insert("req_id".to_string(), Value::from(req_id));
        }
        None => {
            return Err(AppError::Protocol(
                "request must serialize to a JSON object".to_string(),
            ))
        }
    }
    Ok(serde_json::to_string(&value)?)
}

/// Error object embedded in a broker response.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BrokerError {
    pub code: String,
    pub message: String,
}

impl From<BrokerError> for AppError {
    fn from(e: BrokerError) -> Self {
        AppError::Api {
            code: e.code,
            message: e.message,
        }
    }
}

/// A parsed inbound frame.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Local arrival order, assigned by the connection actor.
    pub seq: u64,
    pub req_id: Option<u64>,
    pub msg_type: Option<String>,
    pub subscription_id: Option<String>,
    pub error: Option<BrokerError>,
    pub body: Value,
}

impl InboundMessage {
    /// Parse a text frame.
    pub fn parse(text: &str, seq: u64) -> Result<Self> {
        let body: Value = serde_json::from_str(text)?;
        if !body.is_object() {
            return Err(AppError::Protocol(format!(
                "expected JSON object, got: {}",
                text
            )));
        }

        let req_id = body.get("req_id").and_then(Value::as_u64);
        let msg_type = body
            .get("msg_type")
            .and_then(Value::as_str)
            .map(str::to_string);
        let subscription_id = body
            .get("subscription")
            .and_then(|s| s.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let error = match body.get("error") {
            Some(e) if !e.is_null() => Some(
                serde_json::from_value::<BrokerError>(e.clone()).unwrap_or_else(|_| BrokerError {
                    code: "UnknownError".to_string(),
                    message: e.to_string(),
                }),
            ),
            _ => None,
        };

        Ok(Self {
            seq,
            req_id,
            msg_type,
            subscription_id,
            error,
            body,
        })
    }

    /// Turn an embedded broker error into `Err`.
    pub fn into_result(self) -> Result<Self> {
        match self.error {
            Some(e) => Err(e.into()),
            None => Ok(self),
        }
    }

    /// Deserialize the payload stored under `key`.
    pub fn payload<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self
            .body
            .get(key)
            .ok_or_else(|| AppError::Protocol(format!("response is missing `{}`", key)))?;
        serde_json::from_value(value.clone())
            .map_err(|e| AppError::Protocol(format!("malformed `{}` payload: {}", key, e)))
    }
}

/// `authorize` response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizePayload {
    pub loginid: String,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub balance: f64,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub fullname: Option<String>,
    #[serde(default)]
    pub account_list: Vec<LinkedAccount>,
}

/// One entry of the authorized identity's linked accounts.
#[derive(Debug, Clone, Deserialize)]
pub struct LinkedAccount {
    pub loginid: String,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub is_virtual: u8,
    #[serde(default)]
    pub account_type: Option<String>,
    #[serde(default)]
    pub is_disabled: u8,
}

/// `balance` payload, for both one-off responses and pushes.
#[derive(Debug, Clone, Deserialize)]
pub struct BalancePayload {
    pub balance: f64,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub loginid: Option<String>,
}

/// `buy` response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct BuyPayload {
    pub contract_id: u64,
    pub buy_price: f64,
    #[serde(default)]
    pub payout: f64,
    #[serde(default)]
    pub longcode: String,
    #[serde(default)]
    pub start_time: Option<i64>,
    #[serde(default)]
    pub transaction_id: Option<u64>,
}

/// `sell` response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct SellPayload {
    pub sold_for: f64,
    #[serde(default)]
    pub transaction_id: Option<u64>,
    #[serde(default)]
    pub balance_after: Option<f64>,
}

/// Routing tag of a live subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Route {
    Balance,
    Ticks(String),
    /// Keyed by the proposal parameter fingerprint.
    Proposal(String),
    /// Keyed by the broker contract id.
    OpenContract(u64),
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Balance => write!(f, "balance"),
            Route::Ticks(symbol) => write!(f, "ticks:{}", symbol),
            Route::Proposal(fingerprint) => write!(f, "proposal:{}", fingerprint),
            Route::OpenContract(id) => write!(f, "open_contract:{}", id),
        }
    }
}

/// Balance push, stamped with its arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceUpdate {
    pub seq: u64,
    pub balance: f64,
    pub currency: String,
    pub loginid: Option<String>,
}

/// A decoded push message, typed by the route it arrived on.
#[derive(Debug, Clone)]
pub enum PushUpdate {
    Balance(BalanceUpdate),
    Tick(Tick),
    Proposal(Proposal),
    OpenContract(OpenContractUpdate),
}

impl PushUpdate {
    /// Decode a routed message according to its route tag.
    pub fn decode(route: &Route, msg: &InboundMessage) -> Result<Self> {
        match route {
            Route::Balance => {
                let payload: BalancePayload = msg.payload("balance")?;
                Ok(PushUpdate::Balance(BalanceUpdate {
                    seq: msg.seq,
                    balance: payload.balance,
                    currency: payload.currency,
                    loginid: payload.loginid,
                }))
            }
            Route::Ticks(_) => Ok(PushUpdate::Tick(msg.payload("tick")?)),
            Route::Proposal(_) => Ok(PushUpdate::Proposal(msg.payload("proposal")?)),
            Route::OpenContract(_) => Ok(PushUpdate::OpenContract(
                msg.payload("proposal_open_contract")?,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_request_injects_req_id() {
        let text = encode_request(&TicksRequest::stream("R_100"), 7).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["ticks"], "R_100");
        assert_eq!(value["subscribe"], 1);
        assert_eq!(value["req_id"], 7);
    }

    #[test]
    fn test_balance_once_omits_subscribe() {
        let text = encode_request(&BalanceRequest::once(), 1).unwrap();
        assert!(!text.contains("subscribe"));
    }

    #[test]
    fn test_parse_subscription_envelope() {
        let text = r#"{"msg_type":"tick","req_id":3,"subscription":{"id":"abc"},
            "tick":{"symbol":"R_100","quote":101.5,"epoch":1700000000}}"#;
        let msg = InboundMessage::parse(text, 9).unwrap();
        assert_eq!(msg.seq, 9);
        assert_eq!(msg.req_id, Some(3));
        assert_eq!(msg.subscription_id.as_deref(), Some("abc"));
        assert_eq!(msg.msg_type.as_deref(), Some("tick"));
        assert!(msg.error.is_none());
    }

    #[test]
    fn test_parse_error_envelope() {
        let text = r#"{"msg_type":"buy","req_id":4,
            "error":{"code":"InsufficientBalance","message":"Your account balance is insufficient"}}"#;
        let msg = InboundMessage::parse(text, 1).unwrap();
        let err = msg.into_result().unwrap_err();
        assert_eq!(err.code(), Some("InsufficientBalance"));
    }

    #[test]
    fn test_parse_rejects_non_object() {
        assert!(InboundMessage::parse("[1,2,3]", 1).is_err());
    }

    #[test]
    fn test_decode_balance_push_carries_seq() {
        let text = r#"{"msg_type":"balance","subscription":{"id":"b1"},
            "balance":{"balance":1234.5,"currency":"USD","loginid":"CR1"}}"#;
        let msg = InboundMessage::parse(text, 42).unwrap();
        match PushUpdate::decode(&Route::Balance, &msg).unwrap() {
            PushUpdate::Balance(update) => {
                assert_eq!(update.seq, 42);
                assert_eq!(update.balance, 1234.5);
                assert_eq!(update.loginid.as_deref(), Some("CR1"));
            }
            other => panic!("Expected balance update, got {:?}", other),
        }
    }
}
