//! Capability interfaces for the trading-session gateway.
//!
//! The gateway is a black box: every outbound call returns an immediate
//! accept/reject, and the real result arrives later on a thread the
//! gateway owns, through `GatewayEvents`. Nothing in this crate depends
//! on a concrete gateway type.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    config::{EngineKind, ServerConfig},
    error::{FetchError, FetchResult},
    sim::SimulatedGateway,
    types::{Account, AccountId, Credentials, DateKey},
};

/// Status code for a successful completion.
pub const API_OK: i32 = 0;

/// Code the gateway attaches to a rejected call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RejectCode(pub i32);

pub type CallResult = Result<(), RejectCode>;

// ── Raw payloads ──────────────────────────────────────────────────

/// A length-prefixed string buffer exactly as the gateway hands it over.
/// `len` is the declared length and is not trusted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawStr {
    pub data: Option<Vec<u8>>,
    pub len: i32,
}

impl RawStr {
    pub fn null() -> Self {
        Self { data: None, len: 0 }
    }

    pub fn with_len(bytes: impl Into<Vec<u8>>, len: i32) -> Self {
        Self {
            data: Some(bytes.into()),
            len,
        }
    }
}

impl From<&str> for RawStr {
    fn from(s: &str) -> Self {
        Self {
            data: Some(s.as_bytes().to_vec()),
            len: s.len() as i32,
        }
    }
}

impl From<String> for RawStr {
    fn from(s: String) -> Self {
        let len = s.len() as i32;
        Self {
            data: Some(s.into_bytes()),
            len,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawAccount {
    pub account_id: RawStr,
    pub fcm_id: RawStr,
    pub ib_id: RawStr,
}

impl From<&Account> for RawAccount {
    fn from(a: &Account) -> Self {
        Self {
            account_id: a.account_id.as_str().into(),
            fcm_id: a.fcm_id.as_str().into(),
            ib_id: a.ib_id.as_str().into(),
        }
    }
}

/// One product entry from the RMS/commission list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRmsEntry {
    pub product_code: RawStr,
    pub commission_fill_rate: f64,
    pub has_commission_fill_rate: bool,
}

/// One replayed order line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawOrderLine {
    pub order_num: RawStr,
    pub account: RawAccount,
    pub ticker: RawStr,
    pub exchange: RawStr,
    pub buy_sell_type: RawStr,
    pub order_type: RawStr,
    pub status: RawStr,
    pub quantity_to_fill: i64,
    pub filled: i64,
    pub price_to_fill: f64,
    pub avg_fill_price: f64,
    /// Seconds since the epoch.
    pub ssboe: i64,
}

/// Which request a completion answers, echoed back by the gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestTag {
    pub account_id: Option<AccountId>,
    /// Set on historical replays only.
    pub date: Option<DateKey>,
}

/// A batch delivered by one completion, with its API status code.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion<T> {
    pub status: i32,
    pub items: Vec<T>,
    pub tag: RequestTag,
}

impl<T> Completion<T> {
    pub fn ok(items: Vec<T>) -> Self {
        Self {
            status: API_OK,
            items,
            tag: RequestTag::default(),
        }
    }

    pub fn failed(status: i32) -> Self {
        Self {
            status,
            items: Vec::new(),
            tag: RequestTag::default(),
        }
    }

    pub fn for_account(mut self, account_id: &str) -> Self {
        self.tag.account_id = Some(account_id.to_string());
        self
    }

    pub fn on_date(mut self, date: &str) -> Self {
        self.tag.date = Some(date.to_string());
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == API_OK
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    ConnectionOpened,
    ConnectionClosed,
    LoginComplete,
    LoginFailed,
    Other,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionKind {
    TradingSystem,
    MarketData,
    Other,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlertInfo {
    pub kind: AlertKind,
    pub connection: ConnectionKind,
    pub message: RawStr,
}

// ── Interfaces ────────────────────────────────────────────────────

/// Outbound calls. Each returns as soon as the gateway accepts or
/// rejects the request.
pub trait Gateway: Send + Sync {
    fn login(&self, credentials: &Credentials) -> CallResult;

    fn request_account_list(&self) -> CallResult;

    fn request_product_rms_info(&self, account: &Account) -> CallResult;

    fn request_order_history_dates(&self) -> CallResult;

    /// Synchronous ack, no completion follows.
    fn subscribe_orders(&self, account: &Account) -> CallResult;

    /// Synchronous ack, no completion follows.
    fn unsubscribe_orders(&self, account: &Account) -> CallResult;

    /// `from_time == to_time == 0` replays the current session.
    fn request_replay_orders(&self, account: &Account, from_time: i32, to_time: i32) -> CallResult;

    fn request_replay_historical_orders(&self, account: &Account, date: &str) -> CallResult;

    /// Log out and stop delivering callbacks.
    fn shutdown(&self) {}
}

/// Completions, delivered on the gateway's own thread. RMS and replay
/// completions carry the tag of the request they answer.
pub trait GatewayEvents: Send + Sync {
    fn on_alert(&self, alert: AlertInfo);

    fn on_account_list(&self, completion: Completion<RawAccount>);

    fn on_commission_list(&self, completion: Completion<RawRmsEntry>);

    fn on_history_dates(&self, completion: Completion<RawStr>);

    fn on_order_batch(&self, completion: Completion<RawOrderLine>);
}

/// Construct the engine named by `server` and wire its callbacks to
/// `events`.
pub fn connect(
    server: &ServerConfig,
    events: Arc<dyn GatewayEvents>,
) -> FetchResult<Box<dyn Gateway>> {
    match server.engine {
        EngineKind::Simulated => {
            let settings = server.simulation.clone().unwrap_or_default();
            log::info!(
                "Starting simulated engine (seed {}, {} accounts)",
                settings.seed, settings.accounts
            );
            Ok(Box::new(SimulatedGateway::generated(&settings, events)?))
        }
        EngineKind::Rapi => {
            log::debug!("vendor engine environment: {:?}", server.engine_environment());
            Err(FetchError::Connection(
                "engine unavailable: the vendor trading engine is not linked into this build"
                    .into(),
            ))
        }
    }
}
