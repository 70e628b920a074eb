//! Domain types shared across the crate.
//!
//! RULE: values of these types are always well-formed. Everything coming
//! from the gateway passes through validation.rs before it becomes one.

use serde::{Deserialize, Serialize};

/// Account identifier as issued by the gateway.
pub type AccountId = String;

/// A trading date in fixed-width `YYYYMMDD` form.
pub type DateKey = String;

/// Identity of a brokerage account. Immutable once received.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Account {
    pub account_id: AccountId,
    pub fcm_id: String,
    pub ib_id: String,
}

/// One filled order as persisted to the output file.
///
/// Field order here is the field order on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderRecord {
    pub order_id: String,
    pub account_id: AccountId,
    pub symbol: String,
    pub exchange: String,
    pub side: String,
    pub order_type: String,
    pub status: String,
    pub quantity: i64,
    pub filled_quantity: i64,
    pub price: f64,
    pub commission: f64,
    pub timestamp: i32,
}

/// Per-account progress counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessingStats {
    /// Enumerated history dates plus the current session.
    pub total_days: usize,
    pub days_processed: usize,
    pub orders_processed: usize,
}

/// Login credentials handed to the gateway.
#[derive(Clone)]
pub struct Credentials {
    pub user: String,
    pub password: String,
    pub connect_point: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("connect_point", &self.connect_point)
            .finish()
    }
}
