//! Commission resolver.
//!
//! RULE: the table belongs to exactly one account at a time. It is reset
//! and tagged with the account before that account's RMS request, and a
//! lookup for any other account prices at zero.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::AccountId;

/// Rates outside this range are treated as absent.
pub const MAX_COMMISSION_RATE: f64 = 100.0;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommissionRate {
    pub product_code: String,
    pub rate: f64,
    pub is_valid: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CommissionTable {
    owner: Option<AccountId>,
    rates: HashMap<String, CommissionRate>,
}

impl CommissionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear every rate and hand the table to `account_id`.
    pub fn reset(&mut self, account_id: &str) {
        self.rates.clear();
        self.owner = Some(account_id.to_string());
    }

    pub fn ingest(&mut self, product_code: &str, rate: f64, is_valid: bool) {
        self.rates.insert(
            product_code.to_string(),
            CommissionRate {
                product_code: product_code.to_string(),
                rate: if is_valid { rate } else { 0.0 },
                is_valid,
            },
        );
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub fn len(&self) -> usize {
        self.rates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }

    pub fn get(&self, product_code: &str) -> Option<&CommissionRate> {
        self.rates.get(product_code)
    }

    /// Commission for `filled_quantity` units of `symbol` on `account_id`.
    pub fn price_order(&self, account_id: &str, symbol: &str, filled_quantity: i64) -> f64 {
        if self.owner.as_deref() != Some(account_id) {
            log::debug!(
                "commission table owned by {:?}, not {account_id}; pricing {symbol} at 0",
                self.owner
            );
            return 0.0;
        }

        let code = product_code(symbol);
        match self.rates.get(code) {
            Some(entry) if entry.is_valid && (0.0..=MAX_COMMISSION_RATE).contains(&entry.rate) => {
                filled_quantity as f64 * entry.rate
            }
            Some(entry) if entry.is_valid => {
                log::warn!(
                    "ignoring out-of-range commission rate {} for product {code}",
                    entry.rate
                );
                0.0
            }
            _ => 0.0,
        }
    }
}

/// Strip the trailing month/year code: `ESZ4` -> `ES`. Symbols of two
/// characters or fewer are their own product code.
pub fn product_code(symbol: &str) -> &str {
    let cut = symbol.len().saturating_sub(2);
    if symbol.len() > 2 && symbol.is_char_boundary(cut) {
        &symbol[..cut]
    } else {
        symbol
    }
}
