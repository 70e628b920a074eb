//! Boundary checks for untrusted gateway payloads.
//!
//! RULE: nothing from the gateway reaches the domain model without passing
//! through one of these functions. A failure is local to the record it
//! came from; callers log it with the record index and keep going.

use thiserror::Error;

use crate::{
    gateway::{RawAccount, RawOrderLine, RawStr},
    types::{Account, OrderRecord},
};

/// Exclusive upper bound on a length-prefixed field.
pub const MAX_FIELD_LEN: i32 = 1024;

/// Largest quantity or fill count we accept as plausible.
pub const MAX_QUANTITY: i64 = 1_000_000_000;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("{field}: null buffer")]
    NullBuffer { field: &'static str },

    #[error("{field}: declared length {len} is not positive")]
    EmptyBuffer { field: &'static str, len: i32 },

    #[error("{field}: declared length {len} exceeds limit of {MAX_FIELD_LEN}")]
    Oversized { field: &'static str, len: i32 },

    #[error("{field}: declared length {len} but only {available} bytes present")]
    Truncated {
        field: &'static str,
        len: i32,
        available: usize,
    },

    #[error("{field}: contains non-printable content")]
    NotPrintable { field: &'static str },

    #[error("{field}: value is not finite")]
    NonFinite { field: &'static str },

    #[error("{field}: value {value} out of range")]
    OutOfRange { field: &'static str, value: i64 },

    #[error("invalid date format: {value:?}")]
    InvalidFormat { value: String },
}

/// Decode one length-prefixed string field.
pub fn validate_string(field: &'static str, raw: &RawStr) -> Result<String, ValidationError> {
    let Some(bytes) = raw.data.as_deref() else {
        return Err(ValidationError::NullBuffer { field });
    };
    if raw.len <= 0 {
        return Err(ValidationError::EmptyBuffer {
            field,
            len: raw.len,
        });
    }
    if raw.len >= MAX_FIELD_LEN {
        return Err(ValidationError::Oversized {
            field,
            len: raw.len,
        });
    }
    let len = raw.len as usize;
    if len > bytes.len() {
        return Err(ValidationError::Truncated {
            field,
            len: raw.len,
            available: bytes.len(),
        });
    }
    let bytes = &bytes[..len];
    if !bytes.iter().all(|b| (0x20..=0x7e).contains(b)) {
        return Err(ValidationError::NotPrintable { field });
    }
    // Printable ASCII is always valid UTF-8.
    Ok(bytes.iter().map(|&b| b as char).collect())
}

/// All three identity fields must be valid for the account to be usable.
pub fn validate_account(raw: &RawAccount) -> Result<Account, ValidationError> {
    Ok(Account {
        account_id: validate_string("account_id", &raw.account_id)?,
        fcm_id: validate_string("fcm_id", &raw.fcm_id)?,
        ib_id: validate_string("ib_id", &raw.ib_id)?,
    })
}

pub fn validate_price(field: &'static str, value: f64) -> Result<f64, ValidationError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(ValidationError::NonFinite { field })
    }
}

pub fn validate_quantity(field: &'static str, value: i64) -> Result<i64, ValidationError> {
    if (0..=MAX_QUANTITY).contains(&value) {
        Ok(value)
    } else {
        Err(ValidationError::OutOfRange { field, value })
    }
}

/// Seconds since the epoch, stored as `i32` on disk.
pub fn validate_timestamp(value: i64) -> Result<i32, ValidationError> {
    if value < 0 {
        return Err(ValidationError::OutOfRange {
            field: "timestamp",
            value,
        });
    }
    i32::try_from(value).map_err(|_| ValidationError::OutOfRange {
        field: "timestamp",
        value,
    })
}

/// A replayed order line that passed every boundary check. Commission is
/// attached later, once the line is priced.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderLine {
    pub order_id: String,
    pub account: Account,
    pub symbol: String,
    pub exchange: String,
    pub side: String,
    pub order_type: String,
    pub status: String,
    pub quantity: i64,
    pub filled_quantity: i64,
    pub price: f64,
    pub timestamp: i32,
}

impl OrderLine {
    pub fn into_record(self, commission: f64) -> OrderRecord {
        OrderRecord {
            order_id: self.order_id,
            account_id: self.account.account_id,
            symbol: self.symbol,
            exchange: self.exchange,
            side: self.side,
            order_type: self.order_type,
            status: self.status,
            quantity: self.quantity,
            filled_quantity: self.filled_quantity,
            price: self.price,
            commission,
            timestamp: self.timestamp,
        }
    }
}

/// Validate one replayed line.
///
/// Returns `Ok(None)` for well-formed lines that carry no fill; those are
/// never persisted. The average fill price becomes the record's price, but
/// both prices must be finite.
pub fn validate_order_line(raw: &RawOrderLine) -> Result<Option<OrderLine>, ValidationError> {
    let order_id = validate_string("order_id", &raw.order_num)?;
    let symbol = validate_string("symbol", &raw.ticker)?;
    let exchange = validate_string("exchange", &raw.exchange)?;
    let side = validate_string("side", &raw.buy_sell_type)?;
    let order_type = validate_string("order_type", &raw.order_type)?;
    let status = validate_string("status", &raw.status)?;
    let account = validate_account(&raw.account)?;

    if raw.filled <= 0 {
        return Ok(None);
    }

    let quantity = validate_quantity("quantity", raw.quantity_to_fill)?;
    let filled_quantity = validate_quantity("filled_quantity", raw.filled)?;
    validate_price("price_to_fill", raw.price_to_fill)?;
    let price = validate_price("avg_fill_price", raw.avg_fill_price)?;
    let timestamp = validate_timestamp(raw.ssboe)?;

    Ok(Some(OrderLine {
        order_id,
        account,
        symbol,
        exchange,
        side,
        order_type,
        status,
        quantity,
        filled_quantity,
        price,
        timestamp,
    }))
}
