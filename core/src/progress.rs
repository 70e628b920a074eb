//! Newline-delimited JSON status stream for a calling process.
//!
//! Every line is one object tagged by `type`. Final results (`accounts`,
//! `complete`) go to stdout, everything else to stderr.

use std::io::{self, Write};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::Account;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Log {
        level: String,
        message: String,
    },
    Progress {
        message: String,
        account_id: String,
        date: String,
        index: usize,
        total: usize,
    },
    Accounts {
        accounts: Vec<Account>,
    },
    AccountComplete {
        message: String,
        account_id: String,
        position: usize,
        total_accounts: usize,
        orders: usize,
    },
    Complete {
        status: String,
        total_accounts_available: usize,
        accounts_processed: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        accounts_failed: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        accounts_skipped: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_orders: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        orders_file: Option<String>,
    },
    Error {
        message: String,
    },
}

impl ProgressEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Whether this event belongs on stdout rather than stderr.
    pub fn is_result(&self) -> bool {
        matches!(self, Self::Accounts { .. } | Self::Complete { .. })
    }

    pub fn to_line(&self) -> String {
        // Every variant is plain data; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"type":"error","message":"unserializable event: {e}"}}"#)
        })
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: &ProgressEvent);
}

/// Writes each event as one line to stdout or stderr and flushes.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdioSink;

impl EventSink for StdioSink {
    fn emit(&self, event: &ProgressEvent) {
        let line = event.to_line();
        let result = if event.is_result() {
            let mut out = io::stdout().lock();
            writeln!(out, "{line}").and_then(|()| out.flush())
        } else {
            let mut err = io::stderr().lock();
            writeln!(err, "{line}").and_then(|()| err.flush())
        };
        if let Err(e) = result {
            log::warn!("could not write progress event: {e}");
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().clone()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: &ProgressEvent) {
        self.events.lock().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_tag() {
        let line = ProgressEvent::error("boom").to_line();
        assert_eq!(line, r#"{"type":"error","message":"boom"}"#);

        let line = ProgressEvent::AccountComplete {
            message: "Completed account A1 (1/2): 3 orders processed".into(),
            account_id: "A1".into(),
            position: 1,
            total_accounts: 2,
            orders: 3,
        }
        .to_line();
        let v: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v["type"], "account_complete");
        assert_eq!(v["orders"], 3);
    }

    #[test]
    fn complete_omits_unset_counters() {
        let line = ProgressEvent::Complete {
            status: "all_complete".into(),
            total_accounts_available: 2,
            accounts_processed: 2,
            accounts_failed: None,
            accounts_skipped: None,
            total_orders: None,
            orders_file: None,
        }
        .to_line();
        assert!(!line.contains("orders_file"));
        assert!(ProgressEvent::Accounts { accounts: vec![] }.is_result());
    }
}
