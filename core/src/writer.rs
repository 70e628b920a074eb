//! Streaming JSON order writer.
//!
//! The output document is `{ "<account>": [ {order}, ... ], ..., "status": .., "timestamp": .. }`.
//! Orders are appended as they arrive and flushed after every write; the
//! full order set is never held here.
//!
//! RULE: whatever happens, the file on disk ends as a closed JSON object.
//! `finish()` tags it `complete`, every other exit path tags it
//! `interrupted` (or `error` after an I/O failure). Dropping an open
//! writer closes it.

use std::{
    fs::{self, File},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    sync::{Arc, Weak},
};

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    error::FetchResult,
    types::{AccountId, OrderRecord},
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CloseStatus {
    Complete,
    Interrupted,
    Error,
}

impl CloseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Interrupted => "interrupted",
            Self::Error => "error",
        }
    }
}

pub struct OrderWriter {
    path: PathBuf,
    out: Option<BufWriter<File>>,
    current_account: Option<AccountId>,
    first_order: bool,
    has_written_account: bool,
    orders_written: usize,
    closed_with: Option<CloseStatus>,
}

impl OrderWriter {
    /// Create the file (and its directory) and open the top-level object.
    pub fn create(path: impl Into<PathBuf>) -> FetchResult<Self> {
        let path = path.into();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let mut out = BufWriter::new(File::create(&path)?);
        out.write_all(b"{")?;
        out.flush()?;
        log::info!("Created order output file: {}", path.display());

        Ok(Self {
            path,
            out: Some(out),
            current_account: None,
            first_order: true,
            has_written_account: false,
            orders_written: 0,
            closed_with: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        self.closed_with.is_some()
    }

    pub fn closed_with(&self) -> Option<CloseStatus> {
        self.closed_with
    }

    pub fn orders_written(&self) -> usize {
        self.orders_written
    }

    /// Open the keyed array for `account_id`. Repeating the active account
    /// is a no-op so consecutive date batches share one array.
    pub fn start_account(&mut self, account_id: &str) {
        if self.is_closed() || self.current_account.as_deref() == Some(account_id) {
            return;
        }
        if let Err(e) = self.try_start_account(account_id) {
            self.fail("start_account", e);
        }
    }

    /// Append one order to the active account's array. Returns whether the
    /// record reached the file; failures are logged, never raised.
    pub fn write_order(&mut self, record: &OrderRecord) -> bool {
        if self.is_closed() {
            return false;
        }
        if self.current_account.is_none() {
            log::error!("write_order called with no active account; dropping {}", record.order_id);
            return false;
        }
        match self.try_write_order(record) {
            Ok(()) => {
                self.orders_written += 1;
                true
            }
            Err(e) => {
                self.fail("write_order", e);
                false
            }
        }
    }

    /// Close the document as `complete`. Calling it again does nothing.
    pub fn finish(&mut self) {
        if self.is_closed() {
            return;
        }
        match self.close_with(CloseStatus::Complete) {
            Ok(()) => log::info!(
                "Successfully completed writing orders to {}",
                self.path.display()
            ),
            Err(e) => log::error!("Error in finish for {}: {e}", self.path.display()),
        }
    }

    /// Close the document as `interrupted`.
    pub fn emergency_close(&mut self) {
        if self.is_closed() {
            return;
        }
        match self.close_with(CloseStatus::Interrupted) {
            Ok(()) => log::warn!("Emergency close of order file {}", self.path.display()),
            Err(e) => log::error!("Error in emergency_close for {}: {e}", self.path.display()),
        }
    }

    fn try_start_account(&mut self, account_id: &str) -> io::Result<()> {
        let key = serde_json::to_string(account_id).map_err(io::Error::from)?;
        let out = self.out.as_mut().ok_or_else(stream_gone)?;
        if self.has_written_account {
            out.write_all(b"\n  ],")?;
        }
        write!(out, "\n  {key}: [")?;
        out.flush()?;

        self.current_account = Some(account_id.to_string());
        self.first_order = true;
        self.has_written_account = true;
        Ok(())
    }

    fn try_write_order(&mut self, record: &OrderRecord) -> io::Result<()> {
        let body = serde_json::to_string(record).map_err(io::Error::from)?;
        let out = self.out.as_mut().ok_or_else(stream_gone)?;
        if !self.first_order {
            out.write_all(b",")?;
        }
        write!(out, "\n    {body}")?;
        out.flush()?;
        self.first_order = false;
        Ok(())
    }

    /// Write the closing tail and release the file. The writer counts as
    /// closed even if the tail could not be written.
    fn close_with(&mut self, status: CloseStatus) -> io::Result<()> {
        self.closed_with = Some(status);
        let mut out = self.out.take().ok_or_else(stream_gone)?;
        if self.has_written_account {
            out.write_all(b"\n  ],")?;
        }
        write!(
            out,
            "\n  \"status\": \"{}\",\n  \"timestamp\": \"{}\"\n}}\n",
            status.as_str(),
            Utc::now().timestamp()
        )?;
        out.flush()?;
        out.get_ref().sync_all()
    }

    fn fail(&mut self, op: &str, e: io::Error) {
        log::error!("Error in {op} for {}: {e}; closing file", self.path.display());
        if let Err(e) = self.close_with(CloseStatus::Error) {
            log::error!("Could not close {} after failure: {e}", self.path.display());
        }
    }
}

impl Drop for OrderWriter {
    fn drop(&mut self) {
        if !self.is_closed() {
            self.emergency_close();
        }
    }
}

fn stream_gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "output stream already closed")
}

/// Lock-guarded writer shared between the callback thread (writes) and
/// the shutdown path (finish / emergency close).
#[derive(Clone)]
pub struct SharedWriter {
    inner: Arc<Mutex<OrderWriter>>,
    path: PathBuf,
}

impl SharedWriter {
    pub fn create(path: impl Into<PathBuf>) -> FetchResult<Self> {
        let writer = OrderWriter::create(path)?;
        let path = writer.path().to_path_buf();
        Ok(Self {
            inner: Arc::new(Mutex::new(writer)),
            path,
        })
    }

    /// `<output_dir>/orders_<unix-seconds>.json`
    pub fn for_run(output_dir: &Path) -> FetchResult<Self> {
        Self::create(output_dir.join(format!("orders_{}.json", Utc::now().timestamp())))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Route `record` to its account's array and append it.
    pub fn record(&self, record: &OrderRecord) -> bool {
        let mut writer = self.inner.lock();
        writer.start_account(&record.account_id);
        writer.write_order(record)
    }

    pub fn finish(&self) {
        self.inner.lock().finish();
    }

    pub fn emergency_close(&self) {
        self.inner.lock().emergency_close();
    }

    pub fn closed_with(&self) -> Option<CloseStatus> {
        self.inner.lock().closed_with()
    }

    pub fn orders_written(&self) -> usize {
        self.inner.lock().orders_written()
    }

    /// A handle that does not keep the file open, for signal handlers.
    pub fn downgrade(&self) -> WeakWriter {
        WeakWriter(Arc::downgrade(&self.inner))
    }
}

#[derive(Clone)]
pub struct WeakWriter(Weak<Mutex<OrderWriter>>);

impl WeakWriter {
    /// Emergency-close the file if it is still alive and open. Returns
    /// whether anything was closed.
    pub fn emergency_close(&self) -> bool {
        let Some(inner) = self.0.upgrade() else {
            return false;
        };
        let mut writer = inner.lock();
        if writer.is_closed() {
            return false;
        }
        writer.emergency_close();
        true
    }
}

#[cfg(test)]
mod tests {
    use std::fs::OpenOptions;

    use tempfile::TempDir;

    use super::*;

    fn record(order_id: &str) -> OrderRecord {
        OrderRecord {
            order_id: order_id.into(),
            account_id: "A1".into(),
            symbol: "ESZ4".into(),
            exchange: "CME".into(),
            side: "SELL".into(),
            order_type: "MKT".into(),
            status: "complete".into(),
            quantity: 1,
            filled_quantity: 1,
            price: 5000.0,
            commission: 2.5,
            timestamp: 1_714_000_000,
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn io_failure_is_logged_and_closes_as_error() {
        let dir = TempDir::new().unwrap();
        let mut writer = OrderWriter::create(dir.path().join("orders.json")).unwrap();
        writer.start_account("A1");
        assert!(writer.write_order(&record("1")));

        // Every write to /dev/full fails with ENOSPC.
        let full = OpenOptions::new().write(true).open("/dev/full").unwrap();
        writer.out = Some(BufWriter::new(full));

        assert!(!writer.write_order(&record("2")));
        assert_eq!(writer.closed_with(), Some(CloseStatus::Error));
        assert_eq!(writer.orders_written(), 1);

        writer.finish();
        writer.emergency_close();
        assert_eq!(writer.closed_with(), Some(CloseStatus::Error));
        assert!(!writer.write_order(&record("3")));
    }
}
