//! The callback bridge: the one place gateway completions enter the crate.
//!
//! For every completion the bridge validates the payload, converts what
//! survives into domain types, updates `RunState` under its lock and wakes
//! whoever is waiting on that request. The orchestrator arms a request
//! before issuing it and then blocks in `await_completion` until the bridge
//! signals it or the deadline passes. No polling.
//!
//! RMS and replay completions must carry the account (and replay date) of
//! the armed request. A late answer to a request that already timed out
//! matches nothing and is discarded.
//!
//! RULE: completion handling never blocks on anything but the state lock
//! and the writer lock, and never panics on bad input.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::{
    dates::{build_history_set, parse_date},
    error::{FetchError, FetchResult},
    gateway::{
        AlertInfo, AlertKind, Completion, ConnectionKind, GatewayEvents, RawAccount, RawOrderLine,
        RawRmsEntry, RawStr, RequestTag,
    },
    state::{InFlight, LoginStatus, RequestKind, RunState},
    types::{Account, OrderRecord, ProcessingStats},
    validation::{validate_account, validate_order_line, validate_string, OrderLine},
    writer::SharedWriter,
};

/// Lines beyond this index in a single batch are ignored.
pub const MAX_BATCH_LINES: usize = 10_000;

/// In-memory cap on retained orders per account.
pub const MAX_ORDERS_PER_ACCOUNT: usize = 1_000_000;

const PROGRESS_EVERY: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeOptions {
    pub start_date: String,
    pub max_days: usize,
}

pub struct CallbackBridge {
    state: Mutex<RunState>,
    signal: Condvar,
    writer: Mutex<Option<SharedWriter>>,
    options: BridgeOptions,
}

impl CallbackBridge {
    pub fn new(options: BridgeOptions) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RunState::new()),
            signal: Condvar::new(),
            writer: Mutex::new(None),
            options,
        })
    }

    /// Persist every accepted order through `writer` from now on.
    pub fn attach_writer(&self, writer: SharedWriter) {
        *self.writer.lock() = Some(writer);
    }

    pub fn writer(&self) -> Option<SharedWriter> {
        self.writer.lock().clone()
    }

    pub fn options(&self) -> &BridgeOptions {
        &self.options
    }

    /// Run `f` with exclusive access to the run state.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut RunState) -> R) -> R {
        f(&mut self.state.lock())
    }

    // ── Orchestrator side ─────────────────────────────────────────

    /// Register the request about to be issued so its completion can be
    /// matched and waited for.
    pub fn arm(&self, kind: RequestKind, account_id: Option<&str>, date: Option<&str>) {
        let mut state = self.state.lock();
        if let Some(stale) = state.in_flight.take() {
            log::warn!("replacing unanswered {} request", stale.kind.name());
            state.outstanding_requests = state.outstanding_requests.saturating_sub(1);
        }
        state.set_received(kind, false);
        state.completion_error = None;
        state.in_flight = Some(InFlight {
            kind,
            account_id: account_id.map(str::to_string),
            date: date.map(str::to_string),
        });
        state.outstanding_requests += 1;
    }

    /// Forget the armed request of `kind`, e.g. after the gateway rejected it.
    pub fn disarm(&self, kind: RequestKind) {
        self.state.lock().take_in_flight(kind);
    }

    /// Block until the completion for the armed `kind` arrives or
    /// `timeout` elapses. An error status on the completion comes back as
    /// `FetchError::Gateway`.
    pub fn await_completion(&self, kind: RequestKind, timeout: Duration) -> FetchResult<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.received(kind) {
                return match state.completion_error.take() {
                    Some(e) => Err(e),
                    None => Ok(()),
                };
            }
            if self.signal.wait_until(&mut state, deadline).timed_out() && !state.received(kind) {
                state.take_in_flight(kind);
                return Err(FetchError::Timeout {
                    waiting_for: kind.name().to_string(),
                    waited_ms: timeout.as_millis() as u64,
                });
            }
        }
    }

    /// Block until the trading-system login completes or fails.
    pub fn await_login(&self, timeout: Duration) -> FetchResult<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            match &state.login {
                LoginStatus::Complete => return Ok(()),
                LoginStatus::Failed(reason) => {
                    return Err(FetchError::Connection(format!("login failed: {reason}")));
                }
                LoginStatus::Pending => {}
            }
            if self.signal.wait_until(&mut state, deadline).timed_out()
                && state.login == LoginStatus::Pending
            {
                return Err(FetchError::Connection(format!(
                    "timed out after {}s waiting for login",
                    timeout.as_secs()
                )));
            }
        }
    }

    // ── Helpers ───────────────────────────────────────────────────

    /// Record an error completion for the in-flight request it answers.
    fn fail_completion(&self, kind: RequestKind, status: i32, tag: &RequestTag) {
        let mut state = self.state.lock();
        if state.take_answered(kind, tag).is_none() {
            log::warn!(
                "{} completion with status {status} and no matching request ({tag:?})",
                kind.name()
            );
            return;
        }
        log::error!("{} completion returned status {status}", kind.name());
        state.completion_error = Some(FetchError::gateway(kind.name(), status));
        state.set_received(kind, true);
        self.signal.notify_all();
    }

    fn validate_lines(items: &[RawOrderLine]) -> Vec<OrderLine> {
        if items.len() > MAX_BATCH_LINES {
            log::warn!(
                "order batch of {} lines exceeds limit of {MAX_BATCH_LINES}; truncating",
                items.len()
            );
        }
        items
            .iter()
            .take(MAX_BATCH_LINES)
            .enumerate()
            .filter_map(|(i, raw)| match validate_order_line(raw) {
                Ok(line) => line,
                Err(e) => {
                    log::error!("Invalid line info data at index {i}: {e}");
                    None
                }
            })
            .collect()
    }

    /// Price `lines` and retain them in memory up to `cap` per account.
    /// Returns every priced record; persistence is not capped.
    fn accept_lines(state: &mut RunState, lines: Vec<OrderLine>, cap: usize) -> Vec<OrderRecord> {
        let mut accepted = Vec::with_capacity(lines.len());
        for line in lines {
            let commission = state.commissions.price_order(
                &line.account.account_id,
                &line.symbol,
                line.filled_quantity,
            );
            let record = line.into_record(commission);

            let orders = state.account_orders.entry(record.account_id.clone()).or_default();
            if orders.len() < cap {
                orders.push(record.clone());
                let stats = state.stats.entry(record.account_id.clone()).or_default();
                stats.orders_processed += 1;
                if stats.orders_processed % PROGRESS_EVERY == 0 {
                    log_progress(&record.account_id, stats);
                }
            } else {
                log::error!(
                    "Exceeded maximum orders per account for {}; {} written but not retained",
                    record.account_id,
                    record.order_id
                );
            }
            accepted.push(record);
        }
        accepted
    }
}

fn log_progress(account_id: &str, stats: &ProcessingStats) {
    log::info!(
        "Account {account_id}: processed {} orders ({}/{} days)",
        stats.orders_processed, stats.days_processed, stats.total_days
    );
}

impl GatewayEvents for CallbackBridge {
    fn on_alert(&self, alert: AlertInfo) {
        let message = validate_string("alert_message", &alert.message).unwrap_or_default();
        log::info!("{:?} alert on {:?}: {message}", alert.kind, alert.connection);

        if alert.connection != ConnectionKind::TradingSystem {
            return;
        }
        let mut state = self.state.lock();
        match alert.kind {
            AlertKind::LoginComplete => {
                state.login = LoginStatus::Complete;
                self.signal.notify_all();
            }
            AlertKind::LoginFailed => {
                state.login = LoginStatus::Failed(message);
                self.signal.notify_all();
            }
            AlertKind::ConnectionClosed => log::warn!("trading system connection closed"),
            AlertKind::ConnectionOpened | AlertKind::Other => {}
        }
    }

    fn on_account_list(&self, completion: Completion<RawAccount>) {
        if !completion.is_ok() {
            self.fail_completion(RequestKind::AccountList, completion.status, &completion.tag);
            return;
        }

        log::info!("Processing {} accounts", completion.items.len());
        let accounts: Vec<Account> = completion
            .items
            .iter()
            .enumerate()
            .filter_map(|(i, raw)| match validate_account(raw) {
                Ok(account) => {
                    log::info!("Successfully added account: {}", account.account_id);
                    Some(account)
                }
                Err(e) => {
                    log::error!("Invalid account data at index {i}: {e}");
                    None
                }
            })
            .collect();
        if accounts.is_empty() {
            log::warn!("No accounts received in AccountList callback");
        }

        let mut state = self.state.lock();
        state.take_answered(RequestKind::AccountList, &completion.tag);
        state.accounts = accounts;
        state.account_list_received = true;
        self.signal.notify_all();
    }

    fn on_commission_list(&self, completion: Completion<RawRmsEntry>) {
        if !completion.is_ok() {
            self.fail_completion(RequestKind::CommissionList, completion.status, &completion.tag);
            return;
        }

        let entries: Vec<(String, f64, bool)> = completion
            .items
            .iter()
            .enumerate()
            .filter_map(|(i, raw)| {
                let code = match validate_string("product_code", &raw.product_code) {
                    Ok(code) => code,
                    Err(e) => {
                        log::error!("Invalid RMS entry at index {i}: {e}");
                        return None;
                    }
                };
                let valid = raw.has_commission_fill_rate && raw.commission_fill_rate.is_finite();
                if raw.has_commission_fill_rate && !valid {
                    log::warn!(
                        "Non-finite commission rate for {code} at index {i}; treating as absent"
                    );
                }
                Some((code, raw.commission_fill_rate, valid))
            })
            .collect();

        let mut state = self.state.lock();
        let Some(request) = state.take_answered(RequestKind::CommissionList, &completion.tag) else {
            log::warn!(
                "Ignoring {} RMS entries for {:?} with no matching request",
                entries.len(),
                completion.tag.account_id
            );
            return;
        };
        if request.account_id.as_deref() != state.commissions.owner() {
            log::warn!(
                "RMS entries for {:?} arrived while table belongs to {:?}; ignoring",
                request.account_id,
                state.commissions.owner()
            );
        } else {
            for (code, rate, valid) in &entries {
                state.commissions.ingest(code, *rate, *valid);
            }
            log::info!("Loaded {} commission rates", state.commissions.len());
        }
        state.commission_list_received = true;
        self.signal.notify_all();
    }

    fn on_history_dates(&self, completion: Completion<RawStr>) {
        if !completion.is_ok() {
            self.fail_completion(RequestKind::HistoryDates, completion.status, &completion.tag);
            return;
        }

        let raw_dates: Vec<String> = completion
            .items
            .iter()
            .enumerate()
            .filter_map(|(i, raw)| match validate_string("date", raw) {
                Ok(date) if parse_date(&date).is_ok() => Some(date),
                Ok(date) => {
                    log::error!("Invalid date format: {date}");
                    None
                }
                Err(e) => {
                    log::error!("Invalid date string at index {i}: {e}");
                    None
                }
            })
            .collect();
        let dates = build_history_set(&raw_dates, &self.options.start_date, self.options.max_days);
        if dates.is_empty() {
            log::warn!("No history dates on or after {}", self.options.start_date);
        }

        let mut state = self.state.lock();
        let Some(request) = state.take_answered(RequestKind::HistoryDates, &completion.tag) else {
            log::warn!("Ignoring {} history dates with no matching request", dates.len());
            return;
        };
        if let Some(account_id) = request.account_id {
            state.stats.insert(
                account_id,
                ProcessingStats {
                    total_days: dates.len() + 1,
                    ..ProcessingStats::default()
                },
            );
        }
        state.history_dates = dates;
        state.history_dates_received = true;
        self.signal.notify_all();
    }

    fn on_order_batch(&self, completion: Completion<RawOrderLine>) {
        if !completion.is_ok() {
            self.fail_completion(RequestKind::OrderReplay, completion.status, &completion.tag);
            return;
        }

        let lines = Self::validate_lines(&completion.items);

        let (request, records) = {
            let mut state = self.state.lock();
            let request = state
                .in_flight
                .clone()
                .filter(|f| f.answered_by(RequestKind::OrderReplay, &completion.tag));
            let Some(request) = request else {
                log::warn!(
                    "Discarding order batch of {} lines for {:?} on {:?} with no matching request",
                    lines.len(),
                    completion.tag.account_id,
                    completion.tag.date
                );
                return;
            };
            (request, Self::accept_lines(&mut state, lines, MAX_ORDERS_PER_ACCOUNT))
        };

        // Persist before signalling so a waiter that goes on to finish()
        // never closes the file ahead of this batch.
        if !records.is_empty() {
            match self.writer() {
                Some(writer) => {
                    let lost = records.iter().filter(|r| !writer.record(r)).count();
                    if lost > 0 {
                        log::error!(
                            "{lost} orders could not be written to {}",
                            writer.path().display()
                        );
                    }
                }
                None => log::debug!(
                    "no output attached; {} orders kept in memory only",
                    records.len()
                ),
            }
        }

        let mut state = self.state.lock();
        if state.in_flight.as_ref() != Some(&request) {
            log::warn!(
                "Order replay for {:?} timed out while its {} records were being written",
                request.account_id,
                records.len()
            );
            return;
        }
        state.take_in_flight(RequestKind::OrderReplay);
        if let Some(account_id) = request.account_id {
            let stats = state.stats.entry(account_id.clone()).or_default();
            if stats.days_processed < stats.total_days {
                stats.days_processed += 1;
            }
            log_progress(&account_id, stats);
        }
        state.order_replay_received = true;
        log::info!(
            "Completed order replay batch. Outstanding requests: {}",
            state.outstanding_requests
        );
        self.signal.notify_all();
    }
}
