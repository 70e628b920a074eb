//! The account processing pipeline.
//!
//! Drives every account through
//! `Pending → RequestRms → AwaitRms → RequestDates → AwaitDates →
//! Subscribing → ReplayCurrentSession → ReplayHistorical[i] → Done`,
//! one gateway request at a time.
//!
//! RULE: a failure inside one account (or one date) never ends the run.
//! Only login and account-list failures are returned as errors.

use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::Arc,
    thread,
    time::Duration,
};

use serde::Serialize;

use crate::{
    bridge::CallbackBridge,
    config::FetchOptions,
    error::{FetchError, FetchResult},
    gateway::{CallResult, Gateway, RejectCode},
    progress::{EventSink, ProgressEvent},
    retry::RetryPolicy,
    state::{AccountPhase, RequestKind},
    types::{Account, AccountId, Credentials},
};

/// Every wait and pause the pipeline makes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    pub login_timeout: Duration,
    pub account_list_timeout: Duration,
    pub rms_timeout: Duration,
    pub dates_timeout: Duration,
    pub replay_timeout: Duration,
    /// Pause between consecutive requests for one account.
    pub request_spacing: Duration,
    /// Pause between historical date replays.
    pub date_spacing: Duration,
    pub retry: RetryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            login_timeout: Duration::from_secs(30),
            account_list_timeout: Duration::from_secs(30),
            rms_timeout: Duration::from_secs(10),
            dates_timeout: Duration::from_secs(30),
            replay_timeout: Duration::from_secs(10),
            request_spacing: Duration::from_millis(100),
            date_spacing: Duration::from_millis(5),
            retry: RetryPolicy::default(),
        }
    }
}

/// How one account ended up.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AccountReport {
    pub account_id: AccountId,
    pub phase: AccountPhase,
    pub trace: Vec<AccountPhase>,
    pub orders: usize,
    pub failure: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RunSummary {
    pub total_accounts_available: usize,
    pub accounts_processed: usize,
    pub accounts_failed: usize,
    pub accounts_skipped: usize,
    pub total_orders: usize,
    pub orders_file: Option<PathBuf>,
    pub reports: Vec<AccountReport>,
}

impl RunSummary {
    pub fn report(&self, account_id: &str) -> Option<&AccountReport> {
        self.reports.iter().find(|r| r.account_id == account_id)
    }

    /// The final `complete` line for the progress stream.
    pub fn complete_event(&self) -> ProgressEvent {
        ProgressEvent::Complete {
            status: "all_complete".into(),
            total_accounts_available: self.total_accounts_available,
            accounts_processed: self.accounts_processed,
            accounts_failed: Some(self.accounts_failed),
            accounts_skipped: Some(self.accounts_skipped),
            total_orders: Some(self.total_orders),
            orders_file: self.orders_file.as_ref().map(|p| p.display().to_string()),
        }
    }
}

pub struct FetchPipeline<'a> {
    gateway: &'a dyn Gateway,
    bridge: Arc<CallbackBridge>,
    sink: &'a dyn EventSink,
    config: PipelineConfig,
}

impl<'a> FetchPipeline<'a> {
    pub fn new(
        gateway: &'a dyn Gateway,
        bridge: Arc<CallbackBridge>,
        sink: &'a dyn EventSink,
    ) -> Self {
        Self {
            gateway,
            bridge,
            sink,
            config: PipelineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn bridge(&self) -> &Arc<CallbackBridge> {
        &self.bridge
    }

    // ── Session ───────────────────────────────────────────────────

    /// Log in and fetch the account list. Any failure here is fatal.
    pub fn establish_session(&self, credentials: &Credentials) -> FetchResult<Vec<Account>> {
        log::info!("Logging in as {} at {}", credentials.user, credentials.connect_point);
        self.gateway.login(credentials).map_err(|RejectCode(code)| {
            FetchError::Connection(format!("login call rejected with code {code}"))
        })?;
        self.bridge.await_login(self.config.login_timeout)?;
        log::info!("Login complete");

        self.bridge.arm(RequestKind::AccountList, None, None);
        if let Err(RejectCode(code)) = self.gateway.request_account_list() {
            self.bridge.disarm(RequestKind::AccountList);
            return Err(FetchError::Connection(format!(
                "account list request rejected with code {code}"
            )));
        }
        self.bridge
            .await_completion(RequestKind::AccountList, self.config.account_list_timeout)
            .map_err(|e| FetchError::Connection(format!("no account list: {e}")))?;

        let accounts = self.bridge.with_state(|s| s.accounts.clone());
        log::info!("Received {} accounts", accounts.len());
        Ok(accounts)
    }

    // ── Run ───────────────────────────────────────────────────────

    /// Process every account the session returned, then close the output.
    pub fn run(&self, options: &FetchOptions) -> FetchResult<RunSummary> {
        let accounts = self.bridge.with_state(|s| s.accounts.clone());

        for wanted in &options.requested_accounts {
            if !accounts.iter().any(|a| &a.account_id == wanted) {
                log::warn!("Requested account {wanted} not found in account list");
            }
        }

        let mut targets = Vec::new();
        for account in &accounts {
            let id = &account.account_id;
            self.bridge.with_state(|s| s.transition(id, AccountPhase::Pending));
            if options.wants(id) {
                targets.push(account);
            } else {
                log::info!("Skipping account {id}: not in requested list");
                self.bridge.with_state(|s| s.transition(id, AccountPhase::Skipped));
            }
        }
        log::info!("Processing {} of {} accounts", targets.len(), accounts.len());

        let mut failures: BTreeMap<AccountId, String> = BTreeMap::new();
        let mut subscribed: Option<&Account> = None;
        for (i, account) in targets.iter().copied().enumerate() {
            let id = &account.account_id;
            self.bridge.with_state(|s| s.current_account_index = i);

            if let Some(previous) = subscribed.take() {
                self.unsubscribe(previous);
            }

            let mut now_subscribed = false;
            match self.process_account(account, i + 1, targets.len(), &mut now_subscribed) {
                Ok(orders) => {
                    self.bridge.with_state(|s| s.transition(id, AccountPhase::Done));
                    let message = format!(
                        "Completed account {id} ({}/{}): {orders} orders processed",
                        i + 1,
                        targets.len()
                    );
                    log::info!("{message}");
                    self.sink.emit(&ProgressEvent::AccountComplete {
                        message,
                        account_id: id.clone(),
                        position: i + 1,
                        total_accounts: targets.len(),
                        orders,
                    });
                }
                Err(e) => {
                    log::error!("Account {id} failed: {e}");
                    self.bridge.with_state(|s| s.transition(id, AccountPhase::Failed));
                    failures.insert(id.clone(), e.to_string());
                }
            }
            if now_subscribed {
                subscribed = Some(account);
            }
            self.bridge.with_state(|s| s.current_account_index = i + 1);
        }
        if let Some(last) = subscribed {
            self.unsubscribe(last);
        }

        let writer = self.bridge.writer();
        if let Some(writer) = &writer {
            writer.finish();
        }

        let summary = self.bridge.with_state(|s| {
            let reports: Vec<AccountReport> = accounts
                .iter()
                .map(|a| AccountReport {
                    account_id: a.account_id.clone(),
                    phase: s.phase_of(&a.account_id).unwrap_or(AccountPhase::Pending),
                    trace: s.phases.get(&a.account_id).cloned().unwrap_or_default(),
                    orders: s.orders_for(&a.account_id),
                    failure: failures.get(&a.account_id).cloned(),
                })
                .collect();
            let count = |phase: AccountPhase| reports.iter().filter(|r| r.phase == phase).count();
            RunSummary {
                total_accounts_available: accounts.len(),
                accounts_processed: count(AccountPhase::Done),
                accounts_failed: count(AccountPhase::Failed),
                accounts_skipped: count(AccountPhase::Skipped),
                total_orders: targets.iter().map(|a| s.orders_for(&a.account_id)).sum(),
                orders_file: writer.as_ref().map(|w| w.path().to_path_buf()),
                reports,
            }
        });
        log::info!(
            "Run finished: {} processed, {} failed, {} skipped, {} orders",
            summary.accounts_processed,
            summary.accounts_failed,
            summary.accounts_skipped,
            summary.total_orders
        );
        Ok(summary)
    }

    // ── Per account ───────────────────────────────────────────────

    fn process_account(
        &self,
        account: &Account,
        position: usize,
        total: usize,
        subscribed: &mut bool,
    ) -> FetchResult<usize> {
        let id = account.account_id.as_str();
        log::info!("Processing account {id} ({position}/{total})");

        self.load_commissions(account)?;
        self.pause(self.config.request_spacing);

        let dates = self.load_history_dates(account)?;
        self.pause(self.config.request_spacing);

        self.transition(id, AccountPhase::Subscribing);
        self.config.retry.run("subscribe orders", |_| {
            gateway_call("subscribe orders", self.gateway.subscribe_orders(account))
        })?;
        *subscribed = true;
        log::info!("Subscribed to orders for {id}");
        self.pause(self.config.request_spacing);

        self.transition(id, AccountPhase::ReplayCurrentSession);
        self.replay(account, None);

        for (i, date) in dates.iter().enumerate() {
            self.pause(self.config.date_spacing);
            self.transition(id, AccountPhase::ReplayHistorical { index: i });
            self.sink.emit(&ProgressEvent::Progress {
                message: format!("[{id}] Processing date {}/{}: {date}", i + 1, dates.len()),
                account_id: id.to_string(),
                date: date.clone(),
                index: i + 1,
                total: dates.len(),
            });
            self.replay(account, Some(date));
        }

        Ok(self.bridge.with_state(|s| s.orders_for(id)))
    }

    /// Rebuild the commission table for `account`. Rejections and error
    /// completions are retried; a missing completion fails the account.
    fn load_commissions(&self, account: &Account) -> FetchResult<()> {
        let id = account.account_id.as_str();
        self.bridge.with_state(|s| s.commissions.reset(id));

        self.config.retry.run("product RMS request", |attempt| {
            self.transition(id, AccountPhase::RequestRms);
            log::info!("Requesting RMS info for {id} (attempt {attempt})");
            self.bridge.arm(RequestKind::CommissionList, Some(id), None);
            let accepted = self.gateway.request_product_rms_info(account);
            if let Err(e) = gateway_call("product RMS request", accepted) {
                self.bridge.disarm(RequestKind::CommissionList);
                return Err(e);
            }
            self.transition(id, AccountPhase::AwaitRms);
            self.bridge.await_completion(RequestKind::CommissionList, self.config.rms_timeout)
        })
    }

    fn load_history_dates(&self, account: &Account) -> FetchResult<Vec<String>> {
        let id = account.account_id.as_str();
        self.transition(id, AccountPhase::RequestDates);
        self.bridge.arm(RequestKind::HistoryDates, Some(id), None);
        let accepted = self.gateway.request_order_history_dates();
        if let Err(e) = gateway_call("order history dates", accepted) {
            self.bridge.disarm(RequestKind::HistoryDates);
            return Err(e);
        }
        self.transition(id, AccountPhase::AwaitDates);
        self.bridge
            .await_completion(RequestKind::HistoryDates, self.config.dates_timeout)
            .inspect_err(|e| log::error!("History dates for {id} unavailable: {e}"))?;

        let dates = self.bridge.with_state(|s| s.history_dates.clone());
        log::info!("Found {} history dates for {id}", dates.len());
        Ok(dates)
    }

    /// Replay one date (or the current session when `date` is `None`).
    /// Problems are reported and the pipeline moves on.
    fn replay(&self, account: &Account, date: Option<&str>) {
        let id = account.account_id.as_str();
        let label = date.unwrap_or("current session");
        log::info!("Replaying {label} orders for {id}");

        self.bridge.arm(RequestKind::OrderReplay, Some(id), date);
        let call = match date {
            None => self.gateway.request_replay_orders(account, 0, 0),
            Some(d) => self.gateway.request_replay_historical_orders(account, d),
        };
        if let Err(RejectCode(code)) = call {
            self.bridge.disarm(RequestKind::OrderReplay);
            let message = format!("Replay request for {id} ({label}) rejected with code {code}");
            log::error!("{message}");
            self.sink.emit(&ProgressEvent::error(message));
            return;
        }

        match self.bridge.await_completion(RequestKind::OrderReplay, self.config.replay_timeout) {
            Ok(()) => {}
            Err(FetchError::Timeout { waited_ms, .. }) => {
                log::warn!("Timed out after {waited_ms}ms waiting for {label} replay of {id}");
            }
            Err(e) => log::error!("Replay of {label} for {id} failed: {e}"),
        }
    }

    fn unsubscribe(&self, account: &Account) {
        match self.gateway.unsubscribe_orders(account) {
            Ok(()) => log::info!("Unsubscribed from orders for {}", account.account_id),
            Err(RejectCode(code)) => log::warn!(
                "Unsubscribe for {} rejected with code {code}; continuing",
                account.account_id
            ),
        }
    }

    fn transition(&self, account_id: &str, phase: AccountPhase) {
        self.bridge.with_state(|s| s.transition(account_id, phase));
    }

    fn pause(&self, duration: Duration) {
        if !duration.is_zero() {
            thread::sleep(duration);
        }
    }
}

fn gateway_call(operation: &str, result: CallResult) -> FetchResult<()> {
    result.map_err(|RejectCode(code)| FetchError::gateway(operation, code))
}
