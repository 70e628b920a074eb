//! In-process simulated trading engine.
//!
//! `SimulatedGateway` answers every outbound call with an immediate
//! accept/reject and queues the matching completion onto its own delivery
//! thread, the same shape as the vendor engine. What it answers with comes
//! from a `SimBook` (accounts, commission tables, dates, orders) and what
//! goes wrong comes from a `SimScript` (rejections, error statuses,
//! completions that never arrive).
//!
//! RULE: the delivery thread is the only thread that calls into
//! `GatewayEvents`, and it delivers strictly in request order.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{mpsc, Arc},
    thread::{self, JoinHandle},
    time::Duration,
};

use chrono::{Datelike, NaiveDate, Weekday};
use parking_lot::Mutex;

use crate::{
    config::{SimSettings, MAX_SIM_ACCOUNTS},
    dates::today,
    error::FetchResult,
    gateway::{
        AlertInfo, AlertKind, CallResult, Completion, ConnectionKind, Gateway, GatewayEvents,
        RawAccount, RawOrderLine, RawRmsEntry, RawStr, RejectCode,
    },
    rng::{RngBank, SimStream},
    types::{Account, AccountId, Credentials, DateKey},
};

/// Reject code for calls the script refuses.
pub const SIM_REJECTED: i32 = 9;

/// Reject code once the engine has shut down.
pub const SIM_NOT_CONNECTED: i32 = 11;

/// Status carried by completions the script fails.
pub const SIM_ERROR_STATUS: i32 = 7;

// ── Book ──────────────────────────────────────────────────────────

/// Everything the simulated engine knows about.
#[derive(Debug, Clone, Default)]
pub struct SimBook {
    pub accounts: Vec<RawAccount>,
    pub commissions: HashMap<AccountId, Vec<RawRmsEntry>>,
    pub history_dates: Vec<RawStr>,
    pub current_session: HashMap<AccountId, Vec<RawOrderLine>>,
    pub historical: HashMap<(AccountId, DateKey), Vec<RawOrderLine>>,
}

impl SimBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn account(self, account_id: &str, fcm_id: &str, ib_id: &str) -> Self {
        self.raw_account(RawAccount {
            account_id: account_id.into(),
            fcm_id: fcm_id.into(),
            ib_id: ib_id.into(),
        })
    }

    pub fn raw_account(mut self, account: RawAccount) -> Self {
        self.accounts.push(account);
        self
    }

    pub fn commission(self, account_id: &str, product_code: &str, rate: f64) -> Self {
        self.raw_commission(account_id, RawRmsEntry {
            product_code: product_code.into(),
            commission_fill_rate: rate,
            has_commission_fill_rate: true,
        })
    }

    pub fn raw_commission(mut self, account_id: &str, entry: RawRmsEntry) -> Self {
        self.commissions.entry(account_id.to_string()).or_default().push(entry);
        self
    }

    pub fn history_date(self, date: &str) -> Self {
        self.raw_history_date(date.into())
    }

    pub fn raw_history_date(mut self, date: RawStr) -> Self {
        self.history_dates.push(date);
        self
    }

    pub fn current_order(mut self, account_id: &str, line: RawOrderLine) -> Self {
        self.current_session.entry(account_id.to_string()).or_default().push(line);
        self
    }

    pub fn historical_order(mut self, account_id: &str, date: &str, line: RawOrderLine) -> Self {
        self.historical
            .entry((account_id.to_string(), date.to_string()))
            .or_default()
            .push(line);
        self
    }

    /// A well-formed filled line.
    pub fn order_line(
        order_num: &str,
        account: &Account,
        ticker: &str,
        filled: i64,
        avg_fill_price: f64,
        ssboe: i64,
    ) -> RawOrderLine {
        RawOrderLine {
            order_num: order_num.into(),
            account: account.into(),
            ticker: ticker.into(),
            exchange: "CME".into(),
            buy_sell_type: "BUY".into(),
            order_type: "LMT".into(),
            status: "complete".into(),
            quantity_to_fill: filled.max(1),
            filled,
            price_to_fill: avg_fill_price,
            avg_fill_price,
            ssboe,
        }
    }

    /// A deterministic book for `settings.seed`, with the history calendar
    /// ending at today.
    pub fn generated(settings: &SimSettings) -> Self {
        let bank = RngBank::new(settings.seed);
        let mut account_rng = bank.stream(SimStream::Accounts);
        let mut commission_rng = bank.stream(SimStream::Commissions);
        let mut calendar_rng = bank.stream(SimStream::Calendar);
        let mut order_rng = bank.stream(SimStream::Orders);
        let mut corruption_rng = bank.stream(SimStream::Corruption);

        let mut book = SimBook::new();

        let wanted = settings.accounts.min(MAX_SIM_ACCOUNTS);
        let mut ids = BTreeSet::new();
        while ids.len() < wanted {
            ids.insert(format!("SIM{:05}", account_rng.below(MAX_SIM_ACCOUNTS as u64)));
        }
        let accounts: Vec<Account> = ids
            .into_iter()
            .map(|account_id| Account {
                account_id,
                fcm_id: "SIMFCM".into(),
                ib_id: "SIMIB".into(),
            })
            .collect();

        for account in &accounts {
            book = book.account(&account.account_id, &account.fcm_id, &account.ib_id);
            for product in PRODUCTS {
                if commission_rng.chance(0.1) {
                    book = book.raw_commission(&account.account_id, RawRmsEntry {
                        product_code: product.code.into(),
                        commission_fill_rate: 0.0,
                        has_commission_fill_rate: false,
                    });
                } else {
                    let cents = commission_rng.between(50, 450);
                    book = book.commission(&account.account_id, product.code, cents as f64 / 100.0);
                }
            }
        }

        let calendar = trading_days(settings.history_days);
        for day in &calendar {
            book = book.history_date(&day.format("%Y%m%d").to_string());
        }
        if calendar_rng.chance(0.5) {
            book = book.history_date("20241301");
        }

        let mut serial = 1_000_u64;
        let mut gen_line = |account: &Account, day: NaiveDate, corrupt: bool| {
            serial += 1;
            let product = order_rng.pick(&PRODUCTS).copied().unwrap_or(PRODUCTS[0]);
            let quantity = order_rng.between(1, 10);
            let cancelled = order_rng.chance(0.15);
            let filled = if cancelled { 0 } else { quantity };
            let ticks = order_rng.between(-200, 200) as f64;
            let price = product.base_price + ticks * product.tick;
            let open = day
                .and_hms_opt(13, 30, 0)
                .map(|t| t.and_utc().timestamp())
                .unwrap_or_default();
            let mut line = RawOrderLine {
                order_num: format!("{serial}").into(),
                account: account.into(),
                ticker: format!("{}{}", product.code, contract_suffix(day)).into(),
                exchange: product.exchange.into(),
                buy_sell_type: (if order_rng.chance(0.5) { "BUY" } else { "SELL" }).into(),
                order_type: (if order_rng.chance(0.6) { "LMT" } else { "MKT" }).into(),
                status: (if cancelled { "cancelled" } else { "complete" }).into(),
                quantity_to_fill: quantity,
                filled,
                price_to_fill: price,
                avg_fill_price: if cancelled { 0.0 } else { price },
                ssboe: open + order_rng.between(0, 6 * 3600),
            };
            if corrupt {
                line.ticker = RawStr::null();
            }
            line
        };

        let session_day = trading_days(1).into_iter().next();
        for account in &accounts {
            for day in &calendar {
                let key = day.format("%Y%m%d").to_string();
                for _ in 0..settings.orders_per_day {
                    let corrupt = corruption_rng.chance(0.03);
                    let line = gen_line(account, *day, corrupt);
                    book = book.historical_order(&account.account_id, &key, line);
                }
            }
            if let Some(day) = session_day {
                for _ in 0..settings.orders_per_day.div_ceil(2) {
                    book = book.current_order(&account.account_id, gen_line(account, day, false));
                }
            }
        }
        book
    }
}

#[derive(Debug, Clone, Copy)]
struct Product {
    code: &'static str,
    exchange: &'static str,
    base_price: f64,
    tick: f64,
}

const PRODUCTS: [Product; 6] = [
    Product {
        code: "ES",
        exchange: "CME",
        base_price: 5200.0,
        tick: 0.25,
    },
    Product {
        code: "NQ",
        exchange: "CME",
        base_price: 18200.0,
        tick: 0.25,
    },
    Product {
        code: "CL",
        exchange: "NYMEX",
        base_price: 78.0,
        tick: 0.01,
    },
    Product {
        code: "GC",
        exchange: "COMEX",
        base_price: 2350.0,
        tick: 0.10,
    },
    Product {
        code: "ZB",
        exchange: "CBOT",
        base_price: 118.0,
        tick: 0.03125,
    },
    Product {
        code: "6E",
        exchange: "CME",
        base_price: 1.08,
        tick: 0.00005,
    },
];

/// Month code plus last year digit for the front quarterly contract.
fn contract_suffix(day: NaiveDate) -> String {
    let month = match day.month() {
        1..=3 => 'H',
        4..=6 => 'M',
        7..=9 => 'U',
        _ => 'Z',
    };
    format!("{month}{}", day.year().rem_euclid(10))
}

/// The `count` most recent weekdays up to and including today, newest first.
fn trading_days(count: usize) -> Vec<NaiveDate> {
    let Ok(mut day) = NaiveDate::parse_from_str(&today(), "%Y%m%d") else {
        return Vec::new();
    };
    let mut days = Vec::with_capacity(count);
    while days.len() < count {
        if !matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
            days.push(day);
        }
        match day.pred_opt() {
            Some(prev) => day = prev,
            None => break,
        }
    }
    days
}

// ── Script ────────────────────────────────────────────────────────

/// Failures the simulated engine should inject.
#[derive(Debug, Clone, Default)]
pub struct SimScript {
    /// Reject the login call outright with this code.
    pub reject_login: Option<i32>,
    /// Accept the login, then report LoginFailed with this message.
    pub login_failure: Option<String>,
    /// Accept the login and never report its outcome.
    pub silent_login: bool,
    pub account_list_status: Option<i32>,
    /// Synchronously reject the first n RMS requests per account.
    pub rms_rejects: HashMap<AccountId, u32>,
    /// Answer the first n RMS requests per account with an error status.
    pub rms_error_completions: HashMap<AccountId, u32>,
    pub silent_rms: BTreeSet<AccountId>,
    pub dates_status: Option<i32>,
    pub silent_dates: bool,
    pub subscribe_rejects: HashMap<AccountId, u32>,
    pub replay_rejects: BTreeSet<DateKey>,
    pub replay_error_dates: BTreeSet<DateKey>,
    pub silent_replay_dates: BTreeSet<DateKey>,
    /// Extra delay before an account's RMS completion is delivered.
    pub slow_rms: HashMap<AccountId, Duration>,
    /// Extra delay before a date's replay completion is delivered.
    pub slow_replay_dates: HashMap<DateKey, Duration>,
}

impl SimScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject_login(mut self, code: i32) -> Self {
        self.reject_login = Some(code);
        self
    }

    pub fn fail_login(mut self, message: &str) -> Self {
        self.login_failure = Some(message.to_string());
        self
    }

    pub fn silent_login(mut self) -> Self {
        self.silent_login = true;
        self
    }

    pub fn fail_account_list(mut self, status: i32) -> Self {
        self.account_list_status = Some(status);
        self
    }

    pub fn reject_rms(mut self, account_id: &str, times: u32) -> Self {
        self.rms_rejects.insert(account_id.to_string(), times);
        self
    }

    pub fn fail_rms(mut self, account_id: &str, times: u32) -> Self {
        self.rms_error_completions.insert(account_id.to_string(), times);
        self
    }

    pub fn never_answer_rms(mut self, account_id: &str) -> Self {
        self.silent_rms.insert(account_id.to_string());
        self
    }

    pub fn fail_dates(mut self, status: i32) -> Self {
        self.dates_status = Some(status);
        self
    }

    pub fn never_answer_dates(mut self) -> Self {
        self.silent_dates = true;
        self
    }

    pub fn reject_subscribe(mut self, account_id: &str, times: u32) -> Self {
        self.subscribe_rejects.insert(account_id.to_string(), times);
        self
    }

    pub fn reject_replay(mut self, date: &str) -> Self {
        self.replay_rejects.insert(date.to_string());
        self
    }

    pub fn fail_replay(mut self, date: &str) -> Self {
        self.replay_error_dates.insert(date.to_string());
        self
    }

    pub fn never_answer_replay(mut self, date: &str) -> Self {
        self.silent_replay_dates.insert(date.to_string());
        self
    }

    pub fn delay_rms(mut self, account_id: &str, delay: Duration) -> Self {
        self.slow_rms.insert(account_id.to_string(), delay);
        self
    }

    pub fn delay_replay(mut self, date: &str, delay: Duration) -> Self {
        self.slow_replay_dates.insert(date.to_string(), delay);
        self
    }
}

// ── Engine ────────────────────────────────────────────────────────

/// One outbound call as the engine saw it, accepted or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimCall {
    Login,
    AccountList,
    ProductRms(AccountId),
    HistoryDates,
    Subscribe(AccountId),
    Unsubscribe(AccountId),
    ReplayCurrent(AccountId),
    ReplayHistorical(AccountId, DateKey),
}

enum Delivery {
    Alert(AlertInfo),
    Accounts(Completion<RawAccount>),
    Commissions(Completion<RawRmsEntry>),
    Dates(Completion<RawStr>),
    Orders(Completion<RawOrderLine>),
}

struct Tallies {
    calls: Vec<SimCall>,
    remaining: HashMap<(&'static str, AccountId), u32>,
}

pub struct SimulatedGateway {
    book: SimBook,
    script: SimScript,
    outbox: Mutex<Option<mpsc::Sender<(Duration, Delivery)>>>,
    delivery: Mutex<Option<JoinHandle<()>>>,
    tallies: Mutex<Tallies>,
}

impl SimulatedGateway {
    pub fn new(
        book: SimBook,
        script: SimScript,
        latency: Duration,
        events: Arc<dyn GatewayEvents>,
    ) -> FetchResult<Self> {
        let (tx, rx) = mpsc::channel::<(Duration, Delivery)>();
        let handle = thread::Builder::new()
            .name("sim-callbacks".into())
            .spawn(move || {
                for (extra, delivery) in rx {
                    let delay = latency + extra;
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                    match delivery {
                        Delivery::Alert(alert) => events.on_alert(alert),
                        Delivery::Accounts(c) => events.on_account_list(c),
                        Delivery::Commissions(c) => events.on_commission_list(c),
                        Delivery::Dates(c) => events.on_history_dates(c),
                        Delivery::Orders(c) => events.on_order_batch(c),
                    }
                }
                log::debug!("simulated engine delivery thread stopped");
            })?;

        let mut remaining = HashMap::new();
        for (account, n) in &script.rms_rejects {
            remaining.insert(("rms_reject", account.clone()), *n);
        }
        for (account, n) in &script.rms_error_completions {
            remaining.insert(("rms_error", account.clone()), *n);
        }
        for (account, n) in &script.subscribe_rejects {
            remaining.insert(("subscribe_reject", account.clone()), *n);
        }

        Ok(Self {
            book,
            script,
            outbox: Mutex::new(Some(tx)),
            delivery: Mutex::new(Some(handle)),
            tallies: Mutex::new(Tallies {
                calls: Vec::new(),
                remaining,
            }),
        })
    }

    /// Engine over a generated book, with no injected failures.
    pub fn generated(settings: &SimSettings, events: Arc<dyn GatewayEvents>) -> FetchResult<Self> {
        Self::new(
            SimBook::generated(settings),
            SimScript::default(),
            Duration::from_millis(settings.latency_ms),
            events,
        )
    }

    pub fn book(&self) -> &SimBook {
        &self.book
    }

    /// Every call received so far, in order.
    pub fn calls(&self) -> Vec<SimCall> {
        self.tallies.lock().calls.clone()
    }

    pub fn count_calls(&self, pred: impl Fn(&SimCall) -> bool) -> usize {
        self.tallies.lock().calls.iter().filter(|c| pred(c)).count()
    }

    fn log_call(&self, call: SimCall) {
        self.tallies.lock().calls.push(call);
    }

    /// Consume one scripted occurrence of `what` for `account_id`.
    fn take_scripted(&self, what: &'static str, account_id: &str) -> bool {
        let mut tallies = self.tallies.lock();
        match tallies.remaining.get_mut(&(what, account_id.to_string())) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }

    fn deliver(&self, delivery: Delivery) -> CallResult {
        self.deliver_after(Duration::ZERO, delivery)
    }

    /// Queue `delivery`, holding up the delivery thread for `extra` first.
    fn deliver_after(&self, extra: Duration, delivery: Delivery) -> CallResult {
        let outbox = self.outbox.lock();
        let Some(tx) = outbox.as_ref() else {
            return Err(RejectCode(SIM_NOT_CONNECTED));
        };
        tx.send((extra, delivery)).map_err(|_| RejectCode(SIM_NOT_CONNECTED))
    }

    fn connected(&self) -> CallResult {
        if self.outbox.lock().is_some() {
            Ok(())
        } else {
            Err(RejectCode(SIM_NOT_CONNECTED))
        }
    }
}

fn trading_alert(kind: AlertKind, message: &str) -> Delivery {
    Delivery::Alert(AlertInfo {
        kind,
        connection: ConnectionKind::TradingSystem,
        message: message.into(),
    })
}

impl Gateway for SimulatedGateway {
    fn login(&self, credentials: &Credentials) -> CallResult {
        self.log_call(SimCall::Login);
        if let Some(code) = self.script.reject_login {
            return Err(RejectCode(code));
        }
        self.deliver(trading_alert(AlertKind::ConnectionOpened, "connection opened"))?;
        if self.script.silent_login {
            return Ok(());
        }
        match &self.script.login_failure {
            Some(message) => self.deliver(trading_alert(AlertKind::LoginFailed, message)),
            None => self.deliver(trading_alert(
                AlertKind::LoginComplete,
                &format!("login complete for {}", credentials.user),
            )),
        }
    }

    fn request_account_list(&self) -> CallResult {
        self.log_call(SimCall::AccountList);
        let completion = match self.script.account_list_status {
            Some(status) => Completion::failed(status),
            None => Completion::ok(self.book.accounts.clone()),
        };
        self.deliver(Delivery::Accounts(completion))
    }

    fn request_product_rms_info(&self, account: &Account) -> CallResult {
        let id = &account.account_id;
        self.log_call(SimCall::ProductRms(id.clone()));
        if self.take_scripted("rms_reject", id) {
            return Err(RejectCode(SIM_REJECTED));
        }
        if self.script.silent_rms.contains(id) {
            return self.connected();
        }
        let completion = if self.take_scripted("rms_error", id) {
            Completion::failed(SIM_ERROR_STATUS)
        } else {
            Completion::ok(self.book.commissions.get(id).cloned().unwrap_or_default())
        };
        let delay = self.script.slow_rms.get(id).copied().unwrap_or_default();
        self.deliver_after(delay, Delivery::Commissions(completion.for_account(id)))
    }

    fn request_order_history_dates(&self) -> CallResult {
        self.log_call(SimCall::HistoryDates);
        if self.script.silent_dates {
            return self.connected();
        }
        let completion = match self.script.dates_status {
            Some(status) => Completion::failed(status),
            None => Completion::ok(self.book.history_dates.clone()),
        };
        self.deliver(Delivery::Dates(completion))
    }

    fn subscribe_orders(&self, account: &Account) -> CallResult {
        self.log_call(SimCall::Subscribe(account.account_id.clone()));
        if self.take_scripted("subscribe_reject", &account.account_id) {
            return Err(RejectCode(SIM_REJECTED));
        }
        self.connected()
    }

    fn unsubscribe_orders(&self, account: &Account) -> CallResult {
        self.log_call(SimCall::Unsubscribe(account.account_id.clone()));
        self.connected()
    }

    fn request_replay_orders(
        &self,
        account: &Account,
        _from_time: i32,
        _to_time: i32,
    ) -> CallResult {
        let id = &account.account_id;
        self.log_call(SimCall::ReplayCurrent(id.clone()));
        let lines = self.book.current_session.get(id).cloned().unwrap_or_default();
        self.deliver(Delivery::Orders(Completion::ok(lines).for_account(id)))
    }

    fn request_replay_historical_orders(&self, account: &Account, date: &str) -> CallResult {
        let id = &account.account_id;
        self.log_call(SimCall::ReplayHistorical(id.clone(), date.to_string()));
        if self.script.replay_rejects.contains(date) {
            return Err(RejectCode(SIM_REJECTED));
        }
        if self.script.silent_replay_dates.contains(date) {
            return self.connected();
        }
        let completion = if self.script.replay_error_dates.contains(date) {
            Completion::failed(SIM_ERROR_STATUS)
        } else {
            let key = (id.clone(), date.to_string());
            Completion::ok(self.book.historical.get(&key).cloned().unwrap_or_default())
        };
        let delay = self.script.slow_replay_dates.get(date).copied().unwrap_or_default();
        self.deliver_after(delay, Delivery::Orders(completion.for_account(id).on_date(date)))
    }

    fn shutdown(&self) {
        // Dropping the sender lets the delivery thread drain and exit.
        self.outbox.lock().take();
        if let Some(handle) = self.delivery.lock().take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                log::error!("simulated engine delivery thread panicked");
            }
        }
    }
}

impl Drop for SimulatedGateway {
    fn drop(&mut self) {
        self.shutdown();
    }
}
