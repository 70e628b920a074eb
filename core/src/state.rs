//! Run-wide mutable state.
//!
//! RULE: exactly one RunState exists per run. It is shared between the
//! orchestrator and the callback thread and only ever touched under the
//! bridge's lock. Critical sections stay small: mutate, signal, release.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    commission::CommissionTable,
    error::FetchError,
    gateway::RequestTag,
    types::{Account, AccountId, DateKey, OrderRecord, ProcessingStats},
};

/// Per-account position in the processing state machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum AccountPhase {
    Pending,
    RequestRms,
    AwaitRms,
    RequestDates,
    AwaitDates,
    Subscribing,
    ReplayCurrentSession,
    ReplayHistorical { index: usize },
    Done,
    Skipped,
    Failed,
}

impl AccountPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Skipped | Self::Failed)
    }
}

/// Requests that complete through a callback.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    AccountList,
    CommissionList,
    HistoryDates,
    OrderReplay,
}

impl RequestKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::AccountList => "account list",
            Self::CommissionList => "product RMS info",
            Self::HistoryDates => "order history dates",
            Self::OrderReplay => "order replay",
        }
    }

    /// Whether completions of this kind name the account (and date) they
    /// answer. Account list and history dates are session-wide.
    pub fn is_account_scoped(&self) -> bool {
        matches!(self, Self::CommissionList | Self::OrderReplay)
    }
}

/// The one outstanding request, tagged with who it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlight {
    pub kind: RequestKind,
    pub account_id: Option<AccountId>,
    /// `None` for the current session.
    pub date: Option<DateKey>,
}

impl InFlight {
    /// Whether a `kind` completion tagged `tag` answers this request.
    pub fn answered_by(&self, kind: RequestKind, tag: &RequestTag) -> bool {
        if self.kind != kind {
            return false;
        }
        !kind.is_account_scoped() || (self.account_id == tag.account_id && self.date == tag.date)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LoginStatus {
    #[default]
    Pending,
    Complete,
    Failed(String),
}

#[derive(Debug, Default)]
pub struct RunState {
    pub login: LoginStatus,
    pub accounts: Vec<Account>,
    pub current_account_index: usize,
    pub outstanding_requests: u32,

    pub account_list_received: bool,
    pub commission_list_received: bool,
    pub history_dates_received: bool,
    pub order_replay_received: bool,

    pub in_flight: Option<InFlight>,
    /// Error status carried by the last completion for the in-flight request.
    pub completion_error: Option<FetchError>,

    pub history_dates: Vec<DateKey>,
    pub commissions: CommissionTable,
    pub stats: BTreeMap<AccountId, ProcessingStats>,
    pub account_orders: BTreeMap<AccountId, Vec<OrderRecord>>,
    pub phases: BTreeMap<AccountId, Vec<AccountPhase>>,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the completion for `kind` has arrived.
    pub fn received(&self, kind: RequestKind) -> bool {
        match kind {
            RequestKind::AccountList => self.account_list_received,
            RequestKind::CommissionList => self.commission_list_received,
            RequestKind::HistoryDates => self.history_dates_received,
            RequestKind::OrderReplay => self.order_replay_received,
        }
    }

    pub fn set_received(&mut self, kind: RequestKind, value: bool) {
        match kind {
            RequestKind::AccountList => self.account_list_received = value,
            RequestKind::CommissionList => self.commission_list_received = value,
            RequestKind::HistoryDates => self.history_dates_received = value,
            RequestKind::OrderReplay => self.order_replay_received = value,
        }
    }

    /// Take the in-flight request if it is of `kind`.
    pub fn take_in_flight(&mut self, kind: RequestKind) -> Option<InFlight> {
        if self.in_flight.as_ref().map(|f| f.kind) != Some(kind) {
            return None;
        }
        self.outstanding_requests = self.outstanding_requests.saturating_sub(1);
        self.in_flight.take()
    }

    /// Take the in-flight request only if a `kind` completion tagged `tag`
    /// answers it.
    pub fn take_answered(&mut self, kind: RequestKind, tag: &RequestTag) -> Option<InFlight> {
        if !self.in_flight.as_ref().is_some_and(|f| f.answered_by(kind, tag)) {
            return None;
        }
        self.outstanding_requests = self.outstanding_requests.saturating_sub(1);
        self.in_flight.take()
    }

    pub fn transition(&mut self, account_id: &str, phase: AccountPhase) {
        log::debug!("account {account_id} -> {phase:?}");
        self.phases.entry(account_id.to_string()).or_default().push(phase);
    }

    pub fn phase_of(&self, account_id: &str) -> Option<AccountPhase> {
        self.phases.get(account_id).and_then(|trace| trace.last().copied())
    }

    pub fn stats_for(&self, account_id: &str) -> ProcessingStats {
        self.stats.get(account_id).copied().unwrap_or_default()
    }

    pub fn orders_for(&self, account_id: &str) -> usize {
        self.account_orders.get(account_id).map_or(0, Vec::len)
    }
}
