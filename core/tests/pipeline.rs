//! End-to-end runs of the pipeline against the simulated engine, with the
//! real callback bridge and a real output file.

use std::{collections::HashSet, fs, sync::Arc, time::Duration};

use orderfetch_core::{
    bridge::{BridgeOptions, CallbackBridge},
    config::{FetchOptions, SimSettings},
    error::FetchError,
    gateway::{RawAccount, RawStr},
    pipeline::{FetchPipeline, PipelineConfig, RunSummary},
    progress::{ProgressEvent, RecordingSink},
    retry::RetryPolicy,
    sim::{SimBook, SimCall, SimScript, SimulatedGateway},
    state::AccountPhase,
    types::{Account, Credentials, OrderRecord},
    writer::{CloseStatus, SharedWriter},
};
use serde_json::Value;
use tempfile::TempDir;

const START: &str = "20240101";

fn account(id: &str) -> Account {
    Account {
        account_id: id.into(),
        fcm_id: "FCM".into(),
        ib_id: "IB".into(),
    }
}

fn creds() -> Credentials {
    Credentials {
        user: "trader".into(),
        password: "secret".into(),
        connect_point: "Simulated Trading".into(),
    }
}

fn fast_config() -> PipelineConfig {
    PipelineConfig {
        login_timeout: Duration::from_secs(2),
        account_list_timeout: Duration::from_secs(2),
        rms_timeout: Duration::from_millis(300),
        dates_timeout: Duration::from_millis(300),
        replay_timeout: Duration::from_millis(300),
        request_spacing: Duration::ZERO,
        date_spacing: Duration::ZERO,
        retry: RetryPolicy::new(3, Duration::ZERO),
    }
}

/// Two accounts, three dates (one before the start date), a mix of
/// filled, unfilled and corrupt lines.
fn book() -> SimBook {
    let a1 = account("A1");
    let a2 = account("A2");
    let mut corrupt = SimBook::order_line("A1-bad", &a1, "ESZ4", 1, 5000.0, 1_704_200_000);
    corrupt.ticker = RawStr::null();

    SimBook::new()
        .account("A1", "FCM", "IB")
        .account("A2", "FCM", "IB")
        .commission("A1", "ES", 2.5)
        .commission("A2", "ES", 1.0)
        .history_date("20240101")
        .history_date("20240115")
        .history_date("20231231")
        .current_order("A1", SimBook::order_line("A1-cur", &a1, "ESH4", 2, 5010.0, 1_706_000_000))
        .current_order("A1", SimBook::order_line("A1-unfilled", &a1, "ESH4", 0, 0.0, 1_706_000_100))
        .historical_order(
            "A1",
            "20240115",
            SimBook::order_line("A1-nq", &a1, "NQH4", 1, 17000.0, 1_705_300_000),
        )
        .historical_order("A1", "20240115", corrupt)
        .historical_order(
            "A1",
            "20240101",
            SimBook::order_line("A1-es", &a1, "ESZ4", 3, 4990.5, 1_704_100_000),
        )
        .historical_order(
            "A1",
            "20231231",
            SimBook::order_line("A1-old", &a1, "ESZ3", 1, 4800.0, 1_704_000_000),
        )
        .historical_order(
            "A2",
            "20240101",
            SimBook::order_line("A2-es", &a2, "ESZ4", 3, 4991.0, 1_704_100_500),
        )
}

struct Harness {
    bridge: Arc<CallbackBridge>,
    gateway: SimulatedGateway,
    sink: RecordingSink,
    writer: SharedWriter,
    _dir: TempDir,
}

impl Harness {
    fn new(book: SimBook, script: SimScript) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let bridge = CallbackBridge::new(BridgeOptions {
            start_date: START.into(),
            max_days: 300,
        });
        let gateway = SimulatedGateway::new(book, script, Duration::ZERO, bridge.clone())
            .expect("simulated engine");
        let dir = TempDir::new().unwrap();
        let writer = SharedWriter::for_run(dir.path()).unwrap();
        Self {
            bridge,
            gateway,
            sink: RecordingSink::new(),
            writer,
            _dir: dir,
        }
    }

    fn pipeline(&self) -> FetchPipeline<'_> {
        FetchPipeline::new(&self.gateway, self.bridge.clone(), &self.sink)
            .with_config(fast_config())
    }

    fn run(&self, options: &FetchOptions) -> RunSummary {
        let pipeline = self.pipeline();
        pipeline.establish_session(&creds()).expect("session");
        self.bridge.attach_writer(self.writer.clone());
        pipeline.run(options).expect("run")
    }

    fn output(&self) -> Value {
        let text = fs::read_to_string(self.writer.path()).unwrap();
        serde_json::from_str(&text).unwrap_or_else(|e| panic!("invalid JSON ({e}):\n{text}"))
    }

    fn orders(&self, account_id: &str) -> Vec<OrderRecord> {
        match self.output().get(account_id) {
            Some(v) => serde_json::from_value(v.clone()).unwrap(),
            None => Vec::new(),
        }
    }

    fn calls_matching(&self, pred: impl Fn(&SimCall) -> bool) -> usize {
        self.gateway.count_calls(pred)
    }
}

fn options() -> FetchOptions {
    FetchOptions::new(START).unwrap()
}

// ── Happy path ────────────────────────────────────────────────────

#[test]
fn filled_orders_are_written_exactly_once() {
    let h = Harness::new(book(), SimScript::new());
    let summary = h.run(&options());

    assert_eq!(h.writer.closed_with(), Some(CloseStatus::Complete));
    assert_eq!(h.output()["status"], "complete");

    let a1 = h.orders("A1");
    let ids: Vec<&str> = a1.iter().map(|o| o.order_id.as_str()).collect();
    assert_eq!(ids.len(), 3, "{ids:?}");
    let unique: HashSet<&str> = ids.iter().copied().collect();
    assert_eq!(unique, HashSet::from(["A1-cur", "A1-nq", "A1-es"]));
    assert!(a1.iter().all(|o| o.filled_quantity > 0));

    assert_eq!(summary.total_accounts_available, 2);
    assert_eq!(summary.accounts_processed, 2);
    assert_eq!(summary.accounts_failed, 0);
    assert_eq!(summary.total_orders, 4);
    assert_eq!(summary.orders_file.as_deref(), Some(h.writer.path()));
}

#[test]
fn history_dates_replayed_newest_first_from_start_date() {
    let h = Harness::new(book(), SimScript::new());
    h.run(&options().with_accounts(["A1"]));

    let replays: Vec<SimCall> = h
        .gateway
        .calls()
        .into_iter()
        .filter(|c| matches!(c, SimCall::ReplayCurrent(_) | SimCall::ReplayHistorical(..)))
        .collect();
    assert_eq!(
        replays,
        vec![
            SimCall::ReplayCurrent("A1".into()),
            SimCall::ReplayHistorical("A1".into(), "20240115".into()),
            SimCall::ReplayHistorical("A1".into(), "20240101".into()),
        ]
    );

    let progress: Vec<String> = h
        .sink
        .events()
        .into_iter()
        .filter_map(|e| match e {
            ProgressEvent::Progress { message, .. } => Some(message),
            _ => None,
        })
        .collect();
    assert_eq!(
        progress,
        vec!["[A1] Processing date 1/2: 20240115", "[A1] Processing date 2/2: 20240101"]
    );
}

#[test]
fn commissions_come_from_each_accounts_own_table() {
    let h = Harness::new(book(), SimScript::new());
    h.run(&options());

    let a1 = h.orders("A1");
    let by_id = |id: &str| a1.iter().find(|o| o.order_id == id).cloned().unwrap();
    assert_eq!(by_id("A1-es").commission, 7.5);
    assert_eq!(by_id("A1-cur").commission, 5.0);
    assert_eq!(by_id("A1-nq").commission, 0.0);
    assert_eq!(by_id("A1-es").price, 4990.5);

    let a2 = h.orders("A2");
    assert_eq!(a2.len(), 1);
    assert_eq!(a2[0].commission, 3.0);
}

#[test]
fn stats_count_current_session_as_a_day() {
    let h = Harness::new(book(), SimScript::new());
    h.run(&options());

    let stats = h.bridge.with_state(|s| s.stats_for("A1"));
    assert_eq!(stats.total_days, 3);
    assert_eq!(stats.days_processed, 3);
    assert_eq!(stats.orders_processed, 3);
}

#[test]
fn account_completion_events_carry_position() {
    let h = Harness::new(book(), SimScript::new());
    h.run(&options());

    let done: Vec<(String, usize, usize, usize)> = h
        .sink
        .events()
        .into_iter()
        .filter_map(|e| match e {
            ProgressEvent::AccountComplete { account_id, position, total_accounts, orders, .. } => {
                Some((account_id, position, total_accounts, orders))
            }
            _ => None,
        })
        .collect();
    assert_eq!(done, vec![("A1".to_string(), 1, 2, 3), ("A2".to_string(), 2, 2, 1)]);
    assert_eq!(h.bridge.with_state(|s| s.current_account_index), 2);
}

#[test]
fn full_phase_trace_for_a_clean_account() {
    let h = Harness::new(book(), SimScript::new());
    let summary = h.run(&options());

    let report = summary.report("A1").unwrap();
    assert_eq!(report.phase, AccountPhase::Done);
    assert_eq!(
        report.trace,
        vec![
            AccountPhase::Pending,
            AccountPhase::RequestRms,
            AccountPhase::AwaitRms,
            AccountPhase::RequestDates,
            AccountPhase::AwaitDates,
            AccountPhase::Subscribing,
            AccountPhase::ReplayCurrentSession,
            AccountPhase::ReplayHistorical { index: 0 },
            AccountPhase::ReplayHistorical { index: 1 },
            AccountPhase::Done,
        ]
    );
    assert!(report.failure.is_none());
}

#[test]
fn previous_account_is_unsubscribed_before_the_next_starts() {
    let h = Harness::new(book(), SimScript::new());
    h.run(&options());

    let calls = h.gateway.calls();
    let pos = |call: &SimCall| calls.iter().position(|c| c == call).unwrap();
    let unsub_a1 = pos(&SimCall::Unsubscribe("A1".into()));
    assert!(unsub_a1 > pos(&SimCall::ReplayHistorical("A1".into(), "20240101".into())));
    assert!(unsub_a1 < pos(&SimCall::ProductRms("A2".into())));
    assert_eq!(calls.last(), Some(&SimCall::Unsubscribe("A2".into())));
}

// ── Filtering ─────────────────────────────────────────────────────

#[test]
fn unrequested_accounts_are_skipped() {
    let h = Harness::new(book(), SimScript::new());
    let summary = h.run(&options().with_accounts(["A1"]));

    assert_eq!(summary.report("A2").unwrap().phase, AccountPhase::Skipped);
    assert_eq!(summary.accounts_skipped, 1);
    assert_eq!(summary.accounts_processed, 1);
    assert!(h.output().get("A2").is_none());
    assert_eq!(
        h.calls_matching(
            |c| matches!(c, SimCall::ProductRms(a) | SimCall::Subscribe(a) if a == "A2")
        ),
        0
    );
}

#[test]
fn corrupt_accounts_never_reach_the_pipeline() {
    let broken = RawAccount {
        fcm_id: RawStr::null(),
        ..RawAccount::from(&account("BAD"))
    };
    let h = Harness::new(book().raw_account(broken), SimScript::new());
    let accounts = h.pipeline().establish_session(&creds()).unwrap();

    let ids: Vec<&str> = accounts.iter().map(|a| a.account_id.as_str()).collect();
    assert_eq!(ids, vec!["A1", "A2"]);
}

// ── Retry policy ──────────────────────────────────────────────────

#[test]
fn rms_rejected_twice_then_accepted() {
    let h = Harness::new(book(), SimScript::new().reject_rms("A1", 2));
    let summary = h.run(&options());

    assert_eq!(h.calls_matching(|c| *c == SimCall::ProductRms("A1".into())), 3);
    let report = summary.report("A1").unwrap();
    assert_eq!(report.phase, AccountPhase::Done);
    assert_eq!(
        &report.trace[..5],
        &[
            AccountPhase::Pending,
            AccountPhase::RequestRms,
            AccountPhase::RequestRms,
            AccountPhase::RequestRms,
            AccountPhase::AwaitRms,
        ]
    );
}

#[test]
fn rms_error_completions_are_retried_too() {
    let h = Harness::new(book(), SimScript::new().fail_rms("A1", 2));
    let summary = h.run(&options());

    assert_eq!(h.calls_matching(|c| *c == SimCall::ProductRms("A1".into())), 3);
    assert_eq!(summary.report("A1").unwrap().phase, AccountPhase::Done);
    let es = h.orders("A1").into_iter().find(|o| o.order_id == "A1-es").unwrap();
    assert_eq!(es.commission, 7.5);
}

#[test]
fn rms_rejected_three_times_fails_only_that_account() {
    let h = Harness::new(book(), SimScript::new().reject_rms("A1", 3));
    let summary = h.run(&options());

    assert_eq!(h.calls_matching(|c| *c == SimCall::ProductRms("A1".into())), 3);
    let report = summary.report("A1").unwrap();
    assert_eq!(report.phase, AccountPhase::Failed);
    assert!(report.failure.as_deref().unwrap().contains("after 3 attempts"));
    assert_eq!(h.calls_matching(|c| *c == SimCall::Subscribe("A1".into())), 0);

    assert_eq!(summary.report("A2").unwrap().phase, AccountPhase::Done);
    assert_eq!(summary.accounts_failed, 1);
    assert!(h.output().get("A1").is_none());
    assert_eq!(h.orders("A2").len(), 1);
}

#[test]
fn rms_timeout_is_not_retried() {
    let h = Harness::new(book(), SimScript::new().never_answer_rms("A1"));
    let summary = h.run(&options());

    assert_eq!(h.calls_matching(|c| *c == SimCall::ProductRms("A1".into())), 1);
    assert_eq!(summary.report("A1").unwrap().phase, AccountPhase::Failed);
    assert_eq!(summary.report("A2").unwrap().phase, AccountPhase::Done);
    assert_eq!(h.bridge.with_state(|s| s.outstanding_requests), 0);
}

#[test]
fn late_rms_reply_never_prices_the_next_account() {
    // A1's table arrives halfway through A2's wait, after A1 has failed.
    let script = SimScript::new().delay_rms("A1", Duration::from_millis(450));
    let h = Harness::new(book(), script);
    let summary = h.run(&options());

    assert_eq!(summary.report("A1").unwrap().phase, AccountPhase::Failed);
    assert_eq!(summary.report("A2").unwrap().phase, AccountPhase::Done);
    let a2 = h.orders("A2");
    assert_eq!(a2.len(), 1);
    assert_eq!(a2[0].commission, 3.0);
    h.bridge.with_state(|s| assert_eq!(s.commissions.owner(), Some("A2")));
}

#[test]
fn subscribe_rejected_three_times_fails_account() {
    let h = Harness::new(book(), SimScript::new().reject_subscribe("A1", 3));
    let summary = h.run(&options());

    assert_eq!(h.calls_matching(|c| *c == SimCall::Subscribe("A1".into())), 3);
    assert_eq!(summary.report("A1").unwrap().phase, AccountPhase::Failed);
    assert_eq!(
        h.calls_matching(|c| matches!(
            c,
            SimCall::ReplayCurrent(a) | SimCall::ReplayHistorical(a, _) if a == "A1"
        )),
        0
    );
    assert_eq!(h.calls_matching(|c| *c == SimCall::Unsubscribe("A1".into())), 0);
}

#[test]
fn subscribe_recovers_after_one_rejection() {
    let h = Harness::new(book(), SimScript::new().reject_subscribe("A2", 1));
    let summary = h.run(&options());

    assert_eq!(h.calls_matching(|c| *c == SimCall::Subscribe("A2".into())), 2);
    assert_eq!(summary.accounts_processed, 2);
}

// ── Dates and replays ─────────────────────────────────────────────

#[test]
fn dates_error_status_fails_every_account() {
    let h = Harness::new(book(), SimScript::new().fail_dates(5));
    let summary = h.run(&options());

    assert_eq!(summary.accounts_failed, 2);
    assert_eq!(summary.accounts_processed, 0);
    let doc = h.output();
    assert_eq!(doc["status"], "complete");
    assert_eq!(doc.as_object().unwrap().len(), 2);
}

#[test]
fn dates_timeout_fails_the_account() {
    let h = Harness::new(book(), SimScript::new().never_answer_dates());
    let summary = h.run(&options().with_accounts(["A1"]));

    let report = summary.report("A1").unwrap();
    assert_eq!(report.phase, AccountPhase::Failed);
    assert!(report.failure.as_deref().unwrap().contains("order history dates"));
}

#[test]
fn replay_timeout_moves_on_to_next_date() {
    let h = Harness::new(book(), SimScript::new().never_answer_replay("20240115"));
    let summary = h.run(&options().with_accounts(["A1"]));

    assert_eq!(summary.report("A1").unwrap().phase, AccountPhase::Done);
    let ids: HashSet<String> = h.orders("A1").into_iter().map(|o| o.order_id).collect();
    assert_eq!(ids, HashSet::from(["A1-cur".to_string(), "A1-es".to_string()]));
}

#[test]
fn late_replay_batch_is_not_counted_for_the_next_date() {
    let script = SimScript::new().delay_replay("20240115", Duration::from_millis(450));
    let h = Harness::new(book(), script);
    let summary = h.run(&options().with_accounts(["A1"]));

    assert_eq!(summary.report("A1").unwrap().phase, AccountPhase::Done);
    let ids: HashSet<String> = h.orders("A1").into_iter().map(|o| o.order_id).collect();
    assert_eq!(ids, HashSet::from(["A1-cur".to_string(), "A1-es".to_string()]));

    let stats = h.bridge.with_state(|s| s.stats_for("A1"));
    assert_eq!(stats.days_processed, 2);
    assert_eq!(stats.total_days, 3);
}

#[test]
fn replay_error_status_moves_on_to_next_date() {
    let h = Harness::new(book(), SimScript::new().fail_replay("20240115"));
    let summary = h.run(&options().with_accounts(["A1"]));

    assert_eq!(summary.report("A1").unwrap().phase, AccountPhase::Done);
    assert_eq!(h.orders("A1").len(), 2);
}

#[test]
fn rejected_replay_is_reported_as_error_event() {
    let h = Harness::new(book(), SimScript::new().reject_replay("20240101"));
    let summary = h.run(&options().with_accounts(["A1"]));

    assert_eq!(summary.report("A1").unwrap().phase, AccountPhase::Done);
    let errors: Vec<String> = h
        .sink
        .events()
        .into_iter()
        .filter_map(|e| match e {
            ProgressEvent::Error { message } => Some(message),
            _ => None,
        })
        .collect();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("20240101"), "{errors:?}");
    assert!(h.orders("A1").iter().all(|o| o.order_id != "A1-es"));
}

// ── Session failures ──────────────────────────────────────────────

#[test]
fn failed_login_is_fatal() {
    let h = Harness::new(book(), SimScript::new().fail_login("bad password"));
    let err = h.pipeline().establish_session(&creds()).unwrap_err();
    assert!(matches!(err, FetchError::Connection(ref m) if m.contains("bad password")), "{err}");
    assert!(err.is_fatal());
}

#[test]
fn rejected_login_is_fatal() {
    let h = Harness::new(book(), SimScript::new().reject_login(13));
    let err = h.pipeline().establish_session(&creds()).unwrap_err();
    assert!(err.is_fatal());
    assert!(err.to_string().contains("13"));
    assert_eq!(h.calls_matching(|c| *c == SimCall::AccountList), 0);
}

#[test]
fn unanswered_login_times_out() {
    let h = Harness::new(book(), SimScript::new().silent_login());
    let config = PipelineConfig {
        login_timeout: Duration::from_millis(100),
        ..fast_config()
    };
    let err = h.pipeline().with_config(config).establish_session(&creds()).unwrap_err();
    assert!(matches!(err, FetchError::Connection(_)));
}

#[test]
fn account_list_error_is_fatal() {
    let h = Harness::new(book(), SimScript::new().fail_account_list(4));
    let err = h.pipeline().establish_session(&creds()).unwrap_err();
    assert!(err.is_fatal());
}

// ── Generated engine ──────────────────────────────────────────────

#[test]
fn generated_book_runs_end_to_end() {
    let settings = SimSettings {
        seed: 7,
        accounts: 3,
        history_days: 4,
        orders_per_day: 5,
        latency_ms: 0,
    };
    let bridge = CallbackBridge::new(BridgeOptions {
        start_date: "20000101".into(),
        max_days: 300,
    });
    let gateway = SimulatedGateway::generated(&settings, bridge.clone()).unwrap();
    let sink = RecordingSink::new();
    let dir = TempDir::new().unwrap();
    let writer = SharedWriter::for_run(dir.path()).unwrap();

    let pipeline = FetchPipeline::new(&gateway, bridge.clone(), &sink).with_config(fast_config());
    let accounts = pipeline.establish_session(&creds()).unwrap();
    assert_eq!(accounts.len(), 3);
    bridge.attach_writer(writer.clone());
    let summary = pipeline
        .run(&FetchOptions::new("20000101").unwrap())
        .unwrap();

    assert_eq!(summary.accounts_processed, 3);
    assert_eq!(writer.orders_written(), summary.total_orders);

    let doc: Value = serde_json::from_str(&fs::read_to_string(writer.path()).unwrap()).unwrap();
    assert_eq!(doc["status"], "complete");
    for account in &accounts {
        let array = doc.get(&account.account_id).cloned().unwrap_or(Value::Array(Vec::new()));
        let orders: Vec<OrderRecord> = serde_json::from_value(array).unwrap();
        assert!(orders.iter().all(|o| o.account_id == account.account_id && o.filled_quantity > 0));
    }
}
