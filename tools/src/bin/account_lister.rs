//! account-lister: log in and print the accounts visible to the user.
//!
//! Usage:
//!   account-lister <user> <password> <server_type> <location>
//!
//! Emits one `accounts` line and one `complete` line on stdout.

use std::{env, process};

use anyhow::Result;
use orderfetch_core::{
    bridge::{BridgeOptions, CallbackBridge},
    config::ServerDirectory,
    dates::{today, DEFAULT_MAX_DAYS},
    gateway,
    pipeline::FetchPipeline,
    progress::{EventSink, ProgressEvent, StdioSink},
};
use orderfetch_tools::{
    cli,
    logging::init_logging,
    shutdown::{spawn_signal_watcher, ShutdownHandle},
};

fn main() {
    init_logging();
    let sink = StdioSink;

    if let Err(e) = run(&sink) {
        log::error!("{e:#}");
        sink.emit(&ProgressEvent::error(format!("{e:#}")));
        process::exit(1);
    }
}

fn run(sink: &StdioSink) -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let session = cli::parse_session_args(&args)?;

    let server = ServerDirectory::load(&cli::server_config_path())?
        .lookup(&session.server_type, &session.location)?;

    spawn_signal_watcher(ShutdownHandle::new())?;

    let bridge = CallbackBridge::new(BridgeOptions {
        start_date: today(),
        max_days: DEFAULT_MAX_DAYS,
    });
    let engine = gateway::connect(&server, bridge.clone())?;
    let accounts = FetchPipeline::new(engine.as_ref(), bridge, sink)
        .establish_session(&session.credentials(&server));
    engine.shutdown();
    let accounts = accounts?;

    sink.emit(&ProgressEvent::Accounts {
        accounts: accounts.clone(),
    });
    sink.emit(&ProgressEvent::Complete {
        status: "complete".into(),
        total_accounts_available: accounts.len(),
        accounts_processed: accounts.len(),
        accounts_failed: None,
        accounts_skipped: None,
        total_orders: None,
        orders_file: None,
    });
    Ok(())
}
