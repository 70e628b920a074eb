//! order-fetcher: replay historical orders for every (or selected)
//! account and write them to `orders/orders_<unix-seconds>.json`.
//!
//! Usage:
//!   order-fetcher <user> <password> <server_type> <location> <start_date> [account_ids...]
//!
//! Progress goes to stderr and the final `complete` line to stdout, one
//! JSON object per line. Exit code 0 on success, 1 otherwise.

use std::{env, process};

use anyhow::Result;
use orderfetch_core::{
    bridge::{BridgeOptions, CallbackBridge},
    config::{FetchOptions, ServerDirectory},
    gateway,
    pipeline::{FetchPipeline, RunSummary},
    progress::{EventSink, ProgressEvent, StdioSink},
    writer::SharedWriter,
};
use orderfetch_tools::{
    cli,
    logging::init_logging,
    shutdown::{spawn_signal_watcher, ShutdownHandle},
};

fn main() {
    init_logging();
    let sink = StdioSink;

    let code = match run(&sink) {
        Ok(summary) => {
            sink.emit(&summary.complete_event());
            0
        }
        Err(e) => {
            log::error!("{e:#}");
            sink.emit(&ProgressEvent::error(format!("{e:#}")));
            1
        }
    };
    process::exit(code);
}

fn run(sink: &StdioSink) -> Result<RunSummary> {
    let args: Vec<String> = env::args().skip(1).collect();
    let args = cli::parse_fetch_args(&args)?;

    let options = FetchOptions::new(&args.start_date)?
        .with_accounts(args.accounts.iter().cloned())
        .with_max_days(cli::max_days()?)
        .with_output_dir(cli::output_dir());
    if !options.requested_accounts.is_empty() {
        log::info!("Restricting run to {} requested accounts", options.requested_accounts.len());
    }

    let server = ServerDirectory::load(&cli::server_config_path())?
        .lookup(&args.session.server_type, &args.session.location)?;

    let shutdown = ShutdownHandle::new();
    spawn_signal_watcher(shutdown.clone())?;

    let bridge = CallbackBridge::new(BridgeOptions {
        start_date: options.start_date.clone(),
        max_days: options.max_days,
    });
    let engine = gateway::connect(&server, bridge.clone())?;
    let pipeline = FetchPipeline::new(engine.as_ref(), bridge.clone(), sink);

    let outcome = pipeline
        .establish_session(&args.session.credentials(&server))
        .and_then(|_| {
            let writer = SharedWriter::for_run(&options.output_dir)?;
            shutdown.guard_writer(&writer);
            bridge.attach_writer(writer);
            pipeline.run(&options)
        });

    engine.shutdown();
    Ok(outcome?)
}
