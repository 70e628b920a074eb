//! Termination-signal handling.
//!
//! The pipeline runs on plain threads, so SIGINT/SIGTERM are awaited on a
//! dedicated thread with its own current-thread tokio runtime. On a signal
//! the output file is emergency-closed and the process exits with 1.

use std::{
    io,
    process,
    sync::Arc,
    thread::{self, JoinHandle},
};

use orderfetch_core::{
    progress::{EventSink, ProgressEvent, StdioSink},
    writer::{SharedWriter, WeakWriter},
};
use parking_lot::Mutex;
use tokio::signal;

/// What the signal watcher closes. The writer is held weakly so the
/// watcher never keeps a finished run's file alive.
#[derive(Clone, Default)]
pub struct ShutdownHandle {
    writer: Arc<Mutex<Option<WeakWriter>>>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn guard_writer(&self, writer: &SharedWriter) {
        *self.writer.lock() = Some(writer.downgrade());
    }

    /// Emergency-close the guarded writer. Returns whether a live, open
    /// writer was closed.
    pub fn close_output(&self) -> bool {
        self.writer
            .lock()
            .as_ref()
            .is_some_and(WeakWriter::emergency_close)
    }
}

pub fn spawn_signal_watcher(handle: ShutdownHandle) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("signal-watcher".into())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(rt) => rt,
                Err(e) => {
                    log::error!("Signal watcher unavailable: {e}");
                    return;
                }
            };
            let name = runtime.block_on(await_signal());

            log::warn!("Received {name}, closing output");
            if handle.close_output() {
                log::info!("Output file closed with status interrupted");
            }
            StdioSink.emit(&ProgressEvent::error(format!("terminated by {name}")));
            process::exit(1);
        })
}

async fn await_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to install SIGINT handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => "SIGINT",
        () = terminate => "SIGTERM",
    }
}
