//! env_logger setup that keeps stderr machine-readable.
//!
//! Every log record becomes one `{"type":"log","level":..,"message":..}`
//! line, the same shape as the rest of the progress stream.

use std::io::Write;

use log::Level;
use orderfetch_core::progress::ProgressEvent;

pub fn level_name(level: Level) -> &'static str {
    match level {
        Level::Error => "error",
        Level::Warn => "warning",
        Level::Info => "info",
        Level::Debug => "debug",
        Level::Trace => "trace",
    }
}

pub fn format_line(level: Level, message: &str) -> String {
    ProgressEvent::Log {
        level: level_name(level).to_string(),
        message: message.to_string(),
    }
    .to_line()
}

/// Install the JSON-line logger. `RUST_LOG` overrides the default `info`.
pub fn init_logging() {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.target(env_logger::Target::Stderr);
    builder.format(|buf, record| {
        writeln!(buf, "{}", format_line(record.level(), &record.args().to_string()))
    });
    builder.init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warn_is_spelled_warning() {
        let line = format_line(Level::Warn, "slow \"gateway\"");
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "log");
        assert_eq!(value["level"], "warning");
        assert_eq!(value["message"], "slow \"gateway\"");
    }
}
