//! Minimal stderr logger for the binaries.  The library only uses the `log` facade.

use std::io::Write;
use std::str::FromStr;

use log::{self, LevelFilter, Log, SetLoggerError};

struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true // log::set_max_level() is sufficient
    }

    fn log(&self, record: &log::Record) {
        let tgt = match record.target() {
            "" => record.module_path().unwrap_or_default(),
            tgt => tgt,
        };
        // one write per record
        let line = format!("{:<5} [{}] {}\n", record.level(), tgt, record.args());
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

static LOGGER: StderrLogger = StderrLogger;

/// Level from `$RUST_LOG`, or `default` when unset or unparsable
pub fn level_from_env(default: LevelFilter) -> LevelFilter {
    std::env::var("RUST_LOG")
        .ok()
        .as_deref()
        .map(str::trim)
        .map(LevelFilter::from_str)
        .and_then(Result::ok)
        .unwrap_or(default)
}

/// Install, honouring `$RUST_LOG`.  Default `warn`
pub fn setup() -> Result<(), SetLoggerError> {
    setup_with(level_from_env(LevelFilter::Warn))
}

pub fn setup_with(lvl: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_max_level(lvl);
    log::set_logger(&LOGGER)
}
