//! Logging infrastructure
//!
//! This module provides logging via the `log` crate. The storage stack does
//! not own a console; the kernel registers a text sink at boot and every
//! driver logs through it.

use log::{Level, LevelFilter, Metadata, Record};
use spin::Once;

/// Text sink provided by the kernel console.
pub type LogSink = fn(core::fmt::Arguments<'_>);

static SINK: Once<LogSink> = Once::new();

/// Console-backed logger implementation
struct ConsoleLogger;

impl log::Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Trace
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let level_str = match record.level() {
                Level::Error => "ERROR",
                Level::Warn => "WARN ",
                Level::Info => "INFO ",
                Level::Debug => "DEBUG",
                Level::Trace => "TRACE",
            };

            if let Some(sink) = SINK.get() {
                // Format: [LEVEL] target: message
                sink(format_args!(
                    "[{}] {}: {}",
                    level_str,
                    record.target(),
                    record.args()
                ));
            }
        }
    }

    fn flush(&self) {}
}

static LOGGER: ConsoleLogger = ConsoleLogger;

/// Initialize the logging subsystem with the kernel's console sink
pub fn init(sink: LogSink) {
    SINK.call_once(|| sink);
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Debug);
    }
}

/// Set the maximum log level
pub fn set_level(level: LevelFilter) {
    log::set_max_level(level);
}
