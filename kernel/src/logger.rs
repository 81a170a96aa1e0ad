//! `log` facade backend
//!
//! Routes `log::warn!` and friends to the serial port so diagnostics stay
//! visible even when the framebuffer console is showing a program's UI.

use log::{LevelFilter, Metadata, Record};

struct SerialLogger;

static LOGGER: SerialLogger = SerialLogger;

impl log::Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            serial_println!("[{}] {}", record.target().to_uppercase(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Install the serial logger. Safe to call once during boot, before any
/// subsystem that logs.
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Info);
    }
}
