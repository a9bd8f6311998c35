//! Logging facility for the simulator, built on the `log` facade.
//!
//! Messages are formatted as "[LEVEL] message" and written to stderr so
//! they never mix with the report on stdout.

use log::{LevelFilter, Log, Metadata, Record};
use spin::Mutex;

/// Global logger instance installed once at startup.
pub static LOGGER: Logger = Logger::new();

/// Serializes writers so interleaved messages stay whole.
pub struct Logger {
    inner: Mutex<()>,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl Logger {
    pub const fn new() -> Logger {
        Logger {
            inner: Mutex::new(()),
        }
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let _guard = self.inner.lock();
            eprintln!("[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Installs the logger. Debug level with `verbose`, Info otherwise.
pub fn init(verbose: bool) {
    log::set_logger(&LOGGER)
        .map(|()| {
            log::set_max_level(if verbose {
                LevelFilter::Debug
            } else {
                LevelFilter::Info
            })
        })
        .expect("Logger initialization failed");
}
