//! Explicit logging context.
//!
//! Every component that logs receives a [`Logger`] created once at startup
//! instead of reaching for a process-wide singleton. The logger only carries
//! a source name and forwards to the `log` facade, so the application chooses
//! the backend.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::Level;

#[derive(Debug)]
struct LoggerInner {
    source: String,
    shut_down: AtomicBool,
}

/// Logging context shared by the components of one environment
#[derive(Debug, Clone)]
pub struct Logger {
    inner: Arc<LoggerInner>,
}

impl Logger {
    pub fn new(source: impl Into<String>) -> Self {
        Logger {
            inner: Arc::new(LoggerInner {
                source: source.into(),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Name of the environment or component the messages belong to
    pub fn source(&self) -> &str {
        &self.inner.source
    }

    /// Derive a logger for a sub-component, e.g. `db1/journal`
    pub fn for_component(&self, component: &str) -> Logger {
        Logger::new(format!("{}/{}", self.inner.source, component))
    }

    pub fn is_enabled(&self, level: Level) -> bool {
        !self.inner.shut_down.load(Ordering::Relaxed) && log::log_enabled!(level)
    }

    pub fn log(&self, level: Level, args: fmt::Arguments<'_>) {
        if self.inner.shut_down.load(Ordering::Relaxed) {
            return;
        }
        log::log!(level, "[{}] {}", self.inner.source, args);
    }

    pub fn debug(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Debug, args)
    }

    pub fn info(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Info, args)
    }

    pub fn warn(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Warn, args)
    }

    pub fn error(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Error, args)
    }

    /// Stop emitting messages and flush the backend. Clones share the flag.
    pub fn shutdown(&self) {
        if !self.inner.shut_down.swap(true, Ordering::SeqCst) {
            log::logger().flush();
        }
    }
}

impl Default for Logger {
    fn default() -> Self {
        Logger::new("voron")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn component_loggers_nest_source_names() {
        let logger = Logger::new("db1");
        let journal = logger.for_component("journal");
        assert_eq!(journal.source(), "db1/journal");
    }

    #[test]
    fn shutdown_disables_logging_for_clones() {
        let logger = Logger::new("db1");
        let clone = logger.clone();
        logger.shutdown();
        assert!(!clone.is_enabled(Level::Error));
        clone.info(format_args!("ignored"));
    }
}
