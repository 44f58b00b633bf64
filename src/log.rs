//! Leveled log sink
//!
//! The transport reports its own diagnostics through a [`LogSink`]; the
//! sink forwards each message verbatim at the level it was given.

use std::fmt;

/// Target used when forwarding transport logs to `tracing`
pub const TRANSPORT_TARGET: &str = "routecast::transport";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Error,
    Warn,
    Info,
    Debug,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Level::Error => "error",
            Level::Warn => "warn",
            Level::Info => "info",
            Level::Debug => "debug",
        };
        f.write_str(name)
    }
}

pub trait LogSink: Send + Sync {
    fn log(&self, level: Level, message: &str);

    fn error(&self, message: &str) {
        self.log(Level::Error, message);
    }

    fn warn(&self, message: &str) {
        self.log(Level::Warn, message);
    }

    fn info(&self, message: &str) {
        self.log(Level::Info, message);
    }

    fn debug(&self, message: &str) {
        self.log(Level::Debug, message);
    }
}

/// Forwards to the `tracing` subscriber
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, level: Level, message: &str) {
        match level {
            Level::Error => tracing::error!(target: TRANSPORT_TARGET, "{message}"),
            Level::Warn => tracing::warn!(target: TRANSPORT_TARGET, "{message}"),
            Level::Info => tracing::info!(target: TRANSPORT_TARGET, "{message}"),
            Level::Debug => tracing::debug!(target: TRANSPORT_TARGET, "{message}"),
        }
    }
}
