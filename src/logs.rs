//! Logger collaborator consumed by the supervisor, plus diagnostic throttling.
use std::{
    error::Error,
    fmt,
    sync::Mutex,
    time::{Duration, Instant},
};

use tracing::{debug, error, info, warn};

/// Severity attached to an informational event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        f.write_str(label)
    }
}

/// Sink for supervisor events and errors.
///
/// `local_only` marks messages that should stay on the local host and not be
/// forwarded by sinks that relay to remote collectors.
pub trait EventLogger: Send + Sync {
    /// Posts an informational event.
    fn post_event(&self, message: &str, severity: Severity, local_only: bool);

    /// Posts an error, optionally carrying the error that caused it.
    fn post_error(&self, message: &str, error: Option<&dyn Error>, local_only: bool);
}

/// [`EventLogger`] that forwards everything to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl EventLogger for TracingLogger {
    fn post_event(&self, message: &str, severity: Severity, local_only: bool) {
        match severity {
            Severity::Debug => debug!(local_only, "{message}"),
            Severity::Info => info!(local_only, "{message}"),
            Severity::Warning => warn!(local_only, "{message}"),
            Severity::Error => error!(local_only, "{message}"),
        }
    }

    fn post_error(&self, message: &str, error: Option<&dyn Error>, local_only: bool) {
        match error {
            Some(err) => error!(local_only, "{message}: {err}"),
            None => error!(local_only, "{message}"),
        }
    }
}

/// Limits how often a single call site may emit a diagnostic.
///
/// Intended to be declared as a `static` next to the message it guards.
#[derive(Debug)]
pub struct LogThrottle {
    window: Duration,
    last: Mutex<Option<Instant>>,
}

impl LogThrottle {
    pub const fn new(window: Duration) -> Self {
        Self {
            window,
            last: Mutex::new(None),
        }
    }

    /// Returns `true` when the caller may log now, recording the emission.
    pub fn allow(&self) -> bool {
        let mut last = self
            .last
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();
        match *last {
            Some(previous) if now.duration_since(previous) < self.window => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}
