//! Custom error types for the crate.
//!
//! `RunVizError` is the single error type shared by the document bus, the run
//! aggregator, the plot builders and the remote dispatcher. It follows the
//! taxonomy used throughout the crate:
//!
//! - **`ProtocolViolation`**: a document arrived in an order the run state
//!   machine forbids (duplicate start, descriptor/event before start, stop
//!   without start). Recoverable; the document is dropped.
//! - **`Decode`**: a malformed wire frame. Recoverable; the frame is dropped
//!   and the dispatcher loop continues.
//! - **`MissingField`**: a builder's required field is absent from a run.
//!   Recoverable; that run is skipped by that builder only.
//! - **`InvalidShape`**: an image field declares a shape that cannot be
//!   allocated. Recoverable; that run is skipped by that builder only.
//! - **`ConnectionFailure`**: the dispatcher transport broke. Terminal for
//!   that dispatcher instance.
//! - **`Configuration`** / **`Config`**: invalid or unrecognized
//!   configuration, raised at construction time.
//!
//! Recoverable errors are never swallowed: they are returned to the caller
//! and also broadcast on [`Diagnostics`] so that an observer can see them.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, RunVizError>;

/// Errors produced by the run/plot core.
#[derive(Error, Debug, Clone)]
pub enum RunVizError {
    /// A document arrived in an order the run state machine forbids.
    #[error("Protocol violation for run '{run_uid}': {reason}")]
    ProtocolViolation {
        /// Run the offending document referred to
        run_uid: String,
        /// What was wrong
        reason: String,
    },

    /// A wire frame could not be decoded into a document.
    #[error("Decode error: {0}")]
    Decode(String),

    /// A builder needs a field the run does not provide.
    #[error("Builder '{builder}' cannot plot run '{run_uid}': missing field '{field}'")]
    MissingField {
        /// Builder kind that rejected the run
        builder: String,
        /// Rejected run
        run_uid: String,
        /// First missing field
        field: String,
    },

    /// An image field's shape is empty, overflows or exceeds the pixel limit.
    #[error("Invalid image shape for field '{field}': {reason}")]
    InvalidShape {
        /// Field whose shape was rejected
        field: String,
        /// What was wrong
        reason: String,
    },

    /// The dispatcher transport broke.
    #[error("Connection failure: {0}")]
    ConnectionFailure(String),

    /// Semantically invalid configuration.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Configuration could not be loaded or extracted.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// A plot spec object already belongs to a parent.
    #[error("Already attached: {0}")]
    AlreadyAttached(String),

    /// Lookup of a plot spec object failed.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A subscriber callback failed or panicked while a document was delivered.
    #[error("Subscriber failed: {0}")]
    Subscriber(String),
}

impl RunVizError {
    /// Shorthand for a protocol violation.
    pub fn protocol(run_uid: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            run_uid: run_uid.into(),
            reason: reason.into(),
        }
    }

    /// Whether processing can continue after this error.
    ///
    /// Only a broken connection is terminal, and only for the dispatcher that
    /// raised it.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::ConnectionFailure(_))
    }
}

/// A recoverable error reported on the [`Diagnostics`] channel.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    /// Component that raised the error (e.g. "aggregator", "lines")
    pub component: &'static str,
    /// The error itself
    pub error: Arc<RunVizError>,
}

/// Default capacity of the diagnostics broadcast channel.
const DIAGNOSTICS_CAPACITY: usize = 256;

/// Observable channel for recoverable errors.
///
/// Cloning shares the same channel. Reports are logged through `tracing` even
/// when no receiver is subscribed.
#[derive(Debug, Clone)]
pub struct Diagnostics {
    sender: broadcast::Sender<Diagnostic>,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new()
    }
}

impl Diagnostics {
    /// Create a new diagnostics channel.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(DIAGNOSTICS_CAPACITY);
        Self { sender }
    }

    /// Subscribe to future reports.
    pub fn subscribe(&self) -> broadcast::Receiver<Diagnostic> {
        self.sender.subscribe()
    }

    /// Log and broadcast an error.
    pub fn report(&self, component: &'static str, error: RunVizError) -> Arc<RunVizError> {
        if error.is_recoverable() {
            tracing::warn!(component, "{}", error);
        } else {
            tracing::error!(component, "{}", error);
        }
        let error = Arc::new(error);
        // No receivers is fine, the log line above is the fallback channel.
        let _ = self.sender.send(Diagnostic {
            component,
            error: Arc::clone(&error),
        });
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RunVizError::protocol("abc", "duplicate start");
        assert_eq!(
            err.to_string(),
            "Protocol violation for run 'abc': duplicate start"
        );
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(RunVizError::Decode("bad frame".into()).is_recoverable());
        assert!(!RunVizError::ConnectionFailure("reset".into()).is_recoverable());
    }

    #[test]
    fn test_diagnostics_reach_subscribers() {
        let diagnostics = Diagnostics::new();
        let mut rx = diagnostics.subscribe();
        diagnostics.report("aggregator", RunVizError::protocol("r1", "stop without start"));

        let diag = rx.try_recv().unwrap();
        assert_eq!(diag.component, "aggregator");
        assert!(matches!(
            *diag.error,
            RunVizError::ProtocolViolation { ref run_uid, .. } if run_uid == "r1"
        ));
    }
}
