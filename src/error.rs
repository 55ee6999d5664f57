//! Custom error types for the monitor.
//!
//! This module defines the primary error type, `MonitorError`, shared by the
//! transport, the analyzer driver and the tracker loop. Using the `thiserror`
//! crate, it keeps the failure taxonomy in one place so the tracker can decide
//! between "skip this iteration" and "stop the loop" without string matching.
//!
//! ## Error Hierarchy
//!
//! - **`Transport` / `NotConnected`**: the serial link or the Prologix controller
//!   is unavailable, or a read/write on it failed.
//! - **`Protocol`**: the instrument answered, but the reply did not parse as the
//!   value the command promises (e.g. `"ERR"` where a frequency was expected).
//! - **`Timeout`**: a reply or a sweep did not complete within its bound.
//! - **`Measurement`**: the link is healthy but the trace does not contain what
//!   the tracker needs (no peak above the noise floor, no half-power crossing).
//! - **`OutOfRange`**: a setting was rejected before anything was written.
//! - **`Config` / `Configuration`**: the configuration could not be loaded or is
//!   semantically invalid.
//!
//! `MonitorError::kind()` collapses the variants into a [`FailureKind`], which is
//! what the tracker's skip-and-continue policy looks at.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the monitor error type.
pub type AppResult<T> = std::result::Result<T, MonitorError>;

#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Transport not connected")]
    NotConnected,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unexpected reply to '{command}': '{reply}'")]
    Protocol { command: String, reply: String },

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: String,
        after: Duration,
    },

    #[error("Measurement failed: {0}")]
    Measurement(String),

    #[error("Value out of range: {0}")]
    OutOfRange(String),

    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Tracker task failed: {0}")]
    Task(String),

    #[error("Tracker stopped after {0} consecutive failed iterations")]
    TooManyFailures(u32),
}

/// Coarse classification of a [`MonitorError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Link unavailable or I/O error.
    Transport,
    /// Reply did not parse as expected.
    Protocol,
    /// Reply or sweep did not complete in time.
    Timeout,
    /// No usable estimate in this cycle; the link itself is fine.
    Measurement,
    /// Caller or configuration mistake.
    Usage,
}

impl MonitorError {
    /// Build a protocol error for a reply that failed to parse.
    pub fn protocol(command: impl Into<String>, reply: impl Into<String>) -> Self {
        MonitorError::Protocol {
            command: command.into(),
            reply: reply.into(),
        }
    }

    /// Build a timeout error.
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        MonitorError::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Classify the error for the tracker's failure policy.
    pub fn kind(&self) -> FailureKind {
        match self {
            MonitorError::Transport(_) | MonitorError::NotConnected | MonitorError::Io(_) => {
                FailureKind::Transport
            }
            MonitorError::Protocol { .. } => FailureKind::Protocol,
            MonitorError::Timeout { .. } => FailureKind::Timeout,
            MonitorError::Measurement(_) => FailureKind::Measurement,
            MonitorError::OutOfRange(_)
            | MonitorError::Config(_)
            | MonitorError::Configuration(_)
            | MonitorError::Task(_)
            | MonitorError::TooManyFailures(_) => FailureKind::Usage,
        }
    }

    /// Whether the failure counts towards the consecutive-failure escalation.
    ///
    /// Measurement failures only mean "no estimate this cycle" and never
    /// escalate.
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self.kind(),
            FailureKind::Transport | FailureKind::Protocol | FailureKind::Timeout
        )
    }
}

impl From<figment::Error> for MonitorError {
    fn from(err: figment::Error) -> Self {
        MonitorError::Config(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MonitorError::protocol("CALC1:MARK1:X?", "ERR");
        assert_eq!(err.to_string(), "Unexpected reply to 'CALC1:MARK1:X?': 'ERR'");
    }

    #[test]
    fn test_timeout_display() {
        let err = MonitorError::timeout("Sweep", Duration::from_secs(5));
        assert_eq!(err.to_string(), "Sweep timed out after 5s");
    }

    #[test]
    fn test_failure_classification() {
        assert_eq!(
            MonitorError::Transport("gone".into()).kind(),
            FailureKind::Transport
        );
        assert_eq!(MonitorError::NotConnected.kind(), FailureKind::Transport);
        assert_eq!(
            MonitorError::protocol("*IDN?", "").kind(),
            FailureKind::Protocol
        );
        assert_eq!(
            MonitorError::timeout("read", Duration::from_millis(10)).kind(),
            FailureKind::Timeout
        );
        assert_eq!(
            MonitorError::Measurement("no peak".into()).kind(),
            FailureKind::Measurement
        );
        assert_eq!(
            MonitorError::OutOfRange("span".into()).kind(),
            FailureKind::Usage
        );
    }

    #[test]
    fn test_measurement_failures_do_not_escalate() {
        assert!(!MonitorError::Measurement("no crossing".into()).is_link_failure());
        assert!(MonitorError::timeout("Sweep", Duration::from_secs(5)).is_link_failure());
        assert!(MonitorError::Io(std::io::Error::other("broken pipe")).is_link_failure());
    }
}
