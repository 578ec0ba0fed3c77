//! Error types surfaced to callers of the session.
//!
//! Transport and decode failures are recovered locally (logged, then the
//! pipeline moves on) and never show up here. What remains are construction
//! failures, lifecycle precondition failures and command send outcomes.

use std::path::PathBuf;
use std::time::Duration;

use crate::transport::ConnectionState;

/// Errors returned by [`CaptureSession`](crate::session::CaptureSession) and
/// its collaborators.
#[derive(Debug)]
pub enum SessionError {
    /// The capture executable is missing and the session is not externally managed.
    ExecutableNotFound(PathBuf),
    /// The OS refused to spawn the capture executable.
    Spawn(String),
    /// A lifecycle command was issued while no capture process exists.
    Uninitialized,
    /// `reset` was called without any launch state to resume from.
    NoInstanceToReset,
    /// A command was sent while the transport was not open.
    NotOpen(ConnectionState),
    /// The transport reported an error while sending a command.
    Send(String),
    /// Waiting for the transport to open exceeded the caller's timeout.
    Timeout(Duration),
    /// The transport was closed while an operation was waiting on it.
    Cancelled,
    /// The requested operation is deliberately unsupported.
    NotImplemented(&'static str),
    /// An option value could not be interpreted.
    Config(String),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ExecutableNotFound(path) => {
                write!(f, "ZanarkandWrapper not found in {}", path.display())
            }
            Self::Spawn(msg) => write!(f, "Failed to spawn ZanarkandWrapper: {msg}"),
            Self::Uninitialized => write!(f, "ZanarkandWrapper is uninitialized."),
            Self::NoInstanceToReset => write!(f, "No instance to reset."),
            Self::NotOpen(state) => write!(f, "Transport is not open (state: {state})"),
            Self::Send(msg) => write!(f, "Send failed: {msg}"),
            Self::Timeout(after) => {
                write!(f, "Transport did not open within {}ms", after.as_millis())
            }
            Self::Cancelled => write!(f, "Transport closed while waiting"),
            Self::NotImplemented(what) => write!(f, "{what} has not yet been reimplemented."),
            Self::Config(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for SessionError {}

/// Result alias used throughout the crate.
pub type Result<T, E = SessionError> = std::result::Result<T, E>;
