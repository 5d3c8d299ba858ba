//! Error taxonomy shared by every component in the core.
//!
//! One flat enum, in the style `jonwiggins-cedis` and `paulora2405-loja-rs`
//! use for their own Redis reimplementations, rather than the teacher's
//! `Box<dyn std::error::Error + Send + Sync>` alias: callers that drive a
//! device need to match on *kind* (was it a timeout? a hop failure? a
//! permission error?), not just print a message.

use std::time::Duration;

/// Errors surfaced by observers, runners and devices.
#[derive(Debug, thiserror::Error, Clone)]
pub enum Error {
    /// An observer did not reach a terminal state within its deadline.
    #[error("timed out after {elapsed:?} (deadline was {timeout:?})")]
    Timeout { timeout: Duration, elapsed: Duration },

    /// A command's parser matched a negative/error pattern in the output.
    #[error("command failed: {details}")]
    CommandFailure { details: String },

    /// Output was consumed but its structure was not recognized.
    #[error("failed to parse output: {details}")]
    ParsingFailure { details: String },

    /// The transport closed while an observer was running.
    #[error("connection lost")]
    ConnectionLost,

    /// `start` called on an observer that is not in `Created` state.
    #[error("observer already started")]
    AlreadyStarted,

    /// `submit` called on an observer that is not in `Created` state.
    #[error("observer already submitted")]
    AlreadySubmitted,

    /// `result()` called on an observer that has not reached a terminal state.
    #[error("observer is not done yet")]
    NotDone,

    /// The requested command/event is not registered for the device's current state.
    #[error("'{name}' is not allowed in state '{state}'")]
    NotAllowed { state: String, name: String },

    /// A device with this name already exists in the factory.
    #[error("device name '{0}' is already in use")]
    NameInUse(String),

    /// A hop command failed while `goto_state` was walking the path.
    #[error("hop from '{from}' to '{to}' failed at stage '{stage}': {source}")]
    HopFailure {
        from: String,
        to: String,
        stage: String,
        #[source]
        source: Box<Error>,
    },

    /// No path exists between the device's current state and the requested target.
    #[error("no hop path from '{from}' to '{to}'")]
    NoPath { from: String, to: String },

    /// The requested device state/command name is not registered for any class.
    #[error("unknown device class '{0}'")]
    UnknownDeviceClass(String),

    /// Something escaped an intake/parser/subscriber callback that should
    /// never propagate past it (a caught panic, an internal invariant
    /// violation). Never raised by normal operation.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
