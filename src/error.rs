//! Error types shared across the agent.
//!
//! Per-step failures (`ParseError`, `OracleError`, most `DriverError`s) are
//! recovered inside the control loop; only `AgentError::OracleUnavailable`,
//! `AgentError::Launch` and `AgentError::TooManyConsecutiveErrors` end a run.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::driver::Capability;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("oracle credential missing: set {0}")]
    OracleUnavailable(&'static str),

    #[error("browser launch failed: {0}")]
    Launch(String),

    #[error(transparent)]
    Oracle(#[from] OracleError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("browser task failed: {0}")]
    DriverTask(String),

    #[error("browser session is closed")]
    SessionClosed,

    #[error("failed to write findings report to {}: {source}", path.display())]
    Report {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("stopping after {count} consecutive errors (last: {last_error})")]
    TooManyConsecutiveErrors { count: u32, last_error: String },
}

/// The oracle text did not contain a usable action or report.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("could not parse oracle response:\n{preview}")]
    Unrecognized { preview: String },

    #[error("invalid '{action}' action: {reason}")]
    InvalidAction { action: String, reason: String },

    #[error("malformed findings report: {0}")]
    MalformedReport(String),
}

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("oracle request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("oracle API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("no content in oracle response: {0}")]
    EmptyResponse(String),
}

/// Failures surfaced by a [`crate::driver::PageDriver`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    #[error("driver '{driver}' does not support {capability}")]
    Unsupported {
        driver: String,
        capability: Capability,
    },

    #[error("no element matches selector '{0}'")]
    NotFound(String),

    #[error("selector '{selector}' is ambiguous: it matches {count} elements")]
    Ambiguous { selector: String, count: usize },

    #[error("timed out after {}ms waiting for {what}", timeout.as_millis())]
    Timeout { what: String, timeout: Duration },

    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("script error: {0}")]
    Script(String),

    #[error("{0}")]
    Backend(String),

    #[error("browser session is closed")]
    Closed,
}

pub type DriverResult<T> = Result<T, DriverError>;

#[derive(Debug, Error)]
pub enum NarrationError {
    #[error("speech request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("speech API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("audio clip I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("audio player failed: {0}")]
    Player(String),
}
