//! Error types for the bridge, one enum per layer.
//!
//! Transport failures, protocol failures, and command failures are kept
//! distinct so the coordinator can decide what degrades the session and
//! what is surfaced straight back to the caller.

use std::path::PathBuf;

/// A transport-level failure: the printer service could not be reached or
/// answered with a non-success status.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("request to {url} failed with status {status}")]
    Status { url: String, status: u16 },

    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("websocket error on {url}: {source}")]
    Ws {
        url: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },

    #[error("connection to {url} closed")]
    Closed { url: String },
}

impl ConnectionError {
    /// The URL the failing request was addressed to.
    pub fn url(&self) -> &str {
        match self {
            ConnectionError::Status { url, .. }
            | ConnectionError::Http { url, .. }
            | ConnectionError::Ws { url, .. }
            | ConnectionError::Closed { url } => url,
        }
    }
}

/// A payload that does not have the shape the wire protocol promises.
///
/// Fail-fast within a single parse call; the caller decides whether the
/// surrounding cycle continues.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("response is missing the `{0}` key")]
    MissingKey(&'static str),

    #[error("expected a JSON object under `{0}`")]
    NotAnObject(&'static str),
}

/// A failed G-code submission. Never retried internally.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("gcode submission failed: {0}")]
    Connection(#[from] ConnectionError),
}

/// Configuration problems, surfaced during setup only.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Why a single fetch step failed: either the wire was broken or the
/// payload was malformed.
#[derive(Debug, thiserror::Error)]
pub enum FetchFailure {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Failure report handed back to the host scheduler from the refresh
/// entrypoint.
#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    /// The liveness probe did not succeed; the session has never left (or
    /// has fallen back to) the probing phase. Recoverable: the scheduler
    /// decides when to try again.
    #[error("printer service not ready: {0}")]
    NotReady(#[source] FetchFailure),

    /// The full-snapshot query failed after a successful probe. The
    /// session is degraded until the next scheduled refresh recovers it.
    #[error("status query failed: {0}")]
    Fetch(#[source] FetchFailure),

    /// Poll refreshes are rejected while the socket receive loop is
    /// attached, so the two transports never write concurrently.
    #[error("poll refresh rejected while the socket session is active")]
    DualMode,
}
