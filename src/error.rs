use serde_json::Value;
use thiserror::Error;

/// Error taxonomy for the node session & dispatch layer.
///
/// Nothing here is fatal: every variant has a defined recovery (rollback to
/// no-session, return to idle, or record-and-continue). Latency probe
/// failures deliberately have no variant at all; they are absorbed into the
/// probe record and never propagate.
#[derive(Debug, Error)]
pub enum Error {
    /// Dispatch was attempted without a ready session. Local and
    /// non-retryable; the caller must select (or re-select) a node first.
    #[error("no node session available")]
    NoSession,

    /// The session handshake did not produce both the session-id and config
    /// events within the handshake deadline.
    #[error("session handshake timed out")]
    HandshakeTimeout,

    /// The session handshake failed before completing.
    #[error("session handshake failed: {0}")]
    HandshakeError(String),

    /// Transport-level failure on a streaming channel (connect refused,
    /// non-success status, stream error).
    #[error("streaming channel error: {0}")]
    Channel(String),

    /// `select_node` was handed a node that is not in the current catalogue.
    /// Guards against stale references surviving a registry refresh.
    #[error("node not in current catalogue: {0}")]
    UnknownNode(String),

    /// Node catalogue fetch failed. Callers log this and keep the stale
    /// catalogue rather than clearing it.
    #[error("node discovery failed: {0}")]
    Discovery(String),

    /// A dispatched command failed: transport error, timeout, or a
    /// well-formed payload without an explicit success flag. Carries the raw
    /// payload (when one was received) for diagnostics.
    #[error("{method} failed: {detail}")]
    RequestFailure {
        method: String,
        detail: String,
        body: Option<Value>,
    },

    /// A dispatched command was explicitly canceled via its cancellation
    /// token. Distinct from `RequestFailure` so callers can suppress it from
    /// user-visible error reporting.
    #[error("request canceled")]
    Canceled,

    /// The server rejected the request parameters (HTTP 400). Surfaced as a
    /// user-facing validation message, not logged as a system fault.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    /// True for the cancellation variant, which is suppressed from
    /// user-visible error reporting.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Canceled)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
