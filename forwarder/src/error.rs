//! # Forwarder Error Kinds
//!
//! Every failure mode the forwarding core can produce, collected into one
//! `thiserror` enum. Per the error-handling design: only `ConfigError` and
//! `BindError` are allowed to propagate out of `Orchestrator::start`; every
//! other variant is handled at the handler's outer boundary (closed socket,
//! mapped HTTP status, or a logged-and-continued accept loop).

use std::net::AddrParseError;

/// The error type shared by every component in this crate.
#[derive(Debug, thiserror::Error)]
pub enum ForwarderError {
    /// Invalid or conflicting endpoint configuration, surfaced from `Orchestrator::init`.
    #[error("configuration error: {0}")]
    Config(String),

    /// A listener failed to bind its `(listenIp, listenPort)`.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// The address that could not be bound.
        addr: String,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The admission limiter's permit and wait-queue were both exhausted.
    #[error("admission rejected: {0} is at capacity")]
    AdmissionRejected(String),

    /// No backend in the endpoint's pool was healthy, even after an
    /// on-demand `HealthChecker::check_all` recovery attempt.
    #[error("no healthy backend available for {0}")]
    NoHealthyBackend(String),

    /// The upstream call did not complete before `backend.timeout` elapsed.
    #[error("upstream timed out after {0:?}")]
    UpstreamTimeout(std::time::Duration),

    /// The backend refused the connection or was otherwise unreachable.
    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    /// The backend responded but its response could not be relayed as-is
    /// (malformed status line, headers, etc).
    #[error("upstream protocol error: {0}")]
    UpstreamProtocolError(String),

    /// The TLS handshake, server- or client-side, failed.
    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),

    /// Raised when the process-wide cancellation token fires mid-operation.
    /// Expected during shutdown; logged at `debug`, never `error`.
    #[error("operation cancelled")]
    Cancelled,

    /// A catch-all for anything that reaches a handler boundary unhandled.
    /// Handlers log this at `error` and close the connection to contain the fault.
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl From<std::io::Error> for ForwarderError {
    fn from(e: std::io::Error) -> Self {
        ForwarderError::UpstreamUnreachable(e.to_string())
    }
}

impl From<AddrParseError> for ForwarderError {
    fn from(e: AddrParseError) -> Self {
        ForwarderError::Config(format!("invalid address: {e}"))
    }
}

impl From<reqwest::Error> for ForwarderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ForwarderError::UpstreamTimeout(std::time::Duration::from_secs(0))
        } else if e.is_connect() {
            ForwarderError::UpstreamUnreachable(e.to_string())
        } else {
            ForwarderError::UpstreamProtocolError(e.to_string())
        }
    }
}

impl ForwarderError {
    /// The level a handler boundary should log this error at, per spec §7:
    /// cancellation is expected and quiet, admission/health rejections are
    /// expected-but-noteworthy, and anything unaccounted for is an error.
    pub fn log_level(&self) -> log::Level {
        match self {
            ForwarderError::Cancelled => log::Level::Debug,
            ForwarderError::AdmissionRejected(_)
            | ForwarderError::NoHealthyBackend(_)
            | ForwarderError::TlsHandshakeFailed(_)
            | ForwarderError::UpstreamTimeout(_)
            | ForwarderError::UpstreamUnreachable(_)
            | ForwarderError::UpstreamProtocolError(_) => log::Level::Warn,
            ForwarderError::Config(_) | ForwarderError::Bind { .. } | ForwarderError::Unexpected(_) => {
                log::Level::Error
            }
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ForwarderError>;
