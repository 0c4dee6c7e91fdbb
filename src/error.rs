//! Unified error type for the attempt loop, gateway, and workflow drivers.
//!
//! One variant family per failing layer (transport, validation, circuit,
//! gateway, workflow, persistence) rather than a single flat enum.

use thiserror::Error;

/// Result type used throughout this crate.
pub type StableResult<T> = Result<T, StableError>;

/// Top-level error type.
#[derive(Error, Debug)]
pub enum StableError {
    /// Malformed request descriptor, missing entry point, or illegal graph.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Transport-level failure that was not converted into an `ItemResult`
    /// because `finalErrorAnalyzer` returned `false` after attempts were
    /// exhausted, or `returnResult=false`.
    #[error("attempt loop exhausted retries for {item_id}: {source}")]
    AttemptsExhausted {
        item_id: String,
        #[source]
        source: Box<StableError>,
    },

    /// An HTTP response was received but classified as a failure.
    #[error("HTTP_ERROR: status {status} for {url}")]
    HttpError { status: u16, url: String },

    /// The transport call itself failed before a response was obtained.
    #[error("network error: {0}")]
    Network(String),

    /// `responseAnalyzer` returned false.
    #[error("INVALID_CONTENT: response validation failed")]
    InvalidContent,

    /// Execution exceeded a configured timeout budget. The message always
    /// contains the literal substring "timeout"
    #[error("timeout: execution exceeded {millis}ms")]
    Timeout { millis: u64 },

    /// The circuit breaker is open and short-circuited the attempt.
    #[error("circuit breaker open, retry after {retry_after_ms}ms")]
    CircuitOpen { retry_after_ms: u64 },

    /// The gateway's own `maxTimeout` budget was exceeded.
    #[error("stable-infra: Gateway execution exceeded maxTimeout of {millis}ms{context}")]
    GatewayTimeout { millis: u64, context: String },

    /// Graph build/validation failure.
    #[error("{0}")]
    GraphInvalid(String),

    /// A workflow phase raised rather than returning a failed result.
    #[error("phase {phase_id} failed: {source}")]
    PhaseError {
        phase_id: String,
        #[source]
        source: Box<StableError>,
    },

    /// A user hook body raised. Captured and logged; never changes an
    /// attempt's recorded outcome.
    #[error("hook {hook} failed: {message}")]
    HookFailed { hook: String, message: String },

    /// State persistence load/store callback failed. Never fatal; logged
    /// with the literal prefixes requires.
    #[error("State persistence: Failed to {direction} state: {message}")]
    PersistenceFailed { direction: String, message: String },

    /// Serialization failure while computing a cache fingerprint or
    /// encoding/decoding a shared-buffer snapshot.
    #[error("serialization error")]
    Serialization(#[from] serde_json::Error),
}

impl StableError {
    /// True for classifications that may be retried (spec §7 propagation
    /// policy): transient transport failures, validation failures, and
    /// retryable HTTP statuses. Permanent 4xx and invalid input are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StableError::Network(_) | StableError::InvalidContent | StableError::Timeout { .. }
        ) || matches!(self, StableError::HttpError { status, .. } if is_retryable_status(*status))
    }
}

/// HTTP 4xx is permanent except 408, 425, 429. 5xx and everything else is treated as transient.
pub fn is_retryable_status(status: u16) -> bool {
    if (400..500).contains(&status) {
        matches!(status, 408 | 425 | 429)
    } else {
        true
    }
}

/// Network error `code` values that are signalled retryable
pub const RETRYABLE_NETWORK_CODES: &[&str] =
    &["ECONNRESET", "ETIMEDOUT", "ECONNREFUSED", "ENOTFOUND", "EAI_AGAIN"];
