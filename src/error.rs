// =============================================================================
// Error taxonomy — price codec and synchronization failures
// =============================================================================
//
// Library-level modules return these typed errors; `main` and the bootstrap
// code wrap them in `anyhow` with context.  None of them is fatal to the
// process: a failed page or batch is logged and the job ends, and the next
// scheduled trigger is the recovery path.
// =============================================================================

use thiserror::Error;

/// Failures of the fixed-point price codec.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PriceError {
    #[error("malformed decimal price: {input:?}")]
    Parse { input: String },

    #[error("decimal price out of range: {input:?}")]
    Overflow { input: String },

    #[error("fixed-point arithmetic overflow")]
    ArithmeticOverflow,

    #[error("division by zero")]
    DivisionByZero,
}

/// Failures of the REST synchronizers and the persistence layer.
#[derive(Debug, Error)]
pub enum SyncError {
    /// HTTP connectivity (DNS, TLS, timeouts, connection resets).
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Non-2xx response. Rejected credentials or signatures surface here.
    #[error("exchange returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// 2xx response whose envelope carries a non-zero OKX error code.
    #[error("exchange error code {code}: {msg}")]
    Exchange { code: String, msg: String },

    /// Malformed JSON or a payload that does not match the expected schema.
    #[error("decode error: {0}")]
    Decode(String),

    /// Transaction begin/exec/commit failure.
    #[error("persistence error: {0}")]
    Persistence(String),

    #[error(transparent)]
    Price(#[from] PriceError),
}

impl SyncError {
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(e: sqlx::Error) -> Self {
        Self::Persistence(e.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
