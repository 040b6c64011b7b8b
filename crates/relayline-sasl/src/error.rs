//! Error types for SASL exchanges.

/// Result type alias for SASL operations.
pub type Result<T> = std::result::Result<T, Error>;

/// SASL error types.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Server challenge was not valid base64.
    #[error("Invalid challenge encoding: {0}")]
    InvalidChallenge(#[from] base64::DecodeError),

    /// Mechanism name is not implemented by this crate.
    #[error("Unsupported SASL mechanism: {0}")]
    UnsupportedMechanism(String),

    /// Challenge was required but none was supplied.
    #[error("SASL mechanism {0} expected a server challenge")]
    MissingChallenge(&'static str),
}
