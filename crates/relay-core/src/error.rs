//! Shared error type and result alias for Relay core operations.
//!
//! Variants carry structured context so callers can branch on the failure
//! class instead of parsing messages.

/// The result type used throughout Relay.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Relay core operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An invalid identifier was provided.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the ID invalid.
        message: String,
    },

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}
