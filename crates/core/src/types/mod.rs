pub mod filter;
pub mod nostr;

pub use filter::Filter;
pub use nostr::*;

/// Error types for the types module
#[derive(Debug, thiserror::Error)]
pub enum TypesError {
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Missing field: {0}")]
    MissingField(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(String),
}
