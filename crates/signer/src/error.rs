use nipsigner_core::nip04::Nip04Error;
use nipsigner_core::nip44::Nip44Error;
use nipsigner_core::TypesError;

/// Error types shared by every signer backend, the encryption orchestrator
/// and the gift-wrap protocol.
#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    #[error("No signer configured")]
    NoSignerConfigured,

    #[error("Signing unavailable: {0}")]
    SigningUnavailable(String),

    #[error("No key material loaded")]
    NoKeyMaterial,

    #[error("Encryption scheme not supported by this signer")]
    EncryptionUnsupported,

    #[error("Cannot determine a single recipient for encryption")]
    AmbiguousRecipient,

    #[error("Encryption failed with every supported scheme")]
    EncryptionFailed,

    #[error("Decryption failed with every supported scheme")]
    DecryptionFailed,

    #[error("Extension host unavailable")]
    HostUnavailable,

    #[error("Extension host still busy after retries")]
    HostBusy,

    #[error("Access denied by the extension host")]
    AccessDenied,

    #[error("Remote signer error on {method}: {message}")]
    Rpc { method: String, message: String },

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Failed to decrypt gift wrapper")]
    FailedToDecryptWrapper,

    #[error("Gift seal verification failed")]
    GiftSealVerificationFailed,

    #[error("Failed to decrypt seal")]
    FailedToDecryptSeal,

    #[error("Invalid gift wrap: seal and rumor authors differ")]
    InvalidGiftWrapSenderMismatch,

    #[error("Signer cannot gift wrap with the requested scheme")]
    SignerCannotGiftWrap,

    #[error("Failed to unwrap gift: {0}")]
    GiftUnwrapFailed(#[source] Box<SignerError>),

    #[error("Invalid connection token: {0}")]
    InvalidConnectionToken(String),

    #[error("Directory lookup failed: {0}")]
    DirectoryLookup(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request {0} timed out")]
    Timeout(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Cryptographic operation failed: {0}")]
    Crypto(String),

    #[error("Types error: {0}")]
    Types(#[from] TypesError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<Nip04Error> for SignerError {
    fn from(e: Nip04Error) -> Self {
        SignerError::Crypto(format!("NIP-04: {}", e))
    }
}

impl From<Nip44Error> for SignerError {
    fn from(e: Nip44Error) -> Self {
        SignerError::Crypto(format!("NIP-44: {}", e))
    }
}

/// Result type for signer operations
pub type SignerResult<T> = Result<T, SignerError>;
