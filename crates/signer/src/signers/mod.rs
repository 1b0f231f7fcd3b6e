/*!
Signers module

The three backends share one capability trait:
- `pk`    : local key material (Schnorr signing, NIP-04/44 enc/dec)
- `nip07` : host-provided extension, encrypt/decrypt serialized through a FIFO queue
- `nip46` : remote agent reached over relays (Nostr Connect)

Callers check `supported_schemes` before encrypting; a backend that cannot tell
answers with the empty set.
*/
use std::fmt;

use async_trait::async_trait;
use nipsigner_core::{Event, PublicKey, Template};
use serde::{Deserialize, Serialize};

use crate::error::{SignerError, SignerResult};

pub mod nip07;
pub mod nip46;
pub mod pk;

pub use nip07::{ExtensionHost, HostError, Nip07Signer};
pub use nip46::{Nip46Signer, RemoteSignerState};
pub use pk::PrivateKeySigner;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionScheme {
    /// AES-256-CBC over the raw ECDH x-coordinate
    Nip04,
    /// ChaCha20 + HMAC-SHA256 with HKDF derived keys (v2)
    Nip44,
}

impl EncryptionScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncryptionScheme::Nip04 => "nip04",
            EncryptionScheme::Nip44 => "nip44",
        }
    }
}

impl fmt::Display for EncryptionScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of schemes a signer can handle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SchemeSet {
    nip04: bool,
    nip44: bool,
}

impl SchemeSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Self { nip04: true, nip44: true }
    }

    pub fn only(scheme: EncryptionScheme) -> Self {
        Self::empty().with(scheme)
    }

    pub fn with(mut self, scheme: EncryptionScheme) -> Self {
        match scheme {
            EncryptionScheme::Nip04 => self.nip04 = true,
            EncryptionScheme::Nip44 => self.nip44 = true,
        }
        self
    }

    pub fn contains(&self, scheme: EncryptionScheme) -> bool {
        match scheme {
            EncryptionScheme::Nip04 => self.nip04,
            EncryptionScheme::Nip44 => self.nip44,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.nip04 && !self.nip44
    }

    /// Narrow to a single scheme when one was asked for.
    pub fn restrict(self, scheme: Option<EncryptionScheme>) -> Self {
        match scheme {
            Some(s) if self.contains(s) => Self::only(s),
            Some(_) => Self::empty(),
            None => self,
        }
    }
}

/// Public identity of whoever controls a signer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct User {
    pub pubkey: PublicKey,
}

impl User {
    pub fn new(pubkey: PublicKey) -> Self {
        Self { pubkey }
    }

    pub fn npub(&self) -> String {
        self.pubkey.to_npub()
    }
}

#[async_trait]
pub trait Signer: Send + Sync {
    /// Public identity. May wait until the backend is ready.
    async fn identity(&self) -> SignerResult<User>;

    /// Sign a template as the signer's identity.
    async fn sign(&self, template: Template) -> SignerResult<Event>;

    async fn encrypt(
        &self,
        _counterparty: &PublicKey,
        _plaintext: &str,
        _scheme: Option<EncryptionScheme>,
    ) -> SignerResult<String> {
        Err(SignerError::EncryptionUnsupported)
    }

    async fn decrypt(
        &self,
        _counterparty: &PublicKey,
        _ciphertext: &str,
        _scheme: Option<EncryptionScheme>,
    ) -> SignerResult<String> {
        Err(SignerError::EncryptionUnsupported)
    }

    /// Schemes the backend can use, narrowed to `scheme` when given.
    async fn supported_schemes(&self, _scheme: Option<EncryptionScheme>) -> SchemeSet {
        SchemeSet::empty()
    }

    async fn preferred_relays(&self) -> Option<Vec<String>> {
        None
    }

    fn preferred_scheme(&self) -> EncryptionScheme {
        EncryptionScheme::Nip44
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SignOnly;

    #[async_trait]
    impl Signer for SignOnly {
        async fn identity(&self) -> SignerResult<User> {
            Err(SignerError::NoSignerConfigured)
        }

        async fn sign(&self, _template: Template) -> SignerResult<Event> {
            Err(SignerError::SigningUnavailable("test".to_string()))
        }
    }

    #[test]
    fn test_scheme_set_restrict() {
        let all = SchemeSet::all();
        assert_eq!(all.restrict(None), all);
        assert_eq!(all.restrict(Some(EncryptionScheme::Nip04)), SchemeSet::only(EncryptionScheme::Nip04));

        let only44 = SchemeSet::only(EncryptionScheme::Nip44);
        assert!(only44.restrict(Some(EncryptionScheme::Nip04)).is_empty());
    }

    #[test]
    fn test_scheme_serde_names() {
        assert_eq!(serde_json::to_string(&EncryptionScheme::Nip44).unwrap(), "\"nip44\"");
        let parsed: EncryptionScheme = serde_json::from_str("\"nip04\"").unwrap();
        assert_eq!(parsed, EncryptionScheme::Nip04);
    }

    #[tokio::test]
    async fn test_default_capabilities_are_conservative() {
        let signer = SignOnly;
        assert!(signer.supported_schemes(None).await.is_empty());
        assert!(signer.preferred_relays().await.is_none());
        assert_eq!(signer.preferred_scheme(), EncryptionScheme::Nip44);

        let keys = nipsigner_core::Keys::generate();
        let err = signer.encrypt(&keys.public_key(), "x", None).await.unwrap_err();
        assert!(matches!(err, SignerError::EncryptionUnsupported));
    }
}
