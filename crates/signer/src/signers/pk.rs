use async_lock::RwLock;
use async_trait::async_trait;
use tracing::{debug, info};

use nipsigner_core::nip44::ConversationKey;
use nipsigner_core::{nip04, nip44, nostr_crypto, Event, Keys, PublicKey, Template};

use super::{EncryptionScheme, SchemeSet, Signer, User};
use crate::error::{SignerError, SignerResult};

/// Signer backed by key material held in memory.
///
/// Built without a key, every operation fails with `NoKeyMaterial` until
/// `generate_key` or `set_secret` fills it in.
pub struct PrivateKeySigner {
    keys: RwLock<Option<Keys>>,
}

impl PrivateKeySigner {
    /// Accepts hex (64 chars) or bech32 `nsec1...`.
    pub fn new(secret: &str) -> SignerResult<Self> {
        let keys = Keys::parse(secret)?;
        info!("[pk] created signer for {}", keys.public_key().to_hex());
        Ok(Self::from_keys(keys))
    }

    pub fn from_keys(keys: Keys) -> Self {
        Self {
            keys: RwLock::new(Some(keys)),
        }
    }

    pub fn generate() -> Self {
        Self::from_keys(Keys::generate())
    }

    pub fn without_key() -> Self {
        Self {
            keys: RwLock::new(None),
        }
    }

    /// Fill in a fresh key (replacing any previous one) and return its pubkey.
    pub async fn generate_key(&self) -> PublicKey {
        let keys = Keys::generate();
        let pubkey = keys.public_key();
        *self.keys.write().await = Some(keys);
        info!("[pk] generated key {}", pubkey.to_hex());
        pubkey
    }

    /// Replace the secret.
    pub async fn set_secret(&self, secret: &str) -> SignerResult<()> {
        let keys = Keys::parse(secret)?;
        *self.keys.write().await = Some(keys);
        info!("[pk] signer secret replaced");
        Ok(())
    }

    pub async fn has_key(&self) -> bool {
        self.keys.read().await.is_some()
    }

    async fn keys(&self) -> SignerResult<Keys> {
        self.keys.read().await.clone().ok_or(SignerError::NoKeyMaterial)
    }

    /// Sign synchronously with the given keys, then self-verify.
    pub fn sign_with_keys(keys: &Keys, template: Template) -> SignerResult<Event> {
        let unsigned = template.into_unsigned(keys.public_key());
        let sig = nostr_crypto::sign_id(keys.secret_key(), &unsigned.id)
            .map_err(|e| SignerError::Crypto(format!("Schnorr prehash sign failed: {}", e)))?;
        let event = unsigned.into_signed(sig);

        event
            .verify()
            .map_err(|e| SignerError::InvalidSignature(format!("Local Schnorr verify failed: {}", e)))?;
        Ok(event)
    }

    pub fn encrypt_with_keys(
        keys: &Keys,
        counterparty: &PublicKey,
        plaintext: &str,
        scheme: EncryptionScheme,
    ) -> SignerResult<String> {
        let secret = keys.secret_key();
        match scheme {
            EncryptionScheme::Nip04 => Ok(nip04::encrypt(secret, counterparty, plaintext)?),
            EncryptionScheme::Nip44 => {
                let conversation_key = ConversationKey::derive(secret, counterparty)?;
                Ok(nip44::encrypt(plaintext, &conversation_key)?)
            }
        }
    }

    pub fn decrypt_with_keys(
        keys: &Keys,
        counterparty: &PublicKey,
        ciphertext: &str,
        scheme: EncryptionScheme,
    ) -> SignerResult<String> {
        let secret = keys.secret_key();
        match scheme {
            EncryptionScheme::Nip04 => Ok(nip04::decrypt(secret, counterparty, ciphertext)?),
            EncryptionScheme::Nip44 => {
                let conversation_key = ConversationKey::derive(secret, counterparty)?;
                Ok(nip44::decrypt(ciphertext, &conversation_key)?)
            }
        }
    }
}

#[async_trait]
impl Signer for PrivateKeySigner {
    async fn identity(&self) -> SignerResult<User> {
        Ok(User::new(self.keys().await?.public_key()))
    }

    async fn sign(&self, template: Template) -> SignerResult<Event> {
        let keys = self.keys().await?;
        let event = Self::sign_with_keys(&keys, template)?;
        debug!("[pk] signed event {} kind={}", event.id, event.kind);
        Ok(event)
    }

    async fn encrypt(
        &self,
        counterparty: &PublicKey,
        plaintext: &str,
        scheme: Option<EncryptionScheme>,
    ) -> SignerResult<String> {
        let keys = self.keys().await?;
        Self::encrypt_with_keys(&keys, counterparty, plaintext, scheme.unwrap_or(self.preferred_scheme()))
    }

    async fn decrypt(
        &self,
        counterparty: &PublicKey,
        ciphertext: &str,
        scheme: Option<EncryptionScheme>,
    ) -> SignerResult<String> {
        let keys = self.keys().await?;
        Self::decrypt_with_keys(&keys, counterparty, ciphertext, scheme.unwrap_or(self.preferred_scheme()))
    }

    async fn supported_schemes(&self, scheme: Option<EncryptionScheme>) -> SchemeSet {
        if !self.has_key().await {
            return SchemeSet::empty();
        }
        SchemeSet::all().restrict(scheme)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nipsigner_core::nip19;

    #[tokio::test]
    async fn test_sign_produces_verifiable_event() {
        let signer = PrivateKeySigner::generate();
        let user = signer.identity().await.unwrap();

        let event = signer
            .sign(Template::new(1, "hello", vec![vec!["t".to_string(), "rust".to_string()]]))
            .await
            .unwrap();

        assert_eq!(event.pubkey, user.pubkey);
        assert_eq!(event.content, "hello");
        assert!(event.verify().is_ok());
    }

    #[tokio::test]
    async fn test_new_accepts_hex_and_nsec() {
        let keys = Keys::generate();
        let from_hex = PrivateKeySigner::new(&keys.secret_key().to_hex()).unwrap();
        let from_nsec = PrivateKeySigner::new(&nip19::encode_nsec(keys.secret_key())).unwrap();

        assert_eq!(from_hex.identity().await.unwrap(), from_nsec.identity().await.unwrap());
        assert!(PrivateKeySigner::new("not-a-key").is_err());
    }

    #[tokio::test]
    async fn test_without_key_fails_until_generated() {
        let signer = PrivateKeySigner::without_key();
        assert!(matches!(signer.identity().await, Err(SignerError::NoKeyMaterial)));
        assert!(matches!(signer.sign(Template::new(1, "", vec![])).await, Err(SignerError::NoKeyMaterial)));
        assert!(signer.supported_schemes(None).await.is_empty());

        let pubkey = signer.generate_key().await;
        assert_eq!(signer.identity().await.unwrap().pubkey, pubkey);
        assert!(signer.supported_schemes(None).await.contains(EncryptionScheme::Nip04));
    }

    #[tokio::test]
    async fn test_round_trip_both_schemes() {
        let alice = PrivateKeySigner::generate();
        let bob = PrivateKeySigner::generate();
        let alice_pk = alice.identity().await.unwrap().pubkey;
        let bob_pk = bob.identity().await.unwrap().pubkey;

        for scheme in [EncryptionScheme::Nip04, EncryptionScheme::Nip44] {
            let ciphertext = alice.encrypt(&bob_pk, "round trip", Some(scheme)).await.unwrap();
            let plaintext = bob.decrypt(&alice_pk, &ciphertext, Some(scheme)).await.unwrap();
            assert_eq!(plaintext, "round trip");
        }
    }

    #[tokio::test]
    async fn test_default_scheme_is_nip44() {
        let alice = PrivateKeySigner::generate();
        let bob = PrivateKeySigner::generate();
        let bob_pk = bob.identity().await.unwrap().pubkey;

        let ciphertext = alice.encrypt(&bob_pk, "x", None).await.unwrap();
        assert!(!ciphertext.contains("?iv="));
    }

    #[tokio::test]
    async fn test_supported_schemes_restrict() {
        let signer = PrivateKeySigner::generate();
        let only = signer.supported_schemes(Some(EncryptionScheme::Nip04)).await;
        assert!(only.contains(EncryptionScheme::Nip04));
        assert!(!only.contains(EncryptionScheme::Nip44));
    }
}
