//! NIP-59 gift wrap: rumor inside a seal inside a wrap.
//!
//! The seal is signed by the real author and encrypted to the recipient. The
//! wrap is signed by a key that exists only for the duration of `wrap`, so
//! relays never learn who talks to whom.

use rand::Rng;
use tracing::{debug, warn};

use nipsigner_core::{
    timestamp_now, Event, Keys, Kind, PublicKey, Template, Timestamp, UnsignedEvent, KIND_GIFT_WRAP, KIND_SEAL,
    KIND_SEALED_GROUP_WRAP,
};

use crate::config::GiftWrapConfig;
use crate::error::{SignerError, SignerResult};
use crate::signers::{EncryptionScheme, PrivateKeySigner, Signer};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GiftWrapOptions {
    pub scheme: EncryptionScheme,
    /// Overrides the template kind for the rumor when set.
    pub rumor_kind: Option<Kind>,
    pub wrap_kind: Kind,
    /// Extra tags on the outer wrap; `["p", recipient]` is always appended.
    pub wrap_tags: Vec<Vec<String>>,
    pub time_drift_exponent: u32,
}

impl Default for GiftWrapOptions {
    fn default() -> Self {
        GiftWrapConfig::default().into()
    }
}

impl From<GiftWrapConfig> for GiftWrapOptions {
    fn from(config: GiftWrapConfig) -> Self {
        Self {
            scheme: config.scheme,
            rumor_kind: None,
            wrap_kind: config.wrap_kind,
            wrap_tags: Vec::new(),
            time_drift_exponent: config.time_drift_exponent,
        }
    }
}

impl GiftWrapOptions {
    pub fn with_scheme(mut self, scheme: EncryptionScheme) -> Self {
        self.scheme = scheme;
        self
    }

    pub fn with_rumor_kind(mut self, kind: Kind) -> Self {
        self.rumor_kind = Some(kind);
        self
    }

    pub fn with_wrap_tags(mut self, tags: Vec<Vec<String>>) -> Self {
        self.wrap_tags = tags;
        self
    }
}

/// Now minus a uniform offset in `[0, 10^exponent)` seconds.
pub fn fuzzed_timestamp(exponent: u32) -> Timestamp {
    let window = 10u64.saturating_pow(exponent).max(1);
    let offset = rand::thread_rng().gen_range(0..window);
    timestamp_now().saturating_sub(offset)
}

/// Gift-wrap `template` from `signer` to `recipient`.
pub async fn wrap(
    template: Template,
    recipient: &PublicKey,
    signer: &dyn Signer,
    opts: &GiftWrapOptions,
) -> SignerResult<Event> {
    if !signer.supported_schemes(Some(opts.scheme)).await.contains(opts.scheme) {
        warn!("[nip59] signer cannot encrypt with {}", opts.scheme);
        return Err(SignerError::SignerCannotGiftWrap);
    }

    let author = signer.identity().await?.pubkey;
    let mut template = template;
    if let Some(kind) = opts.rumor_kind {
        template.kind = kind;
    }
    let rumor = template.into_unsigned(author);

    let seal = seal_rumor(&rumor, recipient, signer, opts).await?;
    let wrap = wrap_seal(&seal, recipient, opts)?;
    debug!("[nip59] wrapped rumor kind {} into {} (kind {})", rumor.kind, wrap.id, wrap.kind);
    Ok(wrap)
}

/// Encrypt the rumor to `recipient` and sign the seal as the author.
pub async fn seal_rumor(
    rumor: &UnsignedEvent,
    recipient: &PublicKey,
    signer: &dyn Signer,
    opts: &GiftWrapOptions,
) -> SignerResult<Event> {
    let content = signer.encrypt(recipient, &rumor.as_json(), Some(opts.scheme)).await?;
    let template = Template::new(KIND_SEAL, content, Vec::new())
        .with_created_at(fuzzed_timestamp(opts.time_drift_exponent));
    signer.sign(template).await
}

/// Encrypt the seal with a one-time key and sign the outer wrap with it.
pub fn wrap_seal(seal: &Event, recipient: &PublicKey, opts: &GiftWrapOptions) -> SignerResult<Event> {
    let one_time = Keys::generate();
    let content = PrivateKeySigner::encrypt_with_keys(&one_time, recipient, &seal.as_json(), opts.scheme)?;

    let mut tags = opts.wrap_tags.clone();
    tags.push(vec!["p".to_string(), recipient.to_hex()]);

    let template =
        Template::new(opts.wrap_kind, content, tags).with_created_at(fuzzed_timestamp(opts.time_drift_exponent));
    PrivateKeySigner::sign_with_keys(&one_time, template)
}

/// Open a wrap addressed to `signer` and return the rumor inside.
///
/// Every failure comes back as `GiftUnwrapFailed` with the step that failed
/// as its source.
pub async fn unwrap(
    wrap: &Event,
    signer: &dyn Signer,
    expected_sender: Option<&PublicKey>,
    scheme: EncryptionScheme,
) -> SignerResult<UnsignedEvent> {
    match open_layers(wrap, signer, expected_sender, scheme).await {
        Ok(rumor) => {
            debug!("[nip59] unwrapped {} from {}", wrap.id, rumor.pubkey);
            Ok(rumor)
        }
        Err(e) => {
            warn!("[nip59] failed to unwrap {}: {}", wrap.id, e);
            Err(SignerError::GiftUnwrapFailed(Box::new(e)))
        }
    }
}

async fn open_layers(
    wrap: &Event,
    signer: &dyn Signer,
    expected_sender: Option<&PublicKey>,
    scheme: EncryptionScheme,
) -> SignerResult<UnsignedEvent> {
    let counterparty = expected_sender.copied().unwrap_or(wrap.pubkey);
    let seal_json = signer
        .decrypt(&counterparty, &wrap.content, Some(scheme))
        .await
        .map_err(|e| {
            debug!("[nip59] wrap decryption failed: {}", e);
            SignerError::FailedToDecryptWrapper
        })?;
    let seal = Event::from_json(&seal_json).map_err(|e| {
        debug!("[nip59] wrap does not contain a seal: {}", e);
        SignerError::FailedToDecryptWrapper
    })?;

    if seal.kind != KIND_SEAL {
        debug!("[nip59] inner event has kind {}, expected {}", seal.kind, KIND_SEAL);
        return Err(SignerError::GiftSealVerificationFailed);
    }
    seal.verify().map_err(|e| {
        debug!("[nip59] seal verification failed: {}", e);
        SignerError::GiftSealVerificationFailed
    })?;

    let rumor_json = signer
        .decrypt(&seal.pubkey, &seal.content, Some(scheme))
        .await
        .map_err(|e| {
            debug!("[nip59] seal decryption failed: {}", e);
            SignerError::FailedToDecryptSeal
        })?;
    let mut rumor = UnsignedEvent::from_json(&rumor_json).map_err(|e| {
        debug!("[nip59] seal does not contain a rumor: {}", e);
        SignerError::FailedToDecryptSeal
    })?;

    if seal.pubkey != rumor.pubkey {
        return Err(SignerError::InvalidGiftWrapSenderMismatch);
    }

    rumor.compute_id();
    Ok(rumor)
}

/// True for the kinds a wrap may carry.
pub fn is_wrap_kind(kind: Kind) -> bool {
    kind == KIND_GIFT_WRAP || kind == KIND_SEALED_GROUP_WRAP
}

#[cfg(test)]
mod tests {
    use super::*;
    use nipsigner_core::KIND_DIRECT_MESSAGE;

    fn hello_to(recipient: &PublicKey) -> Template {
        Template::new(
            KIND_DIRECT_MESSAGE,
            "hello",
            vec![vec!["p".to_string(), recipient.to_hex()]],
        )
    }

    fn source_error(err: SignerError) -> SignerError {
        match err {
            SignerError::GiftUnwrapFailed(cause) => *cause,
            other => panic!("expected GiftUnwrapFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_fuzzed_timestamp_window() {
        let now = timestamp_now();
        for _ in 0..100 {
            let t = fuzzed_timestamp(2);
            assert!(t <= now + 1);
            assert!(t + 100 >= now);
        }
        assert!(fuzzed_timestamp(0) >= now);
    }

    #[tokio::test]
    async fn test_direct_message_scenario() {
        let alice = PrivateKeySigner::generate();
        let bob = PrivateKeySigner::generate();
        let alice_pk = alice.identity().await.unwrap().pubkey;
        let bob_pk = bob.identity().await.unwrap().pubkey;

        let wrapped = wrap(hello_to(&bob_pk), &bob_pk, &alice, &GiftWrapOptions::default())
            .await
            .unwrap();
        assert_eq!(wrapped.kind, KIND_GIFT_WRAP);
        assert_eq!(wrapped.tag_values("p").collect::<Vec<_>>(), vec![bob_pk.to_hex()]);
        assert_ne!(wrapped.pubkey, alice_pk);
        assert!(wrapped.verify().is_ok());

        let rumor = unwrap(&wrapped, &bob, None, EncryptionScheme::Nip44).await.unwrap();
        assert_eq!(rumor.kind, KIND_DIRECT_MESSAGE);
        assert_eq!(rumor.content, "hello");
        assert_eq!(rumor.pubkey, alice_pk);
        assert!(rumor.has_valid_id());
    }

    #[tokio::test]
    async fn test_two_wraps_differ() {
        let alice = PrivateKeySigner::generate();
        let bob_pk = Keys::generate().public_key();
        let opts = GiftWrapOptions::default();

        let first = wrap(hello_to(&bob_pk), &bob_pk, &alice, &opts).await.unwrap();
        let second = wrap(hello_to(&bob_pk), &bob_pk, &alice, &opts).await.unwrap();
        assert_ne!(first.pubkey, second.pubkey);
        assert_ne!(first.id, second.id);
        assert_ne!(first.sig, second.sig);
    }

    #[tokio::test]
    async fn test_rumor_kind_override_and_wrap_tags() {
        let alice = PrivateKeySigner::generate();
        let bob = PrivateKeySigner::generate();
        let bob_pk = bob.identity().await.unwrap().pubkey;

        let opts = GiftWrapOptions::from(GiftWrapConfig {
            wrap_kind: KIND_SEALED_GROUP_WRAP,
            ..GiftWrapConfig::default()
        })
        .with_rumor_kind(7)
        .with_wrap_tags(vec![vec!["expiration".to_string(), "99".to_string()]]);

        let wrapped = wrap(hello_to(&bob_pk), &bob_pk, &alice, &opts).await.unwrap();
        assert_eq!(wrapped.kind, 1060);
        assert!(is_wrap_kind(wrapped.kind));
        assert_eq!(wrapped.tags[0], vec!["expiration".to_string(), "99".to_string()]);
        assert_eq!(wrapped.tags.last().unwrap(), &vec!["p".to_string(), bob_pk.to_hex()]);

        let rumor = unwrap(&wrapped, &bob, None, EncryptionScheme::Nip44).await.unwrap();
        assert_eq!(rumor.kind, 7);
    }

    #[tokio::test]
    async fn test_sender_mismatch_rejected() {
        let mallory = PrivateKeySigner::generate();
        let bob = PrivateKeySigner::generate();
        let bob_pk = bob.identity().await.unwrap().pubkey;
        let victim = Keys::generate().public_key();
        let opts = GiftWrapOptions::default();

        // Mallory signs a valid seal around a rumor that claims to be from the victim.
        let forged = hello_to(&bob_pk).into_unsigned(victim);
        let seal = seal_rumor(&forged, &bob_pk, &mallory, &opts).await.unwrap();
        assert!(seal.verify().is_ok());
        let wrapped = wrap_seal(&seal, &bob_pk, &opts).unwrap();

        let err = unwrap(&wrapped, &bob, None, EncryptionScheme::Nip44).await.unwrap_err();
        assert!(matches!(source_error(err), SignerError::InvalidGiftWrapSenderMismatch));
    }

    #[tokio::test]
    async fn test_bad_seal_signature_rejected_first() {
        let alice = PrivateKeySigner::generate();
        let bob = PrivateKeySigner::generate();
        let bob_pk = bob.identity().await.unwrap().pubkey;
        let opts = GiftWrapOptions::default();

        // Rumor author differs too; the signature check must fire before that.
        let rumor = hello_to(&bob_pk).into_unsigned(Keys::generate().public_key());
        let mut seal = seal_rumor(&rumor, &bob_pk, &alice, &opts).await.unwrap();
        let other = alice.sign(Template::new(KIND_SEAL, "x", vec![])).await.unwrap();
        seal.sig = other.sig;
        let wrapped = wrap_seal(&seal, &bob_pk, &opts).unwrap();

        let err = unwrap(&wrapped, &bob, None, EncryptionScheme::Nip44).await.unwrap_err();
        assert!(matches!(source_error(err), SignerError::GiftSealVerificationFailed));
    }

    #[tokio::test]
    async fn test_wrong_recipient_cannot_open() {
        let alice = PrivateKeySigner::generate();
        let bob_pk = Keys::generate().public_key();
        let eve = PrivateKeySigner::generate();

        let wrapped = wrap(hello_to(&bob_pk), &bob_pk, &alice, &GiftWrapOptions::default())
            .await
            .unwrap();
        let err = unwrap(&wrapped, &eve, None, EncryptionScheme::Nip44).await.unwrap_err();
        assert!(matches!(source_error(err), SignerError::FailedToDecryptWrapper));
    }

    #[tokio::test]
    async fn test_signer_without_key_cannot_wrap() {
        let empty = PrivateKeySigner::without_key();
        let bob_pk = Keys::generate().public_key();
        let err = wrap(hello_to(&bob_pk), &bob_pk, &empty, &GiftWrapOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SignerError::SignerCannotGiftWrap));
    }
}
