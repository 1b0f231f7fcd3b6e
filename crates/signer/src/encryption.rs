//! Direct-message encryption with scheme selection and fallback.

use tracing::{debug, warn};

use nipsigner_core::{nip04, Event, Kind, PublicKey, Template};

use crate::config::EncryptionConfig;
use crate::error::{SignerError, SignerResult};
use crate::signers::{EncryptionScheme, Signer};

/// Ciphertext plus the scheme that produced it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedContent {
    pub scheme: EncryptionScheme,
    pub content: String,
}

impl EncryptedContent {
    /// Replace the template's content with the ciphertext.
    pub fn apply(self, mut template: Template) -> Template {
        template.content = self.content;
        template
    }
}

/// Picks a scheme per event and walks the candidates the signer supports.
#[derive(Clone, Debug, Default)]
pub struct EventEncryptor {
    config: EncryptionConfig,
}

impl EventEncryptor {
    pub fn new(config: EncryptionConfig) -> Self {
        Self { config }
    }

    pub fn with_preferred_scheme(mut self, scheme: EncryptionScheme) -> Self {
        self.config.preferred_scheme = Some(scheme);
        self
    }

    pub fn with_legacy_kinds(mut self, kinds: Vec<Kind>) -> Self {
        self.config.legacy_kinds = kinds;
        self
    }

    pub fn config(&self) -> &EncryptionConfig {
        &self.config
    }

    /// Legacy kinds force NIP-04; otherwise the request, then the configured
    /// preference, then NIP-44.
    pub fn select_scheme(&self, kind: Kind, requested: Option<EncryptionScheme>) -> EncryptionScheme {
        if self.config.is_legacy_kind(kind) {
            return EncryptionScheme::Nip04;
        }
        requested
            .or(self.config.preferred_scheme)
            .unwrap_or(EncryptionScheme::Nip44)
    }

    /// Encrypt `template.content` for `recipient`, or for the single `p` tag.
    pub async fn encrypt(
        &self,
        template: &Template,
        signer: &dyn Signer,
        recipient: Option<&PublicKey>,
        scheme: Option<EncryptionScheme>,
    ) -> SignerResult<EncryptedContent> {
        let recipient = match recipient {
            Some(pk) => *pk,
            None => single_recipient(&template.tags)?,
        };

        let selected = self.select_scheme(template.kind, scheme);
        let candidates = usable_candidates(signer, candidates_for(selected)).await?;

        for candidate in candidates {
            match signer.encrypt(&recipient, &template.content, Some(candidate)).await {
                Ok(content) => {
                    debug!("[encryption] kind {} encrypted with {}", template.kind, candidate);
                    return Ok(EncryptedContent {
                        scheme: candidate,
                        content,
                    });
                }
                Err(e) => warn!("[encryption] {} encrypt failed: {}", candidate, e),
            }
        }
        Err(SignerError::EncryptionFailed)
    }

    /// Decrypt `event.content`; the counterparty defaults to the author.
    pub async fn decrypt(
        &self,
        event: &Event,
        signer: &dyn Signer,
        counterparty: Option<&PublicKey>,
        scheme: Option<EncryptionScheme>,
    ) -> SignerResult<String> {
        let counterparty = counterparty.copied().unwrap_or(event.pubkey);

        let legacy = self.config.is_legacy_kind(event.kind)
            || scheme == Some(EncryptionScheme::Nip04)
            || (scheme.is_none() && nip04::looks_like_nip04(&event.content));
        let selected = if legacy {
            EncryptionScheme::Nip04
        } else {
            EncryptionScheme::Nip44
        };
        let candidates = usable_candidates(signer, candidates_for(selected)).await?;

        for candidate in candidates {
            match signer.decrypt(&counterparty, &event.content, Some(candidate)).await {
                Ok(plaintext) => {
                    debug!("[encryption] event {} decrypted with {}", event.id, candidate);
                    return Ok(plaintext);
                }
                Err(e) => debug!("[encryption] {} decrypt of {} failed: {}", candidate, event.id, e),
            }
        }
        warn!("[encryption] could not decrypt event {}", event.id);
        Err(SignerError::DecryptionFailed)
    }
}

fn candidates_for(selected: EncryptionScheme) -> &'static [EncryptionScheme] {
    match selected {
        EncryptionScheme::Nip04 => &[EncryptionScheme::Nip04, EncryptionScheme::Nip44],
        EncryptionScheme::Nip44 => &[EncryptionScheme::Nip44],
    }
}

async fn usable_candidates(
    signer: &dyn Signer,
    candidates: &[EncryptionScheme],
) -> SignerResult<Vec<EncryptionScheme>> {
    let mut usable = Vec::with_capacity(candidates.len());
    for &candidate in candidates {
        if signer.supported_schemes(Some(candidate)).await.contains(candidate) {
            usable.push(candidate);
        } else {
            debug!("[encryption] signer does not support {}, skipping", candidate);
        }
    }
    if usable.is_empty() {
        return Err(SignerError::EncryptionUnsupported);
    }
    Ok(usable)
}

fn single_recipient(tags: &[Vec<String>]) -> SignerResult<PublicKey> {
    let mut recipients = tags
        .iter()
        .filter(|tag| tag.first().map(String::as_str) == Some("p"))
        .filter_map(|tag| tag.get(1));

    match (recipients.next(), recipients.next()) {
        (Some(hex), None) => Ok(PublicKey::from_hex(hex)?),
        _ => Err(SignerError::AmbiguousRecipient),
    }
}
