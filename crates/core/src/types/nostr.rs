use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use k256::schnorr::{SigningKey, VerifyingKey};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::nostr_crypto;
use crate::types::TypesError;

type Result<T> = std::result::Result<T, TypesError>;

pub type Kind = u16;
pub type Timestamp = u64;

/// NIP-04 encrypted direct message. Always encrypted with the legacy scheme.
pub const KIND_ENCRYPTED_DIRECT_MESSAGE: Kind = 4;
/// NIP-59 seal
pub const KIND_SEAL: Kind = 13;
/// NIP-17 private direct message, the default rumor kind
pub const KIND_DIRECT_MESSAGE: Kind = 14;
/// NIP-59 gift wrap
pub const KIND_GIFT_WRAP: Kind = 1059;
/// Gift wrap variant used for sealed group messages
pub const KIND_SEALED_GROUP_WRAP: Kind = 1060;
/// NIP-46 remote signing RPC
pub const KIND_NOSTR_CONNECT: Kind = 24133;

pub fn timestamp_now() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn decode_hex_32(s: &str, what: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(s).map_err(|_| TypesError::InvalidFormat(format!("{what}: invalid hex")))?;
    bytes
        .try_into()
        .map_err(|_| TypesError::InvalidFormat(format!("{what}: expected 32 bytes")))
}

macro_rules! hex_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                <$ty>::from_hex(&s).map_err(de::Error::custom)
            }
        }
    };
}

// ============================================================================
// Basic Types
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(pub [u8; 32]);

impl EventId {
    pub fn from_hex(s: &str) -> Result<Self> {
        decode_hex_32(s, "event id").map(EventId)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventId({})", self.to_hex())
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

hex_serde!(EventId);

/// x-only (BIP-340) public key
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
    /// Parse a 64-char hex key. The bytes must be a valid x-only curve point.
    pub fn from_hex(s: &str) -> Result<Self> {
        Self::from_bytes(decode_hex_32(s, "pubkey")?)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Result<Self> {
        VerifyingKey::from_bytes(&bytes)
            .map_err(|_| TypesError::InvalidKey("not a valid x-only public key".to_string()))?;
        Ok(PublicKey(bytes))
    }

    /// Accepts hex or a bech32 `npub1...` string.
    pub fn parse(s: &str) -> Result<Self> {
        if s.starts_with("npub1") {
            return crate::nip19::decode_npub(s).map_err(|e| TypesError::InvalidKey(e.to_string()));
        }
        Self::from_hex(s)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn to_npub(&self) -> String {
        crate::nip19::encode_npub(self)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

hex_serde!(PublicKey);

#[derive(Clone)]
pub struct SecretKey(pub [u8; 32]);

impl SecretKey {
    pub fn from_hex(s: &str) -> Result<Self> {
        Self::from_bytes(decode_hex_32(s, "secret key")?)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Result<Self> {
        SigningKey::from_bytes(&bytes)
            .map_err(|_| TypesError::InvalidKey("secret key out of range".to_string()))?;
        Ok(SecretKey(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn public_key(&self) -> Result<PublicKey> {
        let signing_key = SigningKey::from_bytes(&self.0)
            .map_err(|_| TypesError::InvalidKey("secret key out of range".to_string()))?;
        Ok(PublicKey(signing_key.verifying_key().to_bytes().into()))
    }

    pub fn display_secret(&self) -> String {
        self.to_hex()
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(<sensitive>)")
    }
}

#[derive(Clone, Debug)]
pub struct Keys {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

impl Keys {
    pub fn new(secret_key: SecretKey) -> Result<Self> {
        let public_key = secret_key.public_key()?;
        Ok(Self {
            secret_key,
            public_key,
        })
    }

    /// Parse a secret key given as hex or bech32 `nsec1...`.
    pub fn parse(secret: &str) -> Result<Self> {
        let secret_key = if secret.starts_with("nsec1") {
            crate::nip19::decode_nsec(secret).map_err(|e| TypesError::InvalidKey(e.to_string()))?
        } else {
            SecretKey::from_hex(secret)?
        };
        Self::new(secret_key)
    }

    pub fn generate() -> Self {
        nostr_crypto::generate_keys()
    }

    pub fn secret_key(&self) -> &SecretKey {
        &self.secret_key
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }
}

// ============================================================================
// Event, Template & Rumor
// ============================================================================

/// The author-less input to signing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub kind: Kind,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    #[serde(default = "timestamp_now")]
    pub created_at: Timestamp,
}

impl Template {
    pub fn new(kind: Kind, content: impl Into<String>, tags: Vec<Vec<String>>) -> Self {
        Template {
            kind,
            content: content.into(),
            tags,
            created_at: timestamp_now(),
        }
    }

    pub fn with_created_at(mut self, created_at: Timestamp) -> Self {
        self.created_at = created_at;
        self
    }

    /// Attach an author and compute the id.
    pub fn into_unsigned(self, pubkey: PublicKey) -> UnsignedEvent {
        UnsignedEvent::new(pubkey, self.created_at, self.kind, self.tags, self.content)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// An event carrying an id but no signature (a rumor).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedEvent {
    pub id: EventId,
    pub pubkey: PublicKey,
    pub created_at: Timestamp,
    pub kind: Kind,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl UnsignedEvent {
    pub fn new(
        pubkey: PublicKey,
        created_at: Timestamp,
        kind: Kind,
        tags: Vec<Vec<String>>,
        content: String,
    ) -> Self {
        let id = nostr_crypto::compute_event_id(&pubkey, created_at, kind, &tags, &content);
        UnsignedEvent {
            id,
            pubkey,
            created_at,
            kind,
            tags,
            content,
        }
    }

    /// Recompute `id` over the canonical serialization.
    pub fn compute_id(&mut self) {
        self.id = nostr_crypto::compute_event_id(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        );
    }

    pub fn has_valid_id(&self) -> bool {
        self.id
            == nostr_crypto::compute_event_id(
                &self.pubkey,
                self.created_at,
                self.kind,
                &self.tags,
                &self.content,
            )
    }

    pub fn into_signed(self, sig: String) -> Event {
        Event {
            id: self.id,
            pubkey: self.pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig,
        }
    }

    pub fn to_template(&self) -> Template {
        Template {
            kind: self.kind,
            content: self.content.clone(),
            tags: self.tags.clone(),
            created_at: self.created_at,
        }
    }

    pub fn as_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Parse a rumor. A `sig` field, if present, is ignored.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub pubkey: PublicKey,
    pub created_at: Timestamp,
    pub kind: Kind,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

impl Event {
    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn tags(&self) -> &Vec<Vec<String>> {
        &self.tags
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// Values in position 1 of every tag named `name`.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |tag| tag.first().map(String::as_str) == Some(name))
            .filter_map(|tag| tag.get(1).map(String::as_str))
    }

    /// Check the id against the canonical serialization, then the signature.
    pub fn verify(&self) -> Result<()> {
        if self.sig.is_empty() {
            return Err(TypesError::MissingField("sig".to_string()));
        }
        let expected =
            nostr_crypto::compute_event_id(&self.pubkey, self.created_at, self.kind, &self.tags, &self.content);
        if expected != self.id {
            return Err(TypesError::InvalidFormat("ID mismatch".to_string()));
        }
        nostr_crypto::verify_signature(&self.pubkey, &self.id, &self.sig)
    }

    pub fn unsigned(&self) -> UnsignedEvent {
        UnsignedEvent {
            id: self.id,
            pubkey: self.pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags.clone(),
            content: self.content.clone(),
        }
    }

    pub fn as_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_key_hex_round_trip() {
        let keys = Keys::generate();
        let hex = keys.public_key().to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(PublicKey::from_hex(&hex).unwrap(), keys.public_key());
    }

    #[test]
    fn test_public_key_rejects_garbage() {
        assert!(PublicKey::from_hex("invalid_pubkey").is_err());
        assert!(PublicKey::from_hex("abcd").is_err());
    }

    #[test]
    fn test_secret_key_debug_is_redacted() {
        let keys = Keys::generate();
        let dbg = format!("{:?}", keys.secret_key());
        assert!(!dbg.contains(&keys.secret_key().to_hex()));
    }

    #[test]
    fn test_rumor_json_ignores_sig() {
        let keys = Keys::generate();
        let rumor = Template::new(KIND_DIRECT_MESSAGE, "hi", vec![]).into_unsigned(keys.public_key());
        let mut value: serde_json::Value = serde_json::from_str(&rumor.as_json()).unwrap();
        value["sig"] = serde_json::Value::String("00".repeat(64));

        let parsed = UnsignedEvent::from_json(&value.to_string()).unwrap();
        assert_eq!(parsed, rumor);
        assert!(parsed.has_valid_id());
    }

    #[test]
    fn test_tag_values() {
        let keys = Keys::generate();
        let event = Template::new(
            1,
            "",
            vec![
                vec!["p".to_string(), "a".to_string()],
                vec!["e".to_string(), "b".to_string()],
                vec!["p".to_string(), "c".to_string()],
                vec!["p".to_string()],
            ],
        )
        .into_unsigned(keys.public_key())
        .into_signed(String::new());

        let values: Vec<&str> = event.tag_values("p").collect();
        assert_eq!(values, vec!["a", "c"]);
    }

    #[test]
    fn test_template_from_json_defaults() {
        let template = Template::from_json(r#"{"kind":1,"content":"x"}"#).unwrap();
        assert!(template.tags.is_empty());
        assert!(template.created_at > 0);
    }
}
