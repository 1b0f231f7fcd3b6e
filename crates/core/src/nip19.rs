//! NIP-19 bech32 encoding for bare keys (`npub`, `nsec`).

use bech32::{FromBase32, ToBase32, Variant};

use crate::types::{PublicKey, SecretKey};

pub const HRP_PUBLIC_KEY: &str = "npub";
pub const HRP_SECRET_KEY: &str = "nsec";

#[derive(Debug, thiserror::Error)]
pub enum Nip19Error {
    #[error("Bech32 error: {0}")]
    Bech32(#[from] bech32::Error),

    #[error("Unexpected prefix: expected {expected}, found {found}")]
    WrongPrefix { expected: &'static str, found: String },

    #[error("Expected 32 bytes of data, found {0}")]
    WrongLength(usize),

    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

fn decode_32(s: &str, expected: &'static str) -> Result<[u8; 32], Nip19Error> {
    let (hrp, data, _variant) = bech32::decode(s)?;
    if hrp != expected {
        return Err(Nip19Error::WrongPrefix { expected, found: hrp });
    }
    let bytes = Vec::<u8>::from_base32(&data)?;
    let len = bytes.len();
    bytes.try_into().map_err(|_| Nip19Error::WrongLength(len))
}

fn encode_32(hrp: &str, bytes: &[u8; 32]) -> String {
    // Only fails on an invalid hrp, and both prefixes are constants.
    bech32::encode(hrp, bytes.to_base32(), Variant::Bech32).unwrap_or_default()
}

pub fn decode_npub(s: &str) -> Result<PublicKey, Nip19Error> {
    PublicKey::from_bytes(decode_32(s, HRP_PUBLIC_KEY)?).map_err(|e| Nip19Error::InvalidKey(e.to_string()))
}

pub fn encode_npub(pubkey: &PublicKey) -> String {
    encode_32(HRP_PUBLIC_KEY, &pubkey.0)
}

pub fn decode_nsec(s: &str) -> Result<SecretKey, Nip19Error> {
    SecretKey::from_bytes(decode_32(s, HRP_SECRET_KEY)?).map_err(|e| Nip19Error::InvalidKey(e.to_string()))
}

pub fn encode_nsec(secret_key: &SecretKey) -> String {
    encode_32(HRP_SECRET_KEY, &secret_key.0)
}
