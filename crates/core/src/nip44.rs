//! NIP-44 v2 versioned payload encryption.
//!
//! <https://github.com/nostr-protocol/nips/blob/master/44.md>

use std::fmt;
use std::ops::Range;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use getrandom::getrandom;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::nostr_crypto::shared_x;
use crate::types::{PublicKey, SecretKey};

pub const VERSION: u8 = 2;

const SALT: &[u8] = b"nip44-v2";
const MESSAGE_KEYS_SIZE: usize = 76;
const CHACHA_KEY_RANGE: Range<usize> = 0..32;
const CHACHA_NONCE_RANGE: Range<usize> = 32..44;
const HMAC_KEY_RANGE: Range<usize> = 44..MESSAGE_KEYS_SIZE;

const MIN_PLAINTEXT_SIZE: usize = 1;
const MAX_PLAINTEXT_SIZE: usize = 65535;

// version(1) + nonce(32) + padded(2 + 32 .. 2 + 65536) + mac(32)
const MIN_PAYLOAD_SIZE: usize = 99;
const MAX_PAYLOAD_SIZE: usize = 65603;
const MIN_BASE64_SIZE: usize = 132;
const MAX_BASE64_SIZE: usize = 87472;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum Nip44Error {
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("HKDF output length")]
    HkdfLength,

    #[error("Message empty")]
    MessageEmpty,

    #[error("Message too long")]
    MessageTooLong,

    #[error("Invalid HMAC")]
    InvalidHmac,

    #[error("Invalid padding")]
    InvalidPadding,

    #[error("Invalid payload")]
    InvalidPayload,

    #[error("Unknown version: {0}")]
    UnknownVersion(u8),

    #[error("Decoding error: {0}")]
    Decoding(String),

    #[error("UTF-8 decode error")]
    Utf8Decode,

    #[error("Random generation failed")]
    RandomGenerationFailed,
}

/// Long-lived symmetric key for a pair of parties.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConversationKey([u8; 32]);

impl fmt::Debug for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ConversationKey(<sensitive>)")
    }
}

impl ConversationKey {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// HKDF-extract(salt = "nip44-v2", ikm = shared x-coordinate).
    pub fn derive(secret_key: &SecretKey, public_key: &PublicKey) -> Result<Self, Nip44Error> {
        let shared = shared_x(secret_key, public_key).map_err(|e| Nip44Error::InvalidKey(e.to_string()))?;
        let (prk, _) = Hkdf::<Sha256>::extract(Some(SALT), &shared);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&prk);
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

struct MessageKeys {
    chacha_key: [u8; 32],
    chacha_nonce: [u8; 12],
    hmac_key: [u8; 32],
}

impl MessageKeys {
    fn derive(conversation_key: &ConversationKey, nonce: &[u8; 32]) -> Result<Self, Nip44Error> {
        let hk = Hkdf::<Sha256>::from_prk(conversation_key.as_bytes()).map_err(|_| Nip44Error::HkdfLength)?;
        let mut okm = [0u8; MESSAGE_KEYS_SIZE];
        hk.expand(nonce, &mut okm).map_err(|_| Nip44Error::HkdfLength)?;

        let mut keys = MessageKeys {
            chacha_key: [0u8; 32],
            chacha_nonce: [0u8; 12],
            hmac_key: [0u8; 32],
        };
        keys.chacha_key.copy_from_slice(&okm[CHACHA_KEY_RANGE]);
        keys.chacha_nonce.copy_from_slice(&okm[CHACHA_NONCE_RANGE]);
        keys.hmac_key.copy_from_slice(&okm[HMAC_KEY_RANGE]);
        Ok(keys)
    }

    fn apply_keystream(&self, buf: &mut [u8]) {
        let mut cipher = ChaCha20::new(&self.chacha_key.into(), &self.chacha_nonce.into());
        cipher.apply_keystream(buf);
    }

    fn mac(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<HmacSha256, Nip44Error> {
        let mut mac = HmacSha256::new_from_slice(&self.hmac_key).map_err(|_| Nip44Error::InvalidHmac)?;
        mac.update(nonce);
        mac.update(ciphertext);
        Ok(mac)
    }
}

fn calc_padded_len(unpadded_len: usize) -> usize {
    if unpadded_len <= 32 {
        return 32;
    }
    let next_power = 1usize << ((unpadded_len - 1).ilog2() + 1);
    let chunk = if next_power <= 256 { 32 } else { next_power / 8 };
    chunk * ((unpadded_len - 1) / chunk + 1)
}

fn pad(plaintext: &[u8]) -> Result<Vec<u8>, Nip44Error> {
    let len = plaintext.len();
    if len < MIN_PLAINTEXT_SIZE {
        return Err(Nip44Error::MessageEmpty);
    }
    if len > MAX_PLAINTEXT_SIZE {
        return Err(Nip44Error::MessageTooLong);
    }

    let mut padded = Vec::with_capacity(2 + calc_padded_len(len));
    padded.extend_from_slice(&(len as u16).to_be_bytes());
    padded.extend_from_slice(plaintext);
    padded.resize(2 + calc_padded_len(len), 0);
    Ok(padded)
}

fn unpad(padded: &[u8]) -> Result<Vec<u8>, Nip44Error> {
    if padded.len() < 2 {
        return Err(Nip44Error::InvalidPadding);
    }
    let len = u16::from_be_bytes([padded[0], padded[1]]) as usize;
    if len == 0 {
        return Err(Nip44Error::MessageEmpty);
    }
    if padded.len() != 2 + calc_padded_len(len) {
        return Err(Nip44Error::InvalidPadding);
    }
    Ok(padded[2..2 + len].to_vec())
}

/// Encrypt with a caller-supplied nonce. Returns the raw (not base64) payload.
pub fn encrypt_to_bytes_with_nonce(
    conversation_key: &ConversationKey,
    plaintext: &[u8],
    nonce: &[u8; 32],
) -> Result<Vec<u8>, Nip44Error> {
    let keys = MessageKeys::derive(conversation_key, nonce)?;

    let mut ciphertext = pad(plaintext)?;
    keys.apply_keystream(&mut ciphertext);
    let mac = keys.mac(nonce, &ciphertext)?.finalize().into_bytes();

    let mut payload = Vec::with_capacity(1 + 32 + ciphertext.len() + 32);
    payload.push(VERSION);
    payload.extend_from_slice(nonce);
    payload.extend_from_slice(&ciphertext);
    payload.extend_from_slice(&mac);
    Ok(payload)
}

pub fn encrypt_to_bytes(conversation_key: &ConversationKey, plaintext: &[u8]) -> Result<Vec<u8>, Nip44Error> {
    let mut nonce = [0u8; 32];
    getrandom(&mut nonce).map_err(|_| Nip44Error::RandomGenerationFailed)?;
    encrypt_to_bytes_with_nonce(conversation_key, plaintext, &nonce)
}

/// Decrypt a raw (already base64-decoded) payload.
pub fn decrypt_to_bytes(conversation_key: &ConversationKey, payload: &[u8]) -> Result<Vec<u8>, Nip44Error> {
    let len = payload.len();
    if !(MIN_PAYLOAD_SIZE..=MAX_PAYLOAD_SIZE).contains(&len) {
        return Err(Nip44Error::InvalidPayload);
    }
    if payload[0] != VERSION {
        return Err(Nip44Error::UnknownVersion(payload[0]));
    }

    let nonce: [u8; 32] = payload[1..33].try_into().map_err(|_| Nip44Error::InvalidPayload)?;
    let ciphertext = &payload[33..len - 32];
    let mac = &payload[len - 32..];

    let keys = MessageKeys::derive(conversation_key, &nonce)?;
    keys.mac(&nonce, ciphertext)?
        .verify_slice(mac)
        .map_err(|_| Nip44Error::InvalidHmac)?;

    let mut padded = ciphertext.to_vec();
    keys.apply_keystream(&mut padded);
    unpad(&padded)
}

pub fn encrypt(plaintext: &str, conversation_key: &ConversationKey) -> Result<String, Nip44Error> {
    Ok(BASE64.encode(encrypt_to_bytes(conversation_key, plaintext.as_bytes())?))
}

pub fn decrypt(payload: &str, conversation_key: &ConversationKey) -> Result<String, Nip44Error> {
    // '#' marks a non-base64 future version
    if payload.starts_with('#') {
        return Err(Nip44Error::UnknownVersion(0));
    }
    if !(MIN_BASE64_SIZE..=MAX_BASE64_SIZE).contains(&payload.len()) {
        return Err(Nip44Error::InvalidPayload);
    }

    let data = BASE64.decode(payload).map_err(|e| Nip44Error::Decoding(e.to_string()))?;
    String::from_utf8(decrypt_to_bytes(conversation_key, &data)?).map_err(|_| Nip44Error::Utf8Decode)
}

/// Derive the conversation key and encrypt in one step.
pub fn encrypt_between(secret_key: &SecretKey, public_key: &PublicKey, plaintext: &str) -> Result<String, Nip44Error> {
    encrypt(plaintext, &ConversationKey::derive(secret_key, public_key)?)
}

pub fn decrypt_between(secret_key: &SecretKey, public_key: &PublicKey, payload: &str) -> Result<String, Nip44Error> {
    decrypt(payload, &ConversationKey::derive(secret_key, public_key)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Keys;

    #[test]
    fn test_calc_padded_len() {
        assert_eq!(calc_padded_len(1), 32);
        assert_eq!(calc_padded_len(32), 32);
        assert_eq!(calc_padded_len(33), 64);
        assert_eq!(calc_padded_len(65), 96);
        assert_eq!(calc_padded_len(256), 256);
        assert_eq!(calc_padded_len(257), 320);
        assert_eq!(calc_padded_len(1000), 1024);
        assert_eq!(calc_padded_len(65535), 65536);
    }

    #[test]
    fn test_pad_unpad() {
        let padded = pad(b"hello").unwrap();
        assert_eq!(padded.len(), 34);
        assert_eq!(padded[0..2], [0x00, 0x05]);
        assert_eq!(unpad(&padded).unwrap(), b"hello");

        assert_eq!(pad(b""), Err(Nip44Error::MessageEmpty));
    }

    #[test]
    fn test_conversation_key_vector() {
        // sec1 = 1, sec2 = 2 from the NIP-44 test vectors
        let sec1 = SecretKey::from_hex("0000000000000000000000000000000000000000000000000000000000000001").unwrap();
        let sec2 = SecretKey::from_hex("0000000000000000000000000000000000000000000000000000000000000002").unwrap();
        let pub2 = sec2.public_key().unwrap();

        let key = ConversationKey::derive(&sec1, &pub2).unwrap();
        assert_eq!(
            hex::encode(key.as_bytes()),
            "c41c775356fd92eadc63ff5a0dc1da211b268cbea22316767095b2871ea1412d"
        );
    }

    #[test]
    fn test_encrypt_vector() {
        let sec1 = SecretKey::from_hex("0000000000000000000000000000000000000000000000000000000000000001").unwrap();
        let sec2 = SecretKey::from_hex("0000000000000000000000000000000000000000000000000000000000000002").unwrap();
        let key = ConversationKey::derive(&sec1, &sec2.public_key().unwrap()).unwrap();

        let mut nonce = [0u8; 32];
        nonce[31] = 1;
        let payload = encrypt_to_bytes_with_nonce(&key, b"a", &nonce).unwrap();
        assert_eq!(
            BASE64.encode(payload),
            "AgAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAABee0G5VSK0/9YypIObAtDKfYEAjD35uVkHyB0F4DwrcNaCXlCWZKaArsGrY6M9wnuTMxWfp1RTN9Xga8no+kF5Vsb"
        );
    }

    #[test]
    fn test_round_trip_between_keys() {
        let alice = Keys::generate();
        let bob = Keys::generate();

        let payload = encrypt_between(alice.secret_key(), &bob.public_key(), "hello from alice").unwrap();
        let plaintext = decrypt_between(bob.secret_key(), &alice.public_key(), &payload).unwrap();
        assert_eq!(plaintext, "hello from alice");
    }

    #[test]
    fn test_random_lengths_round_trip() {
        use rand::rngs::SmallRng;
        use rand::{Rng, SeedableRng};

        let mut rng = SmallRng::seed_from_u64(44);
        let alice = Keys::generate();
        let bob = Keys::generate();
        let key = ConversationKey::derive(alice.secret_key(), &bob.public_key()).unwrap();

        for _ in 0..32 {
            let len = rng.gen_range(1..=MAX_PLAINTEXT_SIZE);
            let message: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            let payload = encrypt_to_bytes(&key, &message).unwrap();
            assert_eq!(payload.len(), 1 + 32 + 2 + calc_padded_len(len) + 32);
            assert_eq!(decrypt_to_bytes(&key, &payload).unwrap(), message);
        }

        assert_eq!(
            encrypt_to_bytes(&key, &vec![0u8; MAX_PLAINTEXT_SIZE + 1]),
            Err(Nip44Error::MessageTooLong)
        );
    }

    #[test]
    fn test_tampered_payload_fails_hmac() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let key = ConversationKey::derive(alice.secret_key(), &bob.public_key()).unwrap();

        let mut payload = encrypt_to_bytes(&key, b"integrity").unwrap();
        payload[40] ^= 0x01;
        assert_eq!(decrypt_to_bytes(&key, &payload), Err(Nip44Error::InvalidHmac));
    }

    #[test]
    fn test_rejects_future_version_marker() {
        let alice = Keys::generate();
        let key = ConversationKey::derive(alice.secret_key(), &alice.public_key()).unwrap();
        assert_eq!(decrypt("#future", &key), Err(Nip44Error::UnknownVersion(0)));
    }
}
