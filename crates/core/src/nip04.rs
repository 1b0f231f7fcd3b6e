//! NIP-04 legacy direct-message encryption.
//!
//! The key is the raw ECDH x-coordinate (no hashing), the cipher is
//! AES-256-CBC with PKCS#7 padding and the payload is `base64(ct)?iv=base64(iv)`.

use aes::Aes256;
use base64::engine::{general_purpose::STANDARD as BASE64, Engine};
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use getrandom::getrandom;

use crate::nostr_crypto::shared_x;
use crate::types::{PublicKey, SecretKey};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

const IV_SEPARATOR: &str = "?iv=";

#[derive(Debug, thiserror::Error)]
pub enum Nip04Error {
    #[error("Invalid content format")]
    InvalidContentFormat,

    #[error("Base64 decode error")]
    Base64Decode,

    #[error("Invalid IV length")]
    InvalidIv,

    #[error("UTF-8 decode error")]
    Utf8Decode,

    #[error("Wrong block mode or padding")]
    WrongBlockMode,

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Random generation failed")]
    RandomGenerationFailed,
}

/// Heuristic used by callers that must guess the scheme of a payload.
pub fn looks_like_nip04(content: &str) -> bool {
    content.contains(IV_SEPARATOR)
}

fn shared_key(secret_key: &SecretKey, public_key: &PublicKey) -> Result<[u8; 32], Nip04Error> {
    shared_x(secret_key, public_key).map_err(|e| Nip04Error::InvalidKey(e.to_string()))
}

pub fn encrypt(secret_key: &SecretKey, public_key: &PublicKey, content: &str) -> Result<String, Nip04Error> {
    let mut iv = [0u8; 16];
    getrandom(&mut iv).map_err(|_| Nip04Error::RandomGenerationFailed)?;
    encrypt_with_iv(secret_key, public_key, content, iv)
}

pub fn encrypt_with_iv(
    secret_key: &SecretKey,
    public_key: &PublicKey,
    content: &str,
    iv: [u8; 16],
) -> Result<String, Nip04Error> {
    let key = shared_key(secret_key, public_key)?;
    let ciphertext = Aes256CbcEnc::new(&key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(content.as_bytes());

    Ok(format!("{}{}{}", BASE64.encode(ciphertext), IV_SEPARATOR, BASE64.encode(iv)))
}

pub fn decrypt(secret_key: &SecretKey, public_key: &PublicKey, encrypted_content: &str) -> Result<String, Nip04Error> {
    let bytes = decrypt_to_bytes(secret_key, public_key, encrypted_content)?;
    String::from_utf8(bytes).map_err(|_| Nip04Error::Utf8Decode)
}

pub fn decrypt_to_bytes(
    secret_key: &SecretKey,
    public_key: &PublicKey,
    encrypted_content: &str,
) -> Result<Vec<u8>, Nip04Error> {
    let (ciphertext_b64, iv_b64) = encrypted_content
        .split_once(IV_SEPARATOR)
        .ok_or(Nip04Error::InvalidContentFormat)?;

    let ciphertext = BASE64.decode(ciphertext_b64).map_err(|_| Nip04Error::Base64Decode)?;
    let iv: [u8; 16] = BASE64
        .decode(iv_b64)
        .map_err(|_| Nip04Error::Base64Decode)?
        .try_into()
        .map_err(|_| Nip04Error::InvalidIv)?;

    let key = shared_key(secret_key, public_key)?;
    Aes256CbcDec::new(&key.into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| Nip04Error::WrongBlockMode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Keys;

    #[test]
    fn test_encrypt_decrypt_between_two_keys() {
        let alice = Keys::generate();
        let bob = Keys::generate();

        let ciphertext = encrypt(alice.secret_key(), &bob.public_key(), "Saturn, bringer of old age").unwrap();
        assert!(looks_like_nip04(&ciphertext));

        let plaintext = decrypt(bob.secret_key(), &alice.public_key(), &ciphertext).unwrap();
        assert_eq!(plaintext, "Saturn, bringer of old age");
    }

    #[test]
    fn test_fixed_iv_is_deterministic() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let iv = [7u8; 16];

        let a = encrypt_with_iv(alice.secret_key(), &bob.public_key(), "x", iv).unwrap();
        let b = encrypt_with_iv(bob.secret_key(), &alice.public_key(), "x", iv).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_wrong_key_fails() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let eve = Keys::generate();

        let ciphertext = encrypt(alice.secret_key(), &bob.public_key(), "secret message here").unwrap();
        match decrypt(eve.secret_key(), &alice.public_key(), &ciphertext) {
            Ok(plaintext) => assert_ne!(plaintext, "secret message here"),
            Err(_) => {}
        }
    }

    #[test]
    fn test_rejects_malformed_payloads() {
        let alice = Keys::generate();
        let bob = Keys::generate();

        assert!(matches!(
            decrypt(alice.secret_key(), &bob.public_key(), "no separator"),
            Err(Nip04Error::InvalidContentFormat)
        ));
        assert!(matches!(
            decrypt(alice.secret_key(), &bob.public_key(), "!!!?iv=AAAA"),
            Err(Nip04Error::Base64Decode)
        ));
        assert!(matches!(
            decrypt(alice.secret_key(), &bob.public_key(), "AAAA?iv=AAAA"),
            Err(Nip04Error::InvalidIv)
        ));
    }
}
