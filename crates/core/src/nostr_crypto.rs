//! Canonical event hashing, BIP-340 signing and verification, ECDH.

use k256::schnorr::{Signature, SigningKey, VerifyingKey};
use k256::{ecdh, PublicKey as K256PublicKey, SecretKey as K256SecretKey};
use sha2::{Digest, Sha256};
use signature::hazmat::{PrehashSigner, PrehashVerifier};

use crate::types::{EventId, Keys, PublicKey, SecretKey, TypesError};

type Result<T> = std::result::Result<T, TypesError>;

/// SHA-256 over `[0, pubkey_hex, created_at, kind, tags, content]` in compact JSON.
pub fn compute_event_id(
    pubkey: &PublicKey,
    created_at: u64,
    kind: u16,
    tags: &[Vec<String>],
    content: &str,
) -> EventId {
    let serialized = serde_json::json!([0, pubkey.to_hex(), created_at, kind, tags, content]).to_string();
    let digest = Sha256::digest(serialized.as_bytes());
    EventId(digest.into())
}

/// Sign an event id, returning the 64-byte signature as hex.
pub fn sign_id(secret_key: &SecretKey, id: &EventId) -> Result<String> {
    let signing_key = SigningKey::from_bytes(&secret_key.0)
        .map_err(|_| TypesError::InvalidKey("Invalid secret key".to_string()))?;
    let signature: Signature = signing_key
        .sign_prehash(&id.to_bytes())
        .map_err(|e| TypesError::Other(format!("Signing failed: {}", e)))?;
    Ok(hex::encode(signature.to_bytes()))
}

pub fn verify_signature(pubkey: &PublicKey, id: &EventId, sig_hex: &str) -> Result<()> {
    let verifying_key = VerifyingKey::from_bytes(&pubkey.0)
        .map_err(|_| TypesError::InvalidKey("Invalid public key".to_string()))?;
    let signature_bytes =
        hex::decode(sig_hex).map_err(|_| TypesError::InvalidFormat("Invalid signature hex".to_string()))?;
    let signature = Signature::try_from(signature_bytes.as_slice())
        .map_err(|_| TypesError::InvalidFormat("Invalid signature format".to_string()))?;

    verifying_key
        .verify_prehash(&id.to_bytes(), &signature)
        .map_err(|_| TypesError::InvalidFormat("Signature verification failed".to_string()))
}

/// Fresh keypair from OS randomness.
pub fn generate_keys() -> Keys {
    loop {
        let mut bytes = [0u8; 32];
        if getrandom::getrandom(&mut bytes).is_err() {
            continue;
        }
        // A uniformly random scalar is out of range with negligible probability.
        if let Ok(signing_key) = SigningKey::from_bytes(&bytes) {
            let public_key = PublicKey(signing_key.verifying_key().to_bytes().into());
            return Keys {
                secret_key: SecretKey(bytes),
                public_key,
            };
        }
    }
}

/// x-coordinate of `secret * pubkey`.
///
/// Nostr keys are x-only, so the point is lifted with an even Y first. The
/// x-coordinate of the product does not depend on the parity chosen.
pub fn shared_x(secret_key: &SecretKey, pubkey: &PublicKey) -> Result<[u8; 32]> {
    let secret = K256SecretKey::from_slice(&secret_key.0)
        .map_err(|_| TypesError::InvalidKey("Invalid secret key".to_string()))?;

    let point = lift_x(pubkey)?;
    let shared = ecdh::diffie_hellman(secret.to_nonzero_scalar(), point.as_affine());
    let mut out = [0u8; 32];
    out.copy_from_slice(shared.raw_secret_bytes().as_slice());
    Ok(out)
}

fn lift_x(pubkey: &PublicKey) -> Result<K256PublicKey> {
    for prefix in [0x02u8, 0x03] {
        let mut sec1 = [0u8; 33];
        sec1[0] = prefix;
        sec1[1..].copy_from_slice(&pubkey.0);
        if let Ok(point) = K256PublicKey::from_sec1_bytes(&sec1) {
            return Ok(point);
        }
    }
    Err(TypesError::InvalidKey("Public key is not on the curve".to_string()))
}
