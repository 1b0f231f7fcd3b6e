//! Core building blocks shared by every nipsigner backend:
//!
//! - `types`        : envelope model (events, rumors, templates, filters) and key types
//! - `nostr_crypto` : canonical id hashing, BIP-340 signing/verification, ECDH
//! - `nip04`        : legacy AES-256-CBC direct-message encryption
//! - `nip44`        : versioned (v2) payload encryption
//! - `nip19`        : bech32 `npub` / `nsec` encoding
//! - `telemetry`    : tracing subscriber bootstrap

pub mod nip04;
pub mod nip19;
pub mod nip44;
pub mod nostr_crypto;
pub mod telemetry;
pub mod types;

pub use telemetry::{init, init_tracing, init_with_component};
pub use types::*;
