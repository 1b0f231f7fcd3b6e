//! Collaborators consumed by the remote signer: the relay transport and the
//! NIP-05 style directory that maps `name@domain` to a pubkey.

use async_trait::async_trait;
use futures::channel::mpsc;
use serde::Deserialize;
use std::collections::HashMap;
use url::Url;

use nipsigner_core::{Event, Filter, PublicKey};

use crate::error::{SignerError, SignerResult};

#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Open a subscription on `relays`. Resolves only once the subscription is
    /// live, so nothing published afterwards can be missed.
    async fn subscribe(&self, relays: &[String], filter: Filter) -> SignerResult<mpsc::Receiver<Event>>;

    async fn publish(&self, relays: &[String], event: &Event) -> SignerResult<()>;
}

/// Result of resolving a human-readable identifier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub pubkey: PublicKey,
    pub relays: Vec<String>,
}

#[async_trait]
pub trait DirectoryResolver: Send + Sync {
    async fn resolve(&self, identifier: &str) -> SignerResult<DirectoryEntry>;
}

/// Split `name@domain` (a bare `domain` means `_@domain`).
pub fn split_identifier(identifier: &str) -> SignerResult<(String, String)> {
    let (name, domain) = match identifier.split_once('@') {
        Some((name, domain)) => (name, domain),
        None => ("_", identifier),
    };
    if name.is_empty() || domain.is_empty() || !domain.contains('.') {
        return Err(SignerError::InvalidConnectionToken(identifier.to_string()));
    }
    Ok((name.to_ascii_lowercase(), domain.to_ascii_lowercase()))
}

/// `https://<domain>/.well-known/nostr.json?name=<name>`
pub fn well_known_url(identifier: &str) -> SignerResult<Url> {
    let (name, domain) = split_identifier(identifier)?;
    let mut url = Url::parse(&format!("https://{}/.well-known/nostr.json", domain))
        .map_err(|e| SignerError::DirectoryLookup(format!("bad domain {}: {}", domain, e)))?;
    url.query_pairs_mut().append_pair("name", &name);
    Ok(url)
}

#[derive(Debug, Default, Deserialize)]
struct Nip05Document {
    #[serde(default)]
    names: HashMap<String, String>,
    #[serde(default)]
    relays: HashMap<String, Vec<String>>,
    #[serde(default)]
    nip46: HashMap<String, Vec<String>>,
}

/// Read a `nostr.json` document for `identifier`. NIP-46 specific relays
/// win over the general relay list when both are present.
pub fn parse_nip05_document(identifier: &str, body: &str) -> SignerResult<DirectoryEntry> {
    let (name, _) = split_identifier(identifier)?;
    let doc: Nip05Document =
        serde_json::from_str(body).map_err(|e| SignerError::DirectoryLookup(format!("bad nostr.json: {}", e)))?;

    let hex = doc
        .names
        .get(&name)
        .ok_or_else(|| SignerError::DirectoryLookup(format!("{} not found", identifier)))?;
    let pubkey = PublicKey::from_hex(hex)?;

    let relays = doc
        .nip46
        .get(hex)
        .filter(|relays| !relays.is_empty())
        .or_else(|| doc.relays.get(hex))
        .cloned()
        .unwrap_or_default();

    Ok(DirectoryEntry { pubkey, relays })
}
