use std::sync::Arc;

use futures::channel::mpsc;
use tracing::{debug, error};

use nipsigner_core::{nip04, timestamp_now, Event, Filter, Keys, Kind, PublicKey, Template};

use super::rpc::Request;
use crate::error::{SignerError, SignerResult};
use crate::relay::RelayTransport;
use crate::signers::{EncryptionScheme, PrivateKeySigner};

/// Encrypted, signed RPC envelopes between the local throwaway key and the
/// remote agent.
pub struct RpcTransport {
    relay: Arc<dyn RelayTransport>,
    local_keys: Keys,
    scheme: EncryptionScheme,
    app_name: Option<String>,
    rpc_kind: Kind,
}

impl RpcTransport {
    pub fn new(
        relay: Arc<dyn RelayTransport>,
        local_keys: Keys,
        scheme: EncryptionScheme,
        app_name: Option<String>,
        rpc_kind: Kind,
    ) -> Self {
        Self {
            relay,
            local_keys,
            scheme,
            app_name,
            rpc_kind,
        }
    }

    pub fn local_pubkey(&self) -> PublicKey {
        self.local_keys.public_key()
    }

    pub fn rpc_kind(&self) -> Kind {
        self.rpc_kind
    }

    /// Responses addressed to us, on the RPC kind and the one after it.
    pub fn response_filter(&self) -> Filter {
        Filter::new()
            .kinds([self.rpc_kind, self.rpc_kind.saturating_add(1)])
            .pubkey_tag(&self.local_pubkey())
            .since(timestamp_now().saturating_sub(10))
    }

    pub fn accepts_kind(&self, kind: Kind) -> bool {
        kind == self.rpc_kind || kind == self.rpc_kind.saturating_add(1)
    }

    pub fn encrypt_for(&self, remote: &PublicKey, plaintext: &str) -> SignerResult<String> {
        PrivateKeySigner::encrypt_with_keys(&self.local_keys, remote, plaintext, self.scheme)
    }

    /// Agents answer in whichever scheme they like; guess from the payload
    /// and fall back to the other one.
    pub fn decrypt_from(&self, sender: &PublicKey, ciphertext: &str) -> SignerResult<String> {
        let order = if nip04::looks_like_nip04(ciphertext) {
            [EncryptionScheme::Nip04, EncryptionScheme::Nip44]
        } else {
            [EncryptionScheme::Nip44, EncryptionScheme::Nip04]
        };

        let mut last_error = SignerError::DecryptionFailed;
        for scheme in order {
            match PrivateKeySigner::decrypt_with_keys(&self.local_keys, sender, ciphertext, scheme) {
                Ok(plaintext) => return Ok(plaintext),
                Err(e) => {
                    debug!("[nip46] {} decrypt failed: {}", scheme, e);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    pub fn build_request_event(&self, remote: &PublicKey, request: &Request) -> SignerResult<Event> {
        let payload = serde_json::to_string(request)?;
        let content = self.encrypt_for(remote, &payload)?;

        let mut tags = vec![vec!["p".to_string(), remote.to_hex()]];
        if let Some(app) = &self.app_name {
            tags.push(vec!["client".to_string(), app.clone()]);
        }

        PrivateKeySigner::sign_with_keys(&self.local_keys, Template::new(self.rpc_kind, content, tags))
    }

    pub async fn subscribe(&self, relays: &[String]) -> SignerResult<mpsc::Receiver<Event>> {
        self.relay.subscribe(relays, self.response_filter()).await
    }

    pub async fn publish(&self, relays: &[String], event: &Event) -> SignerResult<()> {
        self.relay.publish(relays, event).await.map_err(|e| {
            error!("[nip46] Failed to publish request {}: {}", event.id, e);
            e
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NullRelay;

    #[async_trait]
    impl RelayTransport for NullRelay {
        async fn subscribe(&self, _relays: &[String], _filter: Filter) -> SignerResult<mpsc::Receiver<Event>> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }

        async fn publish(&self, _relays: &[String], _event: &Event) -> SignerResult<()> {
            Ok(())
        }
    }

    fn transport(scheme: EncryptionScheme) -> RpcTransport {
        RpcTransport::new(Arc::new(NullRelay), Keys::generate(), scheme, Some("tests".to_string()), 24133)
    }

    #[test]
    fn test_request_event_shape() {
        let transport = transport(EncryptionScheme::Nip44);
        let remote = Keys::generate();
        let request = Request {
            id: "1-1".to_string(),
            method: "ping".to_string(),
            params: vec![],
        };

        let event = transport.build_request_event(&remote.public_key(), &request).unwrap();
        assert_eq!(event.kind, 24133);
        assert_eq!(event.pubkey, transport.local_pubkey());
        assert_eq!(event.tag_values("p").collect::<Vec<_>>(), vec![remote.public_key().to_hex()]);
        assert_eq!(event.tag_values("client").collect::<Vec<_>>(), vec!["tests"]);
        assert!(event.verify().is_ok());

        // The remote side can read it back.
        let plaintext = PrivateKeySigner::decrypt_with_keys(
            &remote,
            &transport.local_pubkey(),
            &event.content,
            EncryptionScheme::Nip44,
        )
        .unwrap();
        let parsed: Request = serde_json::from_str(&plaintext).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn test_decrypt_from_accepts_either_scheme() {
        let transport = transport(EncryptionScheme::Nip44);
        let remote = Keys::generate();

        for scheme in [EncryptionScheme::Nip04, EncryptionScheme::Nip44] {
            let ciphertext =
                PrivateKeySigner::encrypt_with_keys(&remote, &transport.local_pubkey(), "{\"id\":\"x\"}", scheme).unwrap();
            assert_eq!(transport.decrypt_from(&remote.public_key(), &ciphertext).unwrap(), "{\"id\":\"x\"}");
        }
    }

    #[test]
    fn test_response_filter() {
        let transport = transport(EncryptionScheme::Nip04);
        let filter = transport.response_filter();
        assert_eq!(filter.kinds, vec![24133, 24134]);
        assert_eq!(filter.p_tags, vec![transport.local_pubkey().to_hex()]);
        assert!(transport.accepts_kind(24134));
        assert!(!transport.accepts_kind(1));
    }
}
