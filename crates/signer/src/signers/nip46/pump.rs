use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::channel::mpsc;
use futures::StreamExt;
use tracing::{debug, info, warn};

use nipsigner_core::{Event, PublicKey};

use super::rpc::{AuthUrlSubscribers, PendingRequests, Response};
use super::transport::RpcTransport;

/// Drains the response subscription and hands each response to its caller.
pub struct Pump {
    transport: Arc<RpcTransport>,
    remote_pubkey: PublicKey,
    pending: Arc<PendingRequests>,
    auth_urls: Arc<AuthUrlSubscribers>,
    listening: Arc<AtomicBool>,
}

impl Pump {
    pub fn spawn(
        events: mpsc::Receiver<Event>,
        transport: Arc<RpcTransport>,
        remote_pubkey: PublicKey,
        pending: Arc<PendingRequests>,
        auth_urls: Arc<AuthUrlSubscribers>,
        listening: Arc<AtomicBool>,
    ) {
        let pump = Pump {
            transport,
            remote_pubkey,
            pending,
            auth_urls,
            listening,
        };
        tokio::spawn(pump.run(events));
        info!("[nip46] response pump started");
    }

    async fn run(self, mut events: mpsc::Receiver<Event>) {
        while let Some(event) = events.next().await {
            self.handle_event(event).await;
        }
        // Unset first so a request registered after the drain sees it.
        self.listening.store(false, Ordering::SeqCst);
        let abandoned = self.pending.close_all().await;
        info!(
            "[nip46] subscription closed, exiting pump loop ({} pending request(s) failed)",
            abandoned
        );
    }

    async fn handle_event(&self, event: Event) {
        if !self.transport.accepts_kind(event.kind) {
            debug!("[nip46] Ignoring event kind: {}", event.kind);
            return;
        }

        let local = self.transport.local_pubkey().to_hex();
        if !event.tag_values("p").any(|p| p == local) {
            debug!("[nip46] Event not addressed to us (p-tag mismatch)");
            return;
        }

        if event.pubkey != self.remote_pubkey {
            debug!("[nip46] Ignoring event from unexpected author {}", event.pubkey);
            return;
        }

        if let Err(e) = event.verify() {
            warn!("[nip46] Dropping response with bad signature: {}", e);
            return;
        }

        let plaintext = match self.transport.decrypt_from(&event.pubkey, &event.content) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                warn!("[nip46] Decryption failed: {}", e);
                return;
            }
        };

        let response = match Response::from_json(&plaintext) {
            Ok(response) => response,
            Err(e) => {
                warn!("[nip46] Failed to parse RPC response: {}", e);
                return;
            }
        };

        if let Some(url) = response.auth_url() {
            let delivered = self.auth_urls.broadcast(url).await;
            info!(
                "[nip46] auth_url for request {} delivered to {} subscriber(s)",
                response.id, delivered
            );
            return;
        }

        let id = response.id.clone();
        if self.pending.resolve(response).await {
            debug!("[nip46] RPC response processed: id={}", id);
        } else {
            debug!("[nip46] response for unknown request id={}", id);
        }
    }
}
