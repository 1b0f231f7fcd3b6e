use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_lock::{Mutex, OnceCell};
use async_trait::async_trait;
use futures::channel::mpsc;
use tracing::{debug, info, warn};

use nipsigner_core::{Event, Keys, PublicKey, Template};

pub mod pump;
pub mod rpc;
pub mod state;
pub mod token;
pub mod transport;

use pump::Pump;
use rpc::{AuthUrlSubscribers, PendingRequests, Request};
pub use state::{ConnectionState, RemoteSignerState, ResolutionState};
pub use token::{bunker_url, ConnectionToken};
use transport::RpcTransport;

use super::{EncryptionScheme, SchemeSet, Signer, User};
use crate::config::RemoteSignerConfig;
use crate::error::{SignerError, SignerResult};
use crate::relay::{DirectoryResolver, RelayTransport};

/// Remote agent address once the token is resolved.
#[derive(Clone, Debug)]
struct Target {
    pubkey: PublicKey,
    relays: Vec<String>,
}

/// NIP-46 client: signs and encrypts by asking a remote agent over relays.
///
/// Requests are sent from a throwaway local key. Every call gets its own id
/// and completes when the matching response arrives, in any order.
pub struct Nip46Signer {
    config: RemoteSignerConfig,
    token: ConnectionToken,
    directory: Option<Arc<dyn DirectoryResolver>>,
    transport: Arc<RpcTransport>,

    target: OnceCell<Target>,
    listening: Arc<AtomicBool>,
    subscribe_lock: Mutex<()>,
    resolution: Mutex<ResolutionState>,
    connection: Mutex<ConnectionState>,
    handshake: Mutex<()>,
    user: OnceCell<User>,

    pending: Arc<PendingRequests>,
    auth_urls: Arc<AuthUrlSubscribers>,
    id_counter: AtomicU64,
}

impl Nip46Signer {
    pub fn new(
        token: &str,
        relay: Arc<dyn RelayTransport>,
        directory: Option<Arc<dyn DirectoryResolver>>,
        config: RemoteSignerConfig,
    ) -> SignerResult<Self> {
        Self::with_local_keys(token, relay, directory, config, Keys::generate())
    }

    /// Reuse a previously generated local key, e.g. to restore a session.
    pub fn with_local_keys(
        token: &str,
        relay: Arc<dyn RelayTransport>,
        directory: Option<Arc<dyn DirectoryResolver>>,
        config: RemoteSignerConfig,
        local_keys: Keys,
    ) -> SignerResult<Self> {
        let token = ConnectionToken::parse(token)?;
        let transport = Arc::new(RpcTransport::new(
            relay,
            local_keys,
            config.transport_scheme,
            config.app_name.clone(),
            config.rpc_kind,
        ));

        info!(
            "[nip46] created (client={}, token needs resolution={})",
            transport.local_pubkey().to_hex(),
            token.needs_resolution()
        );

        Ok(Self {
            config,
            token,
            directory,
            transport,
            target: OnceCell::new(),
            listening: Arc::new(AtomicBool::new(false)),
            subscribe_lock: Mutex::new(()),
            resolution: Mutex::new(ResolutionState::Unresolved),
            connection: Mutex::new(ConnectionState::Disconnected),
            handshake: Mutex::new(()),
            user: OnceCell::new(),
            pending: Arc::new(PendingRequests::new()),
            auth_urls: Arc::new(AuthUrlSubscribers::default()),
            id_counter: AtomicU64::new(0),
        })
    }

    /// Public key of the throwaway requester identity.
    pub fn local_pubkey(&self) -> PublicKey {
        self.transport.local_pubkey()
    }

    pub async fn state(&self) -> RemoteSignerState {
        RemoteSignerState {
            resolution: *self.resolution.lock().await,
            connection: *self.connection.lock().await,
        }
    }

    /// Receive every `auth_url` the agent sends from now on.
    pub async fn subscribe_auth_urls(&self) -> mpsc::UnboundedReceiver<String> {
        self.auth_urls.subscribe().await
    }

    /// Number of requests still waiting for a response.
    pub async fn pending_requests(&self) -> usize {
        self.pending.len().await
    }

    /// Remote agent pubkey, looking it up in the directory the first time.
    pub async fn resolve(&self) -> SignerResult<PublicKey> {
        Ok(self.target().await?.pubkey)
    }

    async fn target(&self) -> SignerResult<&Target> {
        let result = self
            .target
            .get_or_try_init(|| async {
                let (pubkey, relays) = match &self.token {
                    ConnectionToken::Pubkey { pubkey, relays, .. } => (*pubkey, relays.clone()),
                    ConnectionToken::Identifier { identifier, .. } => {
                        *self.resolution.lock().await = ResolutionState::Resolving;
                        let directory = self.directory.as_ref().ok_or_else(|| {
                            SignerError::DirectoryLookup("no directory resolver configured".to_string())
                        })?;
                        info!("[nip46] resolving {}", identifier);
                        let entry = directory.resolve(identifier).await?;
                        (entry.pubkey, entry.relays)
                    }
                };

                let relays = if relays.is_empty() { self.config.relays.clone() } else { relays };
                if relays.is_empty() {
                    return Err(SignerError::Config("no relays known for the remote signer".to_string()));
                }
                Ok::<_, SignerError>(Target { pubkey, relays })
            })
            .await;

        match &result {
            Ok(target) => {
                let mut resolution = self.resolution.lock().await;
                if *resolution != ResolutionState::Resolved {
                    info!("[nip46] resolved remote signer {} on {:?}", target.pubkey, target.relays);
                    *resolution = ResolutionState::Resolved;
                }
            }
            Err(e) => {
                warn!("[nip46] resolution failed: {}", e);
                *self.resolution.lock().await = ResolutionState::Unresolved;
            }
        }
        result
    }

    /// Subscribe to responses before the first request goes out, and again
    /// after the previous subscription ended.
    async fn ensure_listener(&self, target: &Target) -> SignerResult<()> {
        if self.listening.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _subscribing = self.subscribe_lock.lock().await;
        if self.listening.load(Ordering::SeqCst) {
            return Ok(());
        }

        let events = self.transport.subscribe(&target.relays).await?;
        self.listening.store(true, Ordering::SeqCst);
        Pump::spawn(
            events,
            self.transport.clone(),
            target.pubkey,
            self.pending.clone(),
            self.auth_urls.clone(),
            self.listening.clone(),
        );
        Ok(())
    }

    fn next_id(&self) -> String {
        let c = self.id_counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{}", c, unix_time_ms())
    }

    async fn rpc_call(&self, method: &str, params: Vec<String>) -> SignerResult<String> {
        let target = self.target().await?;
        self.ensure_listener(target).await?;

        let request = Request {
            id: self.next_id(),
            method: method.to_string(),
            params,
        };
        let id = request.id.clone();

        let event = self.transport.build_request_event(&target.pubkey, &request)?;
        let response_rx = self.pending.register(&id).await;
        let _pending = self.pending.guard(&id);

        // The pump clears the table after it stops listening.
        if !self.listening.load(Ordering::SeqCst) {
            return Err(SignerError::Transport("response subscription closed".to_string()));
        }

        self.transport.publish(&target.relays, &event).await?;
        debug!("[nip46] sent {} id={}", method, id);

        let received = match self.config.request_timeout_ms {
            Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), response_rx).await {
                Ok(received) => received,
                Err(_) => {
                    warn!("[nip46] {} id={} timed out after {}ms", method, id, ms);
                    return Err(SignerError::Timeout(id));
                }
            },
            None => response_rx.await,
        };
        let response =
            received.map_err(|_| SignerError::Transport(format!("response channel for {} closed", id)))?;

        if let Some(message) = response.error {
            return Err(SignerError::Rpc {
                method: method.to_string(),
                message,
            });
        }
        Ok(response.result.unwrap_or_default())
    }

    /// Run the `connect` handshake once. Later calls return immediately.
    pub async fn connect(&self) -> SignerResult<()> {
        let _handshake = self.handshake.lock().await;
        if *self.connection.lock().await == ConnectionState::Connected {
            return Ok(());
        }

        let target = self.target().await?;
        *self.connection.lock().await = ConnectionState::Handshaking;
        let mut handshaking = HandshakeReset {
            connection: &self.connection,
            armed: true,
        };

        let secret = self.token.secret();
        let mut params = vec![target.pubkey.to_hex()];
        if secret.is_some() || self.config.perms.is_some() {
            params.push(secret.unwrap_or_default().to_string());
        }
        if let Some(perms) = &self.config.perms {
            params.push(perms.clone());
        }

        let outcome = match self.rpc_call("connect", params).await {
            Ok(result) if result == "ack" || Some(result.as_str()) == secret => Ok(()),
            Ok(result) => Err(SignerError::MalformedResponse(format!("unexpected connect result: {}", result))),
            Err(e) => Err(e),
        };

        handshaking.armed = false;
        let mut connection = self.connection.lock().await;
        match outcome {
            Ok(()) => {
                *connection = ConnectionState::Connected;
                info!("[nip46] connected to {}", target.pubkey);
                Ok(())
            }
            Err(e) => {
                *connection = ConnectionState::Disconnected;
                warn!("[nip46] connect failed: {}", e);
                Err(e)
            }
        }
    }

    pub async fn get_public_key(&self) -> SignerResult<PublicKey> {
        let result = self.rpc_call("get_public_key", vec![]).await?;
        PublicKey::from_hex(&result)
            .map_err(|e| SignerError::MalformedResponse(format!("get_public_key returned {}: {}", result, e)))
    }

    /// Ask the agent to sign `template`; the returned event is verified.
    pub async fn sign_event(&self, template: &Template) -> SignerResult<Event> {
        let result = self.rpc_call("sign_event", vec![template.to_json()]).await?;
        let event = Event::from_json(&result)
            .map_err(|e| SignerError::MalformedResponse(format!("sign_event result is not an event: {}", e)))?;
        event
            .verify()
            .map_err(|e| SignerError::InvalidSignature(format!("remote signer returned a bad event: {}", e)))?;
        Ok(event)
    }

    pub async fn nip04_encrypt(&self, third_party: &PublicKey, plaintext: &str) -> SignerResult<String> {
        self.rpc_call("nip04_encrypt", vec![third_party.to_hex(), plaintext.to_string()]).await
    }

    pub async fn nip04_decrypt(&self, third_party: &PublicKey, ciphertext: &str) -> SignerResult<String> {
        self.rpc_call("nip04_decrypt", vec![third_party.to_hex(), ciphertext.to_string()]).await
    }

    pub async fn nip44_encrypt(&self, third_party: &PublicKey, plaintext: &str) -> SignerResult<String> {
        self.rpc_call("nip44_encrypt", vec![third_party.to_hex(), plaintext.to_string()]).await
    }

    pub async fn nip44_decrypt(&self, third_party: &PublicKey, ciphertext: &str) -> SignerResult<String> {
        self.rpc_call("nip44_decrypt", vec![third_party.to_hex(), ciphertext.to_string()]).await
    }

    /// Ask the agent to create a new account; returns its pubkey.
    pub async fn create_account(
        &self,
        username: &str,
        domain: &str,
        email: Option<&str>,
    ) -> SignerResult<PublicKey> {
        let mut params = vec![username.to_string(), domain.to_string(), email.unwrap_or_default().to_string()];
        if let Some(perms) = &self.config.perms {
            params.push(perms.clone());
        }
        let result = self.rpc_call("create_account", params).await?;
        PublicKey::from_hex(&result)
            .map_err(|e| SignerError::MalformedResponse(format!("create_account returned {}: {}", result, e)))
    }

    pub async fn ping(&self) -> SignerResult<()> {
        match self.rpc_call("ping", vec![]).await?.as_str() {
            "pong" => Ok(()),
            other => Err(SignerError::MalformedResponse(format!("unexpected ping result: {}", other))),
        }
    }

    /// `bunker://` URL for reconnecting to the same agent, once resolved.
    pub fn get_bunker_url(&self) -> Option<String> {
        let target = self.target.get()?;
        Some(bunker_url(&target.pubkey, &target.relays, self.token.secret()))
    }
}

/// Puts the connection back to `Disconnected` if `connect` is dropped mid-handshake.
struct HandshakeReset<'a> {
    connection: &'a Mutex<ConnectionState>,
    armed: bool,
}

impl Drop for HandshakeReset<'_> {
    fn drop(&mut self) {
        if self.armed {
            *self.connection.lock_blocking() = ConnectionState::Disconnected;
            debug!("[nip46] handshake abandoned, connection reset");
        }
    }
}

#[async_trait]
impl Signer for Nip46Signer {
    async fn identity(&self) -> SignerResult<User> {
        let user = self
            .user
            .get_or_try_init(|| async {
                self.connect().await?;
                let pubkey = self.get_public_key().await?;
                info!("[nip46] remote user {}", pubkey.to_hex());
                Ok::<_, SignerError>(User::new(pubkey))
            })
            .await?;
        Ok(*user)
    }

    async fn sign(&self, template: Template) -> SignerResult<Event> {
        self.connect().await?;
        self.sign_event(&template).await
    }

    async fn encrypt(
        &self,
        counterparty: &PublicKey,
        plaintext: &str,
        scheme: Option<EncryptionScheme>,
    ) -> SignerResult<String> {
        self.connect().await?;
        match scheme.unwrap_or(self.preferred_scheme()) {
            EncryptionScheme::Nip04 => self.nip04_encrypt(counterparty, plaintext).await,
            EncryptionScheme::Nip44 => self.nip44_encrypt(counterparty, plaintext).await,
        }
    }

    async fn decrypt(
        &self,
        counterparty: &PublicKey,
        ciphertext: &str,
        scheme: Option<EncryptionScheme>,
    ) -> SignerResult<String> {
        self.connect().await?;
        match scheme.unwrap_or(self.preferred_scheme()) {
            EncryptionScheme::Nip04 => self.nip04_decrypt(counterparty, ciphertext).await,
            EncryptionScheme::Nip44 => self.nip44_decrypt(counterparty, ciphertext).await,
        }
    }

    /// Both RPC methods exist in the protocol; the agent may still refuse per permission.
    async fn supported_schemes(&self, scheme: Option<EncryptionScheme>) -> SchemeSet {
        SchemeSet::all().restrict(scheme)
    }

    async fn preferred_relays(&self) -> Option<Vec<String>> {
        self.target.get().map(|target| target.relays.clone())
    }

    fn preferred_scheme(&self) -> EncryptionScheme {
        self.config.preferred_scheme
    }
}

fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
