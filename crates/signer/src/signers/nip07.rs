use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_lock::{Mutex, OnceCell};
use async_trait::async_trait;
use futures::channel::{mpsc, oneshot};
use futures::StreamExt;
use tracing::{debug, info, warn};

use nipsigner_core::{Event, PublicKey, Template};

use super::{EncryptionScheme, SchemeSet, Signer, User};
use crate::config::ExtensionConfig;
use crate::error::{SignerError, SignerResult};

/// Failure reported by the extension host.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HostError {
    /// The host is still handling a previous call.
    #[error("host busy: {0}")]
    Busy(String),

    #[error("rejected by user: {0}")]
    Rejected(String),

    #[error("host failure: {0}")]
    Failed(String),
}

impl HostError {
    /// Map a free-form host message onto an error class.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_ascii_lowercase();
        if lower.contains("call already executing")
            || lower.contains("already in progress")
            || lower.contains("busy")
        {
            HostError::Busy(message)
        } else if lower.contains("reject") || lower.contains("denied") || lower.contains("cancel") {
            HostError::Rejected(message)
        } else {
            HostError::Failed(message)
        }
    }
}

/// Capability provided by the embedding environment (a browser extension
/// bridge, an OS keychain agent). Known to reject overlapping calls.
#[async_trait]
pub trait ExtensionHost: Send + Sync {
    async fn get_public_key(&self) -> Result<PublicKey, HostError>;

    async fn sign_event(&self, template: Template) -> Result<Event, HostError>;

    async fn supports(&self, scheme: EncryptionScheme) -> bool;

    async fn encrypt(&self, scheme: EncryptionScheme, pubkey: &PublicKey, plaintext: &str)
        -> Result<String, HostError>;

    async fn decrypt(&self, scheme: EncryptionScheme, pubkey: &PublicKey, ciphertext: &str)
        -> Result<String, HostError>;

    async fn get_relays(&self) -> Result<Vec<String>, HostError> {
        Ok(Vec::new())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Operation {
    Encrypt,
    Decrypt,
}

struct QueueItem {
    operation: Operation,
    scheme: EncryptionScheme,
    counterparty: PublicKey,
    value: String,
    retries: u32,
    reply: oneshot::Sender<SignerResult<String>>,
}

/// Signer delegating to an [`ExtensionHost`].
///
/// Encrypt and decrypt calls go through a per-instance FIFO drained by a
/// single worker task, so the host never sees two of them at once. `sign`
/// and identity lookups go straight to the host.
pub struct Nip07Signer {
    host: Option<Arc<dyn ExtensionHost>>,
    config: ExtensionConfig,
    identity: OnceCell<User>,
    queue_tx: mpsc::UnboundedSender<QueueItem>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<QueueItem>>>,
    worker_started: AtomicBool,
}

impl Nip07Signer {
    pub fn new(host: Option<Arc<dyn ExtensionHost>>, config: ExtensionConfig) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded();
        Self {
            host,
            config,
            identity: OnceCell::new(),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            worker_started: AtomicBool::new(false),
        }
    }

    pub fn with_host(host: Arc<dyn ExtensionHost>) -> Self {
        Self::new(Some(host), ExtensionConfig::default())
    }

    pub fn is_available(&self) -> bool {
        self.host.is_some()
    }

    fn host(&self) -> SignerResult<&Arc<dyn ExtensionHost>> {
        self.host.as_ref().ok_or(SignerError::HostUnavailable)
    }

    async fn ensure_worker(&self, host: &Arc<dyn ExtensionHost>) {
        if self.worker_started.load(Ordering::Acquire) {
            return;
        }
        let Some(rx) = self.queue_rx.lock().await.take() else {
            return;
        };
        self.worker_started.store(true, Ordering::Release);

        tokio::spawn(run_queue(host.clone(), rx, self.config.clone()));
        info!("[nip07] queue worker started");
    }

    async fn enqueue(
        &self,
        operation: Operation,
        scheme: EncryptionScheme,
        counterparty: &PublicKey,
        value: &str,
    ) -> SignerResult<String> {
        let host = self.host()?;
        self.ensure_worker(host).await;

        let (reply, done) = oneshot::channel();
        self.queue_tx
            .unbounded_send(QueueItem {
                operation,
                scheme,
                counterparty: *counterparty,
                value: value.to_string(),
                retries: 0,
                reply,
            })
            .map_err(|_| SignerError::HostUnavailable)?;

        done.await.map_err(|_| SignerError::HostUnavailable)?
    }
}

async fn run_queue(
    host: Arc<dyn ExtensionHost>,
    mut rx: mpsc::UnboundedReceiver<QueueItem>,
    config: ExtensionConfig,
) {
    while let Some(mut item) = rx.next().await {
        // A busy host is retried in place so nothing queued behind it overtakes.
        let outcome = loop {
            let result = match item.operation {
                Operation::Encrypt => host.encrypt(item.scheme, &item.counterparty, &item.value).await,
                Operation::Decrypt => host.decrypt(item.scheme, &item.counterparty, &item.value).await,
            };

            match result {
                Ok(value) => break Ok(value),
                Err(HostError::Busy(message)) => {
                    item.retries += 1;
                    if item.retries > config.max_retries {
                        warn!(
                            "[nip07] {:?} still busy after {} retries: {}",
                            item.operation, config.max_retries, message
                        );
                        break Err(SignerError::HostBusy);
                    }
                    let delay = config.base_retry_delay_ms * u64::from(item.retries);
                    debug!(
                        "[nip07] host busy, retry {} of {:?} in {}ms",
                        item.retries, item.operation, delay
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(HostError::Rejected(_)) => break Err(SignerError::AccessDenied),
                Err(HostError::Failed(message)) => {
                    break Err(SignerError::Crypto(format!(
                        "{} {:?} failed: {}",
                        item.scheme, item.operation, message
                    )))
                }
            }
        };

        // The caller may have gone away; nothing to do then.
        let _ = item.reply.send(outcome);
    }

    info!("[nip07] queue closed, worker exiting");
}

#[async_trait]
impl Signer for Nip07Signer {
    async fn identity(&self) -> SignerResult<User> {
        let host = self.host()?;
        let user = self
            .identity
            .get_or_try_init(|| async {
                let pubkey = host.get_public_key().await.map_err(|e| match e {
                    HostError::Rejected(_) => SignerError::AccessDenied,
                    HostError::Busy(_) => SignerError::HostBusy,
                    HostError::Failed(message) => SignerError::SigningUnavailable(message),
                })?;
                info!("[nip07] access granted for {}", pubkey.to_hex());
                Ok::<_, SignerError>(User::new(pubkey))
            })
            .await?;
        Ok(*user)
    }

    async fn sign(&self, template: Template) -> SignerResult<Event> {
        let host = self.host()?;
        let event = host.sign_event(template).await.map_err(|e| match e {
            HostError::Rejected(_) => SignerError::AccessDenied,
            other => SignerError::SigningUnavailable(other.to_string()),
        })?;

        event
            .verify()
            .map_err(|e| SignerError::InvalidSignature(format!("host returned a bad event: {}", e)))?;
        Ok(event)
    }

    async fn encrypt(
        &self,
        counterparty: &PublicKey,
        plaintext: &str,
        scheme: Option<EncryptionScheme>,
    ) -> SignerResult<String> {
        let scheme = scheme.unwrap_or(self.preferred_scheme());
        self.enqueue(Operation::Encrypt, scheme, counterparty, plaintext).await
    }

    async fn decrypt(
        &self,
        counterparty: &PublicKey,
        ciphertext: &str,
        scheme: Option<EncryptionScheme>,
    ) -> SignerResult<String> {
        let scheme = scheme.unwrap_or(self.preferred_scheme());
        self.enqueue(Operation::Decrypt, scheme, counterparty, ciphertext).await
    }

    async fn supported_schemes(&self, scheme: Option<EncryptionScheme>) -> SchemeSet {
        let Some(host) = self.host.as_ref() else {
            return SchemeSet::empty();
        };

        let candidates = match scheme {
            Some(s) => vec![s],
            None => vec![EncryptionScheme::Nip04, EncryptionScheme::Nip44],
        };

        let mut set = SchemeSet::empty();
        for candidate in candidates {
            if host.supports(candidate).await {
                set = set.with(candidate);
            }
        }
        set
    }

    async fn preferred_relays(&self) -> Option<Vec<String>> {
        let host = self.host.as_ref()?;
        match host.get_relays().await {
            Ok(relays) if !relays.is_empty() => Some(relays),
            Ok(_) => None,
            Err(e) => {
                debug!("[nip07] get_relays failed: {}", e);
                None
            }
        }
    }
}
