use std::sync::Arc;

use async_lock::Mutex;
use futures::channel::{mpsc, oneshot};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Result value an agent sends while it waits for the user to approve in a browser.
pub const AUTH_URL_RESULT: &str = "auth_url";

/// `{id, method, params}` as it goes on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub method: String,
    pub params: Vec<String>,
}

/// `{id, result, error?}`. Non-string results are kept as their JSON text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub id: String,
    pub result: Option<String>,
    pub error: Option<String>,
}

impl Response {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        #[derive(Deserialize)]
        struct Raw {
            id: String,
            #[serde(default)]
            result: Option<Value>,
            #[serde(default)]
            error: Option<Value>,
        }

        let raw: Raw = serde_json::from_str(json)?;
        let as_text = |v: Value| match v {
            Value::Null => None,
            Value::String(s) => Some(s),
            other => Some(other.to_string()),
        };

        Ok(Response {
            id: raw.id,
            result: raw.result.and_then(as_text),
            error: raw.error.and_then(as_text).filter(|e| !e.is_empty()),
        })
    }

    pub fn to_json(&self) -> String {
        let mut value = serde_json::json!({ "id": self.id, "result": self.result });
        if let Some(error) = &self.error {
            value["error"] = Value::String(error.clone());
        }
        value.to_string()
    }

    /// An `auth_url` notification carries the URL in `error`.
    pub fn auth_url(&self) -> Option<&str> {
        if self.result.as_deref() == Some(AUTH_URL_RESULT) {
            self.error.as_deref()
        } else {
            None
        }
    }
}

/// Requests waiting for their response, keyed by request id.
#[derive(Default)]
pub struct PendingRequests {
    inner: Mutex<FxHashMap<String, oneshot::Sender<Response>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, id: &str) -> oneshot::Receiver<Response> {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().await.insert(id.to_string(), tx);
        rx
    }

    /// Complete the matching request. Returns false for unknown ids.
    pub async fn resolve(&self, response: Response) -> bool {
        let Some(tx) = self.inner.lock().await.remove(&response.id) else {
            return false;
        };
        if tx.send(response).is_err() {
            debug!("[nip46] caller dropped before its response arrived");
        }
        true
    }

    pub async fn forget(&self, id: &str) {
        self.inner.lock().await.remove(id);
    }

    /// Remove `id` outside of an async context. The lock is never held across
    /// an await, so this only waits for another short critical section.
    pub fn forget_blocking(&self, id: &str) {
        self.inner.lock_blocking().remove(id);
    }

    /// Remove `id` when the returned guard goes out of scope, whether the
    /// caller finished or was cancelled.
    pub fn guard(self: &Arc<Self>, id: &str) -> PendingGuard {
        PendingGuard {
            pending: self.clone(),
            id: id.to_string(),
        }
    }

    /// Drop every waiting sender. Callers see their channel close.
    pub async fn close_all(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let dropped = inner.len();
        inner.clear();
        dropped
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.inner.lock().await.contains_key(id)
    }
}

/// Removes its request from the pending table on drop.
pub struct PendingGuard {
    pending: Arc<PendingRequests>,
    id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.forget_blocking(&self.id);
    }
}

/// Fan-out of `auth_url` notifications to whoever is listening right now.
#[derive(Default)]
pub struct AuthUrlSubscribers {
    inner: Mutex<Vec<mpsc::UnboundedSender<String>>>,
}

impl AuthUrlSubscribers {
    pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded();
        self.inner.lock().await.push(tx);
        rx
    }

    /// Deliver to current subscribers, dropping the ones that hung up.
    pub async fn broadcast(&self, url: &str) -> usize {
        let mut subscribers = self.inner.lock().await;
        subscribers.retain(|tx| tx.unbounded_send(url.to_string()).is_ok());
        subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn test_response_parsing() {
        let ok = Response::from_json(r#"{"id":"1","result":"ack"}"#).unwrap();
        assert_eq!(ok.result.as_deref(), Some("ack"));
        assert!(ok.error.is_none());

        let err = Response::from_json(r#"{"id":"2","result":null,"error":"denied"}"#).unwrap();
        assert_eq!(err.error.as_deref(), Some("denied"));

        let empty_err = Response::from_json(r#"{"id":"3","result":"x","error":""}"#).unwrap();
        assert!(empty_err.error.is_none());

        let obj = Response::from_json(r#"{"id":"4","result":{"a":1}}"#).unwrap();
        assert_eq!(obj.result.as_deref(), Some(r#"{"a":1}"#));

        let auth = Response::from_json(r#"{"id":"5","result":"auth_url","error":"https://approve"}"#).unwrap();
        assert_eq!(auth.auth_url(), Some("https://approve"));

        assert!(Response::from_json(r#"{"result":"no id"}"#).is_err());
    }

    #[tokio::test]
    async fn test_pending_resolves_out_of_order() {
        let pending = PendingRequests::new();
        let first = pending.register("a").await;
        let second = pending.register("b").await;

        let resp = |id: &str, result: &str| Response {
            id: id.to_string(),
            result: Some(result.to_string()),
            error: None,
        };

        assert!(pending.resolve(resp("b", "second")).await);
        assert!(!pending.resolve(resp("zzz", "stray")).await);
        assert!(pending.resolve(resp("a", "first")).await);

        assert_eq!(first.await.unwrap().result.as_deref(), Some("first"));
        assert_eq!(second.await.unwrap().result.as_deref(), Some("second"));
        assert_eq!(pending.len().await, 0);
    }

    #[tokio::test]
    async fn test_forgotten_request_drops_late_response() {
        let pending = PendingRequests::new();
        let _rx = pending.register("late").await;
        pending.forget("late").await;

        let late = Response {
            id: "late".to_string(),
            result: Some("too late".to_string()),
            error: None,
        };
        assert!(!pending.resolve(late).await);
    }

    #[tokio::test]
    async fn test_guard_removes_entry_on_drop() {
        let pending = Arc::new(PendingRequests::new());
        let _rx = pending.register("cancelled").await;
        let guard = pending.guard("cancelled");
        assert!(pending.contains("cancelled").await);

        drop(guard);
        assert!(!pending.contains("cancelled").await);
    }

    #[tokio::test]
    async fn test_close_all_wakes_waiters() {
        let pending = PendingRequests::new();
        let first = pending.register("a").await;
        let second = pending.register("b").await;

        assert_eq!(pending.close_all().await, 2);
        assert!(first.await.is_err());
        assert!(second.await.is_err());
        assert_eq!(pending.len().await, 0);
    }

    #[tokio::test]
    async fn test_auth_url_broadcast_reaches_current_subscribers() {
        let subscribers = AuthUrlSubscribers::default();
        let mut a = subscribers.subscribe().await;
        let b = subscribers.subscribe().await;
        drop(b);

        assert_eq!(subscribers.broadcast("https://approve").await, 1);
        assert_eq!(a.next().await.as_deref(), Some("https://approve"));

        let mut late = subscribers.subscribe().await;
        assert!(late.try_next().is_err());
    }
}
