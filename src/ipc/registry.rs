//! In-flight request bookkeeping for one client session.
//!
//! Each registered id owns a oneshot channel. The reader task resolves it when
//! a matching response arrives; the caller abandons it on timeout; session
//! teardown abandons everything left. Whichever happens first removes the
//! entry, so every id is settled exactly once.

use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;
use tokio::sync::oneshot;

use crate::ipc::protocol::Response;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The id is already waiting for a response.
    #[error("Request id {0} is already registered")]
    DuplicateId(String),
}

/// The pending entry was removed without a response (timeout or teardown).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Request was abandoned before a response arrived")]
pub struct Abandoned;

/// Caller-side handle for a registered request.
#[derive(Debug)]
pub struct PendingResponse {
    rx: oneshot::Receiver<Response>,
}

impl PendingResponse {
    /// Wait for the outcome.
    pub async fn wait(self) -> Result<Response, Abandoned> {
        self.rx.await.map_err(|_| Abandoned)
    }
}

/// Correlation id → pending outcome map.
///
/// The lock is never held across an `.await`; all operations are short
/// synchronous map updates.
#[derive(Debug, Default)]
pub struct RequestRegistry {
    pending: Mutex<HashMap<String, oneshot::Sender<Response>>>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` and return the handle the caller waits on.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::DuplicateId` if `id` is still pending.
    pub fn register(&self, id: &str) -> Result<PendingResponse, RegistryError> {
        let mut pending = self.lock();
        if pending.contains_key(id) {
            return Err(RegistryError::DuplicateId(id.to_string()));
        }

        let (tx, rx) = oneshot::channel();
        pending.insert(id.to_string(), tx);

        Ok(PendingResponse { rx })
    }

    /// Deliver a response to the waiting caller.
    ///
    /// Returns `false` if no entry exists for `id` (an orphan response) or the
    /// caller stopped waiting in the meantime.
    pub fn resolve(&self, id: &str, response: Response) -> bool {
        let sender = self.lock().remove(id);
        match sender {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    /// Drop the entry for `id`. Returns `true` if it was still pending.
    pub fn abandon(&self, id: &str) -> bool {
        self.lock().remove(id).is_some()
    }

    /// Drop every pending entry. Waiting callers observe `Abandoned`.
    pub fn abandon_all(&self) -> usize {
        let drained: Vec<_> = self.lock().drain().collect();
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<Response>>> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::protocol::ErrorCode;
    use serde_json::json;

    fn ok_response(id: &str) -> Response {
        Response::success(Some(id.to_string()), json!({"ok": true}).as_object().cloned().unwrap())
    }

    #[tokio::test]
    async fn test_register_and_resolve() {
        let registry = RequestRegistry::new();
        let pending = registry.register("req-1").unwrap();
        assert_eq!(registry.len(), 1);

        assert!(registry.resolve("req-1", ok_response("req-1")));
        assert!(registry.is_empty());

        let response = pending.wait().await.unwrap();
        assert_eq!(response.id.as_deref(), Some("req-1"));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let registry = RequestRegistry::new();
        let _first = registry.register("req-1").unwrap();

        let err = registry.register("req-1").unwrap_err();
        assert_eq!(err, RegistryError::DuplicateId("req-1".into()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_orphan_resolve_returns_false() {
        let registry = RequestRegistry::new();
        assert!(!registry.resolve("req-404", ok_response("req-404")));
    }

    #[tokio::test]
    async fn test_abandon_then_late_response_is_orphan() {
        let registry = RequestRegistry::new();
        let pending = registry.register("req-1").unwrap();

        assert!(registry.abandon("req-1"));
        assert!(!registry.abandon("req-1"));
        assert!(!registry.resolve("req-1", ok_response("req-1")));

        assert_eq!(pending.wait().await, Err(Abandoned));
    }

    #[tokio::test]
    async fn test_abandon_all_releases_waiters() {
        let registry = RequestRegistry::new();
        let a = registry.register("a").unwrap();
        let b = registry.register("b").unwrap();

        assert_eq!(registry.abandon_all(), 2);
        assert!(registry.is_empty());
        assert_eq!(a.wait().await, Err(Abandoned));
        assert_eq!(b.wait().await, Err(Abandoned));
    }

    #[tokio::test]
    async fn test_id_reusable_after_settlement() {
        let registry = RequestRegistry::new();
        let first = registry.register("req-1").unwrap();
        registry.resolve(
            "req-1",
            Response::failure(Some("req-1".into()), ErrorCode::MethodNotFound, "nope"),
        );
        assert!(first.wait().await.unwrap().is_error());

        assert!(registry.register("req-1").is_ok());
    }

    #[test]
    fn test_resolve_after_caller_dropped() {
        let registry = RequestRegistry::new();
        let pending = registry.register("req-1").unwrap();
        drop(pending);

        assert!(!registry.resolve("req-1", ok_response("req-1")));
        assert!(registry.is_empty());
    }
}
