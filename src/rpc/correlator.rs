//! Request Correlator
//!
//! Single responsibility: Match responses to the requests waiting for them.
//!
//! Every outstanding request owns one slot keyed by its id. A slot is settled
//! by whoever removes it from the map first: the response, the caller's
//! timeout, the caller dropping its future, or `fail_all` on disconnect.
//! Removal is atomic, so a late response racing a timeout is simply a miss.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, trace};

use super::protocol::RpcResponse;
use crate::error::RpcError;

type Completion = oneshot::Sender<Result<RpcResponse, RpcError>>;

/// Distinguishes successive registrations of the same id.
static NEXT_TICKET: AtomicU64 = AtomicU64::new(1);

struct PendingRequest {
    ticket: u64,
    issued_at: Instant,
    completion: Completion,
}

/// Shared map of outstanding requests.
#[derive(Clone, Default)]
pub struct Correlator {
    pending: Arc<DashMap<u64, PendingRequest>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a slot for `id`.
    ///
    /// Fails if the id is already outstanding; ids must be unique for the
    /// lifetime of the connection.
    pub fn register(&self, id: u64) -> Result<PendingResponse, RpcError> {
        let (completion, receiver) = oneshot::channel();
        let ticket = NEXT_TICKET.fetch_add(1, Ordering::Relaxed);

        match self.pending.entry(id) {
            Entry::Occupied(_) => return Err(RpcError::DuplicateRequestId(id)),
            Entry::Vacant(slot) => {
                slot.insert(PendingRequest {
                    ticket,
                    issued_at: Instant::now(),
                    completion,
                });
            }
        }

        trace!(id = id, "Registered pending request");
        Ok(PendingResponse {
            id,
            ticket,
            receiver,
            pending: Arc::clone(&self.pending),
        })
    }

    /// Complete the request waiting on `id`.
    ///
    /// Returns false when nothing was waiting: the peer retransmitted, or the
    /// caller already gave up.
    pub fn resolve(&self, id: u64, response: RpcResponse) -> bool {
        match self.pending.remove(&id) {
            Some((_, request)) => {
                debug!(
                    id = id,
                    method = %response.method,
                    elapsed_ms = request.issued_at.elapsed().as_millis() as u64,
                    "Resolved pending request"
                );
                // The caller may have dropped its receiver in the meantime
                let _ = request.completion.send(Ok(response));
                true
            }
            None => {
                debug!(id = id, method = %response.method, "No pending request for response, ignoring");
                false
            }
        }
    }

    /// Fail every outstanding request with `ConnectionLost`.
    pub fn fail_all(&self, reason: &str) -> usize {
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, request)) = self.pending.remove(&id) {
                let _ = request
                    .completion
                    .send(Err(RpcError::ConnectionLost(reason.to_string())));
                failed += 1;
            }
        }
        if failed > 0 {
            debug!(count = failed, reason = %reason, "Failed all pending requests");
        }
        failed
    }

    pub fn contains(&self, id: u64) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// The caller's side of a pending request.
///
/// Dropping it withdraws the slot, so abandoned requests never linger.
pub struct PendingResponse {
    id: u64,
    ticket: u64,
    receiver: oneshot::Receiver<Result<RpcResponse, RpcError>>,
    pending: Arc<DashMap<u64, PendingRequest>>,
}

impl PendingResponse {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the response, failing with `Timeout` after `timeout`.
    pub async fn wait(mut self, timeout: Duration) -> Result<RpcResponse, RpcError> {
        match tokio::time::timeout(timeout, &mut self.receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RpcError::ConnectionLost("Request slot dropped".into())),
            Err(_) => {
                self.withdraw();
                // A response may have landed between the timer and the removal
                match self.receiver.try_recv() {
                    Ok(result) => result,
                    Err(_) => Err(RpcError::Timeout(format!(
                        "No response to request {} within {:?}",
                        self.id, timeout
                    ))),
                }
            }
        }
    }

    fn withdraw(&self) {
        let ticket = self.ticket;
        self.pending.remove_if(&self.id, |_, request| request.ticket == ticket);
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.withdraw();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(id: u64, method: &str) -> RpcResponse {
        RpcResponse {
            id,
            method: method.into(),
            params: vec![],
            timestamp: 0,
            signatures: vec![],
        }
    }

    #[tokio::test]
    async fn test_resolve_completes_matching_request() {
        let correlator = Correlator::new();
        let a = correlator.register(1).unwrap();
        let b = correlator.register(2).unwrap();

        assert!(correlator.resolve(2, response(2, "b")));
        assert!(correlator.resolve(1, response(1, "a")));

        assert_eq!(a.wait(Duration::from_secs(1)).await.unwrap().method, "a");
        assert_eq!(b.wait(Duration::from_secs(1)).await.unwrap().method, "b");
        assert!(correlator.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_and_duplicate_resolve_are_noops() {
        let correlator = Correlator::new();
        assert!(!correlator.resolve(9, response(9, "x")));

        let pending = correlator.register(1).unwrap();
        assert!(correlator.resolve(1, response(1, "first")));
        assert!(!correlator.resolve(1, response(1, "second")));
        assert_eq!(pending.wait(Duration::from_secs(1)).await.unwrap().method, "first");
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let correlator = Correlator::new();
        let _held = correlator.register(5).unwrap();
        assert!(matches!(
            correlator.register(5),
            Err(RpcError::DuplicateRequestId(5))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_entry() {
        let correlator = Correlator::new();
        let pending = correlator.register(1).unwrap();

        let started = tokio::time::Instant::now();
        let result = pending.wait(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(RpcError::Timeout(_))));
        assert!(started.elapsed() >= Duration::from_millis(50));

        assert!(!correlator.contains(1));
        assert!(!correlator.resolve(1, response(1, "late")));
    }

    #[tokio::test]
    async fn test_fail_all_settles_everything() {
        let correlator = Correlator::new();
        let waiters: Vec<_> = (1..=5).map(|id| correlator.register(id).unwrap()).collect();

        assert_eq!(correlator.fail_all("socket closed"), 5);
        assert!(correlator.is_empty());

        for waiter in waiters {
            assert!(matches!(
                waiter.wait(Duration::from_secs(1)).await,
                Err(RpcError::ConnectionLost(_))
            ));
        }
    }

    #[test]
    fn test_drop_withdraws_slot() {
        let correlator = Correlator::new();
        let pending = correlator.register(3).unwrap();
        assert!(correlator.contains(3));
        drop(pending);
        assert!(!correlator.contains(3));
        // The id is free again
        assert!(correlator.register(3).is_ok());
    }

    #[test]
    fn test_stale_handle_does_not_withdraw_newer_slot() {
        let correlator = Correlator::new();
        let old = correlator.register(4).unwrap();
        assert!(correlator.resolve(4, response(4, "done")));

        let _new = correlator.register(4).unwrap();
        drop(old);
        assert!(correlator.contains(4));
    }

    #[tokio::test]
    async fn test_concurrent_register_resolve() {
        let correlator = Correlator::new();
        let mut handles = Vec::new();

        for id in 0..64u64 {
            let pending = correlator.register(id).unwrap();
            handles.push(tokio::spawn(async move {
                let response = pending.wait(Duration::from_secs(5)).await.unwrap();
                assert_eq!(response.id, id);
            }));
        }

        let resolver = correlator.clone();
        tokio::spawn(async move {
            for id in (0..64u64).rev() {
                resolver.resolve(id, response(id, "ok"));
            }
        })
        .await
        .unwrap();

        for handle in handles {
            handle.await.unwrap();
        }
        assert!(correlator.is_empty());
    }
}
