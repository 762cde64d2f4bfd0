//! Pending-request table keyed by correlation id.
//!
//! `send` registers a waiter before transmitting, the inbound dispatch loop
//! resolves it when the correlated response arrives, and a periodic sweep fails
//! waiters whose deadline has passed. Dropping a [`Waiter`] removes its entry,
//! so a cancelled or abandoned send never leaves state behind.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::protocol::Envelope;

type Outcome = Result<Envelope>;

struct PendingEntry {
    ticket: u64,
    deadline: Instant,
    sender: oneshot::Sender<Outcome>,
}

#[derive(Default)]
pub struct Correlator {
    pending: Mutex<HashMap<String, PendingEntry>>,
    next_ticket: AtomicU64,
}

impl Correlator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a waiter. A correlation id that is already pending is rejected.
    pub fn register_pending(
        self: &Arc<Self>,
        correlation_id: impl Into<String>,
        deadline: Instant,
    ) -> Result<Waiter> {
        let correlation_id = correlation_id.into();
        let (sender, receiver) = oneshot::channel();
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);

        let mut pending = self.pending.lock();
        if pending.contains_key(&correlation_id) {
            return Err(Error::DuplicateCorrelation(correlation_id));
        }
        pending.insert(
            correlation_id.clone(),
            PendingEntry {
                ticket,
                deadline,
                sender,
            },
        );
        drop(pending);

        Ok(Waiter {
            correlation_id,
            ticket,
            deadline,
            receiver,
            correlator: self.clone(),
        })
    }

    /// Wake the waiter for `correlation_id`. Returns false when there is none.
    pub fn resolve(&self, correlation_id: &str, response: Envelope) -> bool {
        self.complete(correlation_id, Ok(response))
    }

    /// Fail the waiter for `correlation_id`. Returns false when there is none.
    pub fn fail(&self, correlation_id: &str, error: Error) -> bool {
        self.complete(correlation_id, Err(error))
    }

    fn complete(&self, correlation_id: &str, outcome: Outcome) -> bool {
        let entry = self.pending.lock().remove(correlation_id);
        match entry {
            Some(entry) => {
                if entry.sender.send(outcome).is_err() {
                    tracing::debug!(correlation_id, "Waiter went away before completion");
                }
                true
            }
            None => {
                tracing::debug!(correlation_id, "Discarding late or duplicate response");
                false
            }
        }
    }

    /// Fail every waiter whose deadline is at or before `now`.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let expired: Vec<(String, PendingEntry)> = {
            let mut pending = self.pending.lock();
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, entry)| entry.deadline <= now)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        let count = expired.len();
        for (id, entry) in expired {
            tracing::debug!(correlation_id = %id, "Pending request expired");
            let _ = entry.sender.send(Err(Error::RequestTimeout(id)));
        }
        count
    }

    /// Fail every waiter, e.g. with `Shutdown` when the runtime stops.
    pub fn fail_all(&self, error: impl Fn() -> Error) -> usize {
        let drained: Vec<PendingEntry> = self.pending.lock().drain().map(|(_, e)| e).collect();
        let count = drained.len();
        for entry in drained {
            let _ = entry.sender.send(Err(error()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        self.pending.lock().contains_key(correlation_id)
    }

    fn remove_ticket(&self, correlation_id: &str, ticket: u64) -> bool {
        let mut pending = self.pending.lock();
        if pending.get(correlation_id).map(|e| e.ticket) == Some(ticket) {
            pending.remove(correlation_id);
            return true;
        }
        false
    }
}

/// Handle to one pending request.
pub struct Waiter {
    correlation_id: String,
    ticket: u64,
    deadline: Instant,
    receiver: oneshot::Receiver<Outcome>,
    correlator: Arc<Correlator>,
}

impl Waiter {
    /// Wait for the correlated response, the deadline, or cancellation.
    pub async fn wait(mut self, cancel: Option<&CancellationToken>) -> Result<Envelope> {
        let cancelled = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            outcome = &mut self.receiver => match outcome {
                Ok(outcome) => outcome,
                Err(_) => Err(Error::Shutdown),
            },
            _ = tokio::time::sleep_until(self.deadline) => {
                self.correlator.remove_ticket(&self.correlation_id, self.ticket);
                // A response may have landed between the timer firing and the removal.
                match self.receiver.try_recv() {
                    Ok(outcome) => outcome,
                    Err(_) => Err(Error::RequestTimeout(self.correlation_id.clone())),
                }
            }
            _ = cancelled => Err(Error::Cancelled(self.correlation_id.clone())),
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        if self.correlator.remove_ticket(&self.correlation_id, self.ticket) {
            tracing::trace!(correlation_id = %self.correlation_id, "Removed abandoned waiter");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AgentId, JSON_CONTENT_TYPE};
    use std::time::Duration;

    fn response(correlation_id: &str) -> Envelope {
        Envelope::request(
            "Pong",
            JSON_CONTENT_TYPE,
            b"{}".to_vec(),
            AgentId::new("runtime", "r"),
            correlation_id,
        )
    }

    fn in_secs(secs: u64) -> Instant {
        Instant::now() + Duration::from_secs(secs)
    }

    #[tokio::test]
    async fn test_resolve_wakes_waiter() {
        let correlator = Correlator::new();
        let waiter = correlator.register_pending("a", in_secs(5)).unwrap();

        assert!(correlator.resolve("a", response("a")));
        let envelope = waiter.wait(None).await.unwrap();
        assert_eq!(envelope.correlation_id, "a");
        assert!(correlator.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_and_repeated_responses_are_discarded() {
        let correlator = Correlator::new();
        let a = correlator.register_pending("a", in_secs(5)).unwrap();
        let b = correlator.register_pending("b", in_secs(5)).unwrap();

        assert!(!correlator.resolve("zzz", response("zzz")));
        assert!(correlator.resolve("a", response("a")));
        assert!(!correlator.resolve("a", response("a")));
        assert!(correlator.contains("b"));

        a.wait(None).await.unwrap();
        assert!(correlator.resolve("b", response("b")));
        b.wait(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_correlation_is_rejected() {
        let correlator = Correlator::new();
        let first = correlator.register_pending("a", in_secs(5)).unwrap();
        assert!(matches!(
            correlator.register_pending("a", in_secs(5)),
            Err(Error::DuplicateCorrelation(id)) if id == "a"
        ));

        assert!(correlator.resolve("a", response("a")));
        first.wait(None).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_once_and_removes_entry() {
        let correlator = Correlator::new();
        for _ in 0..10 {
            let waiter = correlator
                .register_pending("slow", Instant::now() + Duration::from_millis(50))
                .unwrap();
            assert!(matches!(
                waiter.wait(None).await,
                Err(Error::RequestTimeout(id)) if id == "slow"
            ));
            assert!(correlator.is_empty());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_fails_only_expired_waiters() {
        let correlator = Correlator::new();
        let now = Instant::now();
        let expired = correlator
            .register_pending("old", now + Duration::from_millis(10))
            .unwrap();
        let _alive = correlator.register_pending("new", in_secs(60)).unwrap();

        assert_eq!(correlator.sweep_expired(now + Duration::from_millis(20)), 1);
        assert!(!correlator.contains("old"));
        assert!(correlator.contains("new"));
        assert!(matches!(
            expired.wait(None).await,
            Err(Error::RequestTimeout(id)) if id == "old"
        ));
    }

    #[tokio::test]
    async fn test_cancel_removes_entry() {
        let correlator = Correlator::new();
        let token = CancellationToken::new();
        let waiter = correlator.register_pending("c", in_secs(60)).unwrap();

        token.cancel();
        assert!(matches!(
            waiter.wait(Some(&token)).await,
            Err(Error::Cancelled(id)) if id == "c"
        ));
        assert!(correlator.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_waiter_frees_slot() {
        let correlator = Correlator::new();
        let waiter = correlator.register_pending("d", in_secs(60)).unwrap();
        drop(waiter);
        assert!(correlator.is_empty());

        // The id can be reused, and the old handle cannot remove the new entry.
        let again = correlator.register_pending("d", in_secs(60)).unwrap();
        assert!(correlator.resolve("d", response("d")));
        again.wait(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_fail_all_reports_shutdown() {
        let correlator = Correlator::new();
        let a = correlator.register_pending("a", in_secs(60)).unwrap();
        let b = correlator.register_pending("b", in_secs(60)).unwrap();

        assert_eq!(correlator.fail_all(|| Error::Shutdown), 2);
        assert!(matches!(a.wait(None).await, Err(Error::Shutdown)));
        assert!(matches!(b.wait(None).await, Err(Error::Shutdown)));
    }

    #[tokio::test]
    async fn test_explicit_failure_reaches_waiter() {
        let correlator = Correlator::new();
        let waiter = correlator.register_pending("x", in_secs(60)).unwrap();
        assert!(correlator.fail("x", Error::HandlerExecution("boom".into())));
        assert!(matches!(
            waiter.wait(None).await,
            Err(Error::HandlerExecution(m)) if m == "boom"
        ));
    }
}
