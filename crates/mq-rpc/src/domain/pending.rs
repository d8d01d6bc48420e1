//! Pending call table.
//!
//! Maps correlation IDs to calls waiting for a reply.
//!
//! Flow:
//! 1. `send` registers the call under its correlation id
//! 2. The request is published with that id and the reply-to address
//! 3. The reply consumer calls `take()` and resolves the completion
//! 4. Calls nobody answers are evicted by `remove_expired()`
//!
//! Every removal goes through a single atomic map operation, so whichever
//! of reply, timeout, publish failure or shutdown gets there first owns
//! the completion.

use crate::domain::completion::Completion;
use crate::domain::correlation::CorrelationId;
use crate::domain::error::RpcError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// A call waiting for its reply
#[derive(Debug)]
pub struct PendingCall {
    // Continuations are Send but not Sync; the lock makes the table Sync.
    completion: Mutex<Completion>,
    created_at: Instant,
    timeout: Option<Duration>,
    exchange: String,
    routing_key: String,
}

impl PendingCall {
    pub fn new(
        completion: Completion,
        timeout: Option<Duration>,
        exchange: &str,
        routing_key: &str,
    ) -> Self {
        Self {
            completion: Mutex::new(completion),
            created_at: Instant::now(),
            timeout,
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.timeout
            .is_some_and(|timeout| now.saturating_duration_since(self.created_at) >= timeout)
    }

    pub fn into_completion(self) -> Completion {
        self.completion.into_inner()
    }
}

/// Statistics for the pending call table
#[derive(Debug, Default)]
pub struct PendingStats {
    /// Total calls registered
    pub total_registered: AtomicU64,
    /// Calls resolved with a decoded reply
    pub total_completed: AtomicU64,
    /// Calls failed after a reply arrived (decode errors)
    pub total_failed: AtomicU64,
    /// Calls evicted by the timeout sweep
    pub total_timeouts: AtomicU64,
    /// Calls withdrawn before publishing or on shutdown
    pub total_cancelled: AtomicU64,
    /// Replies that matched no pending call
    pub total_unmatched: AtomicU64,
}

impl PendingStats {
    pub fn record(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PendingStatsSnapshot {
        PendingStatsSnapshot {
            registered: self.total_registered.load(Ordering::Relaxed),
            completed: self.total_completed.load(Ordering::Relaxed),
            failed: self.total_failed.load(Ordering::Relaxed),
            timeouts: self.total_timeouts.load(Ordering::Relaxed),
            cancelled: self.total_cancelled.load(Ordering::Relaxed),
            unmatched: self.total_unmatched.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`PendingStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingStatsSnapshot {
    pub registered: u64,
    pub completed: u64,
    pub failed: u64,
    pub timeouts: u64,
    pub cancelled: u64,
    pub unmatched: u64,
}

/// Table of in-flight calls keyed by correlation id.
pub struct PendingCallTable {
    pending: DashMap<CorrelationId, PendingCall>,
    stats: Arc<PendingStats>,
}

impl PendingCallTable {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
            stats: Arc::new(PendingStats::default()),
        }
    }

    /// Register a call. Fails if the id is already pending.
    pub fn register(&self, correlation_id: CorrelationId, call: PendingCall) -> Result<(), RpcError> {
        match self.pending.entry(correlation_id) {
            Entry::Occupied(entry) => Err(RpcError::DuplicateCorrelationId(
                entry.key().to_string(),
            )),
            Entry::Vacant(entry) => {
                debug!(
                    correlation_id = %entry.key(),
                    routing_key = %call.routing_key,
                    "Registered pending call"
                );
                entry.insert(call);
                PendingStats::record(&self.stats.total_registered);
                Ok(())
            }
        }
    }

    /// Remove a call so its completion can be resolved.
    pub fn take(&self, correlation_id: &CorrelationId) -> Option<PendingCall> {
        self.pending.remove(correlation_id).map(|(_, call)| call)
    }

    /// Withdraw a call without resolving it.
    ///
    /// Returns false if something else already removed it.
    pub fn cancel(&self, correlation_id: &CorrelationId) -> bool {
        let removed = self.pending.remove(correlation_id).is_some();
        if removed {
            PendingStats::record(&self.stats.total_cancelled);
            debug!(correlation_id = %correlation_id, "Cancelled pending call");
        }
        removed
    }

    /// Remove every call whose deadline has passed at `now`.
    pub fn remove_expired(&self, now: Instant) -> Vec<(CorrelationId, PendingCall)> {
        let expired_ids: Vec<CorrelationId> = self
            .pending
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();

        // Re-checked under the shard lock in case a reply won the race.
        let expired: Vec<_> = expired_ids
            .into_iter()
            .filter_map(|id| self.pending.remove_if(&id, |_, call| call.is_expired(now)))
            .collect();

        for _ in &expired {
            PendingStats::record(&self.stats.total_timeouts);
        }
        expired
    }

    /// Remove every call.
    pub fn drain(&self) -> Vec<(CorrelationId, PendingCall)> {
        let ids: Vec<CorrelationId> = self.pending.iter().map(|e| e.key().clone()).collect();
        let drained: Vec<_> = ids
            .into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .collect();
        for _ in &drained {
            PendingStats::record(&self.stats.total_cancelled);
        }
        drained
    }

    /// Get number of currently pending calls
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Check if a correlation ID is pending
    pub fn is_pending(&self, correlation_id: &CorrelationId) -> bool {
        self.pending.contains_key(correlation_id)
    }

    pub fn stats(&self) -> &PendingStats {
        &self.stats
    }
}

impl Default for PendingCallTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn call(timeout: Option<Duration>) -> PendingCall {
        PendingCall::new(Completion::new(|_| {}), timeout, "rpc", "add")
    }

    #[test]
    fn test_register_and_take() {
        let table = PendingCallTable::new();
        let id = CorrelationId::new();

        table.register(id.clone(), call(None)).unwrap();
        assert!(table.is_pending(&id));
        assert_eq!(table.pending_count(), 1);

        let taken = table.take(&id).unwrap();
        assert_eq!(taken.routing_key(), "add");
        assert!(table.take(&id).is_none());
        assert_eq!(table.pending_count(), 0);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let table = PendingCallTable::new();
        let id = CorrelationId::parse("same").unwrap();

        table.register(id.clone(), call(None)).unwrap();
        let err = table.register(id, call(None)).unwrap_err();
        assert_eq!(err, RpcError::DuplicateCorrelationId("same".into()));
        assert_eq!(table.pending_count(), 1);
        assert_eq!(table.stats().snapshot().registered, 1);
    }

    #[test]
    fn test_cancel_removes_once() {
        let table = PendingCallTable::new();
        let id = CorrelationId::new();
        table.register(id.clone(), call(None)).unwrap();

        assert!(table.cancel(&id));
        assert!(!table.cancel(&id));
        assert_eq!(table.stats().snapshot().cancelled, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_expired() {
        let table = PendingCallTable::new();
        let short = CorrelationId::new();
        let long = CorrelationId::new();
        let never = CorrelationId::new();

        table
            .register(short.clone(), call(Some(Duration::from_millis(100))))
            .unwrap();
        table
            .register(long.clone(), call(Some(Duration::from_secs(10))))
            .unwrap();
        table.register(never.clone(), call(None)).unwrap();

        tokio::time::advance(Duration::from_millis(150)).await;
        let expired = table.remove_expired(Instant::now());

        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, short);
        assert!(table.is_pending(&long));
        assert!(table.is_pending(&never));
        assert_eq!(table.stats().snapshot().timeouts, 1);
    }

    #[test]
    fn test_drain() {
        let table = PendingCallTable::new();
        for _ in 0..5 {
            table.register(CorrelationId::new(), call(None)).unwrap();
        }
        assert_eq!(table.drain().len(), 5);
        assert_eq!(table.pending_count(), 0);
    }

    proptest! {
        // Each reply, in any order, resolves exactly its own call.
        #[test]
        fn prop_replies_match_by_id(order in Just((0..16usize).collect::<Vec<_>>()).prop_shuffle()) {
            let table = PendingCallTable::new();
            let (tx, rx) = std::sync::mpsc::channel();
            let ids: Vec<CorrelationId> = (0..16).map(|_| CorrelationId::new()).collect();

            for (i, id) in ids.iter().enumerate() {
                let tx = tx.clone();
                let completion = Completion::new(move |value| {
                    tx.send((i, value)).unwrap();
                });
                table
                    .register(id.clone(), PendingCall::new(completion, None, "rpc", "echo"))
                    .unwrap();
            }

            for &i in &order {
                let call = table.take(&ids[i]).unwrap();
                call.into_completion().succeed(json!({ "n": i }));
                prop_assert!(table.take(&ids[i]).is_none());
            }

            drop(tx);
            let results: Vec<(usize, serde_json::Value)> = rx.iter().collect();
            prop_assert_eq!(results.len(), 16);
            for (i, value) in results {
                prop_assert_eq!(value, json!({ "n": i }));
            }
            prop_assert_eq!(table.pending_count(), 0);
        }
    }
}
