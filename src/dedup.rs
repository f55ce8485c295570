//! Single-flight request deduplication.
//!
//! Collapses N concurrent, syntactically identical requests into one
//! execution. The first caller to register a key becomes the leader and
//! runs the request; everyone else subscribes to the leader's outcome and
//! never executes. The pending entry is removed unconditionally when the
//! flight ends, whatever the ending looks like, so the map cannot leak.
//!
//! The map is purely in-process state. Requests sharing a key are ordered
//! only by "first to register wins"; there is no ordering across keys.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// The shared result of one coalesced execution.
///
/// Success and failure travel the same way: a 500 from the real execution
/// is delivered verbatim to every waiter, and no waiter retries on its own.
#[derive(Debug, Clone)]
pub struct DedupOutcome {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

/// Why a waiter came back empty-handed.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DedupWaitError {
    /// The leader's task ended without publishing an outcome.
    #[error("coalesced execution ended without a result")]
    LeaderVanished,
    /// The wait exceeded the configured bound.
    #[error("timed out waiting for the coalesced execution")]
    Timeout,
}

/// Role assigned to a caller for one key.
pub enum Flight {
    /// This caller executes the request and publishes the outcome.
    Leader(FlightGuard),
    /// This caller waits for the leader's outcome.
    Follower(broadcast::Receiver<DedupOutcome>),
}

type PendingMap = Arc<DashMap<String, broadcast::Sender<DedupOutcome>>>;

/// Single-flight map of in-flight request keys.
pub struct DeduplicationCoordinator {
    pending: PendingMap,
    wait_timeout: Duration,
}

impl DeduplicationCoordinator {
    pub fn new(wait_timeout: Duration) -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
            wait_timeout,
        }
    }

    /// Register interest in `key` and learn this caller's role.
    pub fn begin(&self, key: &str) -> Flight {
        use dashmap::mapref::entry::Entry;

        match self.pending.entry(key.to_string()) {
            Entry::Occupied(occupied) => {
                trace!(key = %key, "joining in-flight request");
                Flight::Follower(occupied.get().subscribe())
            }
            Entry::Vacant(vacant) => {
                let (tx, _) = broadcast::channel(1);
                vacant.insert(tx.clone());
                trace!(key = %key, "registered as flight leader");
                Flight::Leader(FlightGuard {
                    pending: self.pending.clone(),
                    key: key.to_string(),
                    tx,
                    completed: false,
                })
            }
        }
    }

    /// Await the leader's outcome, bounded by the configured timeout.
    pub async fn wait(
        &self,
        mut rx: broadcast::Receiver<DedupOutcome>,
    ) -> Result<DedupOutcome, DedupWaitError> {
        match tokio::time::timeout(self.wait_timeout, rx.recv()).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(DedupWaitError::LeaderVanished),
            Err(_) => Err(DedupWaitError::Timeout),
        }
    }

    /// Number of executions currently in flight.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }
}

/// Leader-side handle for one flight.
///
/// Dropping the guard without calling [`FlightGuard::complete`] still
/// removes the pending entry, so a panicking or cancelled leader cannot
/// strand its followers behind a stale key.
pub struct FlightGuard {
    pending: PendingMap,
    key: String,
    tx: broadcast::Sender<DedupOutcome>,
    completed: bool,
}

impl FlightGuard {
    /// Publish the outcome to every follower and retire the key.
    pub fn complete(mut self, outcome: DedupOutcome) {
        self.pending.remove(&self.key);
        self.completed = true;
        let delivered = self.tx.send(outcome).unwrap_or(0);
        debug!(key = %self.key, followers = delivered, "flight completed");
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if !self.completed {
            self.pending.remove(&self.key);
        }
    }
}

/// Default idempotency key: method, path, caller identity, and body digest.
///
/// Two requests get the same key only when they are syntactically identical
/// and come from the same principal.
pub fn request_key(method: &str, path: &str, identity: &str, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_bytes());
    hasher.update(b"\n");
    hasher.update(path.as_bytes());
    hasher.update(b"\n");
    hasher.update(identity.as_bytes());
    hasher.update(b"\n");
    hasher.update(body);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(status: u16, body: &str) -> DedupOutcome {
        DedupOutcome {
            status,
            content_type: Some("application/json".into()),
            body: body.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_execution() {
        let coordinator = Arc::new(DeduplicationCoordinator::new(Duration::from_secs(5)));

        let guard = match coordinator.begin("key-1") {
            Flight::Leader(guard) => guard,
            Flight::Follower(_) => panic!("first caller must lead"),
        };

        // Every subsequent caller joins the same flight.
        let mut waiters = Vec::new();
        for _ in 0..4 {
            match coordinator.begin("key-1") {
                Flight::Leader(_) => panic!("only one leader per key"),
                Flight::Follower(rx) => waiters.push(rx),
            }
        }
        assert_eq!(coordinator.in_flight(), 1);

        let handles: Vec<_> = waiters
            .into_iter()
            .map(|rx| {
                let c = coordinator.clone();
                tokio::spawn(async move { c.wait(rx).await })
            })
            .collect();

        guard.complete(outcome(200, r#"{"ok":true}"#));

        for handle in handles {
            let received = handle.await.unwrap().unwrap();
            assert_eq!(received.status, 200);
            assert_eq!(received.body, br#"{"ok":true}"#);
        }
        assert_eq!(coordinator.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_fresh_execution_after_completion() {
        let coordinator = DeduplicationCoordinator::new(Duration::from_secs(5));

        match coordinator.begin("key-1") {
            Flight::Leader(guard) => guard.complete(outcome(200, "first")),
            Flight::Follower(_) => panic!("expected leader"),
        }

        // The key is retired, so the next caller executes for real.
        assert!(matches!(coordinator.begin("key-1"), Flight::Leader(_)));
    }

    #[tokio::test]
    async fn test_failure_outcome_propagates_to_waiters() {
        let coordinator = DeduplicationCoordinator::new(Duration::from_secs(5));

        let guard = match coordinator.begin("key-1") {
            Flight::Leader(guard) => guard,
            Flight::Follower(_) => panic!("expected leader"),
        };
        let rx = match coordinator.begin("key-1") {
            Flight::Follower(rx) => rx,
            Flight::Leader(_) => panic!("expected follower"),
        };

        guard.complete(outcome(502, r#"{"error":"upstream"}"#));

        let received = coordinator.wait(rx).await.unwrap();
        assert_eq!(received.status, 502);
    }

    #[tokio::test]
    async fn test_dropped_leader_does_not_strand_followers() {
        let coordinator = DeduplicationCoordinator::new(Duration::from_secs(5));

        let guard = match coordinator.begin("key-1") {
            Flight::Leader(guard) => guard,
            Flight::Follower(_) => panic!("expected leader"),
        };
        let rx = match coordinator.begin("key-1") {
            Flight::Follower(rx) => rx,
            Flight::Leader(_) => panic!("expected follower"),
        };

        drop(guard);

        assert_eq!(
            coordinator.wait(rx).await.unwrap_err(),
            DedupWaitError::LeaderVanished
        );
        assert_eq!(coordinator.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_distinct_keys_fly_independently() {
        let coordinator = DeduplicationCoordinator::new(Duration::from_secs(5));

        assert!(matches!(coordinator.begin("key-a"), Flight::Leader(_)));
        assert!(matches!(coordinator.begin("key-b"), Flight::Leader(_)));
    }

    #[test]
    fn test_request_key_sensitivity() {
        let base = request_key("POST", "/api/chat", "user-7", b"{\"q\":\"hi\"}");
        assert_eq!(
            base,
            request_key("POST", "/api/chat", "user-7", b"{\"q\":\"hi\"}")
        );
        assert_ne!(base, request_key("PUT", "/api/chat", "user-7", b"{\"q\":\"hi\"}"));
        assert_ne!(base, request_key("POST", "/api/chat", "user-8", b"{\"q\":\"hi\"}"));
        assert_ne!(base, request_key("POST", "/api/chat", "user-7", b"{}"));
    }
}
