//! Connection pool: one persistent connection per normalized relay URL.
//!
//! `ensure_connection` is idempotent and failure-tolerant: an unreachable
//! relay yields `None` after a bounded timeout instead of an error, so a
//! multi-relay operation is never aborted by one bad relay. The pool also
//! tracks which relays delivered which events (seen-on), used later to
//! pick hint relays when encoding pointers.

use crate::error::{ClientError, Result};
use crate::relay::RelayConnection;
use crate::signer::Signer;
use crate::transport::Transport;
use dashmap::DashMap;
use driftline_core::{Event, is_auth_required_error, normalize_relay_url};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Bound on relay connection attempts.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Which relays have been observed delivering which events.
///
/// Purely additive within a session; never pruned automatically.
#[derive(Default)]
pub struct SeenTracker {
    seen: RwLock<HashMap<String, HashSet<String>>>,
}

impl SeenTracker {
    pub fn record(&self, event_id: &str, url: &str) {
        self.seen
            .write()
            .entry(event_id.to_string())
            .or_default()
            .insert(url.to_string());
    }

    /// Relays that delivered this event, in arbitrary order.
    pub fn seen_on(&self, event_id: &str) -> Vec<String> {
        self.seen
            .read()
            .get(event_id)
            .map(|urls| urls.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Manages connections to many relays.
pub struct ConnectionPool {
    transport: Arc<dyn Transport>,
    connections: DashMap<String, Arc<RelayConnection>>,
    // Per-URL gate so concurrent ensure_connection calls share one attempt.
    connect_gates: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    seen: Arc<SeenTracker>,
    connect_timeout: Duration,
}

impl ConnectionPool {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_timeout(transport, CONNECT_TIMEOUT)
    }

    pub fn with_timeout(transport: Arc<dyn Transport>, connect_timeout: Duration) -> Self {
        Self {
            transport,
            connections: DashMap::new(),
            connect_gates: DashMap::new(),
            seen: Arc::new(SeenTracker::default()),
            connect_timeout,
        }
    }

    /// Return the live connection for `url`, establishing one if needed.
    ///
    /// `None` means the relay could not be reached within the connect
    /// timeout (or the URL is invalid); callers treat that as "this relay
    /// contributes nothing" rather than an error.
    pub async fn ensure_connection(&self, url: &str) -> Option<Arc<RelayConnection>> {
        let normalized = match normalize_relay_url(url) {
            Ok(normalized) => normalized,
            Err(e) => {
                warn!(url, error = %e, "ignoring invalid relay url");
                return None;
            }
        };

        if let Some(existing) = self.connections.get(&normalized) {
            if existing.is_connected() {
                return Some(Arc::clone(&existing));
            }
        }

        let gate = self
            .connect_gates
            .entry(normalized.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = gate.lock().await;

        // Another caller may have connected while we waited on the gate.
        if let Some(existing) = self.connections.get(&normalized) {
            if existing.is_connected() {
                return Some(Arc::clone(&existing));
            }
            self.connections.remove(&normalized);
        }

        match timeout(self.connect_timeout, self.transport.open(&normalized)).await {
            Ok(Ok(io)) => {
                debug!(relay = %normalized, "connected");
                let connection =
                    RelayConnection::establish(normalized.clone(), io, Arc::clone(&self.seen));
                self.connections
                    .insert(normalized, Arc::clone(&connection));
                Some(connection)
            }
            Ok(Err(e)) => {
                warn!(relay = %normalized, error = %e, "connection failed");
                None
            }
            Err(_) => {
                warn!(relay = %normalized, timeout = ?self.connect_timeout, "connection timed out");
                None
            }
        }
    }

    /// Publish an event to one relay.
    ///
    /// If the relay rejects with an authentication-required reason and a
    /// signer is available, performs the handshake and retries exactly
    /// once.
    pub async fn publish(
        &self,
        url: &str,
        event: &Event,
        signer: Option<&dyn Signer>,
    ) -> Result<()> {
        let connection = self
            .ensure_connection(url)
            .await
            .ok_or_else(|| ClientError::Connection(format!("could not reach {url}")))?;

        let outcome = connection.publish(event).await?;
        if outcome.accepted {
            return Ok(());
        }

        if is_auth_required_error(&outcome.message) && !connection.has_authed() {
            if let Some(signer) = signer {
                debug!(relay = %connection.url(), "auth required, retrying publish");
                connection.authenticate(signer).await?;
                let retry = connection.publish(event).await?;
                if retry.accepted {
                    return Ok(());
                }
                return Err(ClientError::Rejected(retry.message));
            }
        }

        Err(ClientError::Rejected(outcome.message))
    }

    /// Relays observed delivering `event_id` in this session.
    pub fn seen_on(&self, event_id: &str) -> Vec<String> {
        self.seen.seen_on(event_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ClientMessage, RelayMessage};
    use crate::transport::RelayIo;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Transport whose relays accept every event, counting opens.
    struct CountingTransport {
        opens: AtomicUsize,
    }

    #[async_trait]
    impl Transport for CountingTransport {
        async fn open(&self, _url: &str) -> Result<RelayIo> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let (io, mut out_rx, in_tx) = RelayIo::pipe();
            tokio::spawn(async move {
                while let Some(msg) = out_rx.recv().await {
                    if let ClientMessage::Event(event) = msg {
                        let _ = in_tx.send(RelayMessage::Ok {
                            event_id: event.id,
                            success: true,
                            message: String::new(),
                        });
                    }
                }
            });
            Ok(io)
        }
    }

    /// Transport that never answers.
    struct BlackholeTransport;

    #[async_trait]
    impl Transport for BlackholeTransport {
        async fn open(&self, _url: &str) -> Result<RelayIo> {
            futures::future::pending().await
        }
    }

    fn test_event() -> Event {
        Event {
            id: "5".repeat(64),
            pubkey: "a".repeat(64),
            created_at: 100,
            kind: 1,
            tags: vec![],
            content: String::new(),
            sig: "0".repeat(128),
        }
    }

    #[tokio::test]
    async fn test_ensure_connection_is_idempotent() {
        let transport = Arc::new(CountingTransport {
            opens: AtomicUsize::new(0),
        });
        let pool = ConnectionPool::new(Arc::clone(&transport) as Arc<dyn Transport>);

        let first = pool.ensure_connection("wss://relay.example.com").await;
        let second = pool.ensure_connection("wss://Relay.Example.com/").await;
        assert!(first.is_some());
        assert!(second.is_some());
        // Different spellings of the same relay share one connection.
        assert_eq!(transport.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unreachable_relay_yields_none() {
        let pool = ConnectionPool::with_timeout(
            Arc::new(BlackholeTransport),
            Duration::from_millis(20),
        );
        assert!(pool.ensure_connection("wss://down.example.com").await.is_none());
    }

    #[tokio::test]
    async fn test_invalid_url_yields_none() {
        let pool = ConnectionPool::new(Arc::new(BlackholeTransport));
        assert!(pool.ensure_connection("https://not-a-relay").await.is_none());
    }

    #[tokio::test]
    async fn test_publish_accepted() {
        let pool = ConnectionPool::new(Arc::new(CountingTransport {
            opens: AtomicUsize::new(0),
        }));
        pool.publish("wss://relay.example.com", &test_event(), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_seen_tracker() {
        let tracker = SeenTracker::default();
        tracker.record("id1", "wss://a.example.com");
        tracker.record("id1", "wss://b.example.com");
        tracker.record("id1", "wss://a.example.com");

        let mut seen = tracker.seen_on("id1");
        seen.sort();
        assert_eq!(seen, vec!["wss://a.example.com", "wss://b.example.com"]);
        assert!(tracker.seen_on("missing").is_empty());
    }
}
