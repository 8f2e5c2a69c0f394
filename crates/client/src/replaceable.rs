//! Replaceable-event store.
//!
//! Per-coordinate cache of the current version of replaceable and
//! addressable events (profiles, relay lists, follow lists, mute lists),
//! backed by the persistent store and by batched queries against the
//! index relays. Every write path goes through [`ReplaceableStore::accept_if_newer`],
//! so a cached value only ever advances in the replaceable order: an
//! in-flight network result can never overwrite a newer version that
//! arrived through `update` while it was loading.
//!
//! Lookups for many coordinates issued within one scheduling window
//! coalesce into grouped relay queries: plain replaceable coordinates
//! group by kind (one filter with many authors), addressable coordinates
//! group by author (one filter with many `#d` values).

use crate::batch::{BatchConfig, BatchQueue, BatchRunner};
use crate::error::Result;
use crate::store::{EventStore, StoredEntry};
use crate::message::Filter;
use crate::subscription::SubscriptionMultiplexer;
use driftline_core::{Coordinate, Event, replaceable_order};
use parking_lot::{Mutex, RwLock};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Cache of current replaceable-event versions, one slot per coordinate.
pub struct ReplaceableStore {
    store: Arc<dyn EventStore>,
    // A resolved slot: Some(current version) or None (confirmed absent).
    cache: RwLock<HashMap<Coordinate, Option<Event>>>,
    // Waiters piggybacking on a lookup already in flight.
    in_flight: Mutex<HashMap<Coordinate, Vec<oneshot::Sender<Option<Event>>>>>,
    plain_queue: BatchQueue<Coordinate, Option<Event>>,
    addressable_queue: BatchQueue<Coordinate, Option<Event>>,
}

impl ReplaceableStore {
    pub fn new(
        mux: Arc<SubscriptionMultiplexer>,
        store: Arc<dyn EventStore>,
        index_relays: Vec<String>,
        batch_config: BatchConfig,
    ) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            plain_queue: BatchQueue::new(
                batch_config.clone(),
                plain_runner(Arc::clone(&mux), index_relays.clone()),
            ),
            addressable_queue: BatchQueue::new(
                batch_config,
                addressable_runner(mux, index_relays),
            ),
        }
    }

    /// Current version for `coordinate`.
    ///
    /// Checks the in-memory slot, then the persistent store, then the
    /// index relays (batched). `Ok(None)` after a network round trip
    /// means the relays confirmed absence, and that absence is cached;
    /// a failed lookup also yields `Ok(None)` but caches nothing, so
    /// the next call retries.
    pub async fn fetch(&self, coordinate: &Coordinate) -> Result<Option<Event>> {
        if let Some(slot) = self.cache.read().get(coordinate) {
            return Ok(slot.clone());
        }

        // Join an in-flight lookup rather than issuing a second one.
        let waiter = {
            let mut in_flight = self.in_flight.lock();
            if let Some(waiters) = in_flight.get_mut(coordinate) {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                Some(rx)
            } else {
                in_flight.insert(coordinate.clone(), Vec::new());
                None
            }
        };
        if let Some(rx) = waiter {
            return Ok(rx.await.unwrap_or(None));
        }

        let result = self.load(coordinate).await;

        let waiters = self
            .in_flight
            .lock()
            .remove(coordinate)
            .unwrap_or_default();
        for tx in waiters {
            let _ = tx.send(result.clone());
        }
        Ok(result)
    }

    async fn load(&self, coordinate: &Coordinate) -> Option<Event> {
        match self.store.get_replaceable(coordinate).await {
            Ok(Some(StoredEntry::Event(event))) => {
                self.accept_if_newer(event);
                return self.cache.read().get(coordinate).cloned().flatten();
            }
            Ok(Some(StoredEntry::ConfirmedAbsent)) => {
                self.cache
                    .write()
                    .entry(coordinate.clone())
                    .or_insert(None);
                return self.cache.read().get(coordinate).cloned().flatten();
            }
            Ok(None) => {}
            // A broken store is a cache miss, not a failure.
            Err(e) => warn!(coordinate = %coordinate.to_tag_value(), error = %e, "store read failed"),
        }

        let queue = if coordinate.identifier.is_some() {
            &self.addressable_queue
        } else {
            &self.plain_queue
        };

        match queue.load(coordinate.clone()).await {
            Ok(Some(event)) => {
                if self.accept_if_newer(event.clone()) {
                    if let Err(e) = self.store.put_replaceable(&event).await {
                        warn!(error = %e, "store write failed");
                    }
                }
            }
            Ok(None) => {
                let inserted = {
                    let mut cache = self.cache.write();
                    if cache.contains_key(coordinate) {
                        false
                    } else {
                        cache.insert(coordinate.clone(), None);
                        true
                    }
                };
                if inserted {
                    if let Err(e) = self.store.put_absent(coordinate).await {
                        warn!(error = %e, "store write failed");
                    }
                }
            }
            // Dropped sender: the batch could not reach any relay.
            // Nothing is cached, so the next fetch retries.
            Err(_) => {
                debug!(coordinate = %coordinate.to_tag_value(), "lookup failed, not caching");
                return self.cache.read().get(coordinate).cloned().flatten();
            }
        }

        self.cache.read().get(coordinate).cloned().flatten()
    }

    /// Accept `event` into its slot if it wins the replaceable order
    /// against the current occupant. Returns whether it was accepted.
    pub fn accept_if_newer(&self, event: Event) -> bool {
        let Some(coordinate) = Coordinate::from_event(&event) else {
            return false;
        };
        let mut cache = self.cache.write();
        match cache.get(&coordinate) {
            Some(Some(current)) if replaceable_order(&event, current) != Ordering::Greater => false,
            _ => {
                cache.insert(coordinate, Some(event));
                true
            }
        }
    }

    /// Prime the slot with a locally known version (typically one just
    /// published) and persist it if it won.
    pub async fn update(&self, event: &Event) -> Result<()> {
        if self.accept_if_newer(event.clone()) {
            self.store.put_replaceable(event).await?;
        }
        Ok(())
    }

    /// Drop the slot and fetch straight from the index relays, bypassing
    /// both caches. The fetched value is accepted unconditionally.
    pub async fn refresh(&self, coordinate: &Coordinate) -> Result<Option<Event>> {
        self.cache.write().remove(coordinate);

        let queue = if coordinate.identifier.is_some() {
            &self.addressable_queue
        } else {
            &self.plain_queue
        };

        match queue.load(coordinate.clone()).await {
            Ok(Some(event)) => {
                self.cache
                    .write()
                    .insert(coordinate.clone(), Some(event.clone()));
                self.store.put_replaceable(&event).await?;
                Ok(Some(event))
            }
            Ok(None) => {
                self.cache.write().insert(coordinate.clone(), None);
                self.store.put_absent(coordinate).await?;
                Ok(None)
            }
            Err(_) => Ok(None),
        }
    }

    /// Seed slots from everything the persistent store holds.
    pub async fn warm_up(&self) -> Result<()> {
        let events = self.store.iter_replaceable().await?;
        let count = events.len();
        for event in events {
            self.accept_if_newer(event);
        }
        debug!(count, "warmed up replaceable cache");
        Ok(())
    }

    /// Cached value, if the slot is resolved. No I/O.
    pub fn cached(&self, coordinate: &Coordinate) -> Option<Option<Event>> {
        self.cache.read().get(coordinate).cloned()
    }
}

/// Pick the winner per coordinate out of a query result.
fn winners_by_coordinate(events: Vec<Event>) -> HashMap<Coordinate, Event> {
    let mut winners: HashMap<Coordinate, Event> = HashMap::new();
    for event in events {
        let Some(coordinate) = Coordinate::from_event(&event) else {
            continue;
        };
        match winners.get(&coordinate) {
            Some(current) if replaceable_order(&event, current) != Ordering::Greater => {}
            _ => {
                winners.insert(coordinate, event);
            }
        }
    }
    winners
}

/// Batch runner for plain replaceable coordinates: one filter per kind,
/// authors merged. A failed group omits its keys so their loads fail
/// without poisoning the rest of the batch.
fn plain_runner(
    mux: Arc<SubscriptionMultiplexer>,
    relays: Vec<String>,
) -> BatchRunner<Coordinate, Option<Event>> {
    Arc::new(move |keys: Vec<Coordinate>| {
        let mux = Arc::clone(&mux);
        let relays = relays.clone();
        Box::pin(async move {
            let mut groups: HashMap<u16, Vec<Coordinate>> = HashMap::new();
            for key in keys {
                groups.entry(key.kind).or_default().push(key);
            }

            let mut results = HashMap::new();
            for (kind, group) in groups {
                let authors: Vec<String> =
                    group.iter().map(|c| c.pubkey.clone()).collect();
                let filter = Filter::new()
                    .kinds(vec![kind])
                    .authors(authors)
                    .limit(group.len() as u64);

                match mux.query(&relays, vec![filter]).await {
                    Ok(events) => {
                        let mut winners = winners_by_coordinate(events);
                        for key in group {
                            let winner = winners.remove(&key);
                            results.insert(key, winner);
                        }
                    }
                    Err(e) => {
                        warn!(kind, error = %e, "replaceable batch query failed");
                    }
                }
            }
            results
        })
    })
}

/// Batch runner for addressable coordinates: one filter per author,
/// kinds and `#d` identifiers merged.
fn addressable_runner(
    mux: Arc<SubscriptionMultiplexer>,
    relays: Vec<String>,
) -> BatchRunner<Coordinate, Option<Event>> {
    Arc::new(move |keys: Vec<Coordinate>| {
        let mux = Arc::clone(&mux);
        let relays = relays.clone();
        Box::pin(async move {
            let mut groups: HashMap<String, Vec<Coordinate>> = HashMap::new();
            for key in keys {
                groups.entry(key.pubkey.clone()).or_default().push(key);
            }

            let mut results = HashMap::new();
            for (pubkey, group) in groups {
                let kinds: Vec<u16> = {
                    let mut kinds: Vec<u16> = group.iter().map(|c| c.kind).collect();
                    kinds.sort_unstable();
                    kinds.dedup();
                    kinds
                };
                let identifiers: Vec<String> = group
                    .iter()
                    .filter_map(|c| c.identifier.clone())
                    .collect();
                let filter = Filter::new()
                    .authors(vec![pubkey.clone()])
                    .kinds(kinds)
                    .tag("d", identifiers)
                    .limit(group.len() as u64);

                match mux.query(&relays, vec![filter]).await {
                    Ok(events) => {
                        let mut winners = winners_by_coordinate(events);
                        for key in group {
                            let winner = winners.remove(&key);
                            results.insert(key, winner);
                        }
                    }
                    Err(e) => {
                        warn!(author = %pubkey, error = %e, "addressable batch query failed");
                    }
                }
            }
            results
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result as ClientResult;
    use crate::message::{ClientMessage, RelayMessage};
    use crate::pool::ConnectionPool;
    use crate::store::MemoryStore;
    use crate::transport::{RelayIo, Transport};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::time::Duration;

    /// Serves a fixed set of events to every REQ, counting queries.
    struct IndexTransport {
        events: Vec<Event>,
        queries: Arc<AtomicUsize>,
        unreachable: bool,
    }

    #[async_trait]
    impl Transport for IndexTransport {
        async fn open(&self, _url: &str) -> ClientResult<RelayIo> {
            if self.unreachable {
                futures::future::pending::<()>().await;
            }
            let events = self.events.clone();
            let queries = Arc::clone(&self.queries);
            let (io, mut out_rx, in_tx) = RelayIo::pipe();
            tokio::spawn(async move {
                while let Some(msg) = out_rx.recv().await {
                    if let ClientMessage::Req {
                        subscription_id, ..
                    } = msg
                    {
                        queries.fetch_add(1, AtomicOrdering::SeqCst);
                        for event in &events {
                            let _ = in_tx.send(RelayMessage::Event {
                                subscription_id: subscription_id.clone(),
                                event: event.clone(),
                            });
                        }
                        let _ = in_tx.send(RelayMessage::Eose { subscription_id });
                    }
                }
            });
            Ok(io)
        }
    }

    fn relay_list_event(pubkey: &str, id_char: char, created_at: u64) -> Event {
        Event {
            id: id_char.to_string().repeat(64),
            pubkey: pubkey.to_string(),
            created_at,
            kind: 10002,
            tags: vec![],
            content: String::new(),
            sig: "0".repeat(128),
        }
    }

    fn build_store(
        transport: IndexTransport,
        store: Arc<dyn EventStore>,
    ) -> ReplaceableStore {
        let pool = Arc::new(ConnectionPool::with_timeout(
            Arc::new(transport),
            Duration::from_millis(50),
        ));
        let mux = Arc::new(SubscriptionMultiplexer::new(pool, None));
        ReplaceableStore::new(
            mux,
            store,
            vec!["wss://index.example.com".to_string()],
            BatchConfig::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_resolves_newest_and_caches() {
        let pubkey = "a".repeat(64);
        let queries = Arc::new(AtomicUsize::new(0));
        let store = build_store(
            IndexTransport {
                events: vec![
                    relay_list_event(&pubkey, '1', 100),
                    relay_list_event(&pubkey, '2', 200),
                ],
                queries: Arc::clone(&queries),
                unreachable: false,
            },
            Arc::new(MemoryStore::default()),
        );

        let coordinate = Coordinate::new(10002, pubkey);
        let first = store.fetch(&coordinate).await.unwrap().unwrap();
        assert_eq!(first.created_at, 200);

        // Second fetch is served from the slot.
        let second = store.fetch(&coordinate).await.unwrap().unwrap();
        assert_eq!(second.created_at, 200);
        assert_eq!(queries.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_fetches_share_one_query() {
        let pubkey = "a".repeat(64);
        let queries = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(build_store(
            IndexTransport {
                events: vec![relay_list_event(&pubkey, '1', 100)],
                queries: Arc::clone(&queries),
                unreachable: false,
            },
            Arc::new(MemoryStore::default()),
        ));

        let coordinate = Coordinate::new(10002, pubkey);
        let (a, b) = tokio::join!(store.fetch(&coordinate), store.fetch(&coordinate));
        assert!(a.unwrap().is_some());
        assert!(b.unwrap().is_some());
        assert_eq!(queries.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_absence_is_cached() {
        let queries = Arc::new(AtomicUsize::new(0));
        let persistent = Arc::new(MemoryStore::default());
        let store = build_store(
            IndexTransport {
                events: vec![],
                queries: Arc::clone(&queries),
                unreachable: false,
            },
            Arc::clone(&persistent) as Arc<dyn EventStore>,
        );

        let coordinate = Coordinate::new(10002, "b".repeat(64));
        assert_eq!(store.fetch(&coordinate).await.unwrap(), None);
        assert_eq!(store.fetch(&coordinate).await.unwrap(), None);
        assert_eq!(queries.load(AtomicOrdering::SeqCst), 1);
        // The absence marker was persisted.
        assert_eq!(
            persistent.get_replaceable(&coordinate).await.unwrap(),
            Some(StoredEntry::ConfirmedAbsent)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_relays_do_not_cache_absence() {
        let queries = Arc::new(AtomicUsize::new(0));
        let store = build_store(
            IndexTransport {
                events: vec![],
                queries: Arc::clone(&queries),
                unreachable: true,
            },
            Arc::new(MemoryStore::default()),
        );

        let coordinate = Coordinate::new(10002, "b".repeat(64));
        assert_eq!(store.fetch(&coordinate).await.unwrap(), None);
        // Nothing resolved, so the slot stays empty and a retry is allowed.
        assert_eq!(store.cached(&coordinate), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_wins_over_in_flight_result() {
        let pubkey = "a".repeat(64);
        let queries = Arc::new(AtomicUsize::new(0));
        let store = build_store(
            IndexTransport {
                events: vec![relay_list_event(&pubkey, '1', 100)],
                queries: Arc::clone(&queries),
                unreachable: false,
            },
            Arc::new(MemoryStore::default()),
        );

        let coordinate = Coordinate::new(10002, pubkey.clone());
        let _ = store.fetch(&coordinate).await.unwrap();

        // A locally published newer version replaces the fetched one.
        let newer = relay_list_event(&pubkey, '2', 600);
        store.update(&newer).await.unwrap();
        assert_eq!(store.fetch(&coordinate).await.unwrap().unwrap().created_at, 600);

        // An older version arriving later is ignored.
        let older = relay_list_event(&pubkey, '3', 300);
        store.update(&older).await.unwrap();
        assert_eq!(store.fetch(&coordinate).await.unwrap().unwrap().created_at, 600);
    }

    #[tokio::test(start_paused = true)]
    async fn test_smaller_id_wins_timestamp_tie() {
        let pubkey = "a".repeat(64);
        let store = build_store(
            IndexTransport {
                events: vec![
                    relay_list_event(&pubkey, '9', 100),
                    relay_list_event(&pubkey, '2', 100),
                ],
                queries: Arc::new(AtomicUsize::new(0)),
                unreachable: false,
            },
            Arc::new(MemoryStore::default()),
        );

        let coordinate = Coordinate::new(10002, pubkey);
        let winner = store.fetch(&coordinate).await.unwrap().unwrap();
        assert_eq!(winner.id, "2".repeat(64));
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_hit_skips_network() {
        let pubkey = "a".repeat(64);
        let queries = Arc::new(AtomicUsize::new(0));
        let persistent = Arc::new(MemoryStore::default());
        persistent
            .put_replaceable(&relay_list_event(&pubkey, '1', 100))
            .await
            .unwrap();

        let store = build_store(
            IndexTransport {
                events: vec![],
                queries: Arc::clone(&queries),
                unreachable: false,
            },
            persistent,
        );

        let coordinate = Coordinate::new(10002, pubkey);
        assert!(store.fetch(&coordinate).await.unwrap().is_some());
        assert_eq!(queries.load(AtomicOrdering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_warm_up_seeds_slots() {
        let pubkey = "a".repeat(64);
        let persistent = Arc::new(MemoryStore::default());
        persistent
            .put_replaceable(&relay_list_event(&pubkey, '1', 100))
            .await
            .unwrap();

        let store = build_store(
            IndexTransport {
                events: vec![],
                queries: Arc::new(AtomicUsize::new(0)),
                unreachable: false,
            },
            persistent,
        );
        store.warm_up().await.unwrap();

        let coordinate = Coordinate::new(10002, pubkey);
        assert!(store.cached(&coordinate).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_bypasses_slot() {
        let pubkey = "a".repeat(64);
        let queries = Arc::new(AtomicUsize::new(0));
        let store = build_store(
            IndexTransport {
                events: vec![relay_list_event(&pubkey, '1', 100)],
                queries: Arc::clone(&queries),
                unreachable: false,
            },
            Arc::new(MemoryStore::default()),
        );

        let coordinate = Coordinate::new(10002, pubkey);
        let _ = store.fetch(&coordinate).await.unwrap();
        let refreshed = store.refresh(&coordinate).await.unwrap();
        assert!(refreshed.is_some());
        assert_eq!(queries.load(AtomicOrdering::SeqCst), 2);
    }
}
