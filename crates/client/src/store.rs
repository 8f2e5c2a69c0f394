//! Persistent store interface.
//!
//! The engine persists replaceable events (and confirmed-absent markers)
//! through this trait; the concrete backend lives outside the crate.
//! Read failures are treated as cache misses by every caller, never as
//! operation failures.

use crate::error::Result;
use async_trait::async_trait;
use driftline_core::{Coordinate, Event};
use parking_lot::RwLock;
use std::collections::HashMap;

/// What the store knows about a replaceable coordinate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredEntry {
    /// The latest known version.
    Event(Event),
    /// A fetch completed and found nothing; remembered so the next
    /// lookup does not hit the network again.
    ConfirmedAbsent,
}

/// Key-value persistence consumed by the replaceable-event store and the
/// favorite-relays cache.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Look up the stored entry for a coordinate.
    async fn get_replaceable(&self, coordinate: &Coordinate) -> Result<Option<StoredEntry>>;

    /// Record the latest version of a replaceable event.
    async fn put_replaceable(&self, event: &Event) -> Result<()>;

    /// Record that a fetch for this coordinate found nothing.
    async fn put_absent(&self, coordinate: &Coordinate) -> Result<()>;

    /// All stored replaceable events, for cache warm-up at startup.
    async fn iter_replaceable(&self) -> Result<Vec<Event>>;

    /// Cached favorite-relay URLs for a pubkey's follows.
    async fn get_favorite_relays(&self, pubkey: &str) -> Result<Option<Vec<String>>>;

    /// Cache favorite-relay URLs for a pubkey's follows.
    async fn put_favorite_relays(&self, pubkey: &str, relays: &[String]) -> Result<()>;
}

/// In-memory reference implementation, also used in tests.
#[derive(Default)]
pub struct MemoryStore {
    replaceable: RwLock<HashMap<Coordinate, StoredEntry>>,
    favorite_relays: RwLock<HashMap<String, Vec<String>>>,
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn get_replaceable(&self, coordinate: &Coordinate) -> Result<Option<StoredEntry>> {
        Ok(self.replaceable.read().get(coordinate).cloned())
    }

    async fn put_replaceable(&self, event: &Event) -> Result<()> {
        if let Some(coordinate) = Coordinate::from_event(event) {
            self.replaceable
                .write()
                .insert(coordinate, StoredEntry::Event(event.clone()));
        }
        Ok(())
    }

    async fn put_absent(&self, coordinate: &Coordinate) -> Result<()> {
        self.replaceable
            .write()
            .insert(coordinate.clone(), StoredEntry::ConfirmedAbsent);
        Ok(())
    }

    async fn iter_replaceable(&self) -> Result<Vec<Event>> {
        Ok(self
            .replaceable
            .read()
            .values()
            .filter_map(|entry| match entry {
                StoredEntry::Event(event) => Some(event.clone()),
                StoredEntry::ConfirmedAbsent => None,
            })
            .collect())
    }

    async fn get_favorite_relays(&self, pubkey: &str) -> Result<Option<Vec<String>>> {
        Ok(self.favorite_relays.read().get(pubkey).cloned())
    }

    async fn put_favorite_relays(&self, pubkey: &str, relays: &[String]) -> Result<()> {
        self.favorite_relays
            .write()
            .insert(pubkey.to_string(), relays.to_vec());
        Ok(())
    }
}
