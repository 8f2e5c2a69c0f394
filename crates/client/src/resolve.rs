//! Event identity and resolution.
//!
//! Turns a permalink-style identifier (raw hex id, `note1...`,
//! `nevent1...`, `naddr1...`) into an event, trying the cheapest source
//! first: the in-memory caches, then a batched lookup against the index
//! relays, then the pointer's own relay hints, then the author's
//! published write relays. A successful resolution lands in the event
//! cache, so resolving the same identifier twice never refetches; a
//! failed one is not remembered, so the next call retries.

use crate::batch::{BatchConfig, BatchQueue, BatchRunner};
use crate::cache::EventCache;
use crate::error::Result;
use crate::message::Filter;
use crate::replaceable::ReplaceableStore;
use crate::subscription::SubscriptionMultiplexer;
use driftline_core::{
    AddressPointer, Coordinate, Event, EventPointer, Nip19Entity, RELAY_LIST_METADATA_KIND,
    RelayListMetadata, is_valid_hex, nip19, normalize_relay_url, timeline_order,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// At most this many of an author's write relays are consulted when
/// resolving through their relay list.
const AUTHOR_RELAY_CAP: usize = 4;

/// A parsed event identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventIdentifier {
    /// Bare 64-hex event id, from raw hex or a `note1...` pointer.
    Id(String),
    /// `nevent1...` pointer with optional relay and author hints.
    Event(EventPointer),
    /// `naddr1...` pointer to an addressable event.
    Address(AddressPointer),
}

impl EventIdentifier {
    /// Parse an identifier. Returns `None` for anything undecodable or
    /// for pointers that do not name an event (`npub`, `nprofile`).
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim().strip_prefix("nostr:").unwrap_or(input.trim());

        if is_valid_hex(input, 64) {
            return Some(Self::Id(input.to_lowercase()));
        }

        match nip19::decode(input).ok()? {
            Nip19Entity::Note(id) => Some(Self::Id(id)),
            Nip19Entity::Event(pointer) => Some(Self::Event(pointer)),
            Nip19Entity::Address(pointer) => Some(Self::Address(pointer)),
            Nip19Entity::Npub(_) | Nip19Entity::Profile(_) => None,
        }
    }
}

/// Resolves identifiers to events.
pub struct EventResolver {
    mux: Arc<SubscriptionMultiplexer>,
    cache: Arc<EventCache>,
    replaceable: Arc<ReplaceableStore>,
    index_relays: Vec<String>,
    // Coalesces concurrent by-id lookups into one index-relay query.
    id_queue: BatchQueue<String, Event>,
}

impl EventResolver {
    pub fn new(
        mux: Arc<SubscriptionMultiplexer>,
        cache: Arc<EventCache>,
        replaceable: Arc<ReplaceableStore>,
        index_relays: Vec<String>,
        batch_config: BatchConfig,
    ) -> Self {
        let id_queue = BatchQueue::new(
            batch_config,
            id_runner(Arc::clone(&mux), index_relays.clone()),
        );
        Self {
            mux,
            cache,
            replaceable,
            index_relays,
            id_queue,
        }
    }

    /// Resolve an identifier string to an event.
    ///
    /// `Ok(None)` covers both a malformed identifier and a genuine miss;
    /// absence is a valid terminal state for callers.
    pub async fn resolve(&self, identifier: &str) -> Result<Option<Event>> {
        match EventIdentifier::parse(identifier) {
            Some(EventIdentifier::Id(id)) => self.resolve_id(&id, &[], None).await,
            Some(EventIdentifier::Event(pointer)) => {
                self.resolve_id(&pointer.id, &pointer.relays, pointer.author.as_deref())
                    .await
            }
            Some(EventIdentifier::Address(pointer)) => self.resolve_address(&pointer).await,
            None => {
                debug!(identifier, "unresolvable identifier");
                Ok(None)
            }
        }
    }

    async fn resolve_id(
        &self,
        id: &str,
        hint_relays: &[String],
        author: Option<&str>,
    ) -> Result<Option<Event>> {
        if let Some(event) = self.cache.get(id) {
            return Ok(Some(event));
        }

        if let Ok(event) = self.id_queue.load(id.to_string()).await {
            self.cache.add(event.clone());
            return Ok(Some(event));
        }

        let hints = self.beyond_index(hint_relays);
        if !hints.is_empty() {
            if let Some(event) = self.fetch_one_by_id(&hints, id).await {
                return Ok(Some(event));
            }
        }

        if let Some(author) = author {
            let author_relays = self.author_write_relays(author).await;
            if !author_relays.is_empty() {
                if let Some(event) = self.fetch_one_by_id(&author_relays, id).await {
                    return Ok(Some(event));
                }
            }
        }

        Ok(None)
    }

    async fn resolve_address(&self, pointer: &AddressPointer) -> Result<Option<Event>> {
        let coordinate = Coordinate::addressable(pointer.kind, &pointer.pubkey, &pointer.identifier);

        if let Some(event) = self.cache.get_by_coordinate(&coordinate) {
            return Ok(Some(event));
        }
        if let Some(event) = self.replaceable.fetch(&coordinate).await? {
            self.cache.add(event.clone());
            return Ok(Some(event));
        }

        let hints = self.beyond_index(&pointer.relays);
        if hints.is_empty() {
            return Ok(None);
        }
        let filter = Filter::new()
            .authors(vec![pointer.pubkey.clone()])
            .kinds(vec![pointer.kind])
            .tag("d", vec![pointer.identifier.clone()])
            .limit(1);
        let mut events = self.mux.fetch_events(&hints, vec![filter]).await;
        events.sort_by(timeline_order);
        let Some(event) = events.into_iter().next() else {
            return Ok(None);
        };

        self.cache.add(event.clone());
        self.replaceable.accept_if_newer(event.clone());
        Ok(Some(event))
    }

    /// Query a narrow relay set for one id, taking the newest match.
    async fn fetch_one_by_id(&self, relays: &[String], id: &str) -> Option<Event> {
        let filter = Filter::new().ids(vec![id.to_string()]).limit(1);
        let events = self.mux.fetch_events(relays, vec![filter]).await;
        let event = events.into_iter().find(|event| event.id == id)?;
        self.cache.add(event.clone());
        Some(event)
    }

    /// Hint relays not already covered by the index set.
    fn beyond_index(&self, hints: &[String]) -> Vec<String> {
        let index: Vec<String> = self
            .index_relays
            .iter()
            .filter_map(|url| normalize_relay_url(url).ok())
            .collect();
        let mut out = Vec::new();
        for hint in hints {
            let Ok(normalized) = normalize_relay_url(hint) else {
                continue;
            };
            if !index.contains(&normalized) && !out.contains(&normalized) {
                out.push(normalized);
            }
        }
        out
    }

    /// The author's published write relays, capped.
    async fn author_write_relays(&self, author: &str) -> Vec<String> {
        let coordinate = Coordinate::new(RELAY_LIST_METADATA_KIND, author);
        let event = match self.replaceable.fetch(&coordinate).await {
            Ok(Some(event)) => event,
            Ok(None) => return Vec::new(),
            Err(e) => {
                warn!(author, error = %e, "relay list lookup failed");
                return Vec::new();
            }
        };
        let Ok(relay_list) = RelayListMetadata::from_event(&event) else {
            return Vec::new();
        };
        relay_list
            .write_relays()
            .into_iter()
            .take(AUTHOR_RELAY_CAP)
            .collect()
    }
}

/// Batch runner for by-id lookups against the index relays. Ids the
/// relays do not hold are omitted, so their loads fail and the caller
/// falls through to narrower relay sets.
fn id_runner(
    mux: Arc<SubscriptionMultiplexer>,
    relays: Vec<String>,
) -> BatchRunner<String, Event> {
    Arc::new(move |ids: Vec<String>| {
        let mux = Arc::clone(&mux);
        let relays = relays.clone();
        Box::pin(async move {
            let filter = Filter::new().ids(ids.clone()).limit(ids.len() as u64);
            let mut results = HashMap::new();
            match mux.query(&relays, vec![filter]).await {
                Ok(events) => {
                    for event in events {
                        if ids.contains(&event.id) {
                            results.insert(event.id.clone(), event);
                        }
                    }
                }
                Err(e) => warn!(error = %e, "batched id lookup failed"),
            }
            results
        })
    })
}
