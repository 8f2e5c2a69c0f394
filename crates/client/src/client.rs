//! Client facade.
//!
//! Wires the pool, multiplexer, caches, resolver and publisher together
//! behind the query surface the presentation layer consumes. Transport,
//! signer and persistent store are injected, so a whole client can run
//! against fakes in tests.

use crate::batch::BatchConfig;
use crate::cache::{CacheConfig, EventCache};
use crate::error::{ClientError, Result};
use crate::pool::ConnectionPool;
use crate::publish::{PublishOptions, Publisher};
use crate::replaceable::ReplaceableStore;
use crate::resolve::EventResolver;
use crate::signer::Signer;
use crate::store::EventStore;
use crate::subscription::SubscriptionMultiplexer;
use crate::timeline::{TimelineHandle, TimelineHandlers, TimelineManager, TimelineRequest};
use crate::transport::Transport;
use driftline_core::{
    BookmarkItem, Contact, Coordinate, Event, EventTemplate, KIND_BOOKMARKS, KIND_CONTACTS,
    KIND_FAVORITE_RELAYS, KIND_METADATA, KIND_MUTE_LIST, Profile, RELAY_LIST_METADATA_KIND,
    RelayListMetadata, bookmark_items, favorite_relays, followed_pubkeys, muted_pubkeys,
    normalize_relay_url,
};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// Well-known high-availability relays, used whenever a user-specific
/// relay set is unknown or insufficient.
pub const BIG_RELAY_URLS: [&str; 4] = [
    "wss://relay.damus.io",
    "wss://nos.lol",
    "wss://relay.nostr.band",
    "wss://nostr.wine",
];

/// Entries kept in the following-favorite-relays memo.
const FAVORITE_RELAYS_MEMO_CAP: usize = 10;

/// Tunables for one client instance.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// The big-relay fallback set.
    pub index_relays: Vec<String>,
    pub cache: CacheConfig,
    pub batch: BatchConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            index_relays: BIG_RELAY_URLS.iter().map(|s| s.to_string()).collect(),
            cache: CacheConfig::default(),
            batch: BatchConfig::default(),
        }
    }
}

/// The query surface exposed to the presentation layer.
pub struct Client {
    pool: Arc<ConnectionPool>,
    cache: Arc<EventCache>,
    replaceable: Arc<ReplaceableStore>,
    resolver: EventResolver,
    publisher: Publisher,
    timelines: TimelineManager,
    store: Arc<dyn EventStore>,
    signer: Option<Arc<dyn Signer>>,
    favorite_relays_memo: Mutex<VecDeque<(String, Vec<String>)>>,
}

impl Client {
    pub fn new(
        transport: Arc<dyn Transport>,
        signer: Option<Arc<dyn Signer>>,
        store: Arc<dyn EventStore>,
    ) -> Self {
        Self::with_config(transport, signer, store, ClientConfig::default())
    }

    pub fn with_config(
        transport: Arc<dyn Transport>,
        signer: Option<Arc<dyn Signer>>,
        store: Arc<dyn EventStore>,
        config: ClientConfig,
    ) -> Self {
        let pool = Arc::new(ConnectionPool::new(transport));
        let mux = Arc::new(SubscriptionMultiplexer::new(
            Arc::clone(&pool),
            signer.clone(),
        ));
        let cache = Arc::new(EventCache::new(config.cache));
        let replaceable = Arc::new(ReplaceableStore::new(
            Arc::clone(&mux),
            Arc::clone(&store),
            config.index_relays.clone(),
            config.batch.clone(),
        ));
        let resolver = EventResolver::new(
            Arc::clone(&mux),
            Arc::clone(&cache),
            Arc::clone(&replaceable),
            config.index_relays.clone(),
            config.batch,
        );
        let publisher = Publisher::new(
            Arc::clone(&pool),
            Arc::clone(&replaceable),
            signer.clone(),
            config.index_relays,
        );
        let timelines = TimelineManager::new(Arc::clone(&mux), Arc::clone(&cache));

        Self {
            pool,
            cache,
            replaceable,
            resolver,
            publisher,
            timelines,
            store,
            signer,
            favorite_relays_memo: Mutex::new(VecDeque::new()),
        }
    }

    /// Seed the replaceable cache from the persistent store. Usually
    /// called once at startup.
    pub async fn warm_up(&self) -> Result<()> {
        self.replaceable.warm_up().await
    }

    /// Open a timeline. See [`TimelineManager::subscribe_timeline`].
    pub fn subscribe_timeline(
        &self,
        requests: Vec<TimelineRequest>,
        handlers: TimelineHandlers,
        need_sort: bool,
    ) -> TimelineHandle {
        self.timelines.subscribe_timeline(requests, handlers, need_sort)
    }

    /// Page a timeline backward from `until`.
    pub async fn load_more_timeline(&self, key: &str, until: u64, limit: usize) -> Vec<Event> {
        self.timelines.load_more(key, until, limit).await
    }

    /// Resolve a permalink-style identifier to an event.
    pub async fn fetch_event(&self, identifier: &str) -> Result<Option<Event>> {
        self.resolver.resolve(identifier).await
    }

    /// Current profile metadata for a pubkey.
    pub async fn fetch_profile(&self, pubkey: &str) -> Result<Option<Profile>> {
        let coordinate = Coordinate::new(KIND_METADATA, pubkey);
        Ok(self
            .replaceable
            .fetch(&coordinate)
            .await?
            .map(|event| Profile::from_event(&event)))
    }

    /// Current relay list for a pubkey.
    pub async fn fetch_relay_list(&self, pubkey: &str) -> Result<Option<RelayListMetadata>> {
        let coordinate = Coordinate::new(RELAY_LIST_METADATA_KIND, pubkey);
        Ok(self
            .replaceable
            .fetch(&coordinate)
            .await?
            .and_then(|event| RelayListMetadata::from_event(&event).ok()))
    }

    /// Refetch a pubkey's relay list from the network, bypassing caches.
    pub async fn refresh_relay_list(&self, pubkey: &str) -> Result<Option<RelayListMetadata>> {
        let coordinate = Coordinate::new(RELAY_LIST_METADATA_KIND, pubkey);
        Ok(self
            .replaceable
            .refresh(&coordinate)
            .await?
            .and_then(|event| RelayListMetadata::from_event(&event).ok()))
    }

    /// Who a pubkey follows.
    pub async fn fetch_follow_list(&self, pubkey: &str) -> Result<Vec<Contact>> {
        let coordinate = Coordinate::new(KIND_CONTACTS, pubkey);
        Ok(self
            .replaceable
            .fetch(&coordinate)
            .await?
            .map(|event| driftline_core::get_contacts(&event))
            .unwrap_or_default())
    }

    /// Pubkeys a user has muted.
    pub async fn fetch_mute_list(&self, pubkey: &str) -> Result<Vec<String>> {
        let coordinate = Coordinate::new(KIND_MUTE_LIST, pubkey);
        Ok(self
            .replaceable
            .fetch(&coordinate)
            .await?
            .map(|event| muted_pubkeys(&event))
            .unwrap_or_default())
    }

    /// A user's bookmarked events and addresses.
    pub async fn fetch_bookmark_list(&self, pubkey: &str) -> Result<Vec<BookmarkItem>> {
        let coordinate = Coordinate::new(KIND_BOOKMARKS, pubkey);
        Ok(self
            .replaceable
            .fetch(&coordinate)
            .await?
            .map(|event| bookmark_items(&event))
            .unwrap_or_default())
    }

    /// Relays favored by the people a pubkey follows, most-favored
    /// first. Memoized in memory (bounded) and in the persistent store.
    pub async fn fetch_following_favorite_relays(&self, pubkey: &str) -> Result<Vec<String>> {
        if let Some(hit) = self.memo_get(pubkey) {
            return Ok(hit);
        }
        if let Ok(Some(stored)) = self.store.get_favorite_relays(pubkey).await {
            self.memo_put(pubkey, stored.clone());
            return Ok(stored);
        }

        let follows: Vec<String> = self
            .fetch_follow_list(pubkey)
            .await?
            .into_iter()
            .map(|contact| contact.pubkey)
            .collect();

        // Per-follow lookups coalesce into batched index queries.
        let lookups = follows.iter().map(|follow| {
            let coordinate = Coordinate::new(KIND_FAVORITE_RELAYS, follow.clone());
            async move { self.replaceable.fetch(&coordinate).await }
        });

        let mut counts: HashMap<String, usize> = HashMap::new();
        for result in join_all(lookups).await {
            let Ok(Some(event)) = result else {
                continue;
            };
            for url in favorite_relays(&event) {
                if let Ok(normalized) = normalize_relay_url(&url) {
                    *counts.entry(normalized).or_default() += 1;
                }
            }
        }

        let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        let relays: Vec<String> = ranked.into_iter().map(|(url, _)| url).collect();

        if let Err(e) = self.store.put_favorite_relays(pubkey, &relays).await {
            debug!(error = %e, "favorite relays not persisted");
        }
        self.memo_put(pubkey, relays.clone());
        Ok(relays)
    }

    /// Sign a draft, publish it, and feed the result back into the
    /// caches. Returns the signed event.
    pub async fn publish(
        &self,
        template: EventTemplate,
        options: PublishOptions,
    ) -> Result<Event> {
        let signer = self.signer.as_ref().ok_or_else(|| {
            ClientError::SignerUnavailable("publishing requires a signer".to_string())
        })?;
        let event = signer.sign_event(template).await?;

        self.publisher.broadcast(&event, &options).await?;

        self.cache.add(event.clone());
        if Coordinate::from_event(&event).is_some() {
            self.replaceable.update(&event).await?;
        }
        Ok(event)
    }

    /// Relays observed delivering an event in this session; used to pick
    /// hint relays when encoding pointers.
    pub fn seen_on(&self, event_id: &str) -> Vec<String> {
        self.pool.seen_on(event_id)
    }

    pub fn cache(&self) -> &Arc<EventCache> {
        &self.cache
    }

    pub fn replaceable(&self) -> &Arc<ReplaceableStore> {
        &self.replaceable
    }

    fn memo_get(&self, pubkey: &str) -> Option<Vec<String>> {
        let mut memo = self.favorite_relays_memo.lock();
        let position = memo.iter().position(|(key, _)| key == pubkey)?;
        let entry = memo.remove(position)?;
        let value = entry.1.clone();
        memo.push_back(entry);
        Some(value)
    }

    fn memo_put(&self, pubkey: &str, relays: Vec<String>) {
        let mut memo = self.favorite_relays_memo.lock();
        memo.retain(|(key, _)| key != pubkey);
        memo.push_back((pubkey.to_string(), relays));
        while memo.len() > FAVORITE_RELAYS_MEMO_CAP {
            memo.pop_front();
        }
    }
}
