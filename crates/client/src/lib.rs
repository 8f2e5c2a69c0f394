//! Multi-relay timeline synchronization and event caching for Nostr.
//!
//! The engine behind a decentralized social client: it fans logical
//! queries out across many relays, merges and deduplicates their
//! streams into ordered timelines, paginates backward through a
//! reference cache before touching the network, keeps latest-wins
//! replaceable objects (profiles, relay lists, follow lists) consistent
//! across memory and persistent storage, and publishes events to the
//! relay set most likely to propagate them.
//!
//! Layering, leaf to root:
//!
//! - [`transport`] / [`relay`] / [`pool`] — wire protocol I/O, one
//!   connection per relay, seen-on tracking, NIP-42 auth
//! - [`subscription`] — one logical query as N per-relay subscriptions
//! - [`cache`] / [`timeline`] — event bodies and ordered timelines
//! - [`batch`] / [`replaceable`] — coalesced latest-wins lookups
//! - [`resolve`] / [`publish`] — pointer resolution and fan-out publish
//! - [`client`] — the injected-dependency facade over all of it
//!
//! ```no_run
//! use driftline_client::{Client, TimelineHandlers, TimelineRequest, WsTransport};
//! use driftline_client::{Filter, MemoryStore};
//! use std::sync::Arc;
//!
//! # async fn demo() {
//! let client = Client::new(
//!     Arc::new(WsTransport::default()),
//!     None,
//!     Arc::new(MemoryStore::default()),
//! );
//!
//! let handle = client.subscribe_timeline(
//!     vec![TimelineRequest {
//!         urls: vec!["wss://relay.damus.io".to_string()],
//!         filter: Filter::new().kinds(vec![1]).limit(50),
//!     }],
//!     TimelineHandlers {
//!         on_events: Some(Box::new(|events, done| {
//!             println!("{} events (complete: {done})", events.len());
//!         })),
//!         ..Default::default()
//!     },
//!     true,
//! );
//! # handle.close();
//! # }
//! ```

pub mod batch;
pub mod cache;
pub mod client;
pub mod error;
pub mod message;
pub mod pool;
pub mod publish;
pub mod relay;
pub mod replaceable;
pub mod resolve;
pub mod signer;
pub mod store;
pub mod subscription;
pub mod timeline;
pub mod transport;

pub use batch::{BatchConfig, BatchQueue};
pub use cache::{CacheConfig, EventCache};
pub use client::{BIG_RELAY_URLS, Client, ClientConfig};
pub use error::{ClientError, Result};
pub use message::{ClientMessage, Filter, MessageError, RelayMessage};
pub use pool::{ConnectionPool, SeenTracker};
pub use publish::{PublishOptions, Publisher};
pub use relay::{PublishOutcome, RelayConnection, SubscriptionUpdate};
pub use replaceable::ReplaceableStore;
pub use resolve::{EventIdentifier, EventResolver};
pub use signer::Signer;
pub use store::{EventStore, MemoryStore, StoredEntry};
pub use subscription::{Subscription, SubscriptionHandlers, SubscriptionMultiplexer};
pub use timeline::{
    TimelineHandle, TimelineHandlers, TimelineManager, TimelineRef, TimelineRequest,
    TimelineStore, timeline_key,
};
pub use transport::{RelayIo, Transport, WsTransport};
