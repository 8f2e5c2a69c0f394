//! In-memory event cache.
//!
//! Bounded by-id store with LRU eviction, plus coordinate indexes so the
//! current version of a replaceable or addressable event can be resolved
//! synchronously. Timeline entries hold (id, created_at) references and
//! resolve full bodies through this cache.

use driftline_core::{Coordinate, Event, replaceable_order};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};

/// Configuration for the event cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of events held in memory.
    pub max_events: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_events: 10_000 }
    }
}

struct CacheInner {
    events: HashMap<String, Event>,
    lru_queue: VecDeque<String>,
    by_coordinate: HashMap<Coordinate, String>,
}

/// Process-wide cache of observed events.
pub struct EventCache {
    config: CacheConfig,
    inner: Mutex<CacheInner>,
}

impl Default for EventCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl EventCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CacheInner {
                events: HashMap::new(),
                lru_queue: VecDeque::new(),
                by_coordinate: HashMap::new(),
            }),
        }
    }

    /// Insert an event. Events are immutable, so a duplicate id only
    /// refreshes its LRU position. The coordinate index is only advanced
    /// when the new event wins the replaceable order.
    pub fn add(&self, event: Event) {
        let mut inner = self.inner.lock();

        if inner.events.contains_key(&event.id) {
            touch(&mut inner.lru_queue, &event.id);
            return;
        }

        if let Some(coordinate) = Coordinate::from_event(&event) {
            let current = inner
                .by_coordinate
                .get(&coordinate)
                .and_then(|id| inner.events.get(id));
            let is_newer = match current {
                Some(current) => replaceable_order(&event, current) == Ordering::Greater,
                None => true,
            };
            if is_newer {
                inner.by_coordinate.insert(coordinate, event.id.clone());
            }
        }

        inner.lru_queue.push_back(event.id.clone());
        inner.events.insert(event.id.clone(), event);

        while inner.events.len() > self.config.max_events {
            let Some(oldest) = inner.lru_queue.pop_front() else {
                break;
            };
            if let Some(evicted) = inner.events.remove(&oldest) {
                if let Some(coordinate) = Coordinate::from_event(&evicted) {
                    if inner.by_coordinate.get(&coordinate) == Some(&evicted.id) {
                        inner.by_coordinate.remove(&coordinate);
                    }
                }
            }
        }
    }

    /// Look up an event by id.
    pub fn get(&self, id: &str) -> Option<Event> {
        let mut inner = self.inner.lock();
        let event = inner.events.get(id).cloned()?;
        touch(&mut inner.lru_queue, id);
        Some(event)
    }

    /// Current version for a replaceable coordinate, if cached.
    pub fn get_by_coordinate(&self, coordinate: &Coordinate) -> Option<Event> {
        let inner = self.inner.lock();
        let id = inner.by_coordinate.get(coordinate)?;
        inner.events.get(id).cloned()
    }

    /// Resolve ids to events, skipping ids not in cache.
    pub fn resolve(&self, ids: impl IntoIterator<Item = impl AsRef<str>>) -> Vec<Event> {
        let inner = self.inner.lock();
        ids.into_iter()
            .filter_map(|id| inner.events.get(id.as_ref()).cloned())
            .collect()
    }

    /// Number of cached events.
    pub fn len(&self) -> usize {
        self.inner.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().events.is_empty()
    }
}

fn touch(lru_queue: &mut VecDeque<String>, id: &str) {
    if let Some(pos) = lru_queue.iter().position(|queued| queued == id) {
        lru_queue.remove(pos);
        lru_queue.push_back(id.to_string());
    }
}
