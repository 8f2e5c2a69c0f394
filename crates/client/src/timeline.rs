//! Timeline cache and orchestration.
//!
//! A timeline is one logical feed backed by one or more (relay set,
//! filter) sub-requests. Each sub-request keeps a cache entry keyed by a
//! hash of its sorted relay URLs and normalized filter, holding ordered
//! (event id, created_at) references into the event cache. Serving a
//! repeat query starts from those references and only asks the network
//! for what is newer; backward pagination drains cached references
//! before touching the network.
//!
//! With several sub-requests, the merged feed is emitted once more than
//! half of them have completed, so one slow relay group does not hold
//! the whole timeline hostage. Completion of the remaining sub-requests
//! re-emits with the fuller picture.

use crate::cache::EventCache;
use crate::message::Filter;
use crate::subscription::{Subscription, SubscriptionHandlers, SubscriptionMultiplexer};
use driftline_core::{Event, timeline_order};
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use tracing::debug;

/// Applied when a sub-request filter carries no limit.
pub const DEFAULT_TIMELINE_LIMIT: usize = 100;

/// Lightweight pointer into the event cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineRef {
    pub id: String,
    pub created_at: u64,
}

impl TimelineRef {
    pub fn of(event: &Event) -> Self {
        Self {
            id: event.id.clone(),
            created_at: event.created_at,
        }
    }
}

/// Sort key for reference lists: newest first, ties by id descending.
fn ref_order(a: &TimelineRef, b: &TimelineRef) -> Ordering {
    b.created_at
        .cmp(&a.created_at)
        .then_with(|| b.id.cmp(&a.id))
}

/// Stable key for one (relay set, filter) query, independent of the
/// ordering of relay URLs and of array-valued filter fields.
pub fn timeline_key(urls: &[String], filter: &Filter) -> String {
    let mut sorted: Vec<&String> = urls.iter().collect();
    sorted.sort();
    sorted.dedup();

    let mut hasher = Sha256::new();
    for url in sorted {
        hasher.update(url.as_bytes());
        hasher.update([0u8]);
    }
    hasher.update(filter.canonical_json().as_bytes());
    hex::encode(hasher.finalize())
}

struct TimelineEntry {
    refs: Vec<TimelineRef>,
    ids: HashSet<String>,
    urls: Vec<String>,
    filter: Filter,
}

/// Keyed store of timeline reference lists.
///
/// Every mutation completes under one lock acquisition, so the sorted /
/// no-duplicates invariant holds at every observable point.
#[derive(Default)]
pub struct TimelineStore {
    entries: RwLock<HashMap<String, TimelineEntry>>,
}

impl TimelineStore {
    /// Replace (or create) the entry wholesale. `refs` must already be
    /// sorted newest-first.
    pub fn replace(&self, key: &str, urls: Vec<String>, filter: Filter, refs: Vec<TimelineRef>) {
        let ids = refs.iter().map(|r| r.id.clone()).collect();
        self.entries.write().insert(
            key.to_string(),
            TimelineEntry {
                refs,
                ids,
                urls,
                filter,
            },
        );
    }

    /// Insert one reference at its sorted position.
    ///
    /// Skips duplicates and references older than everything cached (the
    /// entry's tail is a pagination frontier; inserting behind it would
    /// create a gap). Returns whether the reference was inserted.
    pub fn insert_sorted(&self, key: &str, reference: TimelineRef) -> bool {
        let mut entries = self.entries.write();
        let Some(entry) = entries.get_mut(key) else {
            return false;
        };
        if entry.ids.contains(&reference.id) {
            return false;
        }
        let position = entry
            .refs
            .partition_point(|existing| ref_order(existing, &reference) == Ordering::Less);
        if position == entry.refs.len() && !entry.refs.is_empty() {
            return false;
        }
        entry.ids.insert(reference.id.clone());
        entry.refs.insert(position, reference);
        true
    }

    /// Merge references (typically a fresh newer-than-cache batch) into
    /// the entry, keeping order and uniqueness.
    pub fn merge(&self, key: &str, refs: Vec<TimelineRef>) {
        for reference in refs {
            self.insert_sorted(key, reference);
        }
    }

    /// Append references strictly older than the current oldest, for
    /// backward pagination. Returns the references actually appended;
    /// anything newer or duplicate is dropped, which protects concurrent
    /// pagination calls from double-appending.
    pub fn append_older(&self, key: &str, mut refs: Vec<TimelineRef>) -> Vec<TimelineRef> {
        refs.sort_by(ref_order);
        let mut entries = self.entries.write();
        let Some(entry) = entries.get_mut(key) else {
            return Vec::new();
        };

        let mut appended = Vec::new();
        for reference in refs {
            if entry.ids.contains(&reference.id) {
                continue;
            }
            let strictly_older = match entry.refs.last() {
                Some(oldest) => ref_order(oldest, &reference) == Ordering::Less,
                None => true,
            };
            if !strictly_older {
                continue;
            }
            entry.ids.insert(reference.id.clone());
            entry.refs.push(reference.clone());
            appended.push(reference);
        }
        appended
    }

    /// Up to `limit` references with `created_at <= until`.
    pub fn refs_until(&self, key: &str, until: u64, limit: usize) -> Vec<TimelineRef> {
        let entries = self.entries.read();
        let Some(entry) = entries.get(key) else {
            return Vec::new();
        };
        entry
            .refs
            .iter()
            .filter(|r| r.created_at <= until)
            .take(limit)
            .cloned()
            .collect()
    }

    /// The first `limit` references.
    pub fn head(&self, key: &str, limit: usize) -> Vec<TimelineRef> {
        let entries = self.entries.read();
        let Some(entry) = entries.get(key) else {
            return Vec::new();
        };
        entry.refs.iter().take(limit).cloned().collect()
    }

    /// `created_at` of the newest cached reference.
    pub fn newest(&self, key: &str) -> Option<u64> {
        self.entries
            .read()
            .get(key)
            .and_then(|entry| entry.refs.first().map(|r| r.created_at))
    }

    /// The relay set and filter the entry was created with.
    pub fn query_of(&self, key: &str) -> Option<(Vec<String>, Filter)> {
        self.entries
            .read()
            .get(key)
            .map(|entry| (entry.urls.clone(), entry.filter.clone()))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    #[cfg(test)]
    fn refs(&self, key: &str) -> Vec<TimelineRef> {
        self.entries
            .read()
            .get(key)
            .map(|entry| entry.refs.clone())
            .unwrap_or_default()
    }
}

/// One (relay set, filter) sub-request of a timeline.
#[derive(Debug, Clone)]
pub struct TimelineRequest {
    pub urls: Vec<String>,
    pub filter: Filter,
}

/// Callbacks for one timeline. All optional.
#[derive(Default)]
pub struct TimelineHandlers {
    /// The merged, ordered feed so far; `true` once every sub-request
    /// has completed.
    pub on_events: Option<Box<dyn Fn(Vec<Event>, bool) + Send + Sync>>,
    /// A live event that arrived after the stored backlog.
    pub on_new: Option<Box<dyn Fn(Event) + Send + Sync>>,
}

struct SlotState {
    /// Events buffered before this sub-request's end-of-stored-events,
    /// then the resolved view after it.
    events: Vec<Event>,
    buffer: Vec<Event>,
    eosed: bool,
}

struct TimelineShared {
    handlers: Mutex<Option<Arc<TimelineHandlers>>>,
    closed: AtomicBool,
    slots: Vec<Arc<Mutex<SlotState>>>,
    total: usize,
    eosed_count: AtomicUsize,
    limit: usize,
    need_sort: bool,
}

impl TimelineShared {
    fn handlers(&self) -> Option<Arc<TimelineHandlers>> {
        if self.closed.load(AtomicOrdering::SeqCst) {
            return None;
        }
        self.handlers.lock().clone()
    }

    fn merged(&self) -> Vec<Event> {
        let mut seen = HashSet::new();
        let mut events = Vec::new();
        for slot in &self.slots {
            for event in slot.lock().events.iter() {
                if seen.insert(event.id.clone()) {
                    events.push(event.clone());
                }
            }
        }
        if self.need_sort {
            events.sort_by(timeline_order);
        }
        events.truncate(self.limit);
        events
    }

    /// Emit the merged feed. Without `force`, emission waits for more
    /// than half of the sub-requests to have completed.
    fn emit(&self, force: bool) {
        let eosed = self.eosed_count.load(AtomicOrdering::SeqCst);
        if !force && eosed * 2 <= self.total {
            return;
        }
        let Some(handlers) = self.handlers() else {
            return;
        };
        if let Some(on_events) = &handlers.on_events {
            on_events(self.merged(), eosed >= self.total);
        }
    }

    fn complete_slot(&self) {
        self.eosed_count.fetch_add(1, AtomicOrdering::SeqCst);
        self.emit(false);
    }

    fn deliver_new(&self, event: Event) {
        let Some(handlers) = self.handlers() else {
            return;
        };
        if let Some(on_new) = &handlers.on_new {
            on_new(event);
        }
    }
}

/// Handle to one open timeline.
pub struct TimelineHandle {
    keys: Vec<String>,
    shared: Arc<TimelineShared>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl TimelineHandle {
    /// Cache key of the first sub-request; the usual pagination anchor.
    pub fn key(&self) -> Option<&str> {
        self.keys.first().map(String::as_str)
    }

    /// Cache keys of every sub-request, in request order.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Close the timeline everywhere. Idempotent; neutralizes callbacks
    /// before tearing down the underlying subscriptions.
    pub fn close(&self) {
        if self.shared.closed.swap(true, AtomicOrdering::SeqCst) {
            return;
        }
        *self.shared.handlers.lock() = None;
        for subscription in self.subscriptions.lock().drain(..) {
            subscription.close();
        }
    }
}

impl Drop for TimelineHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens timelines and paginates them, cache first.
pub struct TimelineManager {
    mux: Arc<SubscriptionMultiplexer>,
    cache: Arc<EventCache>,
    timelines: Arc<TimelineStore>,
}

impl TimelineManager {
    pub fn new(mux: Arc<SubscriptionMultiplexer>, cache: Arc<EventCache>) -> Self {
        Self {
            mux,
            cache,
            timelines: Arc::new(TimelineStore::default()),
        }
    }

    pub fn timelines(&self) -> &Arc<TimelineStore> {
        &self.timelines
    }

    /// Open a timeline over one or more sub-requests.
    ///
    /// When `need_sort` is set (any query whose relay-side ordering is
    /// not trusted as-is), cached references are resolved and delivered
    /// synchronously before the live query goes out, and the live query
    /// is narrowed with `since` to the newest cached timestamp.
    pub fn subscribe_timeline(
        &self,
        requests: Vec<TimelineRequest>,
        handlers: TimelineHandlers,
        need_sort: bool,
    ) -> TimelineHandle {
        let limit = requests
            .iter()
            .filter_map(|r| r.filter.limit)
            .max()
            .map(|l| l as usize)
            .unwrap_or(DEFAULT_TIMELINE_LIMIT);

        let shared = Arc::new(TimelineShared {
            handlers: Mutex::new(Some(Arc::new(handlers))),
            closed: AtomicBool::new(false),
            slots: (0..requests.len())
                .map(|_| {
                    Arc::new(Mutex::new(SlotState {
                        events: Vec::new(),
                        buffer: Vec::new(),
                        eosed: false,
                    }))
                })
                .collect(),
            total: requests.len(),
            eosed_count: AtomicUsize::new(0),
            limit,
            need_sort,
        });

        let mut keys = Vec::with_capacity(requests.len());
        let mut subscriptions = Vec::new();
        let mut served_from_cache = false;

        for (index, request) in requests.into_iter().enumerate() {
            let key = timeline_key(&request.urls, &request.filter);
            keys.push(key.clone());

            // A query that resolves to zero kinds can match nothing;
            // complete without touching the network.
            if request.filter.kinds.as_deref() == Some(&[]) {
                let mut slot = shared.slots[index].lock();
                slot.eosed = true;
                drop(slot);
                shared.eosed_count.fetch_add(1, AtomicOrdering::SeqCst);
                continue;
            }

            let request_limit = request
                .filter
                .limit
                .map(|l| l as usize)
                .unwrap_or(DEFAULT_TIMELINE_LIMIT);

            let had_cache = need_sort && self.timelines.contains(&key);
            let mut live_filter = request.filter.clone();
            if had_cache {
                let refs = self.timelines.head(&key, request_limit);
                let cached = self.cache.resolve(refs.iter().map(|r| r.id.as_str()));
                if !cached.is_empty() {
                    shared.slots[index].lock().events = cached;
                    served_from_cache = true;
                }
                if let Some(newest) = self.timelines.newest(&key) {
                    live_filter = live_filter.since(newest);
                }
            }

            let urls = request.urls.clone();
            let subscription = self.mux.subscribe(
                &urls,
                vec![live_filter],
                self.slot_handlers(
                    Arc::clone(&shared),
                    Arc::clone(&shared.slots[index]),
                    key,
                    request,
                    request_limit,
                    had_cache,
                    need_sort,
                ),
            );
            subscriptions.push(subscription);
        }

        // First synchronous delivery: cached events, or immediate
        // completion when nothing was opened at all.
        let all_done = shared.eosed_count.load(AtomicOrdering::SeqCst) >= shared.total;
        if served_from_cache || all_done {
            shared.emit(true);
        }

        TimelineHandle {
            keys,
            shared,
            subscriptions: Mutex::new(subscriptions),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn slot_handlers(
        &self,
        shared: Arc<TimelineShared>,
        slot: Arc<Mutex<SlotState>>,
        key: String,
        request: TimelineRequest,
        request_limit: usize,
        had_cache: bool,
        need_sort: bool,
    ) -> SubscriptionHandlers {
        let cache = Arc::clone(&self.cache);
        let timelines = Arc::clone(&self.timelines);

        let on_event = {
            let shared = Arc::clone(&shared);
            let slot = Arc::clone(&slot);
            let cache = Arc::clone(&cache);
            let timelines = Arc::clone(&timelines);
            let key = key.clone();
            Box::new(move |event: Event| {
                let mut state = slot.lock();
                if !state.eosed {
                    state.buffer.push(event);
                    return;
                }

                // Live event after the stored backlog.
                cache.add(event.clone());
                let inserted = timelines.insert_sorted(&key, TimelineRef::of(&event));
                if inserted {
                    let position = state
                        .events
                        .partition_point(|existing| {
                            timeline_order(existing, &event) == Ordering::Less
                        });
                    state.events.insert(position, event.clone());
                    drop(state);
                    shared.deliver_new(event);
                }
            }) as Box<dyn Fn(Event) + Send + Sync>
        };

        let on_eose = {
            Box::new(move || {
                let mut state = slot.lock();
                if state.eosed {
                    return;
                }
                state.eosed = true;

                let mut fetched = std::mem::take(&mut state.buffer);
                if need_sort {
                    fetched.sort_by(timeline_order);
                }
                let mut seen = HashSet::new();
                fetched.retain(|event| seen.insert(event.id.clone()));
                fetched.truncate(request_limit);

                for event in &fetched {
                    cache.add(event.clone());
                }
                let refs: Vec<TimelineRef> = fetched.iter().map(TimelineRef::of).collect();

                if !had_cache {
                    timelines.replace(&key, request.urls.clone(), request.filter.clone(), refs);
                } else if fetched.len() >= request_limit {
                    // A full fresh batch may hide a gap; do not trust a
                    // partial merge with the stale entry.
                    debug!(key = %key, "replacing stale timeline entry");
                    timelines.replace(&key, request.urls.clone(), request.filter.clone(), refs);
                } else {
                    timelines.merge(&key, refs);
                }

                state.events = if need_sort {
                    let head = timelines.head(&key, request_limit);
                    cache.resolve(head.iter().map(|r| r.id.as_str()))
                } else {
                    fetched
                };
                drop(state);

                shared.complete_slot();
            }) as Box<dyn Fn() + Send + Sync>
        };

        SubscriptionHandlers {
            on_event: Some(on_event),
            on_eose: Some(on_eose),
            ..Default::default()
        }
    }

    /// Page backward from `until`, cache first.
    ///
    /// Cached references with `created_at <= until` are resolved without
    /// network access; only the remainder is fetched, with the window
    /// shifted past the last cache hit. Fetched references are appended
    /// to the entry's tail, so repeated calls with decreasing `until`
    /// never return an id twice.
    pub async fn load_more(&self, key: &str, until: u64, limit: usize) -> Vec<Event> {
        let Some((urls, filter)) = self.timelines.query_of(key) else {
            debug!(key = %key, "load_more on unknown timeline");
            return Vec::new();
        };
        if filter.kinds.as_deref() == Some(&[]) {
            return Vec::new();
        }

        let cached_refs = self.timelines.refs_until(key, until, limit);
        let mut events = self
            .cache
            .resolve(cached_refs.iter().map(|r| r.id.as_str()));
        if events.len() >= limit {
            events.truncate(limit);
            return events;
        }

        let network_until = cached_refs
            .last()
            .map(|r| r.created_at.saturating_sub(1))
            .unwrap_or(until);
        let remainder = limit - events.len();
        let page_filter = filter
            .clone()
            .until(network_until)
            .limit(remainder as u64);

        let mut fetched = self.mux.fetch_events(&urls, vec![page_filter]).await;
        fetched.sort_by(timeline_order);
        let mut seen = HashSet::new();
        fetched.retain(|event| seen.insert(event.id.clone()));
        fetched.truncate(remainder);

        for event in &fetched {
            self.cache.add(event.clone());
        }
        let appended = self
            .timelines
            .append_older(key, fetched.iter().map(TimelineRef::of).collect());
        let appended_ids: HashSet<&str> = appended.iter().map(|r| r.id.as_str()).collect();
        events.extend(
            fetched
                .into_iter()
                .filter(|event| appended_ids.contains(event.id.as_str())),
        );
        events
    }
}
