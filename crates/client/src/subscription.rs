//! Subscription multiplexer.
//!
//! Issues one logical filter query against a set of relays as N
//! independent per-relay subscriptions and merges their event /
//! end-of-stored-events / closed signals into a single logical stream:
//!
//! - events are deduplicated by id across all relays for the lifetime of
//!   the subscription
//! - the merged end-of-stored-events fires exactly once, when every
//!   attempted relay has either reported EOSE, closed terminally, or
//!   failed to connect (a relay that cannot be reached contributes
//!   nothing and must not block the rest)
//! - a CLOSED with an authentication-required reason triggers one NIP-42
//!   handshake and re-subscribe for that relay only, when a signer is
//!   available

use crate::message::Filter;
use crate::pool::ConnectionPool;
use crate::relay::{RelayConnection, SubscriptionUpdate};
use crate::signer::Signer;
use driftline_core::{Event, is_auth_required_error};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Guard bound on waiting for the merged end-of-stored-events.
pub const EOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Generate a short subscription ID.
pub fn generate_subscription_id() -> String {
    Uuid::new_v4().to_string()[..8].to_string()
}

/// Callbacks for one logical subscription. All optional.
#[derive(Default)]
pub struct SubscriptionHandlers {
    /// A deduplicated event arrived from any relay.
    pub on_event: Option<Box<dyn Fn(Event) + Send + Sync>>,
    /// Merged end-of-stored-events; fires at most once.
    pub on_eose: Option<Box<dyn Fn() + Send + Sync>>,
    /// One relay's subscription closed terminally: (url, reason).
    pub on_closed: Option<Box<dyn Fn(&str, &str) + Send + Sync>>,
    /// A relay demanded auth but no signer is available.
    pub on_auth_needed: Option<Box<dyn Fn(&str) + Send + Sync>>,
}

struct SubscriptionShared {
    id: String,
    handlers: Mutex<Option<Arc<SubscriptionHandlers>>>,
    seen_ids: Mutex<HashSet<String>>,
    started: usize,
    ended: AtomicUsize,
    // Relays that genuinely delivered EOSE (as opposed to failing).
    served: AtomicUsize,
    eose_fired: AtomicBool,
    closed: AtomicBool,
    open_relays: Mutex<Vec<(Arc<RelayConnection>, String)>>,
}

impl SubscriptionShared {
    fn handlers(&self) -> Option<Arc<SubscriptionHandlers>> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        self.handlers.lock().clone()
    }

    /// One relay finished delivering stored events (or will never start).
    fn complete_one(&self) {
        let ended = self.ended.fetch_add(1, Ordering::SeqCst) + 1;
        if ended >= self.started && !self.eose_fired.swap(true, Ordering::SeqCst) {
            if let Some(handlers) = self.handlers() {
                if let Some(on_eose) = &handlers.on_eose {
                    on_eose();
                }
            }
        }
    }

    fn deliver_event(&self, event: Event) {
        // The seen-set insert and the delivery decision are one step.
        if !self.seen_ids.lock().insert(event.id.clone()) {
            return;
        }
        if let Some(handlers) = self.handlers() {
            if let Some(on_event) = &handlers.on_event {
                on_event(event);
            }
        }
    }
}

/// Handle to one logical subscription across many relays.
pub struct Subscription {
    shared: Arc<SubscriptionShared>,
}

impl Subscription {
    /// The shared subscription id used on every relay.
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Whether the merged end-of-stored-events has fired.
    pub fn eosed(&self) -> bool {
        self.shared.eose_fired.load(Ordering::SeqCst)
    }

    /// How many relays actually finished delivering stored events, as
    /// opposed to failing or closing early.
    pub fn relays_served(&self) -> usize {
        self.shared.served.load(Ordering::SeqCst)
    }

    /// Close the subscription everywhere.
    ///
    /// Idempotent. Neutralizes all callbacks before tearing down the
    /// per-relay subscriptions, so nothing fires after this returns.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.shared.handlers.lock() = None;
        let open: Vec<_> = self.shared.open_relays.lock().drain(..).collect();
        for (connection, sub_id) in open {
            connection.unsubscribe(&sub_id);
        }
        debug!(subscription = %self.shared.id, "closed");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

/// Fans one logical query out to many relays.
pub struct SubscriptionMultiplexer {
    pool: Arc<ConnectionPool>,
    signer: Option<Arc<dyn Signer>>,
}

impl SubscriptionMultiplexer {
    pub fn new(pool: Arc<ConnectionPool>, signer: Option<Arc<dyn Signer>>) -> Self {
        Self { pool, signer }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Open one logical subscription across `urls`.
    pub fn subscribe(
        &self,
        urls: &[String],
        filters: Vec<Filter>,
        handlers: SubscriptionHandlers,
    ) -> Subscription {
        // Duplicate URLs would double-count completions.
        let mut unique = Vec::new();
        for url in urls {
            if !unique.contains(url) {
                unique.push(url.clone());
            }
        }

        let shared = Arc::new(SubscriptionShared {
            id: generate_subscription_id(),
            handlers: Mutex::new(Some(Arc::new(handlers))),
            seen_ids: Mutex::new(HashSet::new()),
            started: unique.len(),
            ended: AtomicUsize::new(0),
            served: AtomicUsize::new(0),
            eose_fired: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            open_relays: Mutex::new(Vec::new()),
        });

        if unique.is_empty() {
            // Nothing to wait for.
            shared.eose_fired.store(true, Ordering::SeqCst);
            if let Some(handlers) = shared.handlers() {
                if let Some(on_eose) = &handlers.on_eose {
                    on_eose();
                }
            }
            return Subscription { shared };
        }

        for url in unique {
            let shared = Arc::clone(&shared);
            let pool = Arc::clone(&self.pool);
            let signer = self.signer.clone();
            let filters = filters.clone();
            tokio::spawn(async move {
                relay_subscription(url, pool, signer, filters, shared).await;
            });
        }

        Subscription { shared }
    }

    /// Fetch all stored events matching `filters` from `urls`.
    ///
    /// Subscribes, buffers until the merged end-of-stored-events (bounded
    /// by [`EOSE_TIMEOUT`]), closes, and returns whatever arrived.
    pub async fn fetch_events(&self, urls: &[String], filters: Vec<Filter>) -> Vec<Event> {
        self.collect_stored(urls, filters).await.0
    }

    /// Like [`fetch_events`](Self::fetch_events), but distinguishes
    /// "the relays held nothing" from "no relay could be reached": the
    /// latter is an error, so callers never cache absence they did not
    /// actually observe.
    pub async fn query(&self, urls: &[String], filters: Vec<Filter>) -> crate::error::Result<Vec<Event>> {
        let (events, served) = self.collect_stored(urls, filters).await;
        if served == 0 && !urls.is_empty() {
            return Err(crate::error::ClientError::Connection(
                "no relay served the query".to_string(),
            ));
        }
        Ok(events)
    }

    async fn collect_stored(&self, urls: &[String], filters: Vec<Filter>) -> (Vec<Event>, usize) {
        let events: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));
        let (eose_tx, eose_rx) = tokio::sync::oneshot::channel::<()>();
        let eose_tx = Mutex::new(Some(eose_tx));

        let subscription = self.subscribe(
            urls,
            filters,
            SubscriptionHandlers {
                on_event: Some(Box::new({
                    let events = Arc::clone(&events);
                    move |event| events.lock().push(event)
                })),
                on_eose: Some(Box::new(move || {
                    if let Some(tx) = eose_tx.lock().take() {
                        let _ = tx.send(());
                    }
                })),
                ..Default::default()
            },
        );

        let _ = tokio::time::timeout(EOSE_TIMEOUT, eose_rx).await;
        let served = subscription.relays_served();
        subscription.close();

        let collected = std::mem::take(&mut *events.lock());
        (collected, served)
    }
}

/// Drive one relay's share of a logical subscription to completion.
async fn relay_subscription(
    url: String,
    pool: Arc<ConnectionPool>,
    signer: Option<Arc<dyn Signer>>,
    filters: Vec<Filter>,
    shared: Arc<SubscriptionShared>,
) {
    let Some(connection) = pool.ensure_connection(&url).await else {
        // Unreachable relay: completes immediately with zero events.
        shared.complete_one();
        return;
    };

    if shared.closed.load(Ordering::SeqCst) {
        return;
    }

    let (route_tx, mut route_rx) = mpsc::unbounded_channel();
    if connection.subscribe(&shared.id, filters.clone(), route_tx).is_err() {
        shared.complete_one();
        return;
    }

    if shared.closed.load(Ordering::SeqCst) {
        connection.unsubscribe(&shared.id);
        return;
    }
    shared
        .open_relays
        .lock()
        .push((Arc::clone(&connection), shared.id.clone()));

    let mut eosed = false;
    let mut auth_attempted = false;

    loop {
        let Some(update) = route_rx.recv().await else {
            // Route dropped without a close message (local teardown).
            break;
        };
        if shared.closed.load(Ordering::SeqCst) {
            break;
        }

        match update {
            SubscriptionUpdate::Event(event) => shared.deliver_event(event),
            SubscriptionUpdate::Eose => {
                if !eosed {
                    eosed = true;
                    shared.served.fetch_add(1, Ordering::SeqCst);
                    shared.complete_one();
                }
            }
            SubscriptionUpdate::Closed(reason) => {
                if is_auth_required_error(&reason) && !auth_attempted {
                    auth_attempted = true;
                    if let Some(signer) = signer.as_deref() {
                        if connection.authenticate(signer).await.is_ok() {
                            let (route_tx, new_rx) = mpsc::unbounded_channel();
                            if connection
                                .subscribe(&shared.id, filters.clone(), route_tx)
                                .is_ok()
                            {
                                debug!(relay = %url, "re-subscribed after auth");
                                route_rx = new_rx;
                                continue;
                            }
                        }
                    } else if let Some(handlers) = shared.handlers() {
                        if let Some(on_auth_needed) = &handlers.on_auth_needed {
                            on_auth_needed(&url);
                        }
                    }
                }

                // Terminal close for this relay.
                if let Some(handlers) = shared.handlers() {
                    if let Some(on_closed) = &handlers.on_closed {
                        on_closed(&url, &reason);
                    }
                }
                if !eosed {
                    eosed = true;
                    shared.complete_one();
                }
                break;
            }
        }
    }
}
