//! Publish/broadcast coordination.
//!
//! Picks the relay set an outgoing event should land on, then fans the
//! publish out to all of them. Target selection follows the outbox
//! model: mentioned parties' read relays plus the author's own write
//! relays, with the index relays as the fallback when nothing better is
//! known. Relay-list-type kinds are additionally broadcast to the index
//! relays regardless, so other clients can discover them.
//!
//! Publishing succeeds as soon as any one target accepts; only when
//! every target fails does the caller see an error, carrying each
//! relay's individual failure reason.

use crate::error::{ClientError, Result};
use crate::pool::ConnectionPool;
use crate::replaceable::ReplaceableStore;
use crate::signer::Signer;
use driftline_core::{
    Coordinate, Event, KIND_CONTACTS, KIND_FAVORITE_RELAYS, RELAY_LIST_METADATA_KIND,
    RelayListMetadata, is_valid_hex, normalize_relay_url,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Read relays consulted per mentioned party.
const MENTION_RELAY_CAP: usize = 4;
/// Write relays taken from the author's own relay list.
const AUTHOR_WRITE_CAP: usize = 10;

/// Kinds that always also go to the index relays, for discoverability.
const BROADCAST_KINDS: [u16; 3] = [KIND_CONTACTS, RELAY_LIST_METADATA_KIND, KIND_FAVORITE_RELAYS];

/// Caller-supplied target overrides.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Use exactly these relays instead of computing targets.
    pub explicit_relays: Option<Vec<String>>,
    /// Additional relays appended to whichever set is used.
    pub extra_relays: Vec<String>,
}

/// Determines targets and fans out publishes.
pub struct Publisher {
    pool: Arc<ConnectionPool>,
    replaceable: Arc<ReplaceableStore>,
    signer: Option<Arc<dyn Signer>>,
    index_relays: Vec<String>,
}

impl Publisher {
    pub fn new(
        pool: Arc<ConnectionPool>,
        replaceable: Arc<ReplaceableStore>,
        signer: Option<Arc<dyn Signer>>,
        index_relays: Vec<String>,
    ) -> Self {
        Self {
            pool,
            replaceable,
            signer,
            index_relays,
        }
    }

    /// The relay set this event should be published to.
    pub async fn determine_targets(
        &self,
        event: &Event,
        options: &PublishOptions,
    ) -> Vec<String> {
        let mut targets: Vec<String> = Vec::new();

        if let Some(explicit) = &options.explicit_relays {
            targets.extend(explicit.iter().cloned());
        } else {
            for mention in mentioned_pubkeys(event) {
                let read_relays = self.read_relays_of(&mention).await;
                targets.extend(read_relays.into_iter().take(MENTION_RELAY_CAP));
            }

            let write_relays = self.write_relays_of(&event.pubkey).await;
            targets.extend(write_relays.into_iter().take(AUTHOR_WRITE_CAP));

            if targets.is_empty() {
                targets.extend(self.index_relays.iter().cloned());
            }
        }

        targets.extend(options.extra_relays.iter().cloned());

        if BROADCAST_KINDS.contains(&event.kind) {
            targets.extend(self.index_relays.iter().cloned());
        }

        normalize_and_dedup(targets)
    }

    /// Publish to every target concurrently; resolve on the first
    /// acceptance without waiting for the stragglers.
    pub async fn publish(&self, event: &Event, targets: &[String]) -> Result<()> {
        if targets.is_empty() {
            return Err(ClientError::Connection("no publish targets".to_string()));
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        for url in targets {
            let pool = Arc::clone(&self.pool);
            let event = event.clone();
            let signer = self.signer.clone();
            let url = url.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = pool.publish(&url, &event, signer.as_deref()).await;
                let _ = tx.send((url, result));
            });
        }
        drop(tx);

        let mut failures = Vec::new();
        while let Some((url, result)) = rx.recv().await {
            match result {
                Ok(()) => {
                    debug!(relay = %url, event = %event.id, "publish accepted");
                    return Ok(());
                }
                Err(e) => {
                    warn!(relay = %url, error = %e, "publish failed");
                    failures.push((url, e.to_string()));
                }
            }
        }
        Err(ClientError::PublishFailed { failures })
    }

    /// Determine targets and publish in one step.
    pub async fn broadcast(&self, event: &Event, options: &PublishOptions) -> Result<()> {
        let targets = self.determine_targets(event, options).await;
        self.publish(event, &targets).await
    }

    async fn read_relays_of(&self, pubkey: &str) -> Vec<String> {
        match self.relay_list_of(pubkey).await {
            Some(list) => list.read_relays(),
            None => Vec::new(),
        }
    }

    async fn write_relays_of(&self, pubkey: &str) -> Vec<String> {
        match self.relay_list_of(pubkey).await {
            Some(list) => list.write_relays(),
            None => Vec::new(),
        }
    }

    async fn relay_list_of(&self, pubkey: &str) -> Option<RelayListMetadata> {
        let coordinate = Coordinate::new(RELAY_LIST_METADATA_KIND, pubkey);
        match self.replaceable.fetch(&coordinate).await {
            Ok(Some(event)) => RelayListMetadata::from_event(&event).ok(),
            Ok(None) => None,
            Err(e) => {
                warn!(pubkey, error = %e, "relay list lookup failed");
                None
            }
        }
    }
}

/// Distinct valid pubkeys from the event's `p` tags, in tag order.
fn mentioned_pubkeys(event: &Event) -> Vec<String> {
    let mut pubkeys = Vec::new();
    for value in event.tag_values("p") {
        if is_valid_hex(value, 64) && !pubkeys.iter().any(|p| p == value) {
            pubkeys.push(value.to_string());
        }
    }
    pubkeys
}

fn normalize_and_dedup(urls: Vec<String>) -> Vec<String> {
    let mut out = Vec::new();
    for url in urls {
        let Ok(normalized) = normalize_relay_url(&url) else {
            continue;
        };
        if !out.contains(&normalized) {
            out.push(normalized);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchConfig;
    use crate::error::Result as ClientResult;
    use crate::message::{ClientMessage, RelayMessage};
    use crate::pool::ConnectionPool;
    use crate::store::MemoryStore;
    use crate::subscription::SubscriptionMultiplexer;
    use crate::transport::{RelayIo, Transport};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::time::Duration;

    const INDEX: &str = "wss://index.example.com";

    /// How a scripted relay responds to EVENT messages.
    #[derive(Clone)]
    enum PublishBehavior {
        Accept,
        Reject(&'static str),
        /// Connects but never sends OK.
        Silent,
    }

    #[derive(Default)]
    struct PublishTransport {
        behaviors: Mutex<HashMap<String, PublishBehavior>>,
        /// Replaceable events served to REQ queries (relay lists).
        stored: Mutex<Vec<Event>>,
    }

    impl PublishTransport {
        fn relay(self, url: &str, behavior: PublishBehavior) -> Self {
            self.behaviors.lock().insert(url.to_string(), behavior);
            self
        }

        fn with_stored(self, events: Vec<Event>) -> Self {
            *self.stored.lock() = events;
            self
        }
    }

    #[async_trait]
    impl Transport for PublishTransport {
        async fn open(&self, url: &str) -> ClientResult<RelayIo> {
            let behavior = self
                .behaviors
                .lock()
                .get(url)
                .cloned()
                .unwrap_or(PublishBehavior::Accept);
            let stored = self.stored.lock().clone();
            let (io, mut out_rx, in_tx) = RelayIo::pipe();
            tokio::spawn(async move {
                while let Some(msg) = out_rx.recv().await {
                    match msg {
                        ClientMessage::Event(event) => match &behavior {
                            PublishBehavior::Accept => {
                                let _ = in_tx.send(RelayMessage::Ok {
                                    event_id: event.id,
                                    success: true,
                                    message: String::new(),
                                });
                            }
                            PublishBehavior::Reject(reason) => {
                                let _ = in_tx.send(RelayMessage::Ok {
                                    event_id: event.id,
                                    success: false,
                                    message: (*reason).to_string(),
                                });
                            }
                            PublishBehavior::Silent => {}
                        },
                        ClientMessage::Req {
                            subscription_id, ..
                        } => {
                            for event in &stored {
                                let _ = in_tx.send(RelayMessage::Event {
                                    subscription_id: subscription_id.clone(),
                                    event: event.clone(),
                                });
                            }
                            let _ = in_tx.send(RelayMessage::Eose { subscription_id });
                        }
                        _ => {}
                    }
                }
            });
            Ok(io)
        }
    }

    fn publisher(transport: PublishTransport) -> Publisher {
        let pool = Arc::new(ConnectionPool::with_timeout(
            Arc::new(transport),
            Duration::from_millis(50),
        ));
        let mux = Arc::new(SubscriptionMultiplexer::new(Arc::clone(&pool), None));
        let replaceable = Arc::new(ReplaceableStore::new(
            mux,
            Arc::new(MemoryStore::default()),
            vec![INDEX.to_string()],
            BatchConfig::default(),
        ));
        Publisher::new(pool, replaceable, None, vec![INDEX.to_string()])
    }

    fn note_event(tags: Vec<Vec<String>>) -> Event {
        Event {
            id: "5".repeat(64),
            pubkey: "a".repeat(64),
            created_at: 100,
            kind: 1,
            tags,
            content: "hi".to_string(),
            sig: "0".repeat(128),
        }
    }

    fn relay_list(pubkey: &str, id_char: char, entries: Vec<(&str, &str)>) -> Event {
        Event {
            id: id_char.to_string().repeat(64),
            pubkey: pubkey.to_string(),
            created_at: 100,
            kind: RELAY_LIST_METADATA_KIND,
            tags: entries
                .into_iter()
                .map(|(url, marker)| {
                    vec!["r".to_string(), url.to_string(), marker.to_string()]
                })
                .collect(),
            content: String::new(),
            sig: "0".repeat(128),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_acceptance_wins() {
        let publisher = publisher(
            PublishTransport::default()
                .relay("wss://r1.example.com", PublishBehavior::Reject("nope"))
                .relay("wss://r2.example.com", PublishBehavior::Accept)
                .relay("wss://r3.example.com", PublishBehavior::Silent),
        );

        // Succeeds without waiting for the silent relay's confirmation
        // timeout.
        publisher
            .publish(
                &note_event(vec![]),
                &[
                    "wss://r1.example.com".to_string(),
                    "wss://r2.example.com".to_string(),
                    "wss://r3.example.com".to_string(),
                ],
            )
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_rejections_aggregate() {
        let publisher = publisher(
            PublishTransport::default()
                .relay("wss://r1.example.com", PublishBehavior::Reject("blocked: spam"))
                .relay("wss://r2.example.com", PublishBehavior::Reject("pow: too low")),
        );

        let err = publisher
            .publish(
                &note_event(vec![]),
                &[
                    "wss://r1.example.com".to_string(),
                    "wss://r2.example.com".to_string(),
                ],
            )
            .await
            .unwrap_err();

        match err {
            ClientError::PublishFailed { failures } => {
                assert_eq!(failures.len(), 2);
                let messages: Vec<&str> =
                    failures.iter().map(|(_, m)| m.as_str()).collect();
                assert!(messages.iter().any(|m| m.contains("blocked: spam")));
                assert!(messages.iter().any(|m| m.contains("pow: too low")));
            }
            other => panic!("expected PublishFailed, got {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_relays_used_verbatim() {
        let publisher = publisher(PublishTransport::default());
        let targets = publisher
            .determine_targets(
                &note_event(vec![]),
                &PublishOptions {
                    explicit_relays: Some(vec!["wss://Only.Example.Com/".to_string()]),
                    ..Default::default()
                },
            )
            .await;
        assert_eq!(targets, vec!["wss://only.example.com"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_kind_always_adds_index_relays() {
        let publisher = publisher(PublishTransport::default());
        let relay_list_event = relay_list(&"a".repeat(64), '1', vec![]);
        let targets = publisher
            .determine_targets(
                &relay_list_event,
                &PublishOptions {
                    explicit_relays: Some(vec!["wss://mine.example.com".to_string()]),
                    ..Default::default()
                },
            )
            .await;
        assert!(targets.contains(&"wss://mine.example.com".to_string()));
        assert!(targets.contains(&INDEX.to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_targets_from_mention_and_author_relay_lists() {
        let author = "a".repeat(64);
        let mention = "b".repeat(64);
        let publisher = publisher(PublishTransport::default().with_stored(vec![
            relay_list(&author, '1', vec![("wss://author-write.example.com", "write")]),
            relay_list(&mention, '2', vec![("wss://mention-read.example.com", "read")]),
        ]));

        let event = note_event(vec![vec!["p".to_string(), mention.clone()]]);
        let targets = publisher
            .determine_targets(&event, &PublishOptions::default())
            .await;

        assert!(targets.contains(&"wss://mention-read.example.com".to_string()));
        assert!(targets.contains(&"wss://author-write.example.com".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_to_index_relays() {
        let publisher = publisher(PublishTransport::default());
        let targets = publisher
            .determine_targets(&note_event(vec![]), &PublishOptions::default())
            .await;
        assert_eq!(targets, vec![INDEX.to_string()]);
    }
}
