//! NIP-01: Basic protocol flow description.
//!
//! This module implements the core Nostr event structure and operations:
//! - Event structure (id, pubkey, created_at, kind, tags, content, sig)
//! - Event serialization and id hashing
//! - Kind classification (regular, replaceable, ephemeral, addressable)
//! - Replaceable coordinates and the total orders used for conflict
//!   resolution and timeline ordering

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use thiserror::Error;

/// Errors that can occur during NIP-01 operations.
#[derive(Debug, Error)]
pub enum Nip01Error {
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid hex: {0}")]
    InvalidHex(String),
}

/// A signed Nostr event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// 32-bytes lowercase hex-encoded sha256 of the serialized event data
    pub id: String,
    /// 32-bytes lowercase hex-encoded public key of the event creator
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind (integer between 0 and 65535)
    pub kind: u16,
    /// Array of arrays of strings (tags)
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    pub content: String,
    /// 64-bytes lowercase hex signature
    pub sig: String,
}

impl Event {
    /// First value of the first tag with the given name, if any.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.first().map(String::as_str) == Some(name))
            .and_then(|t| t.get(1))
            .map(String::as_str)
    }

    /// All second elements of tags with the given name.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.tags
            .iter()
            .filter(move |t| t.first().map(String::as_str) == Some(name))
            .filter_map(|t| t.get(1))
            .map(String::as_str)
    }

    /// The `d` tag value for addressable events (empty string when missing).
    pub fn d_tag(&self) -> &str {
        self.tag_value("d").unwrap_or("")
    }
}

/// A template for creating events (without pubkey, which comes from the signer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTemplate {
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind
    pub kind: u16,
    /// Array of arrays of strings (tags)
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    pub content: String,
}

/// An unsigned event (template plus author).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedEvent {
    /// 32-bytes lowercase hex-encoded public key of the event creator
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind
    pub kind: u16,
    /// Array of arrays of strings (tags)
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    pub content: String,
}

impl UnsignedEvent {
    /// Attach an author pubkey to a template.
    pub fn from_template(template: EventTemplate, pubkey: impl Into<String>) -> Self {
        Self {
            pubkey: pubkey.into(),
            created_at: template.created_at,
            kind: template.kind,
            tags: template.tags,
            content: template.content,
        }
    }
}

/// Event kind classification according to NIP-01.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindClassification {
    /// Events expected to be stored by relays
    Regular,
    /// Only latest event per pubkey+kind is stored
    Replaceable,
    /// Not expected to be stored by relays
    Ephemeral,
    /// Only latest event per pubkey+kind+d-tag is stored
    Addressable,
}

// Standard event kinds
pub const KIND_METADATA: u16 = 0;
pub const KIND_SHORT_TEXT_NOTE: u16 = 1;
pub const KIND_CONTACTS: u16 = 3;

/// Serialize an unsigned event for hashing.
///
/// Format: `[0, pubkey, created_at, kind, tags, content]`
pub fn serialize_event(event: &UnsignedEvent) -> Result<String, Nip01Error> {
    if !is_valid_hex(&event.pubkey, 64) {
        return Err(Nip01Error::InvalidEvent(
            "pubkey must be 64 lowercase hex characters".to_string(),
        ));
    }

    serde_json::to_string(&(
        0,
        &event.pubkey,
        event.created_at,
        event.kind,
        &event.tags,
        &event.content,
    ))
    .map_err(|e| Nip01Error::Serialization(e.to_string()))
}

/// Compute the event id: sha256 over the canonical serialization.
pub fn event_id(event: &UnsignedEvent) -> Result<String, Nip01Error> {
    let serialized = serialize_event(event)?;
    let hash = Sha256::digest(serialized.as_bytes());
    Ok(hex::encode(hash))
}

/// Check a string is exactly `len` lowercase hex characters.
pub fn is_valid_hex(s: &str, len: usize) -> bool {
    s.len() == len
        && s.chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

/// Classify an event kind.
pub fn classify_kind(kind: u16) -> KindClassification {
    match kind {
        KIND_METADATA | KIND_CONTACTS => KindClassification::Replaceable,
        10000..=19999 => KindClassification::Replaceable,
        20000..=29999 => KindClassification::Ephemeral,
        30000..=39999 => KindClassification::Addressable,
        _ => KindClassification::Regular,
    }
}

/// Whether only the latest event per (pubkey, kind) is canonical.
pub fn is_replaceable_kind(kind: u16) -> bool {
    classify_kind(kind) == KindClassification::Replaceable
}

/// Whether only the latest event per (pubkey, kind, d-tag) is canonical.
pub fn is_addressable_kind(kind: u16) -> bool {
    classify_kind(kind) == KindClassification::Addressable
}

/// Identity of a replaceable event across its versions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Coordinate {
    pub kind: u16,
    pub pubkey: String,
    /// `d` tag value; `None` for non-addressable kinds.
    pub identifier: Option<String>,
}

impl Coordinate {
    pub fn new(kind: u16, pubkey: impl Into<String>) -> Self {
        Self {
            kind,
            pubkey: pubkey.into(),
            identifier: None,
        }
    }

    pub fn addressable(
        kind: u16,
        pubkey: impl Into<String>,
        identifier: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            pubkey: pubkey.into(),
            identifier: Some(identifier.into()),
        }
    }

    /// Derive the coordinate of a replaceable or addressable event.
    pub fn from_event(event: &Event) -> Option<Self> {
        if is_addressable_kind(event.kind) {
            Some(Self::addressable(event.kind, &event.pubkey, event.d_tag()))
        } else if is_replaceable_kind(event.kind) {
            Some(Self::new(event.kind, &event.pubkey))
        } else {
            None
        }
    }

    /// `kind:pubkey:identifier` form used in `a` tags.
    pub fn to_tag_value(&self) -> String {
        format!(
            "{}:{}:{}",
            self.kind,
            self.pubkey,
            self.identifier.as_deref().unwrap_or("")
        )
    }

    /// Parse a `kind:pubkey:identifier` string.
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.splitn(3, ':');
        let kind: u16 = parts.next()?.parse().ok()?;
        let pubkey = parts.next()?;
        if !is_valid_hex(pubkey, 64) {
            return None;
        }
        let identifier = parts.next().unwrap_or("");
        if is_addressable_kind(kind) {
            Some(Self::addressable(kind, pubkey, identifier))
        } else {
            Some(Self::new(kind, pubkey))
        }
    }
}

/// Total order for replaceable conflict resolution: newest `created_at`
/// wins, ties broken by lexicographically smallest id.
///
/// Returns `Greater` when `a` is the more canonical event.
pub fn replaceable_order(a: &Event, b: &Event) -> Ordering {
    a.created_at
        .cmp(&b.created_at)
        .then_with(|| b.id.cmp(&a.id))
}

/// Total order for timeline display: newest `created_at` first, ties
/// broken by id descending.
///
/// Returns `Less` when `a` sorts before (newer than) `b`.
pub fn timeline_order(a: &Event, b: &Event) -> Ordering {
    b.created_at
        .cmp(&a.created_at)
        .then_with(|| b.id.cmp(&a.id))
}

/// Sort events newest-first for timeline display.
pub fn sort_events(events: &mut [Event]) {
    events.sort_by(timeline_order);
}

/// User profile decoded from a kind-0 metadata event.
///
/// Parsing is lenient: unknown fields are ignored and malformed content
/// yields an empty profile rather than an error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub about: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub banner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nip05: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lud16: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
}

impl Profile {
    /// Decode the profile carried by a kind-0 event.
    pub fn from_event(event: &Event) -> Self {
        if event.kind != KIND_METADATA {
            return Self::default();
        }
        serde_json::from_str(&event.content).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn test_event(id: &str, kind: u16, created_at: u64) -> Event {
        Event {
            id: id.to_string(),
            pubkey: "a".repeat(64),
            created_at,
            kind,
            tags: vec![],
            content: String::new(),
            sig: "0".repeat(128),
        }
    }

    #[test]
    fn test_classify_kind() {
        assert_eq!(classify_kind(0), KindClassification::Replaceable);
        assert_eq!(classify_kind(1), KindClassification::Regular);
        assert_eq!(classify_kind(3), KindClassification::Replaceable);
        assert_eq!(classify_kind(10002), KindClassification::Replaceable);
        assert_eq!(classify_kind(22242), KindClassification::Ephemeral);
        assert_eq!(classify_kind(30023), KindClassification::Addressable);
    }

    #[test]
    fn test_event_id_deterministic() {
        let unsigned = UnsignedEvent {
            pubkey: "a".repeat(64),
            created_at: 1_700_000_000,
            kind: 1,
            tags: vec![vec!["t".to_string(), "nostr".to_string()]],
            content: "hello".to_string(),
        };
        let id1 = event_id(&unsigned).unwrap();
        let id2 = event_id(&unsigned).unwrap();
        assert_eq!(id1, id2);
        assert_eq!(id1.len(), 64);
    }

    #[test]
    fn test_event_id_rejects_bad_pubkey() {
        let unsigned = UnsignedEvent {
            pubkey: "not-hex".to_string(),
            created_at: 0,
            kind: 1,
            tags: vec![],
            content: String::new(),
        };
        assert!(event_id(&unsigned).is_err());
    }

    #[test]
    fn test_replaceable_order_newest_wins() {
        let older = test_event(&"b".repeat(64), 0, 100);
        let newer = test_event(&"c".repeat(64), 0, 200);
        assert_eq!(replaceable_order(&newer, &older), Ordering::Greater);
    }

    #[test]
    fn test_replaceable_order_tie_smallest_id_wins() {
        let small_id = test_event(&"1".repeat(64), 0, 100);
        let large_id = test_event(&"f".repeat(64), 0, 100);
        assert_eq!(replaceable_order(&small_id, &large_id), Ordering::Greater);
    }

    #[test]
    fn test_timeline_order_ties_id_descending() {
        let mut events = vec![
            test_event(&"1".repeat(64), 1, 100),
            test_event(&"f".repeat(64), 1, 100),
            test_event(&"2".repeat(64), 1, 200),
        ];
        sort_events(&mut events);
        assert_eq!(events[0].created_at, 200);
        assert_eq!(events[1].id, "f".repeat(64));
        assert_eq!(events[2].id, "1".repeat(64));
    }

    #[test]
    fn test_coordinate_from_event() {
        let replaceable = test_event(&"b".repeat(64), 10002, 1);
        let coord = Coordinate::from_event(&replaceable).unwrap();
        assert_eq!(coord.kind, 10002);
        assert_eq!(coord.identifier, None);

        let mut addressable = test_event(&"c".repeat(64), 30023, 1);
        addressable.tags = vec![vec!["d".to_string(), "my-post".to_string()]];
        let coord = Coordinate::from_event(&addressable).unwrap();
        assert_eq!(coord.identifier.as_deref(), Some("my-post"));

        let regular = test_event(&"d".repeat(64), 1, 1);
        assert!(Coordinate::from_event(&regular).is_none());
    }

    #[test]
    fn test_coordinate_parse_roundtrip() {
        let coord = Coordinate::addressable(30023, "a".repeat(64), "post");
        let parsed = Coordinate::parse(&coord.to_tag_value()).unwrap();
        assert_eq!(parsed, coord);
        assert!(Coordinate::parse("nonsense").is_none());
    }

    #[test]
    fn test_profile_lenient_parse() {
        let mut event = test_event(&"e".repeat(64), 0, 1);
        event.content = r#"{"name":"alice","nip05":"alice@example.com","x":1}"#.to_string();
        let profile = Profile::from_event(&event);
        assert_eq!(profile.name.as_deref(), Some("alice"));
        assert_eq!(profile.nip05.as_deref(), Some("alice@example.com"));

        event.content = "{broken".to_string();
        assert_eq!(Profile::from_event(&event), Profile::default());
    }

    #[test]
    fn test_tag_helpers() {
        let mut event = test_event(&"e".repeat(64), 30023, 1);
        event.tags = vec![
            vec!["d".to_string(), "slug".to_string()],
            vec!["p".to_string(), "a".repeat(64)],
            vec!["p".to_string(), "b".repeat(64)],
        ];
        assert_eq!(event.d_tag(), "slug");
        assert_eq!(event.tag_values("p").count(), 2);
    }
}
