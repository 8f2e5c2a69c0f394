//! NIP-65: Relay List Metadata
//!
//! A replaceable event (kind 10002) advertising the relays a user writes
//! to and reads mentions from, used for relay discovery and outbox-model
//! routing.
//!
//! See: <https://github.com/nostr-protocol/nips/blob/master/65.md>

use crate::nip01::Event;
use crate::nip42::normalize_relay_url;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

/// Event kind for relay list metadata
pub const RELAY_LIST_METADATA_KIND: u16 = 10002;

/// Tag name for relay entries
pub const RELAY_TAG: &str = "r";

/// Errors that can occur during NIP-65 operations
#[derive(Debug, Error)]
pub enum Nip65Error {
    #[error("event is not a relay list metadata event (kind {0})")]
    InvalidKind(u16),
}

/// Relay marker indicating usage type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayMarker {
    /// Relay is used for reading mentions
    Read,
    /// Relay is used for writing own events
    Write,
    /// Relay is used for both (the default when no marker is present)
    ReadWrite,
}

impl RelayMarker {
    /// Marker string as it appears in the tag; `None` for the implicit
    /// read/write default.
    pub fn to_str(&self) -> Option<&str> {
        match self {
            RelayMarker::Read => Some("read"),
            RelayMarker::Write => Some("write"),
            RelayMarker::ReadWrite => None,
        }
    }

    pub fn can_read(&self) -> bool {
        matches!(self, RelayMarker::Read | RelayMarker::ReadWrite)
    }

    pub fn can_write(&self) -> bool {
        matches!(self, RelayMarker::Write | RelayMarker::ReadWrite)
    }
}

/// A relay entry in the relay list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEntry {
    /// Normalized relay URL
    pub url: String,
    /// Marker indicating read/write capability
    pub marker: RelayMarker,
}

/// Relay list metadata decoded from a kind 10002 event
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayListMetadata {
    /// Relay entries in tag order
    pub relays: Vec<RelayEntry>,
}

impl RelayListMetadata {
    /// Decode the relay list carried by a kind 10002 event.
    ///
    /// Tags with unparseable URLs are skipped; duplicate URLs keep their
    /// first entry.
    pub fn from_event(event: &Event) -> Result<Self, Nip65Error> {
        if event.kind != RELAY_LIST_METADATA_KIND {
            return Err(Nip65Error::InvalidKind(event.kind));
        }

        let mut seen = HashSet::new();
        let relays = event
            .tags
            .iter()
            .filter(|tag| tag.first().map(String::as_str) == Some(RELAY_TAG))
            .filter_map(|tag| {
                let url = normalize_relay_url(tag.get(1)?).ok()?;
                if !seen.insert(url.clone()) {
                    return None;
                }
                let marker = match tag.get(2).map(String::as_str) {
                    Some("read") => RelayMarker::Read,
                    Some("write") => RelayMarker::Write,
                    _ => RelayMarker::ReadWrite,
                };
                Some(RelayEntry { url, marker })
            })
            .collect();

        Ok(Self { relays })
    }

    /// Relays the author reads mentions from.
    pub fn read_relays(&self) -> Vec<String> {
        self.relays
            .iter()
            .filter(|r| r.marker.can_read())
            .map(|r| r.url.clone())
            .collect()
    }

    /// Relays the author writes own events to.
    pub fn write_relays(&self) -> Vec<String> {
        self.relays
            .iter()
            .filter(|r| r.marker.can_write())
            .map(|r| r.url.clone())
            .collect()
    }

    /// All listed relays regardless of marker.
    pub fn all_relays(&self) -> Vec<String> {
        self.relays.iter().map(|r| r.url.clone()).collect()
    }
}

/// Build an `r` tag for a relay list event.
pub fn create_relay_tag(url: &str, marker: RelayMarker) -> Vec<String> {
    let mut tag = vec![RELAY_TAG.to_string(), url.to_string()];
    if let Some(marker) = marker.to_str() {
        tag.push(marker.to_string());
    }
    tag
}
