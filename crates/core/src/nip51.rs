//! NIP-51: Lists.
//!
//! Standard replaceable list kinds and extraction of their public
//! entries. Private (encrypted) list entries are out of scope; only the
//! plain tag section of each list event is decoded.
//!
//! See: <https://github.com/nostr-protocol/nips/blob/master/51.md>

use crate::nip01::{Coordinate, Event, is_valid_hex};

/// Kind for mute lists (muted pubkeys).
pub const KIND_MUTE_LIST: u16 = 10000;

/// Kind for bookmark lists.
pub const KIND_BOOKMARKS: u16 = 10003;

/// Kind for favorite relay lists.
pub const KIND_FAVORITE_RELAYS: u16 = 10012;

/// A bookmarked item: either a plain event or an addressable event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookmarkItem {
    /// `e` tag — event id, optional relay hint
    Event { id: String, relay: Option<String> },
    /// `a` tag — replaceable coordinate
    Address(Coordinate),
}

/// Muted pubkeys from the public section of a kind 10000 event.
pub fn muted_pubkeys(event: &Event) -> Vec<String> {
    if event.kind != KIND_MUTE_LIST {
        return Vec::new();
    }
    event
        .tag_values("p")
        .filter(|p| is_valid_hex(p, 64))
        .map(str::to_string)
        .collect()
}

/// Bookmarked items from the public section of a kind 10003 event,
/// preserving tag order.
pub fn bookmark_items(event: &Event) -> Vec<BookmarkItem> {
    if event.kind != KIND_BOOKMARKS {
        return Vec::new();
    }
    event
        .tags
        .iter()
        .filter_map(|tag| match tag.first().map(String::as_str) {
            Some("e") => {
                let id = tag.get(1)?;
                if !is_valid_hex(id, 64) {
                    return None;
                }
                Some(BookmarkItem::Event {
                    id: id.clone(),
                    relay: tag.get(2).filter(|s| !s.is_empty()).cloned(),
                })
            }
            Some("a") => Coordinate::parse(tag.get(1)?).map(BookmarkItem::Address),
            _ => None,
        })
        .collect()
}

/// Favorite relay URLs from a kind 10012 event.
pub fn favorite_relays(event: &Event) -> Vec<String> {
    if event.kind != KIND_FAVORITE_RELAYS {
        return Vec::new();
    }
    event.tag_values("relay").map(str::to_string).collect()
}
