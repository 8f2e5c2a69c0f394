//! NIP-02: Follow List (Contact List)
//!
//! Users publish their follow lists as kind 3 events, one "p" tag per
//! followed profile with an optional relay URL and petname.
//!
//! See: <https://github.com/nostr-protocol/nips/blob/master/02.md>

use crate::nip01::{Event, KIND_CONTACTS, is_valid_hex};
use std::collections::HashSet;

/// Event kind for contact lists (follow lists)
pub const CONTACT_LIST_KIND: u16 = KIND_CONTACTS;

/// A single contact in a follow list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    /// The public key of the followed profile (32-byte hex)
    pub pubkey: String,
    /// Optional relay URL where this profile can be found
    pub relay_url: Option<String>,
    /// Optional local petname for this contact
    pub petname: Option<String>,
}

/// Extract the contacts from a kind 3 event.
///
/// Malformed "p" tags are skipped; anything that is not a kind 3 event
/// yields an empty list.
pub fn get_contacts(event: &Event) -> Vec<Contact> {
    if event.kind != CONTACT_LIST_KIND {
        return Vec::new();
    }

    event
        .tags
        .iter()
        .filter(|tag| tag.first().map(String::as_str) == Some("p"))
        .filter_map(|tag| {
            let pubkey = tag.get(1)?;
            if !is_valid_hex(pubkey, 64) {
                return None;
            }
            Some(Contact {
                pubkey: pubkey.clone(),
                relay_url: tag.get(2).filter(|s| !s.is_empty()).cloned(),
                petname: tag.get(3).filter(|s| !s.is_empty()).cloned(),
            })
        })
        .collect()
}

/// Followed pubkeys in tag order, deduplicated.
pub fn followed_pubkeys(event: &Event) -> Vec<String> {
    let mut seen = HashSet::new();
    get_contacts(event)
        .into_iter()
        .filter(|c| seen.insert(c.pubkey.clone()))
        .map(|c| c.pubkey)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn follow_event(tags: Vec<Vec<String>>) -> Event {
        Event {
            id: "0".repeat(64),
            pubkey: "a".repeat(64),
            created_at: 1,
            kind: CONTACT_LIST_KIND,
            tags,
            content: String::new(),
            sig: "0".repeat(128),
        }
    }

    #[test]
    fn test_get_contacts() {
        let event = follow_event(vec![
            vec![
                "p".to_string(),
                "b".repeat(64),
                "wss://relay.example.com".to_string(),
                "bob".to_string(),
            ],
            vec!["p".to_string(), "c".repeat(64)],
            vec!["t".to_string(), "ignored".to_string()],
            vec!["p".to_string(), "not-a-pubkey".to_string()],
        ]);

        let contacts = get_contacts(&event);
        assert_eq!(contacts.len(), 2);
        assert_eq!(contacts[0].pubkey, "b".repeat(64));
        assert_eq!(
            contacts[0].relay_url.as_deref(),
            Some("wss://relay.example.com")
        );
        assert_eq!(contacts[0].petname.as_deref(), Some("bob"));
        assert_eq!(contacts[1].relay_url, None);
    }

    #[test]
    fn test_followed_pubkeys_dedup() {
        let event = follow_event(vec![
            vec!["p".to_string(), "b".repeat(64)],
            vec!["p".to_string(), "c".repeat(64)],
            vec!["p".to_string(), "b".repeat(64)],
        ]);
        assert_eq!(followed_pubkeys(&event), vec!["b".repeat(64), "c".repeat(64)]);
    }

    #[test]
    fn test_wrong_kind_is_empty() {
        let mut event = follow_event(vec![vec!["p".to_string(), "b".repeat(64)]]);
        event.kind = 1;
        assert!(get_contacts(&event).is_empty());
    }
}
