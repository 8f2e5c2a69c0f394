//! Nostr protocol value types for the driftline sync engine.
//!
//! One module per NIP, no I/O:
//! - `nip01` — events, ids, kind classification, coordinates, orderings
//! - `nip02` — follow lists (kind 3)
//! - `nip19` — bech32-encoded pointers (note/npub/nevent/nprofile/naddr)
//! - `nip42` — relay authentication and URL normalization
//! - `nip51` — mute, bookmark and favorite-relay lists
//! - `nip65` — relay list metadata (kind 10002)

pub mod nip01;
pub mod nip02;
pub mod nip19;
pub mod nip42;
pub mod nip51;
pub mod nip65;

// NIP-01: events and orderings
pub use nip01::{
    Coordinate, Event, EventTemplate, KIND_CONTACTS, KIND_METADATA, KIND_SHORT_TEXT_NOTE,
    KindClassification, Nip01Error, Profile, UnsignedEvent, classify_kind, event_id,
    is_addressable_kind, is_replaceable_kind, is_valid_hex, replaceable_order, serialize_event,
    sort_events, timeline_order,
};

// NIP-02: follow lists
pub use nip02::{CONTACT_LIST_KIND, Contact, followed_pubkeys, get_contacts};

// NIP-19: bech32 entities
pub use nip19::{
    AddressPointer, EventPointer, Nip19Entity, Nip19Error, ProfilePointer, decode, encode_naddr,
    encode_nevent, encode_note, encode_nprofile, encode_npub,
};

// NIP-42: relay auth
pub use nip42::{
    AUTH_KIND, AUTH_REQUIRED_PREFIX, Nip42Error, auth_event_template, is_auth_required_error,
    normalize_relay_url,
};

// NIP-51: lists
pub use nip51::{
    BookmarkItem, KIND_BOOKMARKS, KIND_FAVORITE_RELAYS, KIND_MUTE_LIST, bookmark_items,
    favorite_relays, muted_pubkeys,
};

// NIP-65: relay list metadata
pub use nip65::{
    Nip65Error, RELAY_LIST_METADATA_KIND, RelayEntry, RelayListMetadata, RelayMarker,
    create_relay_tag,
};
