//! NIP-19: bech32-encoded entities.
//!
//! Self-describing pointers to events, profiles and addressable events,
//! optionally carrying relay and author hints in a TLV payload:
//! - `note` — bare event id
//! - `npub` — bare public key
//! - `nevent` — event id + optional relays/author/kind
//! - `nprofile` — public key + optional relays
//! - `naddr` — addressable event coordinate + optional relays
//!
//! See: <https://github.com/nostr-protocol/nips/blob/master/19.md>

use thiserror::Error;

/// Errors that can occur during NIP-19 operations.
#[derive(Debug, Error)]
pub enum Nip19Error {
    #[error("bech32 encoding error: {0}")]
    Bech32Encode(String),

    #[error("bech32 decoding error: {0}")]
    Bech32Decode(String),

    #[error("unknown prefix: {0}")]
    UnknownPrefix(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("invalid hex: {0}")]
    InvalidHex(String),
}

// TLV types shared by nevent/nprofile/naddr payloads
const TLV_SPECIAL: u8 = 0;
const TLV_RELAY: u8 = 1;
const TLV_AUTHOR: u8 = 2;
const TLV_KIND: u8 = 3;

/// Pointer to a single event, with optional hints.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventPointer {
    /// Event id (64-char hex)
    pub id: String,
    /// Relay URLs where the event may be found
    pub relays: Vec<String>,
    /// Author pubkey hint (64-char hex)
    pub author: Option<String>,
    /// Event kind hint
    pub kind: Option<u16>,
}

/// Pointer to a profile, with optional relay hints.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfilePointer {
    /// Public key (64-char hex)
    pub pubkey: String,
    /// Relay URLs where the profile publishes
    pub relays: Vec<String>,
}

/// Pointer to an addressable event, with optional relay hints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressPointer {
    /// Author public key (64-char hex)
    pub pubkey: String,
    /// Event kind
    pub kind: u16,
    /// `d` tag value
    pub identifier: String,
    /// Relay URLs where the event may be found
    pub relays: Vec<String>,
}

/// A decoded NIP-19 entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Nip19Entity {
    /// `note1...` — bare event id
    Note(String),
    /// `npub1...` — bare public key
    Npub(String),
    /// `nevent1...`
    Event(EventPointer),
    /// `nprofile1...`
    Profile(ProfilePointer),
    /// `naddr1...`
    Address(AddressPointer),
}

/// Decode any supported NIP-19 string.
pub fn decode(encoded: &str) -> Result<Nip19Entity, Nip19Error> {
    let (hrp, data) =
        bech32::decode(encoded).map_err(|e| Nip19Error::Bech32Decode(e.to_string()))?;

    match hrp.as_str() {
        "note" => Ok(Nip19Entity::Note(bytes32_hex(&data)?)),
        "npub" => Ok(Nip19Entity::Npub(bytes32_hex(&data)?)),
        "nevent" => decode_nevent(&data).map(Nip19Entity::Event),
        "nprofile" => decode_nprofile(&data).map(Nip19Entity::Profile),
        "naddr" => decode_naddr(&data).map(Nip19Entity::Address),
        other => Err(Nip19Error::UnknownPrefix(other.to_string())),
    }
}

/// Encode an event id as a `note1...` string.
pub fn encode_note(id: &str) -> Result<String, Nip19Error> {
    encode_bech32("note", &hex_bytes32(id)?)
}

/// Encode a public key as an `npub1...` string.
pub fn encode_npub(pubkey: &str) -> Result<String, Nip19Error> {
    encode_bech32("npub", &hex_bytes32(pubkey)?)
}

/// Encode an event pointer as an `nevent1...` string.
pub fn encode_nevent(pointer: &EventPointer) -> Result<String, Nip19Error> {
    let mut payload = Vec::new();
    push_tlv(&mut payload, TLV_SPECIAL, &hex_bytes32(&pointer.id)?);
    for relay in &pointer.relays {
        push_tlv(&mut payload, TLV_RELAY, relay.as_bytes());
    }
    if let Some(author) = &pointer.author {
        push_tlv(&mut payload, TLV_AUTHOR, &hex_bytes32(author)?);
    }
    if let Some(kind) = pointer.kind {
        push_tlv(&mut payload, TLV_KIND, &u32::from(kind).to_be_bytes());
    }
    encode_bech32("nevent", &payload)
}

/// Encode a profile pointer as an `nprofile1...` string.
pub fn encode_nprofile(pointer: &ProfilePointer) -> Result<String, Nip19Error> {
    let mut payload = Vec::new();
    push_tlv(&mut payload, TLV_SPECIAL, &hex_bytes32(&pointer.pubkey)?);
    for relay in &pointer.relays {
        push_tlv(&mut payload, TLV_RELAY, relay.as_bytes());
    }
    encode_bech32("nprofile", &payload)
}

/// Encode an address pointer as an `naddr1...` string.
pub fn encode_naddr(pointer: &AddressPointer) -> Result<String, Nip19Error> {
    let mut payload = Vec::new();
    push_tlv(&mut payload, TLV_SPECIAL, pointer.identifier.as_bytes());
    for relay in &pointer.relays {
        push_tlv(&mut payload, TLV_RELAY, relay.as_bytes());
    }
    push_tlv(&mut payload, TLV_AUTHOR, &hex_bytes32(&pointer.pubkey)?);
    push_tlv(&mut payload, TLV_KIND, &u32::from(pointer.kind).to_be_bytes());
    encode_bech32("naddr", &payload)
}

fn decode_nevent(payload: &[u8]) -> Result<EventPointer, Nip19Error> {
    let mut pointer = EventPointer::default();
    for (tlv_type, value) in parse_tlv(payload)? {
        match tlv_type {
            TLV_SPECIAL => pointer.id = bytes32_hex(value)?,
            TLV_RELAY => pointer.relays.push(tlv_string(value)?),
            TLV_AUTHOR => pointer.author = Some(bytes32_hex(value)?),
            TLV_KIND => pointer.kind = Some(tlv_kind(value)?),
            _ => {} // unknown TLV types are ignored
        }
    }
    if pointer.id.is_empty() {
        return Err(Nip19Error::InvalidPayload("nevent missing id".to_string()));
    }
    Ok(pointer)
}

fn decode_nprofile(payload: &[u8]) -> Result<ProfilePointer, Nip19Error> {
    let mut pointer = ProfilePointer::default();
    for (tlv_type, value) in parse_tlv(payload)? {
        match tlv_type {
            TLV_SPECIAL => pointer.pubkey = bytes32_hex(value)?,
            TLV_RELAY => pointer.relays.push(tlv_string(value)?),
            _ => {}
        }
    }
    if pointer.pubkey.is_empty() {
        return Err(Nip19Error::InvalidPayload(
            "nprofile missing pubkey".to_string(),
        ));
    }
    Ok(pointer)
}

fn decode_naddr(payload: &[u8]) -> Result<AddressPointer, Nip19Error> {
    let mut identifier = None;
    let mut relays = Vec::new();
    let mut pubkey = None;
    let mut kind = None;
    for (tlv_type, value) in parse_tlv(payload)? {
        match tlv_type {
            TLV_SPECIAL => identifier = Some(tlv_string(value)?),
            TLV_RELAY => relays.push(tlv_string(value)?),
            TLV_AUTHOR => pubkey = Some(bytes32_hex(value)?),
            TLV_KIND => kind = Some(tlv_kind(value)?),
            _ => {}
        }
    }
    match (identifier, pubkey, kind) {
        (Some(identifier), Some(pubkey), Some(kind)) => Ok(AddressPointer {
            pubkey,
            kind,
            identifier,
            relays,
        }),
        _ => Err(Nip19Error::InvalidPayload(
            "naddr requires identifier, author and kind".to_string(),
        )),
    }
}

fn push_tlv(payload: &mut Vec<u8>, tlv_type: u8, value: &[u8]) {
    payload.push(tlv_type);
    payload.push(value.len() as u8);
    payload.extend_from_slice(value);
}

fn parse_tlv(mut payload: &[u8]) -> Result<Vec<(u8, &[u8])>, Nip19Error> {
    let mut entries = Vec::new();
    while !payload.is_empty() {
        if payload.len() < 2 {
            return Err(Nip19Error::InvalidPayload(
                "truncated TLV header".to_string(),
            ));
        }
        let tlv_type = payload[0];
        let len = payload[1] as usize;
        if payload.len() < 2 + len {
            return Err(Nip19Error::InvalidPayload("truncated TLV value".to_string()));
        }
        entries.push((tlv_type, &payload[2..2 + len]));
        payload = &payload[2 + len..];
    }
    Ok(entries)
}

fn tlv_string(value: &[u8]) -> Result<String, Nip19Error> {
    String::from_utf8(value.to_vec())
        .map_err(|_| Nip19Error::InvalidPayload("non-UTF-8 TLV value".to_string()))
}

fn tlv_kind(value: &[u8]) -> Result<u16, Nip19Error> {
    let bytes: [u8; 4] = value
        .try_into()
        .map_err(|_| Nip19Error::InvalidPayload("kind TLV must be 4 bytes".to_string()))?;
    u16::try_from(u32::from_be_bytes(bytes))
        .map_err(|_| Nip19Error::InvalidPayload("kind out of range".to_string()))
}

fn bytes32_hex(data: &[u8]) -> Result<String, Nip19Error> {
    if data.len() != 32 {
        return Err(Nip19Error::InvalidPayload(format!(
            "expected 32 bytes, got {}",
            data.len()
        )));
    }
    Ok(hex::encode(data))
}

fn hex_bytes32(s: &str) -> Result<[u8; 32], Nip19Error> {
    let bytes = hex::decode(s).map_err(|e| Nip19Error::InvalidHex(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| Nip19Error::InvalidHex("expected 32 bytes".to_string()))
}

fn encode_bech32(hrp: &str, data: &[u8]) -> Result<String, Nip19Error> {
    use bech32::{Bech32, Hrp};

    let hrp = Hrp::parse(hrp).map_err(|e| Nip19Error::Bech32Encode(e.to_string()))?;
    bech32::encode::<Bech32>(hrp, data).map_err(|e| Nip19Error::Bech32Encode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_note_roundtrip() {
        let id = "d".repeat(64);
        let encoded = encode_note(&id).unwrap();
        assert!(encoded.starts_with("note1"));
        assert_eq!(decode(&encoded).unwrap(), Nip19Entity::Note(id));
    }

    #[test]
    fn test_npub_roundtrip() {
        let pubkey = "7".repeat(64);
        let encoded = encode_npub(&pubkey).unwrap();
        assert!(encoded.starts_with("npub1"));
        assert_eq!(decode(&encoded).unwrap(), Nip19Entity::Npub(pubkey));
    }

    #[test]
    fn test_nevent_roundtrip() {
        let pointer = EventPointer {
            id: "e".repeat(64),
            relays: vec!["wss://relay.example.com".to_string()],
            author: Some("a".repeat(64)),
            kind: Some(1),
        };
        let encoded = encode_nevent(&pointer).unwrap();
        assert!(encoded.starts_with("nevent1"));
        assert_eq!(decode(&encoded).unwrap(), Nip19Entity::Event(pointer));
    }

    #[test]
    fn test_nprofile_roundtrip() {
        let pointer = ProfilePointer {
            pubkey: "b".repeat(64),
            relays: vec![
                "wss://r1.example.com".to_string(),
                "wss://r2.example.com".to_string(),
            ],
        };
        let encoded = encode_nprofile(&pointer).unwrap();
        assert_eq!(decode(&encoded).unwrap(), Nip19Entity::Profile(pointer));
    }

    #[test]
    fn test_naddr_roundtrip() {
        let pointer = AddressPointer {
            pubkey: "c".repeat(64),
            kind: 30023,
            identifier: "my-long-form-post".to_string(),
            relays: vec!["wss://relay.example.com".to_string()],
        };
        let encoded = encode_naddr(&pointer).unwrap();
        assert!(encoded.starts_with("naddr1"));
        assert_eq!(decode(&encoded).unwrap(), Nip19Entity::Address(pointer));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode("not bech32 at all").is_err());
        assert!(decode("nsec1qqqqqqqq").is_err());
    }

    #[test]
    fn test_naddr_requires_all_fields() {
        // nevent payload under an naddr-shaped decode is missing author/kind
        let mut payload = Vec::new();
        push_tlv(&mut payload, TLV_SPECIAL, b"identifier-only");
        assert!(decode_naddr(&payload).is_err());
    }

    #[test]
    fn test_unknown_tlv_types_ignored() {
        let mut payload = Vec::new();
        push_tlv(&mut payload, TLV_SPECIAL, &[0xab; 32]);
        push_tlv(&mut payload, 99, b"future extension");
        let pointer = decode_nevent(&payload).unwrap();
        assert_eq!(pointer.id, hex::encode([0xab; 32]));
    }
}
