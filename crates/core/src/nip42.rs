//! NIP-42: Authentication of clients to relays.
//!
//! Relays may demand a challenge/response handshake before serving or
//! accepting events. The client proves key ownership by signing an
//! ephemeral kind 22242 event carrying the relay URL and the challenge.
//!
//! See: <https://github.com/nostr-protocol/nips/blob/master/42.md>

use crate::nip01::EventTemplate;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use url::Url;

/// Kind for client authentication events.
pub const AUTH_KIND: u16 = 22242;

/// Machine-readable prefix relays use to signal that authentication is
/// required, in OK and CLOSED reason strings.
pub const AUTH_REQUIRED_PREFIX: &str = "auth-required:";

/// Errors that can occur during NIP-42 operations.
#[derive(Debug, Error)]
pub enum Nip42Error {
    #[error("invalid relay url: {0}")]
    InvalidUrl(String),
}

/// Whether a relay reason string signals that authentication is required.
pub fn is_auth_required_error(reason: &str) -> bool {
    reason.starts_with(AUTH_REQUIRED_PREFIX)
}

/// Build the unsigned authentication event for a challenge.
pub fn auth_event_template(relay_url: &str, challenge: &str) -> EventTemplate {
    let created_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    EventTemplate {
        created_at,
        kind: AUTH_KIND,
        tags: vec![
            vec!["relay".to_string(), relay_url.to_string()],
            vec!["challenge".to_string(), challenge.to_string()],
        ],
        content: String::new(),
    }
}

/// Normalize a relay URL so equivalent spellings map to one connection.
///
/// Lowercases scheme and host, defaults to `wss`, drops default ports,
/// trailing slashes, query strings and fragments.
pub fn normalize_relay_url(url: &str) -> Result<String, Nip42Error> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return Err(Nip42Error::InvalidUrl("empty url".to_string()));
    }

    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("wss://{trimmed}")
    };

    let parsed = Url::parse(&with_scheme).map_err(|e| Nip42Error::InvalidUrl(e.to_string()))?;
    match parsed.scheme() {
        "ws" | "wss" => {}
        other => {
            return Err(Nip42Error::InvalidUrl(format!(
                "unsupported scheme: {other}"
            )));
        }
    }
    let host = parsed
        .host_str()
        .ok_or_else(|| Nip42Error::InvalidUrl("missing host".to_string()))?;

    let mut normalized = format!("{}://{}", parsed.scheme(), host.to_lowercase());
    if let Some(port) = parsed.port() {
        normalized.push_str(&format!(":{port}"));
    }
    let path = parsed.path().trim_end_matches('/');
    normalized.push_str(path);
    Ok(normalized)
}
