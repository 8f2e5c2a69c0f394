//! Signing capability consumed by the client.
//!
//! Key management lives outside this crate: a [`Signer`] may hold a local
//! key, talk to a remote approval service, or bridge to a browser
//! extension. The client only ever asks for the public key and for
//! signatures over event drafts.

use crate::error::Result;
use async_trait::async_trait;
use driftline_core::{Event, EventTemplate};

/// Signs event drafts on behalf of one identity.
#[async_trait]
pub trait Signer: Send + Sync {
    /// The identity's public key (64-char hex).
    async fn get_public_key(&self) -> Result<String>;

    /// Turn a draft into a signed event (fills pubkey, id and sig).
    async fn sign_event(&self, template: EventTemplate) -> Result<Event>;
}
