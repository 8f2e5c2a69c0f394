//! A single relay connection.
//!
//! Wraps one transport session with a dispatch task that routes incoming
//! messages to per-subscription channels, resolves publish confirmations
//! through oneshot handles, and tracks the NIP-42 challenge/response
//! state for this session.

use crate::error::{ClientError, Result};
use crate::message::{ClientMessage, Filter, RelayMessage};
use crate::pool::SeenTracker;
use crate::signer::Signer;
use crate::transport::RelayIo;
use driftline_core::nip42;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::debug;

/// Default wait for an OK confirmation after EVENT or AUTH.
pub const CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Updates delivered to one subscription's channel.
#[derive(Debug, Clone)]
pub enum SubscriptionUpdate {
    /// An event matched the subscription's filters
    Event(driftline_core::Event),
    /// The relay delivered all stored matches
    Eose,
    /// The relay closed the subscription, with its reason
    Closed(String),
}

/// Relay response to a published event.
#[derive(Debug, Clone)]
pub struct PublishOutcome {
    pub accepted: bool,
    pub message: String,
}

/// One persistent connection to a relay.
pub struct RelayConnection {
    url: String,
    sender: mpsc::UnboundedSender<ClientMessage>,
    routes: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<SubscriptionUpdate>>>>,
    pending_oks: Arc<Mutex<HashMap<String, oneshot::Sender<PublishOutcome>>>>,
    auth_challenge: Arc<Mutex<Option<String>>>,
    authed: AtomicBool,
    // Serializes challenge/response handshakes on this connection.
    auth_gate: tokio::sync::Mutex<()>,
    alive: Arc<AtomicBool>,
}

impl RelayConnection {
    /// Wrap an open session and start its dispatch task.
    pub fn establish(url: String, io: RelayIo, seen: Arc<SeenTracker>) -> Arc<Self> {
        let routes: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<SubscriptionUpdate>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let pending_oks: Arc<Mutex<HashMap<String, oneshot::Sender<PublishOutcome>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let auth_challenge = Arc::new(Mutex::new(None));
        let alive = Arc::new(AtomicBool::new(true));

        let connection = Arc::new(Self {
            url: url.clone(),
            sender: io.sender,
            routes: Arc::clone(&routes),
            pending_oks: Arc::clone(&pending_oks),
            auth_challenge: Arc::clone(&auth_challenge),
            authed: AtomicBool::new(false),
            auth_gate: tokio::sync::Mutex::new(()),
            alive: Arc::clone(&alive),
        });

        let mut receiver = io.receiver;
        tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                match message {
                    RelayMessage::Event {
                        subscription_id,
                        event,
                    } => {
                        seen.record(&event.id, &url);
                        let route = routes.lock().get(&subscription_id).cloned();
                        if let Some(route) = route {
                            if route.send(SubscriptionUpdate::Event(event)).is_err() {
                                routes.lock().remove(&subscription_id);
                            }
                        }
                    }
                    RelayMessage::Eose { subscription_id } => {
                        let route = routes.lock().get(&subscription_id).cloned();
                        if let Some(route) = route {
                            let _ = route.send(SubscriptionUpdate::Eose);
                        }
                    }
                    RelayMessage::Closed {
                        subscription_id,
                        message,
                    } => {
                        let route = routes.lock().remove(&subscription_id);
                        if let Some(route) = route {
                            let _ = route.send(SubscriptionUpdate::Closed(message));
                        }
                    }
                    RelayMessage::Ok {
                        event_id,
                        success,
                        message,
                    } => {
                        let pending = pending_oks.lock().remove(&event_id);
                        if let Some(pending) = pending {
                            let _ = pending.send(PublishOutcome {
                                accepted: success,
                                message,
                            });
                        }
                    }
                    RelayMessage::Auth { challenge } => {
                        debug!(relay = %url, "received auth challenge");
                        *auth_challenge.lock() = Some(challenge);
                    }
                    RelayMessage::Notice { message } => {
                        debug!(relay = %url, notice = %message, "relay notice");
                    }
                }
            }

            // Relay is gone: every open subscription gets a terminal close
            // and pending confirmations resolve as dropped.
            alive.store(false, Ordering::SeqCst);
            let stale: Vec<_> = routes.lock().drain().collect();
            for (_, route) in stale {
                let _ = route.send(SubscriptionUpdate::Closed(
                    "error: connection closed".to_string(),
                ));
            }
            pending_oks.lock().clear();
            debug!(relay = %url, "dispatch task ended");
        });

        connection
    }

    /// Normalized URL of this relay.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether the underlying session is still up.
    pub fn is_connected(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.sender.is_closed()
    }

    /// Whether this session has completed a NIP-42 handshake.
    pub fn has_authed(&self) -> bool {
        self.authed.load(Ordering::SeqCst)
    }

    /// Open a subscription, routing its updates into `route`.
    pub fn subscribe(
        &self,
        subscription_id: &str,
        filters: Vec<Filter>,
        route: mpsc::UnboundedSender<SubscriptionUpdate>,
    ) -> Result<()> {
        self.routes
            .lock()
            .insert(subscription_id.to_string(), route);
        self.send(ClientMessage::Req {
            subscription_id: subscription_id.to_string(),
            filters,
        })
    }

    /// Close a subscription and drop its route.
    pub fn unsubscribe(&self, subscription_id: &str) {
        self.routes.lock().remove(subscription_id);
        let _ = self.send(ClientMessage::Close {
            subscription_id: subscription_id.to_string(),
        });
    }

    /// Publish an event and wait for the relay's OK.
    ///
    /// `Ok` means the relay responded; inspect [`PublishOutcome::accepted`]
    /// for whether it kept the event.
    pub async fn publish(&self, event: &driftline_core::Event) -> Result<PublishOutcome> {
        let (tx, rx) = oneshot::channel();
        self.pending_oks.lock().insert(event.id.clone(), tx);
        if let Err(e) = self.send(ClientMessage::Event(event.clone())) {
            self.pending_oks.lock().remove(&event.id);
            return Err(e);
        }

        match timeout(CONFIRMATION_TIMEOUT, rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(ClientError::Connection(format!(
                "{} closed before confirming event",
                self.url
            ))),
            Err(_) => {
                self.pending_oks.lock().remove(&event.id);
                Err(ClientError::Timeout(format!(
                    "no confirmation from {} within {:?}",
                    self.url, CONFIRMATION_TIMEOUT
                )))
            }
        }
    }

    /// Perform the NIP-42 handshake using the relay's stored challenge.
    ///
    /// Succeeds immediately if this session already authenticated.
    pub async fn authenticate(&self, signer: &dyn Signer) -> Result<()> {
        let _gate = self.auth_gate.lock().await;
        if self.has_authed() {
            return Ok(());
        }

        let challenge = self
            .auth_challenge
            .lock()
            .clone()
            .ok_or_else(|| ClientError::Protocol(format!("{} sent no auth challenge", self.url)))?;

        let template = nip42::auth_event_template(&self.url, &challenge);
        let auth_event = signer.sign_event(template).await?;

        let (tx, rx) = oneshot::channel();
        self.pending_oks.lock().insert(auth_event.id.clone(), tx);
        if let Err(e) = self.send(ClientMessage::Auth(auth_event.clone())) {
            self.pending_oks.lock().remove(&auth_event.id);
            return Err(e);
        }

        match timeout(CONFIRMATION_TIMEOUT, rx).await {
            Ok(Ok(outcome)) if outcome.accepted => {
                debug!(relay = %self.url, "authenticated");
                self.authed.store(true, Ordering::SeqCst);
                Ok(())
            }
            Ok(Ok(outcome)) => Err(ClientError::Rejected(outcome.message)),
            Ok(Err(_)) => Err(ClientError::Connection(format!(
                "{} closed during auth",
                self.url
            ))),
            Err(_) => {
                self.pending_oks.lock().remove(&auth_event.id);
                Err(ClientError::Timeout(format!(
                    "auth confirmation from {} timed out",
                    self.url
                )))
            }
        }
    }

    fn send(&self, message: ClientMessage) -> Result<()> {
        self.sender
            .send(message)
            .map_err(|_| ClientError::NotConnected(self.url.clone()))
    }
}
