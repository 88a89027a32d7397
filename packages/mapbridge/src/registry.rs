//! Connection registry: at most one plugin and one application socket per user.

use axum::extract::ws::Message as WsMessage;
use mapbridge_proto::{Message, PeerStatus};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::{Mutex, mpsc, mpsc::error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Which end of the relay a socket belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Plugin,
    App,
}

impl Side {
    pub fn counterpart(self) -> Side {
        match self {
            Side::Plugin => Side::App,
            Side::App => Side::Plugin,
        }
    }

    /// Presence frame describing this side, addressed to its counterpart.
    pub fn presence(self, status: PeerStatus) -> Message {
        match self {
            Side::Plugin => Message::plugin_status(status),
            Side::App => Message::app_status(status),
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Plugin => f.write_str("plugin"),
            Side::App => f.write_str("app"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("peer connection closed")]
pub struct PeerClosed;

/// Cheap handle to a live relay socket: its outbound queue plus a token that
/// stops its read loop.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    id: Uuid,
    tx: mpsc::Sender<WsMessage>,
    cancel: CancellationToken,
}

impl PeerHandle {
    pub fn new(tx: mpsc::Sender<WsMessage>, cancel: CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4(),
            tx,
            cancel,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Queue a raw frame for this socket's writer.
    pub async fn send(&self, frame: WsMessage) -> Result<(), PeerClosed> {
        self.tx.send(frame).await.map_err(|_| PeerClosed)
    }

    /// Queue an envelope as a text frame.
    pub async fn send_message(&self, msg: &Message) -> Result<(), PeerClosed> {
        match msg.to_json() {
            Ok(json) => self.send(WsMessage::Text(json.into())).await,
            Err(e) => {
                warn!("Failed to serialize relay message: {}", e);
                Ok(())
            }
        }
    }

    /// Queue a presence frame without waiting. A peer whose queue is full is
    /// closed rather than left with a stale view of its counterpart.
    fn announce(&self, msg: &Message) {
        let json = match msg.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize presence frame: {}", e);
                return;
            }
        };
        match self.tx.try_send(WsMessage::Text(json.into())) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(_)) => {
                warn!(peer = %self.id, "Outbound queue full, dropping lagging connection");
                self.close();
            }
        }
    }

    /// Ask the owning read loop to shut down.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }
}

#[derive(Debug, Default)]
struct UserSlots {
    plugin: Option<PeerHandle>,
    app: Option<PeerHandle>,
}

impl UserSlots {
    fn slot(&self, side: Side) -> &Option<PeerHandle> {
        match side {
            Side::Plugin => &self.plugin,
            Side::App => &self.app,
        }
    }

    fn slot_mut(&mut self, side: Side) -> &mut Option<PeerHandle> {
        match side {
            Side::Plugin => &mut self.plugin,
            Side::App => &mut self.app,
        }
    }

    fn is_empty(&self) -> bool {
        self.plugin.is_none() && self.app.is_none()
    }
}

/// Per-user connection slots behind a single lock.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    users: Mutex<HashMap<String, UserSlots>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install (or clear, with `None`) the slot for `(user, side)` and return
    /// the previous occupant.
    pub async fn set(&self, user: &str, side: Side, peer: Option<PeerHandle>) -> Option<PeerHandle> {
        let mut users = self.users.lock().await;
        let previous = match peer {
            Some(peer) => users
                .entry(user.to_string())
                .or_default()
                .slot_mut(side)
                .replace(peer),
            None => {
                let previous = users.get_mut(user).and_then(|s| s.slot_mut(side).take());
                if users.get(user).is_some_and(UserSlots::is_empty) {
                    users.remove(user);
                }
                previous
            }
        };
        debug!(user = %user, side = %side, replaced = previous.is_some(), "registry slot set");
        previous
    }

    /// [`set`](Self::set) for a newly opened socket. When the slot was empty
    /// the counterpart's `Connected` frame is queued before the lock is
    /// released, so presence frames follow slot transitions in order.
    pub async fn register(&self, user: &str, side: Side, peer: PeerHandle) -> Option<PeerHandle> {
        let mut users = self.users.lock().await;
        let slots = users.entry(user.to_string()).or_default();
        let previous = slots.slot_mut(side).replace(peer);
        if previous.is_none() {
            if let Some(counterpart) = slots.slot(side.counterpart()) {
                counterpart.announce(&side.presence(PeerStatus::Connected));
            }
        }
        debug!(user = %user, side = %side, replaced = previous.is_some(), "registry slot set");
        previous
    }

    /// [`clear_if`](Self::clear_if) for a closing socket, queueing the
    /// counterpart's `Disconnected` frame under the same lock.
    pub async fn unregister(&self, user: &str, side: Side, id: Uuid) -> bool {
        let mut users = self.users.lock().await;
        let cleared = take_if(&mut users, user, side, id);
        if cleared {
            if let Some(counterpart) = users.get(user).and_then(|s| s.slot(side.counterpart()).as_ref()) {
                counterpart.announce(&side.presence(PeerStatus::Disconnected));
            }
        }
        cleared
    }

    pub async fn get(&self, user: &str, side: Side) -> Option<PeerHandle> {
        let users = self.users.lock().await;
        users.get(user).and_then(|s| s.slot(side).clone())
    }

    /// Clear `(user, side)` only while it still holds connection `id`.
    /// Returns whether the slot was cleared.
    pub async fn clear_if(&self, user: &str, side: Side, id: Uuid) -> bool {
        take_if(&mut *self.users.lock().await, user, side, id)
    }

    /// Number of users with at least one live socket.
    pub async fn user_count(&self) -> usize {
        self.users.lock().await.len()
    }
}

fn take_if(users: &mut HashMap<String, UserSlots>, user: &str, side: Side, id: Uuid) -> bool {
    let Some(slots) = users.get_mut(user) else {
        return false;
    };
    let slot = slots.slot_mut(side);
    if !slot.as_ref().is_some_and(|p| p.id == id) {
        return false;
    }
    *slot = None;
    if slots.is_empty() {
        users.remove(user);
    }
    true
}
