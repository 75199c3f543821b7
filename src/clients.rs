#![forbid(unsafe_code)]

// Client registry - process-wide map of connection id to session state.
//
// Sessions hold only identifiers for engine resources; the media adapter owns
// the engine handles. The registry lock is held for brief map accesses only,
// never across await points.

use crate::auth::User;
use crate::events::EventBridge;
use crate::media::{MediaAdapter, TransportDirection};
use crate::rooms::RoomRegistry;
use crate::signaling::protocol::ServerMessage;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Where a transport points: which room it was created for and whether it
/// carries media towards or away from the client.
#[derive(Debug, Clone)]
pub struct TransportBinding {
    pub room: String,
    pub direction: TransportDirection,
}

/// Per-connection session state.
pub struct ClientSession {
    pub id: String,
    pub sender: mpsc::Sender<Arc<String>>,
    pub user: Option<User>,
    pub role: crate::rooms::RoomRole,
    pub transports: HashSet<String>,
    pub transport_info: HashMap<String, TransportBinding>,
    pub producers: HashSet<String>,
    pub consumers: HashSet<String>,
    pub rooms: HashSet<String>,
}

impl ClientSession {
    fn new(id: String, sender: mpsc::Sender<Arc<String>>, user: Option<User>) -> Self {
        Self {
            id,
            sender,
            user,
            role: crate::rooms::RoomRole::Publisher,
            transports: HashSet::new(),
            transport_info: HashMap::new(),
            producers: HashSet::new(),
            consumers: HashSet::new(),
            rooms: HashSet::new(),
        }
    }
}

/// Process-wide map of connection id to session.
pub struct ClientRegistry {
    inner: StdRwLock<HashMap<String, ClientSession>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            inner: StdRwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, ClientSession>> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, ClientSession>> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add(&self, id: &str, sender: mpsc::Sender<Arc<String>>, user: Option<User>) {
        info!(
            "Registered client {}{}",
            id,
            user.as_ref()
                .map(|u| format!(" (user {})", u.name))
                .unwrap_or_default()
        );
        self.write()
            .insert(id.to_string(), ClientSession::new(id.to_string(), sender, user));
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().contains_key(id)
    }

    pub fn count(&self) -> usize {
        self.read().len()
    }

    pub fn ids(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn with_session<R>(&self, id: &str, f: impl FnOnce(&ClientSession) -> R) -> Option<R> {
        self.read().get(id).map(f)
    }

    pub fn with_session_mut<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut ClientSession) -> R,
    ) -> Option<R> {
        self.write().get_mut(id).map(f)
    }

    pub fn remove(&self, id: &str) -> bool {
        let removed = self.write().remove(id).is_some();
        if removed {
            info!("Removed client {}", id);
        }
        removed
    }

    /// Sends a message to one client. Returns false when the client is
    /// unknown or its channel has closed; a full channel drops the message
    /// but still counts as deliverable (the connection is alive).
    pub fn send_to(&self, id: &str, message: &ServerMessage) -> bool {
        let json = match serde_json::to_string(message) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!("Failed to serialize message for {}: {}", id, e);
                return false;
            }
        };
        self.send_raw(id, json)
    }

    /// Sends a pre-serialized frame to one client.
    pub fn send_raw(&self, id: &str, json: Arc<String>) -> bool {
        let sender = match self.read().get(id) {
            Some(session) => session.sender.clone(),
            None => return false,
        };
        match sender.try_send(json) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Channel full for client {}, dropping message", id);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Channel closed for client {} (disconnected)", id);
                false
            }
        }
    }

    /// Closes every engine resource the client owns. Best-effort: adapter
    /// failures are logged and skipped, the bookkeeping is always cleared.
    pub async fn close_resources(&self, id: &str, media: &Arc<MediaAdapter>) {
        let (transports, producers, consumers) = match self.with_session(id, |s| {
            (
                s.transports.iter().cloned().collect::<Vec<_>>(),
                s.producers.iter().cloned().collect::<Vec<_>>(),
                s.consumers.iter().cloned().collect::<Vec<_>>(),
            )
        }) {
            Some(sets) => sets,
            None => return,
        };

        for consumer_id in consumers {
            if let Err(e) = media.close_consumer(&consumer_id).await {
                warn!("Failed to close consumer {} for {}: {}", consumer_id, id, e);
            }
        }
        for producer_id in producers {
            if let Err(e) = media.close_producer(&producer_id).await {
                warn!("Failed to close producer {} for {}: {}", producer_id, id, e);
            }
        }
        for transport_id in transports {
            if let Err(e) = media.close_transport(&transport_id).await {
                warn!("Failed to close transport {} for {}: {}", transport_id, id, e);
            }
        }

        self.with_session_mut(id, |s| {
            s.transports.clear();
            s.transport_info.clear();
            s.producers.clear();
            s.consumers.clear();
        });
    }

    /// Walks every room the client belongs to: closes the client's producers
    /// there, removes membership, fans out the departure, and deletes rooms
    /// that end up empty.
    pub async fn remove_from_all_rooms(
        &self,
        id: &str,
        rooms: &RoomRegistry,
        media: Option<&Arc<MediaAdapter>>,
        bridge: &EventBridge,
    ) {
        let joined: Vec<String> = self
            .with_session(id, |s| s.rooms.iter().cloned().collect())
            .unwrap_or_default();

        for room in joined {
            let closed = rooms.close_client_producers(&room, id, media).await;
            for producer_id in &closed {
                self.with_session_mut(id, |s| {
                    s.producers.remove(producer_id);
                });
                bridge.broadcast_to_room(
                    &room,
                    &ServerMessage::ProducerClosed {
                        room: Some(room.clone()),
                        producer_id: producer_id.clone(),
                        client_id: Some(id.to_string()),
                        request_id: None,
                    },
                    Some(id),
                );
            }

            if rooms.remove_member(&room, id) {
                bridge.broadcast_to_room(
                    &room,
                    &ServerMessage::MemberLeft {
                        room: room.clone(),
                        id: id.to_string(),
                    },
                    Some(id),
                );
            }
            if rooms.delete_if_empty(&room) {
                if let Some(media) = media {
                    media.close_room(&room);
                }
            }
            self.with_session_mut(id, |s| {
                s.rooms.remove(&room);
            });
        }
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}
