#![forbid(unsafe_code)]

// Fan-out and event bridge - translates adapter lifecycle events into
// control-plane mutations and room broadcasts, and provides the broadcast
// primitive used by message handlers.
//
// Wired once at startup; adapter callbacks may outlive the client they refer
// to, so every mutation here tolerates missing registry entries.

use crate::clients::ClientRegistry;
use crate::media::EngineEvent;
use crate::rooms::RoomRegistry;
use crate::signaling::protocol::ServerMessage;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

pub struct EventBridge {
    clients: Arc<ClientRegistry>,
    rooms: Arc<RoomRegistry>,
}

impl EventBridge {
    pub fn new(clients: Arc<ClientRegistry>, rooms: Arc<RoomRegistry>) -> Self {
        Self { clients, rooms }
    }

    /// Sends a message to every member of a room, optionally excluding one.
    /// Send failures are silent; a dead channel drives its own disconnect
    /// path separately.
    pub fn broadcast_to_room(&self, room: &str, message: &ServerMessage, exclude: Option<&str>) {
        let json = match serde_json::to_string(message) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!("Failed to serialize broadcast message: {}", e);
                return;
            }
        };
        for member in self.rooms.member_ids(room) {
            if exclude == Some(member.as_str()) {
                continue;
            }
            self.clients.send_raw(&member, Arc::clone(&json));
        }
    }

    /// Sends a pre-serialized frame to every member of a room. Used by the
    /// legacy relay, which forwards client JSON untouched.
    pub fn broadcast_raw_to_room(&self, room: &str, json: Arc<String>, exclude: Option<&str>) {
        for member in self.rooms.member_ids(room) {
            if exclude == Some(member.as_str()) {
                continue;
            }
            self.clients.send_raw(&member, Arc::clone(&json));
        }
    }

    /// Sends a message to every registered client, optionally excluding one.
    pub fn broadcast_all(&self, message: &ServerMessage, exclude: Option<&str>) {
        let json = match serde_json::to_string(message) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!("Failed to serialize broadcast message: {}", e);
                return;
            }
        };
        for id in self.clients.ids() {
            if exclude == Some(id.as_str()) {
                continue;
            }
            self.clients.send_raw(&id, Arc::clone(&json));
        }
    }

    /// Consumes adapter events until the adapter is dropped.
    pub async fn run(self: Arc<Self>, mut events: UnboundedReceiver<EngineEvent>) {
        info!("Event bridge running");
        while let Some(event) = events.recv().await {
            self.apply(event);
        }
        info!("Event bridge stopped (adapter gone)");
    }

    /// Applies one engine event to the registries. Idempotent: an event for
    /// an already-cleaned resource is a no-op.
    pub fn apply(&self, event: EngineEvent) {
        match event {
            EngineEvent::TransportClosed {
                client_id,
                transport_id,
                reason,
                ..
            } => {
                debug!("Transport {} closed ({})", transport_id, reason);
                self.clients.with_session_mut(&client_id, |s| {
                    s.transports.remove(&transport_id);
                    s.transport_info.remove(&transport_id);
                });
            }
            EngineEvent::ProducerClosed {
                room,
                client_id,
                producer_id,
                reason,
            } => {
                debug!("Producer {} closed ({})", producer_id, reason);
                let was_listed = self
                    .rooms
                    .with_room_mut(&room, |r| r.producers.remove(&producer_id).is_some())
                    .unwrap_or(false);
                self.clients.with_session_mut(&client_id, |s| {
                    s.producers.remove(&producer_id);
                });

                // Broadcast only when this event did the removal, so an
                // engine event racing an explicit close fans out once.
                if was_listed {
                    self.broadcast_to_room(
                        &room,
                        &ServerMessage::ProducerClosed {
                            room: Some(room.clone()),
                            producer_id,
                            client_id: Some(client_id),
                            request_id: None,
                        },
                        None,
                    );
                }
            }
            EngineEvent::ConsumerClosed {
                client_id,
                consumer_id,
                reason,
                ..
            } => {
                debug!("Consumer {} closed ({})", consumer_id, reason);
                self.clients.with_session_mut(&client_id, |s| {
                    s.consumers.remove(&consumer_id);
                });
            }
        }
    }
}
