#![forbid(unsafe_code)]

// WebSocket connection handler and message dispatch for a single client.
//
// Messages on one channel are handled strictly in order: the receive loop
// awaits each handler before pulling the next frame, so a join always commits
// before a following produce is looked at. Across connections handlers run
// concurrently against the shared registries.

use super::protocol::{self, ClientMessage, ServerMessage};
use super::SharedState;
use crate::auth::User;
use crate::clients::TransportBinding;
use crate::ice;
use crate::media::{MediaError, TransportDirection};
use crate::rooms::{RoomProducer, RoomRole};
use anyhow::anyhow;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use mediasoup::prelude::MediaKind;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bounded channel capacity per client. Messages queued beyond this are
/// stale — drop them early.
const CHANNEL_CAPACITY: usize = 64;

/// Idle timeout — close connection if no message received within this duration.
/// Prevents Slowloris-style attacks that hold semaphore permits indefinitely.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Handles a single WebSocket connection
pub async fn handle_connection(
    socket: WebSocket,
    state: Arc<SharedState>,
    user: Option<User>,
    auth_ok: bool,
    _permit: OwnedSemaphorePermit,
) {
    let client_id = Uuid::new_v4().to_string();

    state.metrics.inc_connections_total();
    let _conn_guard = state.metrics.connection_active_guard();

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Bounded channel for sending messages to this client
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(CHANNEL_CAPACITY);

    // Spawn task to send messages to client
    let send_metrics = state.metrics.clone();
    let send_client_id = client_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            send_metrics.inc_messages_sent();
            if ws_sender
                .send(Message::Text((*json).clone().into()))
                .await
                .is_err()
            {
                break;
            }
        }
        debug!("Send task finished for client: {}", send_client_id);
    });

    if !auth_ok {
        warn!("Rejecting unauthenticated connection {}", client_id);
        let unauthorized = serde_json::to_string(&ServerMessage::Error {
            message: "unauthorized".to_string(),
        })
        .expect("static message serializes");
        let _ = tx.send(Arc::new(unauthorized)).await;
        drop(tx);
        let _ = send_task.await;
        return;
    }

    info!("New signaling connection: {}", client_id);
    state.clients.add(&client_id, tx.clone(), user);
    state.clients.send_to(
        &client_id,
        &ServerMessage::Hello {
            id: client_id.clone(),
        },
    );

    loop {
        // Idle timeout: close connection if no message within IDLE_TIMEOUT
        let msg = match tokio::time::timeout(IDLE_TIMEOUT, ws_receiver.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(_))) | Ok(None) => break, // Stream error or closed
            Err(_) => {
                warn!("Idle timeout for client {}", client_id);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                state.metrics.inc_messages_received();
                let start = Instant::now();
                dispatch(&state, &client_id, &text).await;
                state.metrics.observe_message_handling(start.elapsed());
            }
            Message::Close(_) => {
                info!("Client {} closed connection", client_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                // WebSocket ping/pong handled automatically
            }
            _ => {
                warn!("Unexpected message type from client {}", client_id);
            }
        }
    }

    disconnect(&state, &client_id).await;

    drop(tx);
    let _ = send_task.await;

    info!("Connection handler finished for client: {}", client_id);
}

/// Decodes one frame and runs its handler, converting any failure into an
/// error reply on the same channel. Frames that are not JSON objects with a
/// `type` are dropped silently (logged).
pub async fn dispatch(state: &SharedState, client_id: &str, text: &str) {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            debug!("Dropping non-JSON frame from {}: {}", client_id, e);
            return;
        }
    };
    let ty = match value.get("type").and_then(|t| t.as_str()) {
        Some(ty) => ty.to_string(),
        None => {
            debug!("Dropping frame without type from {}", client_id);
            return;
        }
    };

    let message = match serde_json::from_value::<ClientMessage>(value) {
        Ok(m) => m,
        Err(e) => {
            state.metrics.inc_errors();
            let reply = if protocol::KNOWN_TYPES.contains(&ty.as_str()) {
                warn!("Invalid {} message from {}: {}", ty, client_id, e);
                format!("invalid {ty} message: {e}")
            } else {
                warn!("Unknown message type {:?} from {}", ty, client_id);
                "unknown message type".to_string()
            };
            state
                .clients
                .send_to(client_id, &ServerMessage::Error { message: reply });
            return;
        }
    };

    if let Err(e) = handle_message(state, client_id, message).await {
        state.metrics.inc_errors();
        warn!("Error handling {} from {}: {}", ty, client_id, e);
        state.clients.send_to(
            client_id,
            &ServerMessage::Error {
                message: e.to_string(),
            },
        );
    }
}

fn require_media(state: &SharedState) -> anyhow::Result<Arc<crate::media::MediaAdapter>> {
    state
        .media
        .clone()
        .ok_or_else(|| anyhow!("sfu not enabled"))
}

/// Precondition failures keep their message; engine failures are collapsed to
/// a generic reply with the cause logged.
fn engine_failed(op: &str, e: MediaError) -> anyhow::Error {
    if e.is_precondition() {
        anyhow!("{e}")
    } else {
        warn!("sfu.{} failed: {}", op, e);
        anyhow!("sfu.{op} failed")
    }
}

fn require_admin(state: &SharedState, client_id: &str) -> anyhow::Result<()> {
    let is_admin = state
        .clients
        .with_session(client_id, |s| {
            s.user.as_ref().map(User::is_admin).unwrap_or(false)
        })
        .ok_or_else(|| anyhow!("client not found"))?;
    if !is_admin {
        anyhow::bail!("admin access required");
    }
    Ok(())
}

/// Handle a single client message
async fn handle_message(
    state: &SharedState,
    client_id: &str,
    message: ClientMessage,
) -> anyhow::Result<()> {
    match message {
        ClientMessage::Join { room, role } => handle_join(state, client_id, room, role).await,

        ClientMessage::LeaveRoom { room } => handle_leave_room(state, client_id, room).await,

        ClientMessage::Leave => {
            // Courtesy notice; the real cleanup runs when the channel closes.
            debug!("Client {} announced leave", client_id);
            Ok(())
        }

        ClientMessage::List => {
            state.clients.send_to(
                client_id,
                &ServerMessage::ClientList {
                    clients: state.clients.ids(),
                },
            );
            Ok(())
        }

        ClientMessage::Rooms => {
            state.clients.send_to(
                client_id,
                &ServerMessage::RoomList {
                    rooms: state.rooms.summaries(),
                },
            );
            Ok(())
        }

        ClientMessage::Ice {
            candidate,
            to,
            room,
        } => {
            let relayed = ServerMessage::Ice {
                from: client_id.to_string(),
                candidate,
            };
            if let Some(to) = to {
                if !state.clients.send_to(&to, &relayed) {
                    anyhow::bail!("client not found: {to}");
                }
            } else if let Some(room) = room {
                if !state.rooms.contains(&room) {
                    anyhow::bail!("room not found: {room}");
                }
                state.bridge.broadcast_to_room(&room, &relayed, Some(client_id));
            } else {
                anyhow::bail!("ice requires to or room");
            }
            Ok(())
        }

        ClientMessage::Offer { to, room, rest } => {
            relay_legacy(state, client_id, "offer", to, room, rest)
        }
        ClientMessage::Answer { to, room, rest } => {
            relay_legacy(state, client_id, "answer", to, room, rest)
        }
        ClientMessage::Candidate { to, room, rest } => {
            relay_legacy(state, client_id, "candidate", to, room, rest)
        }

        ClientMessage::CreateTransport {
            room,
            direction,
            request_id,
        } => {
            let media = require_media(state)?;
            state
                .clients
                .with_session(client_id, |_| ())
                .ok_or_else(|| anyhow!("client not found"))?;
            let direction = direction.unwrap_or(TransportDirection::Send);
            let is_member = state
                .rooms
                .with_room(&room, |r| r.is_member(client_id))
                .ok_or_else(|| anyhow!("room not found: {room}"))?;
            if !is_member {
                anyhow::bail!("not a member of room {room}");
            }

            let created = media
                .create_webrtc_transport(&room, client_id, direction)
                .await
                .map_err(|e| engine_failed("createTransport", e))?;

            state.clients.with_session_mut(client_id, |s| {
                s.transports.insert(created.transport_id.clone());
                s.transport_info.insert(
                    created.transport_id.clone(),
                    TransportBinding {
                        room: room.clone(),
                        direction,
                    },
                );
            });

            let ice_servers = ice::ice_servers_for(
                &state.config.ice_servers,
                state.config.turn_rest.as_ref(),
                client_id,
            );
            state.clients.send_to(
                client_id,
                &ServerMessage::TransportCreated {
                    transport_id: created.transport_id,
                    ice_parameters: created.ice_parameters,
                    ice_candidates: created.ice_candidates,
                    dtls_parameters: created.dtls_parameters,
                    ice_servers,
                    router_rtp_capabilities: created.router_rtp_capabilities,
                    direction,
                    request_id,
                },
            );
            Ok(())
        }

        ClientMessage::ConnectTransport {
            transport_id,
            dtls_parameters,
            request_id,
        } => {
            let media = require_media(state)?;
            let owns = state
                .clients
                .with_session(client_id, |s| s.transports.contains(&transport_id))
                .ok_or_else(|| anyhow!("client not found"))?;
            if !owns {
                anyhow::bail!("transport not found: {transport_id}");
            }

            media
                .connect_transport(&transport_id, dtls_parameters)
                .await
                .map_err(|e| engine_failed("connectTransport", e))?;

            state.clients.send_to(
                client_id,
                &ServerMessage::TransportConnected {
                    transport_id,
                    request_id,
                },
            );
            Ok(())
        }

        ClientMessage::Produce {
            transport_id,
            kind,
            rtp_parameters,
            room,
            request_id,
        } => {
            let media = require_media(state)?;
            let (role, producer_user, owns_transport) = state
                .clients
                .with_session(client_id, |s| {
                    (
                        s.role,
                        s.user.as_ref().map(|u| u.name.clone()),
                        s.transports.contains(&transport_id),
                    )
                })
                .ok_or_else(|| anyhow!("client not found"))?;
            if !role.can_produce() {
                anyhow::bail!("observers cannot produce");
            }

            let (is_member, video_count, max_video) = state
                .rooms
                .with_room(&room, |r| {
                    (
                        r.is_member(client_id),
                        r.video_producer_count(),
                        r.options.max_video_producers,
                    )
                })
                .ok_or_else(|| anyhow!("room not found: {room}"))?;
            if !is_member {
                anyhow::bail!("not a member of room {room}");
            }
            if kind == MediaKind::Video && max_video > 0 && video_count >= max_video {
                anyhow::bail!("room already has {max_video} video producers");
            }
            if !owns_transport {
                anyhow::bail!("transport not found: {transport_id}");
            }

            let created = media
                .create_producer(&transport_id, &room, client_id, kind, rtp_parameters)
                .await
                .map_err(|e| engine_failed("produce", e))?;

            // Commit to both tables before anyone is told, so a member
            // reacting to sfu.newProducer can consume immediately.
            state.rooms.with_room_mut(&room, |r| {
                r.producers.insert(
                    created.producer_id.clone(),
                    RoomProducer {
                        client_id: client_id.to_string(),
                        kind,
                        created_at: SystemTime::now(),
                    },
                );
            });
            state.clients.with_session_mut(client_id, |s| {
                s.producers.insert(created.producer_id.clone());
            });
            state.metrics.inc_producers_created();

            state.clients.send_to(
                client_id,
                &ServerMessage::Produced {
                    producer_id: created.producer_id.clone(),
                    kind,
                    request_id,
                },
            );
            state.bridge.broadcast_to_room(
                &room,
                &ServerMessage::NewProducer {
                    room: room.clone(),
                    producer_id: created.producer_id.clone(),
                    client_id: client_id.to_string(),
                    producer_user,
                    kind,
                },
                Some(client_id),
            );

            if state.config.record_auto && kind == MediaKind::Video {
                if let Some(recorder) = state.recorder.clone() {
                    if let Some(snapshot) = media.producer_snapshot(&created.producer_id) {
                        tokio::spawn(async move {
                            if let Err(e) = recorder.start(&snapshot).await {
                                warn!("Auto-recording failed for {}: {}", snapshot.producer_id, e);
                            }
                        });
                    }
                }
            }

            Ok(())
        }

        ClientMessage::Consume {
            transport_id,
            producer_id,
            rtp_capabilities,
            room,
            request_id,
        } => {
            let media = require_media(state)?;
            let owns_transport = state
                .clients
                .with_session(client_id, |s| s.transports.contains(&transport_id))
                .ok_or_else(|| anyhow!("client not found"))?;

            let listed = state
                .rooms
                .with_room(&room, |r| r.producers.contains_key(&producer_id))
                .ok_or_else(|| anyhow!("room not found: {room}"))?;
            if !listed {
                anyhow::bail!("producer not found in room {room}");
            }
            if !owns_transport {
                anyhow::bail!("transport not found: {transport_id}");
            }

            let created = media
                .create_consumer(&transport_id, &producer_id, rtp_capabilities, client_id)
                .await
                .map_err(|e| engine_failed("consume", e))?;

            state.clients.with_session_mut(client_id, |s| {
                s.consumers.insert(created.consumer_id.clone());
            });
            state.metrics.inc_consumers_created();

            state.clients.send_to(
                client_id,
                &ServerMessage::Consumed {
                    consumer_id: created.consumer_id,
                    producer_id: created.producer_id,
                    kind: created.kind,
                    rtp_parameters: created.rtp_parameters,
                    request_id,
                },
            );
            Ok(())
        }

        ClientMessage::ListProducers { room } => {
            let producers = state
                .rooms
                .with_room(&room, |r| r.producers_payload())
                .ok_or_else(|| anyhow!("room not found: {room}"))?;
            state
                .clients
                .send_to(client_id, &ServerMessage::Producers { room, producers });
            Ok(())
        }

        ClientMessage::CloseProducer { producer_id } => {
            let media = require_media(state)?;
            let owns = state
                .clients
                .with_session(client_id, |s| s.producers.contains(&producer_id))
                .ok_or_else(|| anyhow!("client not found"))?;
            if !owns {
                anyhow::bail!("producer not found: {producer_id}");
            }

            // The engine close feeds the event bridge, which removes the
            // room entry and fans sfu.producerClosed out to the members.
            media
                .close_producer(&producer_id)
                .await
                .map_err(|e| engine_failed("closeProducer", e))?;
            state.clients.with_session_mut(client_id, |s| {
                s.producers.remove(&producer_id);
            });

            state.clients.send_to(
                client_id,
                &ServerMessage::ProducerClosed {
                    room: None,
                    producer_id,
                    client_id: None,
                    request_id: None,
                },
            );
            Ok(())
        }

        ClientMessage::StartRecording { producer_id } => {
            let media = require_media(state)?;
            let recorder = state
                .recorder
                .clone()
                .ok_or_else(|| anyhow!("recording not enabled"))?;
            let (owns, is_admin) = state
                .clients
                .with_session(client_id, |s| {
                    (
                        s.producers.contains(&producer_id),
                        s.user.as_ref().map(User::is_admin).unwrap_or(false),
                    )
                })
                .ok_or_else(|| anyhow!("client not found"))?;
            if !owns && !is_admin {
                anyhow::bail!("producer not found: {producer_id}");
            }

            let snapshot = media
                .producer_snapshot(&producer_id)
                .ok_or_else(|| anyhow!("producer not found: {producer_id}"))?;
            let output_file = recorder.start(&snapshot).await.map_err(|e| {
                warn!("sfu.startRecording failed: {}", e);
                anyhow!("sfu.startRecording failed")
            })?;

            state.clients.send_to(
                client_id,
                &ServerMessage::RecordingStarted {
                    producer_id,
                    output_file,
                },
            );
            Ok(())
        }

        ClientMessage::StopRecording { producer_id } => {
            let recorder = state
                .recorder
                .clone()
                .ok_or_else(|| anyhow!("recording not enabled"))?;
            let (owns, is_admin) = state
                .clients
                .with_session(client_id, |s| {
                    (
                        s.producers.contains(&producer_id),
                        s.user.as_ref().map(User::is_admin).unwrap_or(false),
                    )
                })
                .ok_or_else(|| anyhow!("client not found"))?;
            if !owns && !is_admin {
                anyhow::bail!("producer not found: {producer_id}");
            }

            recorder.stop(&producer_id).await.map_err(|e| {
                warn!("sfu.stopRecording failed: {}", e);
                anyhow!("sfu.stopRecording failed")
            })?;

            state
                .clients
                .send_to(client_id, &ServerMessage::RecordingStopped { producer_id });
            Ok(())
        }

        ClientMessage::AdminRooms => {
            require_admin(state, client_id)?;
            state.clients.send_to(
                client_id,
                &ServerMessage::AdminRooms {
                    rooms: state.rooms.overview(),
                },
            );
            Ok(())
        }

        ClientMessage::AdminRoomInfo { room } => {
            require_admin(state, client_id)?;
            let info = state
                .rooms
                .info(&room)
                .ok_or_else(|| anyhow!("room not found: {room}"))?;
            state
                .clients
                .send_to(client_id, &ServerMessage::AdminRoomInfo { info });
            Ok(())
        }

        ClientMessage::AdminMetrics => {
            require_admin(state, client_id)?;
            let mut metrics = serde_json::json!({
                "server": state
                    .metrics
                    .snapshot_json(state.rooms.count(), state.clients.count()),
            });
            if let Some(media) = &state.media {
                metrics["engine"] = serde_json::to_value(media.metrics())?;
            }
            state
                .clients
                .send_to(client_id, &ServerMessage::AdminMetrics { metrics });
            Ok(())
        }
    }
}

async fn handle_join(
    state: &SharedState,
    client_id: &str,
    room: String,
    role: Option<RoomRole>,
) -> anyhow::Result<()> {
    if room.is_empty() {
        anyhow::bail!("invalid room: must not be empty");
    }

    let is_admin = state
        .clients
        .with_session(client_id, |s| {
            s.user.as_ref().map(User::is_admin).unwrap_or(false)
        })
        .ok_or_else(|| anyhow!("client not found"))?;

    let role = role.unwrap_or(RoomRole::Publisher);
    if role == RoomRole::Moderator && !is_admin {
        anyhow::bail!("only admin users can join as moderator");
    }

    if state.rooms.ensure(&room, &state.config.room_defaults) {
        state.metrics.inc_rooms_created();
    }

    if role == RoomRole::Observer {
        let verdict = state
            .rooms
            .with_room(&room, |r| {
                if !r.options.allow_observers {
                    return Err("observers not allowed in this room");
                }
                let already_observer = r.role_of(client_id) == Some(RoomRole::Observer);
                if r.options.max_observers > 0
                    && !already_observer
                    && r.observer_count() >= r.options.max_observers
                {
                    return Err("room observer limit reached");
                }
                Ok(())
            })
            .ok_or_else(|| anyhow!("room not found: {room}"))?;
        if let Err(message) = verdict {
            anyhow::bail!("{message}");
        }
    }

    // Commit membership, then tell the joiner, then everyone else.
    state.clients.with_session_mut(client_id, |s| {
        s.role = role;
        s.rooms.insert(room.clone());
    });
    state
        .rooms
        .with_room_mut(&room, |r| r.add_member(client_id, role))
        .ok_or_else(|| anyhow!("room not found: {room}"))?;
    state.metrics.inc_joins();
    info!("Client {} joined room {} as {:?}", client_id, room, role);

    state.clients.send_to(
        client_id,
        &ServerMessage::Joined {
            room: room.clone(),
            id: client_id.to_string(),
            role,
        },
    );
    state.bridge.broadcast_to_room(
        &room,
        &ServerMessage::MemberJoined {
            room: room.clone(),
            id: client_id.to_string(),
            role,
        },
        Some(client_id),
    );

    // Observers consume only; hand them the current producer list up front.
    if role == RoomRole::Observer {
        if let Some(producers) = state.rooms.with_room(&room, |r| r.producers_payload()) {
            state
                .clients
                .send_to(client_id, &ServerMessage::Producers { room, producers });
        }
    }

    Ok(())
}

async fn handle_leave_room(
    state: &SharedState,
    client_id: &str,
    room: String,
) -> anyhow::Result<()> {
    let is_member = state
        .rooms
        .with_room(&room, |r| r.is_member(client_id))
        .ok_or_else(|| anyhow!("room not found: {room}"))?;
    if !is_member {
        anyhow::bail!("not a member of room {room}");
    }

    // Producers first, so member-left is only seen once the media is gone.
    let closed = state
        .rooms
        .close_client_producers(&room, client_id, state.media.as_ref())
        .await;
    for producer_id in &closed {
        state.clients.with_session_mut(client_id, |s| {
            s.producers.remove(producer_id);
        });
        state.bridge.broadcast_to_room(
            &room,
            &ServerMessage::ProducerClosed {
                room: Some(room.clone()),
                producer_id: producer_id.clone(),
                client_id: Some(client_id.to_string()),
                request_id: None,
            },
            Some(client_id),
        );
    }

    state.rooms.remove_member(&room, client_id);
    state.clients.with_session_mut(client_id, |s| {
        s.rooms.remove(&room);
    });
    state.metrics.inc_leaves();

    state.clients.send_to(
        client_id,
        &ServerMessage::Left {
            room: room.clone(),
            id: client_id.to_string(),
        },
    );
    state.bridge.broadcast_to_room(
        &room,
        &ServerMessage::MemberLeft {
            room: room.clone(),
            id: client_id.to_string(),
        },
        Some(client_id),
    );

    if state.rooms.delete_if_empty(&room) {
        if let Some(media) = &state.media {
            media.close_room(&room);
        }
    }

    Ok(())
}

/// Relays a legacy mesh message (offer/answer/candidate) unchanged, annotated
/// with the sender's id.
fn relay_legacy(
    state: &SharedState,
    client_id: &str,
    ty: &str,
    to: Option<String>,
    room: Option<String>,
    rest: serde_json::Map<String, serde_json::Value>,
) -> anyhow::Result<()> {
    let mut payload = serde_json::Map::new();
    payload.insert("type".to_string(), ty.into());
    for (key, value) in rest {
        payload.insert(key, value);
    }
    payload.insert("from".to_string(), client_id.into());

    if let Some(to) = to {
        payload.insert("to".to_string(), to.clone().into());
        let json = Arc::new(serde_json::Value::Object(payload).to_string());
        if !state.clients.send_raw(&to, json) {
            anyhow::bail!("client not found: {to}");
        }
    } else if let Some(room) = room {
        if !state.rooms.contains(&room) {
            anyhow::bail!("room not found: {room}");
        }
        payload.insert("room".to_string(), room.clone().into());
        let json = Arc::new(serde_json::Value::Object(payload).to_string());
        state
            .bridge
            .broadcast_raw_to_room(&room, json, Some(client_id));
    } else {
        anyhow::bail!("{ty} requires to or room");
    }
    Ok(())
}

/// Channel-closed cleanup: one path for every way a connection can end. When
/// it completes no room and no adapter table knows the client.
pub async fn disconnect(state: &SharedState, client_id: &str) {
    if !state.clients.contains(client_id) {
        return;
    }
    info!("Client {} disconnected, cleaning up", client_id);

    state
        .clients
        .remove_from_all_rooms(client_id, &state.rooms, state.media.as_ref(), &state.bridge)
        .await;

    if let Some(media) = &state.media {
        state.clients.close_resources(client_id, media).await;
        media.close_client(client_id).await;
    }

    state.clients.remove(client_id);
    state
        .bridge
        .broadcast_all(&ServerMessage::Leave {
            id: client_id.to_string(),
        }, None);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::UserRole;
    use crate::clients::ClientRegistry;
    use crate::config::AppConfig;
    use crate::events::EventBridge;
    use crate::metrics::ServerMetrics;
    use crate::rooms::{RoomOptions, RoomRegistry};

    fn make_state_with(config: AppConfig) -> SharedState {
        let clients = Arc::new(ClientRegistry::new());
        let rooms = Arc::new(RoomRegistry::new());
        let bridge = Arc::new(EventBridge::new(clients.clone(), rooms.clone()));
        SharedState {
            clients,
            rooms,
            media: None,
            bridge,
            recorder: None,
            metrics: ServerMetrics::new(),
            config: Arc::new(config),
        }
    }

    fn make_state() -> SharedState {
        make_state_with(AppConfig::default())
    }

    fn admin_user() -> User {
        User {
            id: "u-admin".into(),
            name: "Root".into(),
            role: UserRole::Admin,
        }
    }

    fn connect(
        state: &SharedState,
        id: &str,
        user: Option<User>,
    ) -> mpsc::Receiver<Arc<String>> {
        let (tx, rx) = mpsc::channel(32);
        state.clients.add(id, tx, user);
        rx
    }

    fn drain(rx: &mut mpsc::Receiver<Arc<String>>) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Ok(json) = rx.try_recv() {
            out.push(serde_json::from_str(&json).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_basic_join_fanout() {
        let state = make_state();
        let mut rx_a = connect(&state, "A", None);
        let mut rx_b = connect(&state, "B", None);
        let mut rx_c = connect(&state, "C", None);

        dispatch(&state, "A", r#"{"type": "join", "room": "R"}"#).await;
        let a_msgs = drain(&mut rx_a);
        assert_eq!(a_msgs[0]["type"], "joined");
        assert_eq!(a_msgs[0]["room"], "R");
        assert_eq!(a_msgs[0]["role"], "publisher");

        dispatch(&state, "B", r#"{"type": "join", "room": "R"}"#).await;
        let a_msgs = drain(&mut rx_a);
        assert_eq!(a_msgs[0]["type"], "member-joined");
        assert_eq!(a_msgs[0]["id"], "B");

        dispatch(&state, "C", r#"{"type": "join", "room": "R"}"#).await;
        assert_eq!(drain(&mut rx_a)[0]["id"], "C");
        assert_eq!(drain(&mut rx_b)[0]["id"], "C");
        // the joiner hears nothing but its own confirmation
        let c_msgs = drain(&mut rx_c);
        assert_eq!(c_msgs.len(), 1);
        assert_eq!(c_msgs[0]["type"], "joined");

        state.rooms.with_room("R", |room| {
            assert_eq!(room.member_count(), 3);
            assert_eq!(room.owner_id.as_deref(), Some("A"));
        });
    }

    #[tokio::test]
    async fn test_moderator_gate() {
        let state = make_state();
        let mut rx_anon = connect(&state, "anon", None);
        let mut rx_root = connect(&state, "root", Some(admin_user()));

        dispatch(&state, "anon", r#"{"type": "join", "room": "R", "role": "moderator"}"#).await;
        let msgs = drain(&mut rx_anon);
        assert_eq!(msgs[0]["type"], "error");
        assert_eq!(msgs[0]["message"], "only admin users can join as moderator");

        dispatch(&state, "root", r#"{"type": "join", "room": "R", "role": "moderator"}"#).await;
        let msgs = drain(&mut rx_root);
        assert_eq!(msgs[0]["type"], "joined");
        assert_eq!(msgs[0]["role"], "moderator");
        state.rooms.with_room("R", |room| {
            assert_eq!(room.moderators(), vec!["root".to_string()]);
        });
    }

    #[tokio::test]
    async fn test_observer_policy() {
        let mut config = AppConfig::default();
        config.room_defaults = RoomOptions {
            max_video_producers: 0,
            allow_observers: true,
            max_observers: 1,
        };
        let state = make_state_with(config);
        let mut rx_o1 = connect(&state, "O1", None);
        let mut rx_o2 = connect(&state, "O2", None);

        dispatch(&state, "O1", r#"{"type": "join", "room": "R", "role": "observer"}"#).await;
        let msgs = drain(&mut rx_o1);
        assert_eq!(msgs[0]["type"], "joined");
        assert_eq!(msgs[0]["role"], "observer");
        // observers get the current producer list on join
        assert_eq!(msgs[1]["type"], "sfu.producers");
        assert_eq!(msgs[1]["room"], "R");

        dispatch(&state, "O2", r#"{"type": "join", "room": "R", "role": "observer"}"#).await;
        let msgs = drain(&mut rx_o2);
        assert_eq!(msgs[0]["type"], "error");
        assert_eq!(msgs[0]["message"], "room observer limit reached");
    }

    #[tokio::test]
    async fn test_observers_disallowed_by_room_options() {
        let mut config = AppConfig::default();
        config.room_defaults.allow_observers = false;
        let state = make_state_with(config);
        let mut rx = connect(&state, "O", None);

        dispatch(&state, "O", r#"{"type": "join", "room": "R", "role": "observer"}"#).await;
        let msgs = drain(&mut rx);
        assert_eq!(msgs[0]["message"], "observers not allowed in this room");
    }

    #[tokio::test]
    async fn test_sfu_messages_require_adapter() {
        let state = make_state();
        let mut rx = connect(&state, "A", None);
        dispatch(&state, "A", r#"{"type": "join", "room": "R"}"#).await;
        drain(&mut rx);

        dispatch(
            &state,
            "A",
            r#"{"type": "sfu.createTransport", "room": "R"}"#,
        )
        .await;
        let msgs = drain(&mut rx);
        assert_eq!(msgs[0]["type"], "error");
        assert_eq!(msgs[0]["message"], "sfu not enabled");
    }

    #[tokio::test]
    async fn test_ice_relay() {
        let state = make_state();
        let mut rx_a = connect(&state, "A", None);
        let mut rx_b = connect(&state, "B", None);
        let mut rx_c = connect(&state, "C", None);
        for id in ["A", "B", "C"] {
            dispatch(&state, id, r#"{"type": "join", "room": "R"}"#).await;
        }
        drain(&mut rx_a);
        drain(&mut rx_b);
        drain(&mut rx_c);

        // direct
        dispatch(
            &state,
            "A",
            r#"{"type": "ice", "to": "B", "candidate": {"sdpMid": "0"}}"#,
        )
        .await;
        let msgs = drain(&mut rx_b);
        assert_eq!(msgs[0]["type"], "ice");
        assert_eq!(msgs[0]["from"], "A");
        assert_eq!(msgs[0]["candidate"]["sdpMid"], "0");
        assert!(drain(&mut rx_c).is_empty());

        // room fan-out skips the sender
        dispatch(
            &state,
            "A",
            r#"{"type": "ice", "room": "R", "candidate": "c"}"#,
        )
        .await;
        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(drain(&mut rx_b).len(), 1);
        assert_eq!(drain(&mut rx_c).len(), 1);

        // neither target is an error
        dispatch(&state, "A", r#"{"type": "ice", "candidate": "c"}"#).await;
        let msgs = drain(&mut rx_a);
        assert_eq!(msgs[0]["type"], "error");
        assert_eq!(msgs[0]["message"], "ice requires to or room");
    }

    #[tokio::test]
    async fn test_legacy_offer_relay_annotates_from() {
        let state = make_state();
        let mut rx_a = connect(&state, "A", None);
        let mut rx_b = connect(&state, "B", None);
        dispatch(&state, "A", r#"{"type": "join", "room": "R"}"#).await;
        dispatch(&state, "B", r#"{"type": "join", "room": "R"}"#).await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        dispatch(
            &state,
            "A",
            r#"{"type": "offer", "to": "B", "sdp": "v=0", "custom": 42}"#,
        )
        .await;
        let msgs = drain(&mut rx_b);
        assert_eq!(msgs[0]["type"], "offer");
        assert_eq!(msgs[0]["from"], "A");
        assert_eq!(msgs[0]["sdp"], "v=0");
        assert_eq!(msgs[0]["custom"], 42);

        // room broadcast excludes the sender
        dispatch(
            &state,
            "B",
            r#"{"type": "answer", "room": "R", "sdp": "v=0"}"#,
        )
        .await;
        assert!(drain(&mut rx_b).is_empty());
        let msgs = drain(&mut rx_a);
        assert_eq!(msgs[0]["type"], "answer");
        assert_eq!(msgs[0]["from"], "B");
    }

    #[tokio::test]
    async fn test_unknown_type_and_garbage_frames() {
        let state = make_state();
        let mut rx = connect(&state, "A", None);

        // valid JSON, unrecognized type: protocol error
        dispatch(&state, "A", r#"{"type": "teleport"}"#).await;
        let msgs = drain(&mut rx);
        assert_eq!(msgs[0]["message"], "unknown message type");

        // invalid JSON and missing type: dropped silently
        dispatch(&state, "A", "not json at all").await;
        dispatch(&state, "A", r#"{"room": "R"}"#).await;
        assert!(drain(&mut rx).is_empty());

        // recognized type with a missing field names the problem
        dispatch(&state, "A", r#"{"type": "join"}"#).await;
        let msgs = drain(&mut rx);
        assert_eq!(msgs[0]["type"], "error");
        let text = msgs[0]["message"].as_str().unwrap();
        assert!(text.starts_with("invalid join message"), "{text}");
        assert!(text.contains("room"), "{text}");
    }

    #[tokio::test]
    async fn test_leave_room_round_trip() {
        let state = make_state();
        let mut rx_a = connect(&state, "A", None);
        let mut rx_b = connect(&state, "B", None);
        dispatch(&state, "A", r#"{"type": "join", "room": "R"}"#).await;
        dispatch(&state, "B", r#"{"type": "join", "room": "R"}"#).await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        // pretend A produced earlier (the control-plane commit of produce)
        state.rooms.with_room_mut("R", |room| {
            room.producers.insert(
                "PA".into(),
                RoomProducer {
                    client_id: "A".into(),
                    kind: MediaKind::Video,
                    created_at: SystemTime::now(),
                },
            );
        });
        state.clients.with_session_mut("A", |s| {
            s.producers.insert("PA".into());
        });

        dispatch(&state, "A", r#"{"type": "leaveRoom", "room": "R"}"#).await;

        let a_msgs = drain(&mut rx_a);
        assert_eq!(a_msgs[0]["type"], "left");
        assert_eq!(a_msgs[0]["room"], "R");

        let b_msgs = drain(&mut rx_b);
        assert_eq!(b_msgs[0]["type"], "sfu.producerClosed");
        assert_eq!(b_msgs[0]["producerId"], "PA");
        assert_eq!(b_msgs[0]["clientId"], "A");
        assert_eq!(b_msgs[1]["type"], "member-left");
        assert_eq!(b_msgs[1]["id"], "A");

        state.rooms.with_room("R", |room| {
            assert!(room.producers.is_empty());
            assert!(!room.is_member("A"));
            assert_eq!(room.owner_id.as_deref(), Some("B"));
        });
        assert!(state
            .clients
            .with_session("A", |s| s.rooms.is_empty() && s.producers.is_empty())
            .unwrap());

        // leaving again is an error: no longer a member
        dispatch(&state, "A", r#"{"type": "leaveRoom", "room": "R"}"#).await;
        let msgs = drain(&mut rx_a);
        assert_eq!(msgs[0]["type"], "error");

        // last member out deletes the room
        dispatch(&state, "B", r#"{"type": "leaveRoom", "room": "R"}"#).await;
        assert!(!state.rooms.contains("R"));
    }

    #[tokio::test]
    async fn test_disconnect_cleanup_with_fanout() {
        let state = make_state();
        let mut rx_a = connect(&state, "A", None);
        let mut rx_b = connect(&state, "B", None);
        dispatch(&state, "A", r#"{"type": "join", "room": "R"}"#).await;
        dispatch(&state, "B", r#"{"type": "join", "room": "R"}"#).await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        state.rooms.with_room_mut("R", |room| {
            room.producers.insert(
                "PA".into(),
                RoomProducer {
                    client_id: "A".into(),
                    kind: MediaKind::Video,
                    created_at: SystemTime::now(),
                },
            );
        });
        state.clients.with_session_mut("A", |s| {
            s.producers.insert("PA".into());
        });

        disconnect(&state, "A").await;

        let b_msgs = drain(&mut rx_b);
        assert_eq!(b_msgs[0]["type"], "sfu.producerClosed");
        assert_eq!(b_msgs[0]["room"], "R");
        assert_eq!(b_msgs[0]["producerId"], "PA");
        assert_eq!(b_msgs[0]["clientId"], "A");
        assert_eq!(b_msgs[1]["type"], "member-left");
        assert_eq!(b_msgs[1]["id"], "A");
        assert_eq!(b_msgs[2]["type"], "leave");
        assert_eq!(b_msgs[2]["id"], "A");

        assert!(!state.clients.contains("A"));
        state.rooms.with_room("R", |room| {
            assert_eq!(room.members(), ["B".to_string()]);
            assert_eq!(room.owner_id.as_deref(), Some("B"));
        });

        // a second disconnect is a no-op
        disconnect(&state, "A").await;
        assert!(drain(&mut rx_b).is_empty());
    }

    #[tokio::test]
    async fn test_list_and_rooms() {
        let state = make_state();
        let mut rx_a = connect(&state, "A", None);
        let _rx_b = connect(&state, "B", None);
        dispatch(&state, "A", r#"{"type": "join", "room": "R"}"#).await;
        drain(&mut rx_a);

        dispatch(&state, "A", r#"{"type": "list"}"#).await;
        let msgs = drain(&mut rx_a);
        assert_eq!(msgs[0]["type"], "list");
        let mut clients: Vec<String> = msgs[0]["clients"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        clients.sort();
        assert_eq!(clients, vec!["A".to_string(), "B".to_string()]);

        dispatch(&state, "A", r#"{"type": "rooms"}"#).await;
        let msgs = drain(&mut rx_a);
        assert_eq!(msgs[0]["type"], "rooms");
        assert_eq!(msgs[0]["rooms"][0]["name"], "R");
        assert_eq!(msgs[0]["rooms"][0]["count"], 1);
    }

    #[tokio::test]
    async fn test_admin_gate() {
        let state = make_state();
        let mut rx_user = connect(&state, "user", None);
        let mut rx_root = connect(&state, "root", Some(admin_user()));
        dispatch(&state, "user", r#"{"type": "join", "room": "R"}"#).await;
        drain(&mut rx_user);

        dispatch(&state, "user", r#"{"type": "admin.rooms"}"#).await;
        let msgs = drain(&mut rx_user);
        assert_eq!(msgs[0]["message"], "admin access required");

        dispatch(&state, "root", r#"{"type": "admin.rooms"}"#).await;
        let msgs = drain(&mut rx_root);
        assert_eq!(msgs[0]["type"], "admin.rooms");
        assert_eq!(msgs[0]["rooms"][0]["name"], "R");

        dispatch(&state, "root", r#"{"type": "admin.roomInfo", "room": "R"}"#).await;
        let msgs = drain(&mut rx_root);
        assert_eq!(msgs[0]["type"], "admin.roomInfo");
        assert_eq!(msgs[0]["name"], "R");
        assert_eq!(msgs[0]["members"][0]["id"], "user");

        dispatch(&state, "root", r#"{"type": "admin.metrics"}"#).await;
        let msgs = drain(&mut rx_root);
        assert_eq!(msgs[0]["type"], "admin.metrics");
        assert!(msgs[0]["metrics"]["server"]["joins"].as_u64().unwrap() >= 1);
    }

    #[tokio::test]
    async fn test_recording_requires_configuration() {
        let state = make_state();
        let mut rx = connect(&state, "A", None);
        dispatch(
            &state,
            "A",
            r#"{"type": "sfu.stopRecording", "producerId": "p"}"#,
        )
        .await;
        let msgs = drain(&mut rx);
        assert_eq!(msgs[0]["message"], "recording not enabled");
    }
}
