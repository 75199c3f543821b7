#![forbid(unsafe_code)]

// Signaling protocol - JSON message types carried over the WebSocket channel.
//
// Every frame is an object with a `type` field. Engine-operation requests
// carry an optional client-supplied `requestId` that is echoed on the reply so
// the remote side can correlate its outstanding continuation.

use crate::ice::IceServer;
use crate::media::TransportDirection;
use crate::rooms::{RoomInfo, RoomOverview, RoomRole};
use mediasoup::prelude::*;
use serde::{Deserialize, Serialize};

/// Client-to-Server messages
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Join a room, optionally with a role (defaults to publisher)
    #[serde(rename = "join")]
    Join {
        room: String,
        #[serde(default)]
        role: Option<RoomRole>,
    },
    /// Leave one room
    #[serde(rename = "leaveRoom")]
    LeaveRoom { room: String },
    /// Courtesy notice before closing the socket; cleanup runs on close
    #[serde(rename = "leave")]
    Leave,
    /// List connected client ids
    #[serde(rename = "list")]
    List,
    /// List rooms with member counts
    #[serde(rename = "rooms")]
    Rooms,
    /// Relay an ICE candidate to a peer or a room
    #[serde(rename = "ice")]
    Ice {
        candidate: serde_json::Value,
        #[serde(default)]
        to: Option<String>,
        #[serde(default)]
        room: Option<String>,
    },
    /// Legacy mesh SDP offer, relayed verbatim with a `from` annotation
    #[serde(rename = "offer")]
    Offer {
        #[serde(default)]
        to: Option<String>,
        #[serde(default)]
        room: Option<String>,
        #[serde(flatten)]
        rest: serde_json::Map<String, serde_json::Value>,
    },
    /// Legacy mesh SDP answer
    #[serde(rename = "answer")]
    Answer {
        #[serde(default)]
        to: Option<String>,
        #[serde(default)]
        room: Option<String>,
        #[serde(flatten)]
        rest: serde_json::Map<String, serde_json::Value>,
    },
    /// Legacy mesh ICE candidate
    #[serde(rename = "candidate")]
    Candidate {
        #[serde(default)]
        to: Option<String>,
        #[serde(default)]
        room: Option<String>,
        #[serde(flatten)]
        rest: serde_json::Map<String, serde_json::Value>,
    },
    /// Create a WebRTC transport in a room
    #[serde(rename = "sfu.createTransport", rename_all = "camelCase")]
    CreateTransport {
        room: String,
        #[serde(default)]
        direction: Option<TransportDirection>,
        #[serde(default)]
        request_id: Option<String>,
    },
    /// Supply DTLS parameters for a created transport
    #[serde(rename = "sfu.connectTransport", rename_all = "camelCase")]
    ConnectTransport {
        transport_id: String,
        dtls_parameters: DtlsParameters,
        #[serde(default)]
        request_id: Option<String>,
    },
    /// Publish a track into a room
    #[serde(rename = "sfu.produce", rename_all = "camelCase")]
    Produce {
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        room: String,
        #[serde(default)]
        request_id: Option<String>,
    },
    /// Subscribe to another member's producer
    #[serde(rename = "sfu.consume", rename_all = "camelCase")]
    Consume {
        transport_id: String,
        producer_id: String,
        rtp_capabilities: RtpCapabilities,
        room: String,
        #[serde(default)]
        request_id: Option<String>,
    },
    /// List the producers currently live in a room
    #[serde(rename = "sfu.listProducers")]
    ListProducers { room: String },
    /// Close one of the caller's producers
    #[serde(rename = "sfu.closeProducer", rename_all = "camelCase")]
    CloseProducer { producer_id: String },
    /// Ask the external recorder to start capturing a producer
    #[serde(rename = "sfu.startRecording", rename_all = "camelCase")]
    StartRecording { producer_id: String },
    /// Ask the external recorder to stop capturing a producer
    #[serde(rename = "sfu.stopRecording", rename_all = "camelCase")]
    StopRecording { producer_id: String },
    /// Admin: room overview
    #[serde(rename = "admin.rooms")]
    AdminRooms,
    /// Admin: full detail for one room
    #[serde(rename = "admin.roomInfo")]
    AdminRoomInfo { room: String },
    /// Admin: server metrics snapshot
    #[serde(rename = "admin.metrics")]
    AdminMetrics,
}

/// The `type` strings this server understands. Anything else is a protocol
/// error; frames without a `type` are dropped silently.
pub const KNOWN_TYPES: &[&str] = &[
    "join",
    "leaveRoom",
    "leave",
    "list",
    "rooms",
    "ice",
    "offer",
    "answer",
    "candidate",
    "sfu.createTransport",
    "sfu.connectTransport",
    "sfu.produce",
    "sfu.consume",
    "sfu.listProducers",
    "sfu.closeProducer",
    "sfu.startRecording",
    "sfu.stopRecording",
    "admin.rooms",
    "admin.roomInfo",
    "admin.metrics",
];

/// Server-to-Client messages
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Connection greeting carrying the assigned client id
    #[serde(rename = "id")]
    Hello { id: String },
    /// Error reply on the same channel
    #[serde(rename = "error")]
    Error { message: String },
    /// Join confirmation to the joiner
    #[serde(rename = "joined")]
    Joined {
        room: String,
        id: String,
        role: RoomRole,
    },
    /// Leave confirmation to the leaver
    #[serde(rename = "left")]
    Left { room: String, id: String },
    /// Connected client ids
    #[serde(rename = "list")]
    ClientList { clients: Vec<String> },
    /// Room names and member counts
    #[serde(rename = "rooms")]
    RoomList { rooms: Vec<RoomSummary> },
    /// Broadcast to a room when a member joins
    #[serde(rename = "member-joined")]
    MemberJoined {
        room: String,
        id: String,
        role: RoomRole,
    },
    /// Broadcast to a room when a member leaves
    #[serde(rename = "member-left")]
    MemberLeft { room: String, id: String },
    /// Broadcast process-wide when a client disconnects
    #[serde(rename = "leave")]
    Leave { id: String },
    /// Relayed ICE candidate
    #[serde(rename = "ice")]
    Ice {
        from: String,
        candidate: serde_json::Value,
    },
    #[serde(rename = "sfu.transportCreated", rename_all = "camelCase")]
    TransportCreated {
        transport_id: String,
        ice_parameters: IceParameters,
        ice_candidates: Vec<IceCandidate>,
        dtls_parameters: DtlsParameters,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        ice_servers: Vec<IceServer>,
        router_rtp_capabilities: RtpCapabilitiesFinalized,
        direction: TransportDirection,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    #[serde(rename = "sfu.transportConnected", rename_all = "camelCase")]
    TransportConnected {
        transport_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    #[serde(rename = "sfu.produced", rename_all = "camelCase")]
    Produced {
        producer_id: String,
        kind: MediaKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    #[serde(rename = "sfu.consumed", rename_all = "camelCase")]
    Consumed {
        consumer_id: String,
        producer_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    /// Producers currently live in a room
    #[serde(rename = "sfu.producers")]
    Producers {
        room: String,
        producers: Vec<ProducerEntry>,
    },
    /// Broadcast to other members when a producer goes live
    #[serde(rename = "sfu.newProducer", rename_all = "camelCase")]
    NewProducer {
        room: String,
        producer_id: String,
        client_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        producer_user: Option<String>,
        kind: MediaKind,
    },
    /// Producer gone: reply to the closer carries only the id, the room
    /// broadcast also names the room and owner
    #[serde(rename = "sfu.producerClosed", rename_all = "camelCase")]
    ProducerClosed {
        #[serde(skip_serializing_if = "Option::is_none")]
        room: Option<String>,
        producer_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    #[serde(rename = "sfu.recordingStarted", rename_all = "camelCase")]
    RecordingStarted {
        producer_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        output_file: Option<String>,
    },
    #[serde(rename = "sfu.recordingStopped", rename_all = "camelCase")]
    RecordingStopped { producer_id: String },
    #[serde(rename = "admin.rooms")]
    AdminRooms { rooms: Vec<RoomOverview> },
    #[serde(rename = "admin.roomInfo")]
    AdminRoomInfo {
        #[serde(flatten)]
        info: RoomInfo,
    },
    #[serde(rename = "admin.metrics")]
    AdminMetrics { metrics: serde_json::Value },
}

/// Room name with member count, for the `rooms` listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomSummary {
    pub name: String,
    pub count: usize,
}

/// One producer in a room listing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerEntry {
    pub producer_id: String,
    pub kind: MediaKind,
    pub client_id: String,
}
