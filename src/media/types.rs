#![forbid(unsafe_code)]

// Common types, errors, and event definitions for the media adapter

use mediasoup::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Direction of a WebRTC transport, seen from the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Recv,
}

/// Custom error type for media operations.
///
/// Precondition variants carry client-facing messages; everything else is an
/// engine failure whose cause is logged server-side.
#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Router error: {0}")]
    Router(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Producer error: {0}")]
    Producer(String),

    #[error("Consumer error: {0}")]
    Consumer(String),

    #[error("transport not found: {0}")]
    TransportNotFound(String),

    #[error("producer not found: {0}")]
    ProducerNotFound(String),

    #[error("consumer not found: {0}")]
    ConsumerNotFound(String),

    #[error("transport belongs to different room")]
    RoomMismatch,

    #[error("cannot consume with provided rtpCapabilities")]
    CannotConsume,
}

impl MediaError {
    /// Precondition failures are surfaced to clients verbatim; engine
    /// failures are collapsed to a generic "sfu.<op> failed" message.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            MediaError::TransportNotFound(_)
                | MediaError::ProducerNotFound(_)
                | MediaError::ConsumerNotFound(_)
                | MediaError::RoomMismatch
                | MediaError::CannotConsume
        )
    }
}

/// Result type alias for media operations
pub type MediaResult<T> = Result<T, MediaError>;

/// Everything a client needs to set up a created transport on its side.
#[derive(Debug, Clone)]
pub struct CreatedTransport {
    pub transport_id: String,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
    pub router_rtp_capabilities: RtpCapabilitiesFinalized,
}

#[derive(Debug, Clone)]
pub struct CreatedProducer {
    pub producer_id: String,
    pub kind: MediaKind,
}

#[derive(Debug, Clone)]
pub struct CreatedConsumer {
    pub consumer_id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

/// Producer metadata for the recorder RPC.
#[derive(Debug, Clone)]
pub struct ProducerSnapshot {
    pub producer_id: String,
    pub room: String,
    pub client_id: String,
    pub kind: MediaKind,
    pub codec: Option<String>,
    pub payload_type: Option<u8>,
    pub ssrc: Option<u32>,
}

/// Normalized lifecycle events emitted by the adapter. A closed sum consumed
/// by the event bridge; handlers fire at most once per resource.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    TransportClosed {
        room: String,
        client_id: String,
        transport_id: String,
        reason: &'static str,
    },
    ProducerClosed {
        room: String,
        client_id: String,
        producer_id: String,
        reason: &'static str,
    },
    ConsumerClosed {
        room: String,
        client_id: String,
        consumer_id: String,
        reason: &'static str,
    },
}

/// Engine-side view of one room for the admin surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineRoomOverview {
    pub name: String,
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
    pub producers_total: u64,
    pub consumers_total: u64,
}

/// Engine-wide counters for the admin surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineMetrics {
    pub workers: usize,
    pub rooms: usize,
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
    pub producers_total: u64,
    pub consumers_total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_serde() {
        assert_eq!(
            serde_json::to_string(&TransportDirection::Send).unwrap(),
            r#""send""#
        );
        let d: TransportDirection = serde_json::from_str(r#""recv""#).unwrap();
        assert_eq!(d, TransportDirection::Recv);
    }

    #[test]
    fn test_precondition_classification() {
        assert!(MediaError::RoomMismatch.is_precondition());
        assert!(MediaError::CannotConsume.is_precondition());
        assert!(MediaError::TransportNotFound("t".into()).is_precondition());
        assert!(!MediaError::Worker("boom".into()).is_precondition());
        assert!(!MediaError::Producer("boom".into()).is_precondition());
    }

    #[test]
    fn test_contract_error_strings() {
        assert_eq!(
            MediaError::RoomMismatch.to_string(),
            "transport belongs to different room"
        );
        assert_eq!(
            MediaError::CannotConsume.to_string(),
            "cannot consume with provided rtpCapabilities"
        );
    }
}
