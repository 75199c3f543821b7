#![forbid(unsafe_code)]

// Media engine adapter: owns every engine handle and the authoritative
// engine-side tables, and normalizes engine lifecycle into the three
// EngineEvent kinds.
//
// Registration happens before an operation returns, so a resource id handed
// to a client always resolves. Unregistration is idempotent: explicit close
// and engine-initiated close race freely, the second one is a no-op.

use crate::media::config::MediaSettings;
use crate::media::routers::RoomRouters;
use crate::media::types::{
    CreatedConsumer, CreatedProducer, CreatedTransport, EngineEvent, EngineMetrics,
    EngineRoomOverview, MediaError, MediaResult, ProducerSnapshot, TransportDirection,
};
use crate::media::worker_pool::WorkerPool;
use mediasoup::prelude::*;
use std::collections::HashMap;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

#[derive(Clone)]
struct TransportRecord {
    transport: WebRtcTransport,
    room: String,
    client_id: String,
    direction: TransportDirection,
}

#[derive(Clone)]
struct ProducerRecord {
    producer: Producer,
    room: String,
    client_id: String,
    kind: MediaKind,
}

#[derive(Clone)]
struct ConsumerRecord {
    consumer: Consumer,
    room: String,
    client_id: String,
    producer_id: String,
}

struct AdapterShared {
    settings: MediaSettings,
    pool: OnceCell<WorkerPool>,
    routers: RoomRouters,
    transports: StdRwLock<HashMap<String, TransportRecord>>,
    producers: StdRwLock<HashMap<String, ProducerRecord>>,
    consumers: StdRwLock<HashMap<String, ConsumerRecord>>,
    events: UnboundedSender<EngineEvent>,
}

impl AdapterShared {
    fn transport(&self, id: &str) -> MediaResult<TransportRecord> {
        self.transports
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| MediaError::TransportNotFound(id.to_string()))
    }

    fn producer(&self, id: &str) -> MediaResult<ProducerRecord> {
        self.producers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| MediaError::ProducerNotFound(id.to_string()))
    }

    fn unregister_transport(&self, id: &str, reason: &'static str) -> Option<TransportRecord> {
        let rec = self
            .transports
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)?;
        debug!("Unregistered transport {} ({})", id, reason);
        let _ = self.events.send(EngineEvent::TransportClosed {
            room: rec.room.clone(),
            client_id: rec.client_id.clone(),
            transport_id: id.to_string(),
            reason,
        });
        Some(rec)
    }

    fn unregister_producer(&self, id: &str, reason: &'static str) -> Option<ProducerRecord> {
        let rec = self
            .producers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)?;
        debug!("Unregistered producer {} ({})", id, reason);
        let _ = self.events.send(EngineEvent::ProducerClosed {
            room: rec.room.clone(),
            client_id: rec.client_id.clone(),
            producer_id: id.to_string(),
            reason,
        });
        Some(rec)
    }

    fn unregister_consumer(&self, id: &str, reason: &'static str) -> Option<ConsumerRecord> {
        let rec = self
            .consumers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)?;
        debug!("Unregistered consumer {} ({})", id, reason);
        let _ = self.events.send(EngineEvent::ConsumerClosed {
            room: rec.room.clone(),
            client_id: rec.client_id.clone(),
            consumer_id: id.to_string(),
            reason,
        });
        Some(rec)
    }
}

/// Facade over the mediasoup engine. Construction is cheap; workers spawn on
/// the first call that needs them.
pub struct MediaAdapter {
    shared: Arc<AdapterShared>,
}

impl MediaAdapter {
    pub fn new(settings: MediaSettings) -> (Self, UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let adapter = Self {
            shared: Arc::new(AdapterShared {
                settings,
                pool: OnceCell::new(),
                routers: RoomRouters::new(),
                transports: StdRwLock::new(HashMap::new()),
                producers: StdRwLock::new(HashMap::new()),
                consumers: StdRwLock::new(HashMap::new()),
                events: tx,
            }),
        };
        (adapter, rx)
    }

    async fn pool(&self) -> MediaResult<&WorkerPool> {
        self.shared
            .pool
            .get_or_try_init(|| WorkerPool::spawn(&self.shared.settings))
            .await
    }

    /// Creates a WebRTC transport on the room's router. The record is
    /// registered before the payload is returned.
    pub async fn create_webrtc_transport(
        &self,
        room: &str,
        client_id: &str,
        direction: TransportDirection,
    ) -> MediaResult<CreatedTransport> {
        let pool = self.pool().await?;
        let ctx = self
            .shared
            .routers
            .get_or_create(room, pool, &self.shared.settings)
            .await?;

        let transport = ctx
            .router
            .create_webrtc_transport(self.shared.settings.transport_options())
            .await
            .map_err(|e| MediaError::Transport(format!("Failed to create transport: {e}")))?;

        let transport_id = transport.id().to_string();
        {
            let mut transports = self.shared.transports.write().unwrap_or_else(|e| e.into_inner());
            transports.insert(
                transport_id.clone(),
                TransportRecord {
                    transport: transport.clone(),
                    room: room.to_string(),
                    client_id: client_id.to_string(),
                    direction,
                },
            );
        }

        // close and routerclose both feed the same idempotent unregister
        transport
            .on_close(Box::new({
                let shared = Arc::clone(&self.shared);
                let id = transport_id.clone();
                move || {
                    shared.unregister_transport(&id, "closed");
                }
            }))
            .detach();
        transport
            .on_router_close(Box::new({
                let shared = Arc::clone(&self.shared);
                let id = transport_id.clone();
                move || {
                    shared.unregister_transport(&id, "routerclose");
                }
            }))
            .detach();

        info!(
            "Created {:?} transport {} for client {} in room {}",
            direction, transport_id, client_id, room
        );

        Ok(CreatedTransport {
            transport_id,
            ice_parameters: transport.ice_parameters().clone(),
            ice_candidates: transport.ice_candidates().clone(),
            dtls_parameters: transport.dtls_parameters(),
            router_rtp_capabilities: ctx.router.rtp_capabilities().clone(),
        })
    }

    pub async fn connect_transport(
        &self,
        transport_id: &str,
        dtls_parameters: DtlsParameters,
    ) -> MediaResult<()> {
        let rec = self.shared.transport(transport_id)?;
        rec.transport
            .connect(WebRtcTransportRemoteParameters { dtls_parameters })
            .await
            .map_err(|e| MediaError::Transport(format!("Failed to connect transport: {e}")))?;

        info!("Connected transport {} for client {}", transport_id, rec.client_id);
        Ok(())
    }

    pub async fn close_transport(&self, transport_id: &str) -> MediaResult<()> {
        match self.shared.unregister_transport(transport_id, "closed") {
            Some(_rec) => Ok(()),
            None => Err(MediaError::TransportNotFound(transport_id.to_string())),
        }
    }

    /// Creates a producer on the given transport. The transport must belong
    /// to the room the caller names.
    pub async fn create_producer(
        &self,
        transport_id: &str,
        room: &str,
        client_id: &str,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> MediaResult<CreatedProducer> {
        let rec = self.shared.transport(transport_id)?;
        if rec.room != room {
            return Err(MediaError::RoomMismatch);
        }

        let producer = rec
            .transport
            .produce(ProducerOptions::new(kind, rtp_parameters))
            .await
            .map_err(|e| MediaError::Producer(format!("Failed to create producer: {e}")))?;

        let producer_id = producer.id().to_string();
        {
            let mut producers = self.shared.producers.write().unwrap_or_else(|e| e.into_inner());
            producers.insert(
                producer_id.clone(),
                ProducerRecord {
                    producer: producer.clone(),
                    room: rec.room.clone(),
                    client_id: client_id.to_string(),
                    kind,
                },
            );
        }
        if let Some(ctx) = self.shared.routers.get(&rec.room) {
            ctx.counters.producers_total.fetch_add(1, Relaxed);
        }

        producer
            .on_transport_close({
                let shared = Arc::clone(&self.shared);
                let id = producer_id.clone();
                move || {
                    shared.unregister_producer(&id, "transportclose");
                }
            })
            .detach();
        producer
            .on_close({
                let shared = Arc::clone(&self.shared);
                let id = producer_id.clone();
                move || {
                    shared.unregister_producer(&id, "closed");
                }
            })
            .detach();

        info!(
            "Created {:?} producer {} for client {} in room {}",
            kind, producer_id, client_id, room
        );

        Ok(CreatedProducer { producer_id, kind })
    }

    /// Creates a consumer for a producer on the caller's receive transport.
    pub async fn create_consumer(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: RtpCapabilities,
        client_id: &str,
    ) -> MediaResult<CreatedConsumer> {
        let trec = self.shared.transport(transport_id)?;
        let prec = self.shared.producer(producer_id)?;
        let ctx = self
            .shared
            .routers
            .get(&trec.room)
            .ok_or_else(|| MediaError::Router(format!("Router not found for room: {}", trec.room)))?;

        let typed_producer_id = prec.producer.id();
        if !ctx.router.can_consume(&typed_producer_id, &rtp_capabilities) {
            return Err(MediaError::CannotConsume);
        }

        let mut options = ConsumerOptions::new(typed_producer_id, rtp_capabilities);
        options.paused = false;

        let consumer = trec
            .transport
            .consume(options)
            .await
            .map_err(|e| MediaError::Consumer(format!("Failed to create consumer: {e}")))?;

        let consumer_id = consumer.id().to_string();
        {
            let mut consumers = self.shared.consumers.write().unwrap_or_else(|e| e.into_inner());
            consumers.insert(
                consumer_id.clone(),
                ConsumerRecord {
                    consumer: consumer.clone(),
                    room: trec.room.clone(),
                    client_id: client_id.to_string(),
                    producer_id: producer_id.to_string(),
                },
            );
        }
        ctx.counters.consumers_total.fetch_add(1, Relaxed);

        // transportclose, producerclose, and close all feed one idempotent cleanup
        consumer
            .on_transport_close({
                let shared = Arc::clone(&self.shared);
                let id = consumer_id.clone();
                move || {
                    shared.unregister_consumer(&id, "transportclose");
                }
            })
            .detach();
        consumer
            .on_producer_close({
                let shared = Arc::clone(&self.shared);
                let id = consumer_id.clone();
                move || {
                    shared.unregister_consumer(&id, "producerclose");
                }
            })
            .detach();
        consumer
            .on_close({
                let shared = Arc::clone(&self.shared);
                let id = consumer_id.clone();
                move || {
                    shared.unregister_consumer(&id, "closed");
                }
            })
            .detach();

        // The engine sometimes needs an explicit resume to start sending RTP
        if let Err(e) = consumer.resume().await {
            warn!("Failed to resume consumer {}: {}", consumer_id, e);
        }

        info!(
            "Created consumer {} of producer {} for client {} in room {}",
            consumer_id, producer_id, client_id, trec.room
        );

        Ok(CreatedConsumer {
            consumer_id,
            producer_id: producer_id.to_string(),
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters().clone(),
        })
    }

    pub async fn close_producer(&self, producer_id: &str) -> MediaResult<()> {
        match self.shared.unregister_producer(producer_id, "closed") {
            Some(_rec) => Ok(()),
            None => Err(MediaError::ProducerNotFound(producer_id.to_string())),
        }
    }

    pub async fn close_consumer(&self, consumer_id: &str) -> MediaResult<()> {
        match self.shared.unregister_consumer(consumer_id, "closed") {
            Some(_rec) => Ok(()),
            None => Err(MediaError::ConsumerNotFound(consumer_id.to_string())),
        }
    }

    /// Closes every engine resource tagged with the client id. Safe to call
    /// any number of times.
    pub async fn close_client(&self, client_id: &str) {
        let consumer_ids: Vec<String> = {
            let consumers = self.shared.consumers.read().unwrap_or_else(|e| e.into_inner());
            consumers
                .iter()
                .filter(|(_, rec)| rec.client_id == client_id)
                .map(|(id, _)| id.clone())
                .collect()
        };
        let producer_ids: Vec<String> = {
            let producers = self.shared.producers.read().unwrap_or_else(|e| e.into_inner());
            producers
                .iter()
                .filter(|(_, rec)| rec.client_id == client_id)
                .map(|(id, _)| id.clone())
                .collect()
        };
        let transport_ids: Vec<String> = {
            let transports = self.shared.transports.read().unwrap_or_else(|e| e.into_inner());
            transports
                .iter()
                .filter(|(_, rec)| rec.client_id == client_id)
                .map(|(id, _)| id.clone())
                .collect()
        };

        for id in consumer_ids {
            self.shared.unregister_consumer(&id, "clientclose");
        }
        for id in producer_ids {
            self.shared.unregister_producer(&id, "clientclose");
        }
        for id in transport_ids {
            self.shared.unregister_transport(&id, "clientclose");
        }
    }

    /// Drops the room's router context; the engine cascades routerclose to
    /// everything created on it.
    pub fn close_room(&self, room: &str) -> bool {
        self.shared.routers.remove(room)
    }

    /// Producer metadata needed to drive the external recorder.
    pub fn producer_snapshot(&self, producer_id: &str) -> Option<ProducerSnapshot> {
        let rec = self
            .shared
            .producers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(producer_id)
            .cloned()?;

        let rtp_parameters = rec.producer.rtp_parameters().clone();
        let (codec, payload_type) = match rtp_parameters.codecs.first() {
            Some(RtpCodecParameters::Audio {
                mime_type,
                payload_type,
                ..
            }) => (
                serde_json::to_value(mime_type)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string)),
                Some(*payload_type),
            ),
            Some(RtpCodecParameters::Video {
                mime_type,
                payload_type,
                ..
            }) => (
                serde_json::to_value(mime_type)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string)),
                Some(*payload_type),
            ),
            None => (None, None),
        };
        let ssrc = rtp_parameters.encodings.first().and_then(|e| e.ssrc);

        Some(ProducerSnapshot {
            producer_id: producer_id.to_string(),
            room: rec.room,
            client_id: rec.client_id,
            kind: rec.kind,
            codec,
            payload_type,
            ssrc,
        })
    }

    /// Engine-side per-room overview for the admin surface.
    pub fn rooms_overview(&self) -> Vec<EngineRoomOverview> {
        let transports = self.shared.transports.read().unwrap_or_else(|e| e.into_inner());
        let producers = self.shared.producers.read().unwrap_or_else(|e| e.into_inner());
        let consumers = self.shared.consumers.read().unwrap_or_else(|e| e.into_inner());

        self.shared
            .routers
            .names()
            .into_iter()
            .map(|name| {
                let counters = self.shared.routers.get(&name).map(|ctx| ctx.counters);
                EngineRoomOverview {
                    transports: transports.values().filter(|r| r.room == name).count(),
                    producers: producers.values().filter(|r| r.room == name).count(),
                    consumers: consumers.values().filter(|r| r.room == name).count(),
                    producers_total: counters
                        .as_ref()
                        .map(|c| c.producers_total.load(Relaxed))
                        .unwrap_or(0),
                    consumers_total: counters
                        .as_ref()
                        .map(|c| c.consumers_total.load(Relaxed))
                        .unwrap_or(0),
                    name,
                }
            })
            .collect()
    }

    /// Engine-wide counters for the admin surface.
    pub fn metrics(&self) -> EngineMetrics {
        let overview = self.rooms_overview();
        EngineMetrics {
            workers: self.shared.pool.get().map(WorkerPool::len).unwrap_or(0),
            rooms: overview.len(),
            transports: self
                .shared
                .transports
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .len(),
            producers: self
                .shared
                .producers
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .len(),
            consumers: self
                .shared
                .consumers
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .len(),
            producers_total: overview.iter().map(|r| r.producers_total).sum(),
            consumers_total: overview.iter().map(|r| r.consumers_total).sum(),
        }
    }

    /// The room a transport belongs to, with its direction.
    pub fn transport_binding(&self, transport_id: &str) -> Option<(String, TransportDirection)> {
        self.shared
            .transports
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(transport_id)
            .map(|rec| (rec.room.clone(), rec.direction))
    }
}
