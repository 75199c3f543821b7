#![forbid(unsafe_code)]

// Media module - the adapter between the signaling control plane and the
// mediasoup engine: worker pool, per-room routers, and the resource tables
// that mirror engine state.

pub mod adapter;
pub mod config;
pub mod routers;
pub mod types;
pub mod worker_pool;

pub use adapter::MediaAdapter;
pub use config::{media_codecs, MediaSettings};
pub use routers::{RoomContext, RoomRouters};
pub use types::{
    CreatedConsumer, CreatedProducer, CreatedTransport, EngineEvent, EngineMetrics,
    EngineRoomOverview, MediaError, MediaResult, ProducerSnapshot, TransportDirection,
};
pub use worker_pool::WorkerPool;
