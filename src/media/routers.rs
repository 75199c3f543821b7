#![forbid(unsafe_code)]

// Per-room router contexts, created lazily on the first adapter call that
// references the room.

use crate::media::config::MediaSettings;
use crate::media::types::{MediaError, MediaResult};
use crate::media::worker_pool::WorkerPool;
use mediasoup::prelude::*;
use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use tracing::{info, warn};

/// Lifetime counters for one room, kept past individual resource churn.
#[derive(Debug, Default)]
pub struct RoomCounters {
    pub producers_total: AtomicU64,
    pub consumers_total: AtomicU64,
}

/// A room's router plus the worker it was bound to.
#[derive(Clone)]
pub struct RoomContext {
    pub router: Router,
    pub worker_index: usize,
    pub counters: Arc<RoomCounters>,
}

pub struct RoomRouters {
    rooms: StdRwLock<HashMap<String, RoomContext>>,
}

impl RoomRouters {
    pub fn new() -> Self {
        Self {
            rooms: StdRwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, RoomContext>> {
        self.rooms.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, RoomContext>> {
        self.rooms.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, room: &str) -> Option<RoomContext> {
        self.read().get(room).cloned()
    }

    /// Gets the room's context, creating its router on a round-robin-assigned
    /// worker if this is the first reference. Concurrent creators race; the
    /// loser's router is dropped.
    pub async fn get_or_create(
        &self,
        room: &str,
        pool: &WorkerPool,
        settings: &MediaSettings,
    ) -> MediaResult<RoomContext> {
        if let Some(ctx) = self.get(room) {
            return Ok(ctx);
        }

        let (worker, worker_index) = pool.assign();
        let router = worker
            .create_router(settings.router_options())
            .await
            .map_err(|e| MediaError::Router(format!("Failed to create router: {e}")))?;

        info!(
            "Created router {} for room {} on worker index {}",
            router.id(),
            room,
            worker_index
        );

        {
            let room = room.to_string();
            router
                .on_worker_close(move || {
                    warn!("Worker closed under router of room {}", room);
                })
                .detach();
        }

        let mut rooms = self.write();
        Ok(rooms
            .entry(room.to_string())
            .or_insert_with(|| RoomContext {
                router,
                worker_index,
                counters: Arc::new(RoomCounters::default()),
            })
            .clone())
    }

    /// Drops the room's context. Closing the router cascades routerclose to
    /// every transport created on it.
    pub fn remove(&self, room: &str) -> bool {
        let removed = self.write().remove(room).is_some();
        if removed {
            info!("Removed router for room {}", room);
        }
        removed
    }

    pub fn names(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.read().len()
    }
}

impl Default for RoomRouters {
    fn default() -> Self {
        Self::new()
    }
}
