#![forbid(unsafe_code)]

// Worker pool: N mediasoup workers spawned on first use, rooms bound
// round-robin. A dead worker is fatal — in-memory engine state cannot be
// reconstructed, so the process exits non-zero and the supervisor restarts it.

use crate::media::config::MediaSettings;
use crate::media::types::{MediaError, MediaResult};
use mediasoup::prelude::*;
use mediasoup::worker_manager::WorkerManager;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{error, info};

pub struct WorkerPool {
    workers: Vec<Worker>,
    next: AtomicUsize,
    // Keeps the mediasoup channel alive for the lifetime of the pool.
    _manager: WorkerManager,
}

impl WorkerPool {
    pub async fn spawn(settings: &MediaSettings) -> MediaResult<Self> {
        let count = settings.num_workers.max(1);
        info!("Spawning {} media workers", count);

        let manager = WorkerManager::new();
        let mut workers = Vec::with_capacity(count);

        for index in 0..count {
            let worker = manager
                .create_worker(settings.worker_settings())
                .await
                .map_err(|e| MediaError::Worker(format!("Failed to create worker: {e}")))?;

            let worker_id = worker.id();
            info!("Created worker {} with id: {}", index, worker_id);

            worker
                .on_dead(move |reason| {
                    error!(
                        "Worker {} (index {}) died: {:?} — exiting, engine state is unrecoverable",
                        worker_id, index, reason
                    );
                    std::process::exit(1);
                })
                .detach();

            workers.push(worker);
        }

        Ok(Self {
            workers,
            next: AtomicUsize::new(0),
            _manager: manager,
        })
    }

    /// Round-robin worker assignment for a new room. Returns the worker and
    /// its pool index.
    pub fn assign(&self) -> (Worker, usize) {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        (self.workers[idx].clone(), idx)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Spawns real mediasoup workers; requires the worker binary built by the
    // mediasoup crate.
    #[tokio::test]
    async fn test_round_robin_assignment() {
        let settings = MediaSettings {
            num_workers: 2,
            ..MediaSettings::default()
        };
        let pool = WorkerPool::spawn(&settings).await.unwrap();
        assert_eq!(pool.len(), 2);

        let (w0, i0) = pool.assign();
        let (w1, i1) = pool.assign();
        let (w2, i2) = pool.assign();
        assert_eq!(i0, 0);
        assert_eq!(i1, 1);
        assert_eq!(i2, 0);
        assert_eq!(w0.id(), w2.id());
        assert_ne!(w0.id(), w1.id());
    }
}
