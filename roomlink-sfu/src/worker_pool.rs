//! Media worker pool
//!
//! Workers are created at startup, routers are placed on them round-robin.
//! A worker that dies reports through the death channel; the registry's
//! supervisor invalidates its rooms and asks the pool for a replacement.

use crate::config::SfuConfig;
use crate::engine::{EngineWorker, MediaEngine, WorkerSettings};
use crate::error::{Result, SfuError};
use crate::types::WorkerId;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

/// Reported once per worker that died unexpectedly
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerDeath {
    pub worker_id: WorkerId,
    pub reason: String,
}

pub struct WorkerPool {
    engine: Arc<dyn MediaEngine>,
    settings: WorkerSettings,
    workers: RwLock<Vec<Arc<dyn EngineWorker>>>,
    next: AtomicUsize,
    deaths_tx: mpsc::UnboundedSender<WorkerDeath>,
    deaths_rx: Mutex<Option<mpsc::UnboundedReceiver<WorkerDeath>>>,
}

impl WorkerPool {
    /// Create `config.worker_count()` workers
    pub async fn start(engine: Arc<dyn MediaEngine>, config: &SfuConfig) -> Result<Arc<Self>> {
        let (deaths_tx, deaths_rx) = mpsc::unbounded_channel();
        let pool = Arc::new(Self {
            engine,
            settings: WorkerSettings {
                rtc_min_port: config.rtc_min_port,
                rtc_max_port: config.rtc_max_port,
            },
            workers: RwLock::new(Vec::new()),
            next: AtomicUsize::new(0),
            deaths_tx,
            deaths_rx: Mutex::new(Some(deaths_rx)),
        });

        let count = config.worker_count();
        for _ in 0..count {
            let worker = pool.spawn_worker().await?;
            pool.workers.write().push(worker);
        }

        info!(
            workers = count,
            rtc_min_port = config.rtc_min_port,
            rtc_max_port = config.rtc_max_port,
            "Media worker pool started"
        );
        Ok(pool)
    }

    async fn spawn_worker(&self) -> Result<Arc<dyn EngineWorker>> {
        let worker = self.engine.create_worker(&self.settings).await?;
        let deaths = self.deaths_tx.clone();
        let worker_id = worker.id().clone();
        worker.on_died(Box::new(move |reason| {
            error!(worker_id = %worker_id, reason = %reason, "Media worker died");
            let _ = deaths.send(WorkerDeath { worker_id, reason });
        }));
        Ok(worker)
    }

    /// Next live worker, round-robin
    pub fn pick(&self) -> Result<Arc<dyn EngineWorker>> {
        let workers = self.workers.read();
        for _ in 0..workers.len() {
            let index = self.next.fetch_add(1, Ordering::Relaxed) % workers.len();
            let worker = &workers[index];
            if worker.is_alive() {
                return Ok(Arc::clone(worker));
            }
        }
        Err(SfuError::EngineFatal("no live media worker".to_string()))
    }

    /// Swap a dead worker for a fresh one
    pub async fn replace(&self, dead: &WorkerId) -> Result<WorkerId> {
        let worker = self.spawn_worker().await?;
        let worker_id = worker.id().clone();
        let mut workers = self.workers.write();
        match workers.iter().position(|w| w.id() == dead) {
            Some(index) => workers[index] = worker,
            None => workers.push(worker),
        }
        info!(dead_worker_id = %dead, worker_id = %worker_id, "Media worker replaced");
        Ok(worker_id)
    }

    /// Death notifications; only the first caller gets the receiver
    pub fn take_deaths(&self) -> Option<mpsc::UnboundedReceiver<WorkerDeath>> {
        self.deaths_rx.lock().take()
    }

    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.workers.read().iter().map(|w| w.id().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.workers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.read().is_empty()
    }

    pub fn alive_count(&self) -> usize {
        self.workers.read().iter().filter(|w| w.is_alive()).count()
    }

    pub fn close(&self) {
        for worker in self.workers.write().drain(..) {
            worker.close();
        }
    }
}
