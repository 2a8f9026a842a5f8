//! Room registry - top-level orchestration for multi-room routing
//!
//! This module provides:
//! - Race-free lazy room creation (one router per room id)
//! - Resource limit enforcement
//! - Empty-room policy and the background sweep
//! - Worker death supervision

use crate::config::{EmptyRoomPolicy, SfuConfig};
use crate::error::{Result, SfuError};
use crate::events::PeerEventSender;
use crate::room::{Room, RoomStats};
use crate::types::{PeerId, RoomId, WorkerId};
use crate::worker_pool::WorkerPool;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Aggregate statistics across all rooms
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RegistryStats {
    pub active_rooms: usize,
    pub total_peers: usize,
    pub total_transports: usize,
    pub total_producers: usize,
    pub total_consumers: usize,
    pub workers: usize,
    pub routers_created: u64,
}

type RoomSlot = Arc<OnceCell<Arc<Room>>>;

pub struct RoomRegistry {
    /// Configuration
    config: Arc<SfuConfig>,

    pool: Arc<WorkerPool>,

    /// One slot per room id; the slot's `OnceCell` is the only place a router
    /// for that id gets created
    rooms: DashMap<RoomId, RoomSlot>,

    routers_created: AtomicU64,
}

impl RoomRegistry {
    pub fn new(config: Arc<SfuConfig>, pool: Arc<WorkerPool>) -> Arc<Self> {
        let registry = Arc::new(Self {
            config,
            pool,
            rooms: DashMap::new(),
            routers_created: AtomicU64::new(0),
        });

        info!(
            max_rooms = registry.config.max_rooms,
            max_peers_per_room = registry.config.max_peers_per_room,
            empty_room_policy = ?registry.config.empty_room_policy,
            "Room registry initialized"
        );
        registry
    }

    pub fn config(&self) -> &Arc<SfuConfig> {
        &self.config
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Get or lazily create a room. Concurrent callers for the same id share
    /// one creation and see the same router.
    pub async fn get_or_create(&self, room_id: &RoomId) -> Result<Arc<Room>> {
        loop {
            let max = self.config.max_rooms;
            if max > 0 && !self.rooms.contains_key(room_id) && self.rooms.len() >= max {
                warn!(
                    current_rooms = self.rooms.len(),
                    max_rooms = max,
                    "Room limit reached"
                );
                return Err(SfuError::ResourceExhausted(format!(
                    "maximum number of rooms ({max}) reached"
                )));
            }

            let slot = Arc::clone(
                self.rooms
                    .entry(room_id.clone())
                    .or_insert_with(|| Arc::new(OnceCell::new()))
                    .value(),
            );

            match slot.get_or_try_init(|| self.create_room(room_id)).await {
                Ok(room) if room.is_closed() => {
                    // closed between lookup and use; drop the stale slot and retry
                    self.discard(room);
                }
                Ok(room) => return Ok(Arc::clone(room)),
                Err(err) => {
                    self.rooms.remove_if(room_id, |_, existing| {
                        Arc::ptr_eq(existing, &slot) && existing.get().is_none()
                    });
                    return Err(err);
                }
            }
        }
    }

    async fn create_room(&self, room_id: &RoomId) -> Result<Arc<Room>> {
        let worker = self.pool.pick()?;
        let router = worker.create_router(&self.config.media_codecs).await?;
        self.routers_created.fetch_add(1, Ordering::Relaxed);

        let room = Room::new(
            room_id.clone(),
            worker.id().clone(),
            router,
            Arc::clone(&self.config),
        );
        info!(
            room_id = %room_id,
            worker_id = %room.worker_id(),
            router_id = %room.router_id(),
            "Created new room"
        );
        Ok(room)
    }

    /// Add a peer to a room, creating the room on first join
    pub async fn join(
        &self,
        room_id: &RoomId,
        peer_id: &PeerId,
        events: PeerEventSender,
    ) -> Result<Arc<Room>> {
        loop {
            let room = self.get_or_create(room_id).await?;
            if room.add_peer(peer_id, events.clone())? {
                info!(
                    room_id = %room_id,
                    peer_id = %peer_id,
                    peer_count = room.peer_count(),
                    "Added peer to room"
                );
                return Ok(room);
            }
            self.discard(&room);
        }
    }

    /// Remove a peer (and everything it owns) and apply the empty-room policy
    pub fn leave(&self, room: &Arc<Room>, peer_id: &PeerId) {
        let empty = room.remove_peer(peer_id);
        info!(room_id = %room.id(), peer_id = %peer_id, "Removed peer from room");

        if empty && self.config.empty_room_policy == EmptyRoomPolicy::Close && room.close_if_empty() {
            self.discard(room);
            debug!(room_id = %room.id(), "Closed empty room");
        }
    }

    /// Drop the registry slot if it still holds this room
    fn discard(&self, room: &Arc<Room>) {
        self.rooms.remove_if(room.id(), |_, slot| {
            slot.get().is_some_and(|existing| Arc::ptr_eq(existing, room))
        });
    }

    /// Existing, open room
    pub fn get(&self, room_id: &RoomId) -> Option<Arc<Room>> {
        self.rooms
            .get(room_id)
            .and_then(|slot| slot.get().cloned())
            .filter(|room| !room.is_closed())
    }

    fn rooms(&self) -> Vec<Arc<Room>> {
        self.rooms
            .iter()
            .filter_map(|entry| entry.value().get().cloned())
            .collect()
    }

    /// Get list of all active room IDs
    pub fn room_ids(&self) -> Vec<RoomId> {
        let mut ids: Vec<_> = self.rooms().iter().map(|room| room.id().clone()).collect();
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        ids
    }

    /// Get number of active rooms
    pub fn room_count(&self) -> usize {
        self.rooms().len()
    }

    pub fn room_stats(&self, room_id: &RoomId) -> Option<RoomStats> {
        self.get(room_id).map(|room| room.stats())
    }

    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            workers: self.pool.alive_count(),
            routers_created: self.routers_created(),
            ..Default::default()
        };
        for room in self.rooms() {
            let room_stats = room.stats();
            stats.active_rooms += 1;
            stats.total_peers += room_stats.peer_count;
            stats.total_transports += room_stats.transport_count;
            stats.total_producers += room_stats.producer_count;
            stats.total_consumers += room_stats.consumer_count;
        }
        stats
    }

    /// Routers created since startup
    pub fn routers_created(&self) -> u64 {
        self.routers_created.load(Ordering::Relaxed)
    }

    /// Tear down every room hosted on a dead worker; returns how many
    pub fn invalidate_worker(&self, worker_id: &WorkerId, reason: &str) -> usize {
        let affected: Vec<_> = self
            .rooms()
            .into_iter()
            .filter(|room| room.worker_id() == worker_id)
            .collect();

        for room in &affected {
            room.invalidate(reason);
            self.discard(room);
        }

        if !affected.is_empty() {
            warn!(
                worker_id = %worker_id,
                rooms = affected.len(),
                reason = %reason,
                "Invalidated rooms of dead worker"
            );
        }
        affected.len()
    }

    /// Close rooms that stayed empty past `empty_room_ttl_secs`
    pub fn sweep_empty_rooms(&self) -> usize {
        let ttl = Duration::from_secs(self.config.empty_room_ttl_secs);
        let mut removed_count = 0;

        for room in self.rooms() {
            let expired = room.empty_for().is_some_and(|empty_for| empty_for >= ttl);
            if expired && room.close_if_empty() {
                self.discard(&room);
                removed_count += 1;
                debug!(room_id = %room.id(), "Removed empty room");
            }
        }

        if removed_count > 0 {
            info!(
                removed_count,
                remaining_rooms = self.rooms.len(),
                "Cleaned up empty rooms"
            );
        }
        removed_count
    }

    /// Background task for periodic cleanup
    pub fn spawn_cleanup_task(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        let period = Duration::from_secs(self.config.empty_room_ttl_secs.clamp(1, 60));

        tokio::spawn(async move {
            let mut ticker = interval(period);
            info!(interval_secs = period.as_secs(), "Starting room cleanup task");

            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(registry) = registry.upgrade() else { break };
                        registry.sweep_empty_rooms();
                    }
                }
            }
            debug!("Room cleanup task stopped");
        })
    }

    /// Watch for worker deaths: invalidate the worker's rooms and replace it.
    /// If no replacement can be started the whole process is shut down after
    /// the configured grace period. Returns `None` when the death channel was
    /// already taken.
    pub fn spawn_worker_supervisor(
        self: &Arc<Self>,
        shutdown: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        let mut deaths = self.pool.take_deaths()?;
        let registry: Weak<Self> = Arc::downgrade(self);
        let grace = Duration::from_secs(self.config.worker_death_grace_secs);

        Some(tokio::spawn(async move {
            loop {
                let death = tokio::select! {
                    () = shutdown.cancelled() => break,
                    death = deaths.recv() => match death {
                        Some(death) => death,
                        None => break,
                    },
                };
                let Some(registry) = registry.upgrade() else { break };

                registry.invalidate_worker(&death.worker_id, &death.reason);
                if let Err(e) = registry.pool.replace(&death.worker_id).await {
                    error!(
                        worker_id = %death.worker_id,
                        error = %e,
                        grace_secs = grace.as_secs(),
                        "Failed to replace media worker, shutting down"
                    );
                    tokio::time::sleep(grace).await;
                    shutdown.cancel();
                    break;
                }
            }
            debug!("Worker supervisor stopped");
        }))
    }

    /// Close every room and the worker pool
    pub fn close_all(&self) {
        let rooms = self.rooms();
        self.rooms.clear();
        for room in &rooms {
            room.close();
        }
        self.pool.close();
        info!(rooms = rooms.len(), "Closed all rooms");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::LocalEngine;
    use crate::events::PeerEvent;
    use futures::future::join_all;
    use tokio::sync::mpsc;

    async fn registry_with(config: SfuConfig) -> (Arc<LocalEngine>, Arc<RoomRegistry>) {
        let engine = Arc::new(LocalEngine::new());
        let pool = WorkerPool::start(engine.clone(), &config).await.unwrap();
        (engine, RoomRegistry::new(Arc::new(config), pool))
    }

    fn config() -> SfuConfig {
        SfuConfig {
            num_workers: 2,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_room_lifecycle() {
        let (_engine, registry) = registry_with(config()).await;
        assert_eq!(registry.room_count(), 0);

        let room_id = RoomId::from("test-room");
        let room = registry.get_or_create(&room_id).await.unwrap();
        assert_eq!(registry.room_count(), 1);

        // Getting the same room should return the existing one
        let room2 = registry.get_or_create(&room_id).await.unwrap();
        assert_eq!(registry.room_count(), 1);
        assert!(Arc::ptr_eq(&room, &room2));
        assert_eq!(registry.routers_created(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_create_makes_one_router() {
        let (_engine, registry) = registry_with(config()).await;
        let room_id = RoomId::from("hot");

        let rooms = join_all((0..32).map(|_| registry.get_or_create(&room_id))).await;

        let first = rooms[0].as_ref().unwrap();
        for room in &rooms {
            let room = room.as_ref().unwrap();
            assert!(Arc::ptr_eq(room, first));
            assert_eq!(room.router_id(), first.router_id());
        }
        assert_eq!(registry.routers_created(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_create_across_tasks() {
        let (_engine, registry) = registry_with(config()).await;
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    registry
                        .get_or_create(&RoomId::from("shared"))
                        .await
                        .unwrap()
                        .router_id()
                        .clone()
                })
            })
            .collect();

        let ids: Vec<_> = join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(registry.routers_created(), 1);
    }

    #[tokio::test]
    async fn test_room_limit() {
        let (_engine, registry) = registry_with(SfuConfig {
            max_rooms: 2,
            ..config()
        })
        .await;

        // Create rooms up to limit
        registry.get_or_create(&RoomId::from("room1")).await.unwrap();
        registry.get_or_create(&RoomId::from("room2")).await.unwrap();

        // Creating one more should fail
        let result = registry.get_or_create(&RoomId::from("room3")).await;
        assert!(matches!(result, Err(SfuError::ResourceExhausted(_))));
        // existing rooms are still reachable
        assert!(registry.get_or_create(&RoomId::from("room1")).await.is_ok());
    }

    #[tokio::test]
    async fn test_peer_limit() {
        let (_engine, registry) = registry_with(SfuConfig {
            max_peers_per_room: 2,
            ..config()
        })
        .await;
        let room_id = RoomId::from("test-room");
        let (tx, _rx) = mpsc::unbounded_channel();

        registry.join(&room_id, &PeerId::from("peer1"), tx.clone()).await.unwrap();
        registry.join(&room_id, &PeerId::from("peer2"), tx.clone()).await.unwrap();

        let result = registry.join(&room_id, &PeerId::from("peer3"), tx).await;
        assert!(matches!(result, Err(SfuError::ResourceExhausted(_))));
    }

    #[tokio::test]
    async fn test_close_policy_removes_empty_room() {
        let (_engine, registry) = registry_with(config()).await;
        let room_id = RoomId::from("r");
        let (tx, _rx) = mpsc::unbounded_channel();
        let peer = PeerId::from("a");

        let room = registry.join(&room_id, &peer, tx.clone()).await.unwrap();
        registry.leave(&room, &peer);

        assert!(room.is_closed());
        assert!(registry.get(&room_id).is_none());

        // rejoining builds a fresh room with a new router
        let again = registry.join(&room_id, &peer, tx).await.unwrap();
        assert!(!Arc::ptr_eq(&room, &again));
        assert_eq!(registry.routers_created(), 2);
    }

    #[tokio::test]
    async fn test_keep_policy_sweeps_after_ttl() {
        let (_engine, registry) = registry_with(SfuConfig {
            empty_room_policy: EmptyRoomPolicy::Keep,
            empty_room_ttl_secs: 0,
            ..config()
        })
        .await;
        let room_id = RoomId::from("r");
        let (tx, _rx) = mpsc::unbounded_channel();
        let peer = PeerId::from("a");

        let room = registry.join(&room_id, &peer, tx).await.unwrap();
        assert_eq!(registry.sweep_empty_rooms(), 0);

        registry.leave(&room, &peer);
        assert!(!room.is_closed());
        assert!(registry.get(&room_id).is_some());

        assert_eq!(registry.sweep_empty_rooms(), 1);
        assert!(room.is_closed());
        assert_eq!(registry.room_count(), 0);
    }

    #[tokio::test]
    async fn test_worker_death_invalidates_rooms_and_replaces_worker() {
        let (engine, registry) = registry_with(SfuConfig {
            num_workers: 1,
            ..Default::default()
        })
        .await;
        let shutdown = CancellationToken::new();
        let supervisor = registry.spawn_worker_supervisor(shutdown.clone()).unwrap();

        let room_id = RoomId::from("r");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let room = registry.join(&room_id, &PeerId::from("a"), tx).await.unwrap();
        let dead_worker = room.worker_id().clone();

        engine.workers()[0].kill("crashed");

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, PeerEvent::RejoinRequired { .. }));
        assert!(room.is_closed());
        assert!(room.invalidation_reason().is_some());

        // wait for the replacement worker
        for _ in 0..100 {
            if registry.pool().alive_count() == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(registry.pool().alive_count(), 1);
        assert!(!registry.pool().worker_ids().contains(&dead_worker));

        let (tx, _rx) = mpsc::unbounded_channel();
        let fresh = registry.join(&room_id, &PeerId::from("a"), tx).await.unwrap();
        assert_ne!(fresh.worker_id(), &dead_worker);
        assert!(!shutdown.is_cancelled());

        shutdown.cancel();
        supervisor.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_all() {
        let (_engine, registry) = registry_with(config()).await;
        let a = registry.get_or_create(&RoomId::from("a")).await.unwrap();
        let b = registry.get_or_create(&RoomId::from("b")).await.unwrap();
        assert_eq!(registry.room_ids(), vec![RoomId::from("a"), RoomId::from("b")]);

        registry.close_all();
        assert!(a.is_closed());
        assert!(b.is_closed());
        assert_eq!(registry.room_count(), 0);
        assert_eq!(registry.pool().alive_count(), 0);
    }
}
