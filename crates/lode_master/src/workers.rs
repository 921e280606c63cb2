//! Worker (tablet server) directory, proxies, and replica placement.
//!
//! The master does not detect worker liveness itself; the embedding server
//! registers workers here from its heartbeat path, and the catalog consumes
//! snapshots of the live set. Each descriptor tracks placement load: the
//! number of live replicas last reported plus a decaying count of recent
//! replica creations, so batched placements see their own pressure before
//! any worker reports back.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use crate::consensus::RaftConfig;
use crate::partition::Partition;
use crate::schema::Schema;
use crate::state::{TableId, TabletId};

/// Half-life of the recent-replica-creation counter.
const CREATIONS_DECAY_HALF_LIFE: Duration = Duration::from_secs(60);

/// Error codes a worker may attach to an admin or consensus RPC response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerErrorCode {
    Unknown,
    TabletNotFound,
    CasFailed,
    MismatchedSchema,
    TabletHasNewerSchema,
    AlreadyPresent,
}

#[derive(Clone, Debug, Error, Serialize, Deserialize)]
#[error("{code:?}: {message}")]
pub struct WorkerError {
    pub code: WorkerErrorCode,
    pub message: String,
}

impl WorkerError {
    pub fn new(code: WorkerErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

/// Response to any worker admin/consensus RPC: success, or a coded error.
#[derive(Clone, Debug, Default)]
pub struct WorkerResponse {
    pub error: Option<WorkerError>,
}

impl WorkerResponse {
    pub fn ok() -> Self {
        Self { error: None }
    }

    pub fn err(code: WorkerErrorCode, message: impl Into<String>) -> Self {
        Self { error: Some(WorkerError::new(code, message)) }
    }
}

/// Transport-level RPC failure; always retried by the task engine.
#[derive(Clone, Debug, Error)]
#[error("rpc transport error: {0}")]
pub struct RpcError(pub String);

/// Data-state a replica's storage can be in, also used as the delete mode:
/// tombstoning wipes data but keeps the record for CAS ordering, deletion
/// removes everything.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaDataState {
    Copying,
    Ready,
    Tombstoned,
    Deleted,
}

#[derive(Clone, Debug)]
pub struct CreateTabletRequest {
    pub dest_uuid: String,
    pub table_id: TableId,
    pub tablet_id: TabletId,
    pub partition: Partition,
    pub table_name: String,
    pub schema: Schema,
    pub partition_schema: crate::partition::PartitionSchema,
    pub committed_config: RaftConfig,
}

#[derive(Clone, Debug)]
pub struct DeleteTabletRequest {
    pub dest_uuid: String,
    pub tablet_id: TabletId,
    pub delete_type: ReplicaDataState,
    /// Only delete if the replica's committed config opid index is at most
    /// this value.
    pub cas_config_opid_index: Option<i64>,
    pub reason: String,
}

#[derive(Clone, Debug)]
pub struct AlterSchemaRequest {
    pub dest_uuid: String,
    pub tablet_id: TabletId,
    pub new_table_name: String,
    pub schema_version: u32,
    pub schema: Schema,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeConfigType {
    AddPeer,
    RemovePeer,
}

#[derive(Clone, Debug)]
pub struct ChangeConfigRequest {
    pub dest_uuid: String,
    pub tablet_id: TabletId,
    pub change_type: ChangeConfigType,
    pub cas_config_opid_index: i64,
    pub peer: crate::consensus::RaftPeer,
}

/// Transport seam to one worker's admin and consensus services.
#[async_trait]
pub trait WorkerProxy: Send + Sync {
    async fn create_tablet(&self, req: CreateTabletRequest) -> Result<WorkerResponse, RpcError>;
    async fn delete_tablet(&self, req: DeleteTabletRequest) -> Result<WorkerResponse, RpcError>;
    async fn alter_schema(&self, req: AlterSchemaRequest) -> Result<WorkerResponse, RpcError>;
    async fn change_config(&self, req: ChangeConfigRequest) -> Result<WorkerResponse, RpcError>;
}

struct RecentCreations {
    value: f64,
    last_update: Instant,
}

impl RecentCreations {
    fn decay(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_update);
        if elapsed > Duration::ZERO {
            let halves = elapsed.as_secs_f64() / CREATIONS_DECAY_HALF_LIFE.as_secs_f64();
            self.value *= 0.5f64.powf(halves);
            self.last_update = now;
        }
    }
}

/// One registered worker.
pub struct WorkerDescriptor {
    uuid: String,
    addr: String,
    proxy: Arc<dyn WorkerProxy>,
    num_live_replicas: AtomicUsize,
    recent_creations: Mutex<RecentCreations>,
}

impl WorkerDescriptor {
    pub fn new(uuid: impl Into<String>, addr: impl Into<String>, proxy: Arc<dyn WorkerProxy>) -> Arc<Self> {
        Arc::new(Self {
            uuid: uuid.into(),
            addr: addr.into(),
            proxy,
            num_live_replicas: AtomicUsize::new(0),
            recent_creations: Mutex::new(RecentCreations {
                value: 0.0,
                last_update: Instant::now(),
            }),
        })
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn proxy(&self) -> Arc<dyn WorkerProxy> {
        Arc::clone(&self.proxy)
    }

    /// Updated by the embedding server from worker heartbeats.
    pub fn set_num_live_replicas(&self, count: usize) {
        self.num_live_replicas.store(count, Ordering::Relaxed);
    }

    pub fn num_live_replicas(&self) -> usize {
        self.num_live_replicas.load(Ordering::Relaxed)
    }

    /// Count a replica placement on this worker so subsequent placements in
    /// the same batch see the elevated load.
    pub fn increment_recent_replica_creations(&self) {
        let mut recent = self.recent_creations.lock().unwrap();
        recent.decay(Instant::now());
        recent.value += 1.0;
    }

    pub fn recent_replica_creations(&self) -> f64 {
        let mut recent = self.recent_creations.lock().unwrap();
        recent.decay(Instant::now());
        recent.value
    }

    /// Placement load: recent creations plus live replicas.
    pub fn replica_load(&self) -> f64 {
        self.recent_replica_creations() + self.num_live_replicas() as f64
    }
}

/// Registry of known workers, fed externally; the catalog treats the
/// registered set as the live set.
#[derive(Default)]
pub struct WorkerManager {
    workers: RwLock<HashMap<String, Arc<WorkerDescriptor>>>,
}

impl WorkerManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, worker: Arc<WorkerDescriptor>) {
        self.workers
            .write()
            .unwrap()
            .insert(worker.uuid().to_string(), worker);
    }

    pub fn unregister(&self, uuid: &str) {
        self.workers.write().unwrap().remove(uuid);
    }

    pub fn lookup(&self, uuid: &str) -> Option<Arc<WorkerDescriptor>> {
        self.workers.read().unwrap().get(uuid).cloned()
    }

    /// Snapshot of the live workers.
    pub fn live_workers(&self) -> Vec<Arc<WorkerDescriptor>> {
        self.workers.read().unwrap().values().cloned().collect()
    }

    pub fn num_registered(&self) -> usize {
        self.workers.read().unwrap().len()
    }
}

/// Of exactly two candidates, pick the one with less placement load; ties
/// break randomly.
fn pick_less_loaded(
    a: Arc<WorkerDescriptor>,
    b: Arc<WorkerDescriptor>,
    rng: &mut impl Rng,
) -> Arc<WorkerDescriptor> {
    let load_a = a.replica_load();
    let load_b = b.replica_load();
    if load_a < load_b {
        a
    } else if load_b < load_a {
        b
    } else if rng.gen_bool(0.5) {
        a
    } else {
        b
    }
}

/// Power-of-two-choices replica selection: sample two workers uniformly at
/// random (excluding `excluded`) and keep the less loaded one. Returns
/// `None` when every candidate is excluded.
pub fn select_replica(
    candidates: &[Arc<WorkerDescriptor>],
    excluded: &HashSet<String>,
    rng: &mut impl Rng,
) -> Option<Arc<WorkerDescriptor>> {
    let mut eligible: Vec<&Arc<WorkerDescriptor>> = candidates
        .iter()
        .filter(|w| !excluded.contains(w.uuid()))
        .collect();
    match eligible.len() {
        0 => None,
        1 => Some(Arc::clone(eligible[0])),
        _ => {
            eligible.shuffle(rng);
            Some(pick_less_loaded(
                Arc::clone(eligible[0]),
                Arc::clone(eligible[1]),
                rng,
            ))
        }
    }
}
