//! Retrying master->worker task engine and the concrete task kinds.
//!
//! A task re-resolves its target worker before every attempt (so leader
//! moves are absorbed), sends one RPC with a per-attempt timeout, and backs
//! off exponentially with jitter until it completes, fails its wall-clock
//! deadline, or is aborted. Each task unregisters from its table's pending
//! set exactly once, after its loop exits; a task without a table keeps
//! itself alive through the spawned future alone.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::MasterConfig;
use crate::consensus::{ConsensusState, MemberType, RaftPeer};
use crate::state::{TableInfo, TabletId, TabletInfo};
use crate::workers::{
    AlterSchemaRequest, ChangeConfigRequest, ChangeConfigType, CreateTabletRequest,
    DeleteTabletRequest, ReplicaDataState, RpcError, WorkerDescriptor, WorkerErrorCode,
    WorkerManager, WorkerResponse,
};

/// Lifecycle of a task. Transitions only leave `Running`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Complete,
    Aborted,
    Failed,
}

/// Atomic task state word. All other task fields are written before a state
/// transition and read only afterward.
pub struct TaskStateCell(AtomicU8);

impl TaskStateCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(TaskState::Running as u8))
    }

    pub fn get(&self) -> TaskState {
        match self.0.load(Ordering::Acquire) {
            0 => TaskState::Running,
            1 => TaskState::Complete,
            2 => TaskState::Aborted,
            _ => TaskState::Failed,
        }
    }

    fn transition(&self, to: TaskState) {
        let _ = self.0.compare_exchange(
            TaskState::Running as u8,
            to as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub fn mark_complete(&self) {
        self.transition(TaskState::Complete);
    }

    pub fn mark_aborted(&self) {
        self.transition(TaskState::Aborted);
    }

    pub fn mark_failed(&self) {
        self.transition(TaskState::Failed);
    }
}

impl Default for TaskStateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared handle to a spawned task, held in its table's pending set.
#[derive(Clone)]
pub struct TaskHandle {
    id: u64,
    state: Arc<TaskStateCell>,
    cancel: CancellationToken,
    description: Arc<String>,
}

impl TaskHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> TaskState {
        self.state.get()
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Abort the task. Its next scheduled step observes the abort and the
    /// task unregisters itself.
    pub fn abort(&self) {
        self.state.mark_aborted();
        self.cancel.cancel();
    }
}

/// Strategy for choosing the worker an attempt is sent to.
pub enum ReplicaPicker {
    /// Always the same worker.
    Fixed(String),
    /// The current leader of the tablet, re-read from the tablet's
    /// consensus state on every attempt.
    TabletLeader(Arc<TabletInfo>),
}

impl ReplicaPicker {
    fn pick(&self) -> Result<String> {
        match self {
            ReplicaPicker::Fixed(uuid) => Ok(uuid.clone()),
            ReplicaPicker::TabletLeader(tablet) => {
                let record = tablet.read();
                let Some(cstate) = &record.consensus else {
                    bail!("tablet {} has no consensus state", tablet.id());
                };
                match &cstate.leader_uuid {
                    Some(uuid) => Ok(uuid.clone()),
                    None => bail!("tablet {} consensus state has no leader", tablet.id()),
                }
            }
        }
    }
}

/// Shared collaborators every task needs.
#[derive(Clone)]
pub struct TaskContext {
    pub workers: Arc<WorkerManager>,
    pub config: Arc<MasterConfig>,
}

/// Result of one send attempt.
pub enum SendOutcome {
    Sent(Result<WorkerResponse, RpcError>),
    /// No RPC was issued this attempt (no candidate target, task
    /// superseded, ...). The engine falls through to the retry decision.
    Skipped,
}

/// One kind of retrying remote task.
#[async_trait]
pub trait TaskSpec: Send + Sync + 'static {
    fn type_name(&self) -> &'static str;
    fn tablet_id(&self) -> &str;
    fn description(&self) -> String;
    fn table(&self) -> Option<Arc<TableInfo>>;
    fn picker(&self) -> &ReplicaPicker;

    /// Wall-clock deadline for the whole task; `None` never times out.
    fn deadline(&self, config: &MasterConfig) -> Option<Duration> {
        Some(config.unresponsive_worker_timeout)
    }

    /// Issue one RPC attempt against `target`.
    async fn send_request(
        &self,
        ctx: &TaskContext,
        target: &Arc<WorkerDescriptor>,
        attempt: u32,
        state: &TaskStateCell,
    ) -> SendOutcome;

    /// Interpret a worker response, transitioning `state` out of `Running`
    /// to stop retrying. Must not block.
    fn handle_response(
        &self,
        response: &WorkerResponse,
        target: &Arc<WorkerDescriptor>,
        attempt: u32,
        state: &TaskStateCell,
    );
}

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Register (if the task has a table) and spawn a task.
pub fn spawn_task(spec: Arc<dyn TaskSpec>, ctx: TaskContext) -> TaskHandle {
    let handle = TaskHandle {
        id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
        state: Arc::new(TaskStateCell::new()),
        cancel: CancellationToken::new(),
        description: Arc::new(spec.description()),
    };
    if let Some(table) = spec.table() {
        table.add_task(handle.clone());
    }
    tokio::spawn(run_task(spec, ctx, handle.clone()));
    handle
}

fn resolve_target(spec: &dyn TaskSpec, ctx: &TaskContext) -> Result<Arc<WorkerDescriptor>> {
    let uuid = spec.picker().pick()?;
    ctx.workers
        .lookup(&uuid)
        .ok_or_else(|| anyhow!("could not find worker for UUID {uuid}"))
}

fn backoff_base_ms(attempt: u32) -> u64 {
    // First retry is delayed 2^4 ms, the second 2^5, capped at one minute.
    if attempt <= 12 {
        1u64 << (attempt + 3)
    } else {
        60_000
    }
}

/// Delay before the next attempt, or `None` when fewer than 10ms remain to
/// the deadline.
fn backoff_delay(attempt: u32, deadline: Option<Instant>) -> Option<Duration> {
    let delay_ms = backoff_base_ms(attempt) + rand::thread_rng().gen_range(0..50);
    match deadline {
        None => Some(Duration::from_millis(delay_ms)),
        Some(deadline) => {
            let remaining_ms =
                deadline.saturating_duration_since(Instant::now()).as_millis() as u64;
            let usable_ms = remaining_ms.saturating_sub(10);
            if usable_ms == 0 {
                None
            } else {
                Some(Duration::from_millis(delay_ms.min(usable_ms)))
            }
        }
    }
}

async fn run_task(spec: Arc<dyn TaskSpec>, ctx: TaskContext, handle: TaskHandle) {
    let deadline = spec.deadline(&ctx.config).map(|d| Instant::now() + d);
    let state = &*handle.state;
    let mut attempt: u32 = 0;

    loop {
        if state.get() != TaskState::Running {
            break;
        }
        attempt += 1;

        match resolve_target(spec.as_ref(), &ctx) {
            Ok(target) => {
                let per_attempt = match deadline {
                    Some(d) => d
                        .saturating_duration_since(Instant::now())
                        .min(ctx.config.worker_rpc_timeout),
                    None => ctx.config.worker_rpc_timeout,
                };
                let send = spec.send_request(&ctx, &target, attempt, state);
                let result = tokio::select! {
                    _ = handle.cancel.cancelled() => None,
                    res = tokio::time::timeout(per_attempt, send) => Some(res),
                };
                let Some(result) = result else {
                    break;
                };
                match result {
                    Err(_) => {
                        tracing::warn!(
                            task = %handle.description(),
                            attempt,
                            "worker RPC attempt timed out"
                        );
                    }
                    Ok(SendOutcome::Skipped) => {}
                    Ok(SendOutcome::Sent(Err(err))) => {
                        tracing::warn!(
                            task = %handle.description(),
                            attempt,
                            error = %err,
                            "worker RPC failed"
                        );
                    }
                    Ok(SendOutcome::Sent(Ok(response))) => {
                        spec.handle_response(&response, &target, attempt, state);
                    }
                }
            }
            Err(err) => {
                tracing::debug!(
                    task = %handle.description(),
                    attempt,
                    error = %err,
                    "could not resolve target worker"
                );
            }
        }

        if state.get() != TaskState::Running {
            break;
        }
        match backoff_delay(attempt, deadline) {
            None => {
                tracing::warn!(task = %handle.description(), "request timed out");
                state.mark_failed();
                break;
            }
            Some(delay) => {
                tracing::debug!(
                    task = %handle.description(),
                    delay_ms = delay.as_millis() as u64,
                    attempt,
                    "scheduling retry"
                );
                tokio::select! {
                    _ = handle.cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    // Unregister exactly once.
    if let Some(table) = spec.table() {
        table.remove_task(handle.id());
    }
    tracing::debug!(
        task = %handle.description(),
        state = ?state.get(),
        attempts = attempt,
        "task finished"
    );
}

/// Sends the full tablet-create payload to one worker. A worker that
/// already has the tablet counts as success.
pub struct CreateReplicaTask {
    picker: ReplicaPicker,
    table: Arc<TableInfo>,
    tablet_id: TabletId,
    dest_uuid: String,
    req: CreateTabletRequest,
}

impl CreateReplicaTask {
    /// `record` is the tablet's committed record; its consensus state must
    /// already carry the initial committed config.
    pub fn new(
        table: Arc<TableInfo>,
        tablet_id: TabletId,
        record: &crate::state::PersistedTablet,
        dest_uuid: String,
    ) -> Self {
        let table_record = table.read();
        let req = CreateTabletRequest {
            dest_uuid: dest_uuid.clone(),
            table_id: table.id().to_string(),
            tablet_id: tablet_id.clone(),
            partition: record.partition.clone(),
            table_name: table_record.name.clone(),
            schema: table_record.schema.clone(),
            partition_schema: table_record.partition_schema.clone(),
            committed_config: record
                .consensus
                .as_ref()
                .map(|c| c.committed_config.clone())
                .unwrap_or_default(),
        };
        drop(table_record);
        Self {
            picker: ReplicaPicker::Fixed(dest_uuid.clone()),
            table,
            tablet_id,
            dest_uuid,
            req,
        }
    }
}

#[async_trait]
impl TaskSpec for CreateReplicaTask {
    fn type_name(&self) -> &'static str {
        "Create Tablet"
    }

    fn tablet_id(&self) -> &str {
        &self.tablet_id
    }

    fn description(&self) -> String {
        format!("CreateTablet RPC for tablet {} on worker {}", self.tablet_id, self.dest_uuid)
    }

    fn table(&self) -> Option<Arc<TableInfo>> {
        Some(Arc::clone(&self.table))
    }

    fn picker(&self) -> &ReplicaPicker {
        &self.picker
    }

    fn deadline(&self, config: &MasterConfig) -> Option<Duration> {
        Some(config.tablet_creation_timeout)
    }

    async fn send_request(
        &self,
        _ctx: &TaskContext,
        target: &Arc<WorkerDescriptor>,
        _attempt: u32,
        _state: &TaskStateCell,
    ) -> SendOutcome {
        SendOutcome::Sent(target.proxy().create_tablet(self.req.clone()).await)
    }

    fn handle_response(
        &self,
        response: &WorkerResponse,
        target: &Arc<WorkerDescriptor>,
        _attempt: u32,
        state: &TaskStateCell,
    ) {
        match &response.error {
            None => state.mark_complete(),
            Some(err) if err.code == WorkerErrorCode::AlreadyPresent => {
                tracing::info!(
                    tablet_id = %self.tablet_id,
                    worker = target.uuid(),
                    "create returned already present; treating as success"
                );
                state.mark_complete();
            }
            Some(err) => {
                tracing::warn!(
                    tablet_id = %self.tablet_id,
                    worker = target.uuid(),
                    error = %err,
                    "create tablet failed"
                );
            }
        }
    }
}

/// Deletes or tombstones one replica on a specific worker.
pub struct DeleteReplicaTask {
    picker: ReplicaPicker,
    table: Option<Arc<TableInfo>>,
    tablet_id: TabletId,
    dest_uuid: String,
    delete_type: ReplicaDataState,
    cas_config_opid_index: Option<i64>,
    reason: String,
}

impl DeleteReplicaTask {
    pub fn new(
        table: Option<Arc<TableInfo>>,
        tablet_id: TabletId,
        dest_uuid: String,
        delete_type: ReplicaDataState,
        cas_config_opid_index: Option<i64>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            picker: ReplicaPicker::Fixed(dest_uuid.clone()),
            table,
            tablet_id,
            dest_uuid,
            delete_type,
            cas_config_opid_index,
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl TaskSpec for DeleteReplicaTask {
    fn type_name(&self) -> &'static str {
        "Delete Tablet"
    }

    fn tablet_id(&self) -> &str {
        &self.tablet_id
    }

    fn description(&self) -> String {
        format!("DeleteTablet RPC for tablet {} on worker {}", self.tablet_id, self.dest_uuid)
    }

    fn table(&self) -> Option<Arc<TableInfo>> {
        self.table.clone()
    }

    fn picker(&self) -> &ReplicaPicker {
        &self.picker
    }

    async fn send_request(
        &self,
        _ctx: &TaskContext,
        target: &Arc<WorkerDescriptor>,
        _attempt: u32,
        _state: &TaskStateCell,
    ) -> SendOutcome {
        let req = DeleteTabletRequest {
            dest_uuid: self.dest_uuid.clone(),
            tablet_id: self.tablet_id.clone(),
            delete_type: self.delete_type,
            cas_config_opid_index: self.cas_config_opid_index,
            reason: self.reason.clone(),
        };
        tracing::info!(
            tablet_id = %self.tablet_id,
            worker = target.uuid(),
            delete_type = ?self.delete_type,
            reason = %self.reason,
            "sending DeleteTablet"
        );
        SendOutcome::Sent(target.proxy().delete_tablet(req).await)
    }

    fn handle_response(
        &self,
        response: &WorkerResponse,
        target: &Arc<WorkerDescriptor>,
        _attempt: u32,
        state: &TaskStateCell,
    ) {
        match &response.error {
            None => {
                if self.table.is_some() {
                    tracing::info!(
                        tablet_id = %self.tablet_id,
                        worker = target.uuid(),
                        "replica successfully deleted"
                    );
                } else {
                    tracing::warn!(
                        tablet_id = %self.tablet_id,
                        worker = target.uuid(),
                        "tablet did not belong to a known table, but was successfully deleted"
                    );
                }
                state.mark_complete();
            }
            Some(err)
                if matches!(
                    err.code,
                    WorkerErrorCode::TabletNotFound | WorkerErrorCode::CasFailed
                ) =>
            {
                tracing::warn!(
                    tablet_id = %self.tablet_id,
                    worker = target.uuid(),
                    error = %err,
                    "delete failed; no further retry"
                );
                state.mark_complete();
            }
            Some(err) => {
                tracing::warn!(
                    tablet_id = %self.tablet_id,
                    worker = target.uuid(),
                    error = %err,
                    "delete failed"
                );
            }
        }
    }
}

/// Pushes the table's latest schema to a tablet's leader. Stale alters are
/// harmless: the target ignores versions it has already passed.
pub struct AlterSchemaTask {
    picker: ReplicaPicker,
    table: Arc<TableInfo>,
    tablet: Arc<TabletInfo>,
}

impl AlterSchemaTask {
    pub fn new(table: Arc<TableInfo>, tablet: Arc<TabletInfo>) -> Self {
        Self {
            picker: ReplicaPicker::TabletLeader(Arc::clone(&tablet)),
            table,
            tablet,
        }
    }
}

#[async_trait]
impl TaskSpec for AlterSchemaTask {
    fn type_name(&self) -> &'static str {
        "Alter Schema"
    }

    fn tablet_id(&self) -> &str {
        self.tablet.id()
    }

    fn description(&self) -> String {
        format!("AlterSchema RPC for tablet {}", self.tablet.id())
    }

    fn table(&self) -> Option<Arc<TableInfo>> {
        Some(Arc::clone(&self.table))
    }

    fn picker(&self) -> &ReplicaPicker {
        &self.picker
    }

    async fn send_request(
        &self,
        _ctx: &TaskContext,
        target: &Arc<WorkerDescriptor>,
        _attempt: u32,
        _state: &TaskStateCell,
    ) -> SendOutcome {
        // Re-read the table on every attempt so concurrent alters are
        // always sent at their latest version.
        let record = self.table.read();
        let req = AlterSchemaRequest {
            dest_uuid: target.uuid().to_string(),
            tablet_id: self.tablet.id().to_string(),
            new_table_name: record.name.clone(),
            schema_version: record.schema_version,
            schema: record.schema.clone(),
        };
        drop(record);
        SendOutcome::Sent(target.proxy().alter_schema(req).await)
    }

    fn handle_response(
        &self,
        response: &WorkerResponse,
        target: &Arc<WorkerDescriptor>,
        _attempt: u32,
        state: &TaskStateCell,
    ) {
        match &response.error {
            None => state.mark_complete(),
            Some(err)
                if matches!(
                    err.code,
                    WorkerErrorCode::TabletNotFound
                        | WorkerErrorCode::MismatchedSchema
                        | WorkerErrorCode::TabletHasNewerSchema
                ) =>
            {
                tracing::warn!(
                    tablet_id = self.tablet.id(),
                    worker = target.uuid(),
                    error = %err,
                    "alter failed; no further retry"
                );
                state.mark_complete();
            }
            Some(err) => {
                tracing::warn!(
                    tablet_id = self.tablet.id(),
                    worker = target.uuid(),
                    error = %err,
                    "alter failed"
                );
            }
        }
    }
}

/// Abort a config-change task whose recorded opid index has been overtaken
/// by a newer committed configuration.
fn check_opid_index(tablet: &TabletInfo, task_opid_index: i64, state: &TaskStateCell) -> bool {
    let latest = tablet
        .read()
        .consensus
        .as_ref()
        .map(|c| c.committed_config.opid_index_or_invalid())
        .unwrap_or(crate::consensus::INVALID_OPID_INDEX);
    if latest > task_opid_index {
        tracing::info!(
            tablet_id = tablet.id(),
            latest_opid_index = latest,
            task_opid_index,
            "aborting config change task: superseded by a newer committed config"
        );
        state.mark_aborted();
        return false;
    }
    true
}

fn handle_change_config_response(
    kind: &str,
    tablet_id: &str,
    response: &WorkerResponse,
    target: &Arc<WorkerDescriptor>,
    attempt: u32,
    state: &TaskStateCell,
) {
    match &response.error {
        None => {
            tracing::info!(tablet_id, worker = target.uuid(), attempt, "{kind} succeeded");
            state.mark_complete();
        }
        Some(err) if err.code == WorkerErrorCode::CasFailed => {
            tracing::warn!(
                tablet_id,
                worker = target.uuid(),
                error = %err,
                "{kind} failed due to a CAS failure; no further retry"
            );
            state.mark_failed();
        }
        Some(err) => {
            tracing::info!(
                tablet_id,
                worker = target.uuid(),
                error = %err,
                "{kind} failed; will retry"
            );
        }
    }
}

/// Adds a replacement replica to a tablet's Raft config through its leader.
/// The replacement worker is chosen fresh on every attempt by
/// power-of-two-choices, excluding current members.
pub struct AddReplicaTask {
    picker: ReplicaPicker,
    table: Arc<TableInfo>,
    tablet: Arc<TabletInfo>,
    cstate: ConsensusState,
    member_type: MemberType,
}

impl AddReplicaTask {
    pub fn new(
        table: Arc<TableInfo>,
        tablet: Arc<TabletInfo>,
        cstate: ConsensusState,
        member_type: MemberType,
    ) -> Self {
        Self {
            picker: ReplicaPicker::TabletLeader(Arc::clone(&tablet)),
            table,
            tablet,
            cstate,
            member_type,
        }
    }
}

#[async_trait]
impl TaskSpec for AddReplicaTask {
    fn type_name(&self) -> &'static str {
        "ChangeConfig:AddPeer"
    }

    fn tablet_id(&self) -> &str {
        self.tablet.id()
    }

    fn description(&self) -> String {
        format!(
            "ChangeConfig:AddPeer({:?}) RPC for tablet {} with cas_config_opid_index {}",
            self.member_type,
            self.tablet.id(),
            self.cstate.committed_config.opid_index_or_invalid()
        )
    }

    fn table(&self) -> Option<Arc<TableInfo>> {
        Some(Arc::clone(&self.table))
    }

    fn picker(&self) -> &ReplicaPicker {
        &self.picker
    }

    fn deadline(&self, _config: &MasterConfig) -> Option<Duration> {
        // Config changes retry until aborted by a superseding config.
        None
    }

    async fn send_request(
        &self,
        ctx: &TaskContext,
        target: &Arc<WorkerDescriptor>,
        attempt: u32,
        state: &TaskStateCell,
    ) -> SendOutcome {
        if !check_opid_index(&self.tablet, self.cstate.committed_config.opid_index_or_invalid(), state)
        {
            return SendOutcome::Skipped;
        }

        let live = ctx.workers.live_workers();
        let excluded: HashSet<String> = self
            .cstate
            .committed_config
            .member_uuids()
            .map(|u| u.to_string())
            .collect();
        let Some(replacement) =
            crate::workers::select_replica(&live, &excluded, &mut rand::thread_rng())
        else {
            let replication_factor = self.table.read().num_replicas;
            let needed = if ctx.config.prepare_replacement_before_eviction {
                replication_factor + 1
            } else {
                replication_factor
            };
            let registered = ctx.workers.num_registered();
            tracing::warn!(
                tablet_id = self.tablet.id(),
                attempt,
                registered,
                needed,
                "no candidate replacement replica found"
            );
            return SendOutcome::Skipped;
        };

        let promote =
            ctx.config.prepare_replacement_before_eviction && self.member_type == MemberType::NonVoter;
        let req = ChangeConfigRequest {
            dest_uuid: target.uuid().to_string(),
            tablet_id: self.tablet.id().to_string(),
            change_type: ChangeConfigType::AddPeer,
            cas_config_opid_index: self.cstate.committed_config.opid_index_or_invalid(),
            peer: RaftPeer {
                uuid: replacement.uuid().to_string(),
                member_type: self.member_type,
                last_known_addr: replacement.addr().to_string(),
                promote,
                health: None,
            },
        };
        SendOutcome::Sent(target.proxy().change_config(req).await)
    }

    fn handle_response(
        &self,
        response: &WorkerResponse,
        target: &Arc<WorkerDescriptor>,
        attempt: u32,
        state: &TaskStateCell,
    ) {
        handle_change_config_response(
            "ChangeConfig:AddPeer",
            self.tablet.id(),
            response,
            target,
            attempt,
            state,
        );
    }
}

/// Evicts a specific replica from a tablet's Raft config through its leader.
pub struct EvictReplicaTask {
    picker: ReplicaPicker,
    table: Arc<TableInfo>,
    tablet: Arc<TabletInfo>,
    cstate: ConsensusState,
    peer_uuid_to_evict: String,
}

impl EvictReplicaTask {
    pub fn new(
        table: Arc<TableInfo>,
        tablet: Arc<TabletInfo>,
        cstate: ConsensusState,
        peer_uuid_to_evict: String,
    ) -> Self {
        Self {
            picker: ReplicaPicker::TabletLeader(Arc::clone(&tablet)),
            table,
            tablet,
            cstate,
            peer_uuid_to_evict,
        }
    }
}

#[async_trait]
impl TaskSpec for EvictReplicaTask {
    fn type_name(&self) -> &'static str {
        "ChangeConfig:RemovePeer"
    }

    fn tablet_id(&self) -> &str {
        self.tablet.id()
    }

    fn description(&self) -> String {
        format!(
            "ChangeConfig:RemovePeer({}) RPC for tablet {} with cas_config_opid_index {}",
            self.peer_uuid_to_evict,
            self.tablet.id(),
            self.cstate.committed_config.opid_index_or_invalid()
        )
    }

    fn table(&self) -> Option<Arc<TableInfo>> {
        Some(Arc::clone(&self.table))
    }

    fn picker(&self) -> &ReplicaPicker {
        &self.picker
    }

    fn deadline(&self, _config: &MasterConfig) -> Option<Duration> {
        None
    }

    async fn send_request(
        &self,
        _ctx: &TaskContext,
        target: &Arc<WorkerDescriptor>,
        _attempt: u32,
        state: &TaskStateCell,
    ) -> SendOutcome {
        if !check_opid_index(&self.tablet, self.cstate.committed_config.opid_index_or_invalid(), state)
        {
            return SendOutcome::Skipped;
        }
        let req = ChangeConfigRequest {
            dest_uuid: target.uuid().to_string(),
            tablet_id: self.tablet.id().to_string(),
            change_type: ChangeConfigType::RemovePeer,
            cas_config_opid_index: self.cstate.committed_config.opid_index_or_invalid(),
            peer: RaftPeer {
                uuid: self.peer_uuid_to_evict.clone(),
                member_type: MemberType::Voter,
                last_known_addr: String::new(),
                promote: false,
                health: None,
            },
        };
        SendOutcome::Sent(target.proxy().change_config(req).await)
    }

    fn handle_response(
        &self,
        response: &WorkerResponse,
        target: &Arc<WorkerDescriptor>,
        attempt: u32,
        state: &TaskStateCell,
    ) {
        handle_change_config_response(
            "ChangeConfig:RemovePeer",
            self.tablet.id(),
            response,
            target,
            attempt,
            state,
        );
    }
}
