//! The catalog manager: the master's authoritative in-memory index of
//! tables and tablets and the leader-gated request handlers.
//!
//! Locking here is deliberate. Each record sits in a copy-on-write cell
//! (see `cow`), so reads never block. The rules:
//!
//! - Read locks may be taken in any order; they are wait-free snapshots.
//! - A write lock on a table and some of its tablets is taken table first,
//!   then tablets in tablet-ID order; commits happen in reverse (tablets
//!   before their table).
//! - The global lock order is leader lock, index lock, table lock, tablet
//!   locks ascending by ID.
//! - In-memory state is committed only after the corresponding system-table
//!   write succeeded; a failed write aborts every staged mutation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::bg_tasks::BgTasks;
use crate::config::MasterConfig;
use crate::consensus::{consensus_role, MemberType, ReplicaRole};
use crate::cow::{CowReadGuard, CowWriteGuard};
use crate::error::CatalogError;
use crate::partition::{
    create_partitions, decode_range_ops, decode_single_bound, Partition, PartitionSchema, RangeOp,
};
use crate::schema::{
    process_column_defaults, validate_client_schema, validate_identifier, ColumnDelta,
    ColumnSchema, Schema, SchemaBuilder,
};
use crate::state::{
    PersistedTable, PersistedTablet, TableId, TableInfo, TableState, TabletId, TabletInfo,
    TabletState,
};
use crate::sys_table::{
    CatchupError, SysTableActions, SysTableError, SysTabletConsensus, SystemTable,
    SigningKeyVisitor, TableVisitor, TabletVisitor,
};
use crate::tasks::{
    spawn_task, AlterSchemaTask, CreateReplicaTask, DeleteReplicaTask, TaskContext,
};
use crate::tokens::{now_unix_secs, CertAuthority, TokenSigner, TokenSigningKey};
use crate::workers::{ReplicaDataState, WorkerManager};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RunState {
    Constructed,
    Starting,
    Running,
    Closing,
}

/// In-memory index over all tables and tablets. One lock guards all four
/// maps; reserved names fence concurrent creations of the same table name.
#[derive(Default)]
pub(crate) struct CatalogIndex {
    pub tables_by_id: HashMap<TableId, Arc<TableInfo>>,
    pub tables_by_name: HashMap<String, Arc<TableInfo>>,
    pub tablets: HashMap<TabletId, Arc<TabletInfo>>,
    pub reserved_names: HashSet<String>,
}

/// Everything the catalog manager needs from its surroundings.
pub struct CatalogManagerContext {
    /// UUID of this master process; leadership is recognized when the system
    /// tablet's leader UUID equals it.
    pub uuid: String,
    pub config: MasterConfig,
    pub sys_table: Arc<dyn SystemTable>,
    pub sys_consensus: Arc<dyn SysTabletConsensus>,
    pub workers: Arc<WorkerManager>,
    pub cert_authority: Arc<dyn CertAuthority>,
    pub signer: Arc<TokenSigner>,
}

pub struct CatalogManager {
    pub(crate) uuid: String,
    pub(crate) config: Arc<MasterConfig>,
    pub(crate) sys: Arc<dyn SystemTable>,
    pub(crate) consensus: Arc<dyn SysTabletConsensus>,
    pub(crate) workers: Arc<WorkerManager>,
    pub(crate) cert_authority: Arc<dyn CertAuthority>,
    pub(crate) signer: Arc<TokenSigner>,
    run_state: Mutex<RunState>,
    /// Term for which the in-memory maps reflect the durable system table;
    /// -1 until the first leadership preparation completes.
    leader_ready_term: AtomicI64,
    /// Held shared by every handler, exclusive during leadership
    /// transitions. FIFO-fair, so a pending transition is not starved.
    leader_lock: tokio::sync::RwLock<()>,
    pub(crate) index: RwLock<CatalogIndex>,
    elected_tx: Mutex<Option<mpsc::UnboundedSender<()>>>,
    prepare_worker: Mutex<Option<JoinHandle<()>>>,
    pub(crate) bg: Mutex<Option<BgTasks>>,
}

pub(crate) fn generate_id() -> String {
    use rand::Rng;
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    (0..32).map(|_| HEX[rng.gen_range(0..16usize)] as char).collect()
}

/// Drops a reserved table name when the owning operation finishes.
struct NameReservation<'a> {
    catalog: &'a CatalogManager,
    name: String,
}

impl Drop for NameReservation<'_> {
    fn drop(&mut self) {
        self.catalog
            .index
            .write()
            .unwrap()
            .reserved_names
            .remove(&self.name);
    }
}

/// Shared leader lock held for the duration of one handler invocation.
pub(crate) struct LeaderGuard<'a> {
    _shared: tokio::sync::RwLockReadGuard<'a, ()>,
    term: i64,
}

impl LeaderGuard<'_> {
    pub fn term(&self) -> i64 {
        self.term
    }
}

// ---------------------------------------------------------------------------
// Request and response types for the client-facing RPC surface.
// ---------------------------------------------------------------------------

/// Identifies a table by ID, name, or both (both must match one table).
#[derive(Clone, Debug, Default)]
pub struct TableRef {
    pub table_id: Option<TableId>,
    pub table_name: Option<String>,
}

impl TableRef {
    pub fn by_name(name: impl Into<String>) -> Self {
        Self { table_id: None, table_name: Some(name.into()) }
    }

    pub fn by_id(id: impl Into<String>) -> Self {
        Self { table_id: Some(id.into()), table_name: None }
    }
}

#[derive(Clone, Debug)]
pub struct CreateTableRequest {
    pub name: String,
    pub schema: Schema,
    /// Split rows and range bounds, already decoded from the row-operations
    /// payload.
    pub range_ops: Vec<RangeOp>,
    pub num_replicas: Option<i32>,
}

#[derive(Clone, Debug)]
pub struct CreateTableResponse {
    pub table_id: TableId,
}

#[derive(Clone, Debug)]
pub struct IsCreateTableDoneResponse {
    pub done: bool,
}

#[derive(Clone, Debug)]
pub enum AlterTableStep {
    AddColumn { column: ColumnSchema },
    DropColumn { name: String },
    RenameColumn { old_name: String, new_name: String },
    AlterColumn { delta: ColumnDelta },
    AddRangePartition { ops: Vec<RangeOp> },
    DropRangePartition { ops: Vec<RangeOp> },
}

#[derive(Clone, Debug)]
pub struct AlterTableRequest {
    pub table: TableRef,
    pub steps: Vec<AlterTableStep>,
    pub new_table_name: Option<String>,
}

#[derive(Clone, Debug)]
pub struct AlterTableResponse {
    pub table_id: TableId,
}

#[derive(Clone, Debug)]
pub struct IsAlterTableDoneResponse {
    pub schema_version: u32,
    pub done: bool,
}

#[derive(Clone, Debug)]
pub struct GetTableSchemaResponse {
    pub table_id: TableId,
    pub table_name: String,
    pub schema: Schema,
    pub partition_schema: PartitionSchema,
    pub num_replicas: i32,
}

#[derive(Clone, Debug, Default)]
pub struct ListTablesRequest {
    /// Substring filter over table names.
    pub name_filter: Option<String>,
}

#[derive(Clone, Debug)]
pub struct ListedTable {
    pub id: TableId,
    pub name: String,
}

#[derive(Clone, Debug)]
pub struct ListTablesResponse {
    pub tables: Vec<ListedTable>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicaTypeFilter {
    VoterReplica,
    AnyReplica,
}

#[derive(Clone, Debug)]
pub struct GetTableLocationsRequest {
    pub table: TableRef,
    pub partition_key_start: Option<Vec<u8>>,
    pub partition_key_end: Option<Vec<u8>>,
    pub max_returned_locations: usize,
    pub replica_type_filter: ReplicaTypeFilter,
}

impl GetTableLocationsRequest {
    pub fn whole_table(table: TableRef) -> Self {
        Self {
            table,
            partition_key_start: None,
            partition_key_end: None,
            max_returned_locations: 10,
            replica_type_filter: ReplicaTypeFilter::AnyReplica,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ReplicaLocation {
    pub uuid: String,
    pub addr: String,
    pub role: ReplicaRole,
}

#[derive(Clone, Debug)]
pub struct TabletLocations {
    pub tablet_id: TabletId,
    pub partition: Partition,
    pub replicas: Vec<ReplicaLocation>,
}

#[derive(Clone, Debug)]
pub struct GetTableLocationsResponse {
    pub tablet_locations: Vec<TabletLocations>,
    /// Advisory TTL clients may cache these locations for.
    pub ttl: Duration,
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

impl CatalogManager {
    pub fn new(ctx: CatalogManagerContext) -> Arc<Self> {
        Arc::new(Self {
            uuid: ctx.uuid,
            config: Arc::new(ctx.config),
            sys: ctx.sys_table,
            consensus: ctx.sys_consensus,
            workers: ctx.workers,
            cert_authority: ctx.cert_authority,
            signer: ctx.signer,
            run_state: Mutex::new(RunState::Constructed),
            leader_ready_term: AtomicI64::new(-1),
            leader_lock: tokio::sync::RwLock::new(()),
            index: RwLock::new(CatalogIndex::default()),
            elected_tx: Mutex::new(None),
            prepare_worker: Mutex::new(None),
            bg: Mutex::new(None),
        })
    }

    /// Start the leadership-callback worker and the background scheduler.
    pub fn init(self: &Arc<Self>) -> Result<(), CatalogError> {
        {
            let mut state = self.run_state.lock().unwrap();
            if *state != RunState::Constructed {
                return Err(CatalogError::Unknown(format!(
                    "catalog manager cannot be initialized from state {state:?}"
                )));
            }
            *state = RunState::Starting;
        }

        // A single worker task serializes closely timed consecutive
        // elected-as-leader callbacks.
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let catalog = Arc::clone(self);
        let worker = tokio::spawn(async move {
            while rx.recv().await.is_some() {
                catalog.prepare_for_leadership().await;
            }
        });
        *self.elected_tx.lock().unwrap() = Some(tx);
        *self.prepare_worker.lock().unwrap() = Some(worker);

        *self.bg.lock().unwrap() = Some(BgTasks::spawn(Arc::clone(self)));

        *self.run_state.lock().unwrap() = RunState::Running;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        *self.run_state.lock().unwrap() == RunState::Running
    }

    fn is_closing(&self) -> bool {
        *self.run_state.lock().unwrap() == RunState::Closing
    }

    pub fn leader_ready_term(&self) -> i64 {
        self.leader_ready_term.load(Ordering::Acquire)
    }

    /// Callback from the system tablet's consensus: this node may have
    /// become leader. The preparation itself runs on the serialized worker.
    pub fn elected_as_leader(&self) {
        if let Some(tx) = self.elected_tx.lock().unwrap().as_ref() {
            let _ = tx.send(());
        }
    }

    pub async fn shutdown(&self) {
        {
            let mut state = self.run_state.lock().unwrap();
            if *state == RunState::Closing {
                tracing::debug!("catalog manager already shut down");
                return;
            }
            *state = RunState::Closing;
        }

        let bg = self.bg.lock().unwrap().take();
        if let Some(bg) = bg {
            bg.shutdown().await;
        }

        // Abort outstanding table tasks and wait for them to unregister.
        let tables: Vec<Arc<TableInfo>> = {
            let index = self.index.read().unwrap();
            index.tables_by_id.values().cloned().collect()
        };
        for table in &tables {
            table.abort_tasks();
        }
        for table in &tables {
            table.wait_tasks_done().await;
        }

        // Consensus goes down first: that aborts pending system-table
        // operations and breaks any retry cycle a leadership callback may
        // be stuck in.
        self.consensus.shutdown().await;

        let worker = {
            self.elected_tx.lock().unwrap().take();
            self.prepare_worker.lock().unwrap().take()
        };
        if let Some(worker) = worker {
            let _ = worker.await;
        }

        self.sys.shutdown().await;
    }

    pub(crate) fn task_ctx(&self) -> TaskContext {
        TaskContext {
            workers: Arc::clone(&self.workers),
            config: Arc::clone(&self.config),
        }
    }

    pub(crate) fn wake_bg(&self) {
        if let Some(bg) = self.bg.lock().unwrap().as_ref() {
            bg.wake();
        }
    }

    /// Common handler prologue: verify the manager runs, this node leads
    /// the system tablet, and memory reflects the current term.
    pub(crate) fn leader_shared(&self) -> Result<LeaderGuard<'_>, CatalogError> {
        if !self.is_initialized() {
            return Err(CatalogError::NotInitialized(
                "catalog manager is not running".to_string(),
            ));
        }
        let leadership = self.consensus.leadership();
        if leadership.leader_uuid.as_deref() != Some(self.uuid.as_str()) {
            return Err(CatalogError::NotLeader(format!(
                "local UUID {} is not the system tablet leader in term {}",
                self.uuid, leadership.term
            )));
        }
        let shared = self.leader_lock.try_read().map_err(|_| {
            CatalogError::NotLeader("leader is not yet ready to serve requests".to_string())
        })?;
        if self.leader_ready_term.load(Ordering::Acquire) != leadership.term {
            return Err(CatalogError::NotLeader(
                "leader is not yet ready to serve requests".to_string(),
            ));
        }
        Ok(LeaderGuard { _shared: shared, term: leadership.term })
    }

    pub(crate) fn has_term_changed(&self, term: i64) -> bool {
        self.consensus.leadership().term != term
    }

    // -----------------------------------------------------------------------
    // Leadership preparation
    // -----------------------------------------------------------------------

    /// React to a prepare-step failure: benign on shutdown or when the term
    /// moved on (the next leader redoes the work), fatal otherwise.
    fn handle_prepare_failure(&self, what: &str, err: &anyhow::Error, start_term: i64) {
        if self.is_closing() {
            tracing::info!(error = %err, "{what} failed due to catalog shutdown");
            return;
        }
        let term = self.consensus.leadership().term;
        if term != start_term {
            tracing::info!(
                start_term,
                term,
                error = %err,
                "{what} failed; change in term detected"
            );
            return;
        }
        tracing::error!(error = %err, "{what} failed");
        std::process::exit(1);
    }

    async fn prepare_for_leadership(&self) {
        let term_before_wait = self.consensus.leadership().term;
        if self.leader_ready_term.load(Ordering::Acquire) == term_before_wait {
            // No other master can have led in this term, so nothing durable
            // can have changed under us.
            tracing::debug!(term = term_before_wait, "term unchanged, ignoring leader callback");
            return;
        }

        match self
            .consensus
            .wait_for_catchup(self.config.failover_catchup_timeout)
            .await
        {
            Ok(()) => {}
            Err(CatchupError::TimedOut) => {
                tracing::error!(
                    timeout_ms = self.config.failover_catchup_timeout.as_millis() as u64,
                    "failed to catch up with the system tablet after election; shutting down"
                );
                std::process::exit(1);
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed waiting to catch up after election");
                return;
            }
        }

        let term = self.consensus.leadership().term;
        if term != term_before_wait {
            tracing::info!(
                term_before_wait,
                term,
                "term changed while waiting for leader catchup; not loading metadata"
            );
            return;
        }

        // Block new catalog operations and wait for in-flight handlers.
        let _leader_guard = self.leader_lock.write().await;

        tracing::info!("loading table and tablet metadata into memory");
        if let Err(err) = self.load_tables_and_tablets().await {
            self.handle_prepare_failure("loading table and tablet metadata", &err, term);
            return;
        }

        tracing::info!("initializing the certificate authority");
        if let Err(err) = self.init_cert_authority().await {
            self.handle_prepare_failure("initializing the certificate authority", &err, term);
            return;
        }

        tracing::info!("loading token signing keys");
        if let Err(err) = self.init_token_signer().await {
            self.handle_prepare_failure("loading token signing keys", &err, term);
            return;
        }

        self.leader_ready_term.store(term, Ordering::Release);
        tracing::info!(term, "leadership preparation complete");
    }

    /// Rebuild the in-memory maps from the system table.
    async fn load_tables_and_tablets(&self) -> anyhow::Result<()> {
        // Outstanding tasks reference tables that are about to be orphaned;
        // end them first.
        let tables: Vec<Arc<TableInfo>> = {
            let index = self.index.read().unwrap();
            index.tables_by_id.values().cloned().collect()
        };
        for table in &tables {
            table.abort_tasks();
        }
        for table in &tables {
            table.wait_tasks_done().await;
        }

        struct TableLoader {
            tables_by_id: HashMap<TableId, Arc<TableInfo>>,
            tables_by_name: HashMap<String, Arc<TableInfo>>,
        }

        impl TableVisitor for TableLoader {
            fn visit_table(
                &mut self,
                table_id: &str,
                record: PersistedTable,
            ) -> Result<(), SysTableError> {
                if self.tables_by_id.contains_key(table_id) {
                    return Err(SysTableError::Corruption(format!(
                        "table {table_id} loaded twice"
                    )));
                }
                let is_deleted = record.is_deleted();
                let name = record.name.clone();
                let table = TableInfo::new(table_id.to_string(), record);
                if !is_deleted {
                    self.tables_by_name.insert(name, Arc::clone(&table));
                    tracing::info!(table = %table.describe(), "loaded metadata for table");
                }
                self.tables_by_id.insert(table_id.to_string(), table);
                Ok(())
            }
        }

        struct TabletLoader<'a> {
            tables_by_id: &'a HashMap<TableId, Arc<TableInfo>>,
            tablets: HashMap<TabletId, Arc<TabletInfo>>,
        }

        impl TabletVisitor for TabletLoader<'_> {
            fn visit_tablet(
                &mut self,
                tablet_id: &str,
                record: PersistedTablet,
            ) -> Result<(), SysTableError> {
                let Some(table) = self.tables_by_id.get(&record.table_id) else {
                    // Tables and tablets are created and deleted in one
                    // transaction, so this indicates corruption.
                    let msg = format!(
                        "missing table {} required by tablet {tablet_id}",
                        record.table_id
                    );
                    tracing::error!("{msg}");
                    return Err(SysTableError::Corruption(msg));
                };
                let is_deleted = record.is_deleted();
                let tablet = TabletInfo::new(table, tablet_id.to_string(), record);
                self.tablets.insert(tablet_id.to_string(), Arc::clone(&tablet));
                if !is_deleted {
                    table.add_remove_tablets(&[Arc::clone(&tablet)], &[]);
                    tracing::info!(tablet_id, table = %table.describe(), "loaded metadata for tablet");
                }
                Ok(())
            }
        }

        let mut table_loader = TableLoader {
            tables_by_id: HashMap::new(),
            tables_by_name: HashMap::new(),
        };
        self.sys.visit_tables(&mut table_loader).await?;

        let mut tablet_loader = TabletLoader {
            tables_by_id: &table_loader.tables_by_id,
            tablets: HashMap::new(),
        };
        self.sys.visit_tablets(&mut tablet_loader).await?;
        let tablets = tablet_loader.tablets;

        let mut index = self.index.write().unwrap();
        index.tables_by_id = table_loader.tables_by_id;
        index.tables_by_name = table_loader.tables_by_name;
        index.tablets = tablets;
        // Reserved names belong to in-flight operations and survive reloads.
        Ok(())
    }

    /// Load the CA record, or generate and persist one on the very first
    /// leadership of a fresh cluster. Generated material is installed only
    /// after it has been durably persisted; a persist failure (typically
    /// lost leadership) discards it.
    async fn init_cert_authority(&self) -> anyhow::Result<()> {
        match self.sys.ca_entry().await? {
            Some(bundle) => {
                self.cert_authority.adopt(bundle)?;
            }
            None => {
                let bundle = self.cert_authority.generate()?;
                self.sys.add_ca_entry(bundle.clone()).await?;
                tracing::info!("generated new certificate authority record");
                self.cert_authority.adopt(bundle)?;
            }
        }
        Ok(())
    }

    async fn init_token_signer(&self) -> anyhow::Result<()> {
        struct TskLoader {
            now_unix: i64,
            keys: Vec<TokenSigningKey>,
            expired_seqs: Vec<i64>,
        }

        impl SigningKeyVisitor for TskLoader {
            fn visit_key(&mut self, key: TokenSigningKey) -> Result<(), SysTableError> {
                if key.expire_at_unix_secs <= self.now_unix {
                    self.expired_seqs.push(key.seq_num);
                }
                // Expired entries still matter: they keep sequence numbers
                // monotonic.
                self.keys.push(key);
                Ok(())
            }
        }

        let mut loader = TskLoader {
            now_unix: now_unix_secs(),
            keys: Vec::new(),
            expired_seqs: Vec::new(),
        };
        self.sys.visit_signing_keys(&mut loader).await?;
        for key in &loader.keys {
            tracing::info!(seq = key.seq_num, "loaded token signing key");
        }
        let expired = loader.expired_seqs;
        self.signer.import_keys(loader.keys);

        self.try_generate_new_tsk().await?;

        if !expired.is_empty() {
            let actions = SysTableActions {
                tsk_entries_to_remove: expired,
                ..Default::default()
            };
            self.sys.write(actions).await?;
        }
        Ok(())
    }

    /// Generate, persist, install, and rotate the token signing key when the
    /// rotation cadence calls for it. A key is handed to the signer only
    /// after the system-table write succeeded.
    pub(crate) async fn try_generate_new_tsk(&self) -> anyhow::Result<()> {
        if let Some(key) = self.signer.check_need_key()? {
            let actions = SysTableActions {
                tsk_entries_to_add: vec![key.clone()],
                ..Default::default()
            };
            self.sys.write(actions).await?;
            tracing::info!(seq = key.seq_num, "generated new token signing key");
            self.signer.add_key(key);
        }
        self.signer.try_rotate()
    }

    // -----------------------------------------------------------------------
    // Index helpers
    // -----------------------------------------------------------------------

    fn find_table(&self, ident: &TableRef) -> Result<Option<Arc<TableInfo>>, CatalogError> {
        let index = self.index.read().unwrap();
        match (&ident.table_id, &ident.table_name) {
            (Some(id), maybe_name) => {
                let table = index.tables_by_id.get(id).cloned();
                if let (Some(table), Some(name)) = (&table, maybe_name) {
                    // When both are given they must reference the same table.
                    let matches = index
                        .tables_by_name
                        .get(name)
                        .map(|other| Arc::ptr_eq(other, table))
                        .unwrap_or(false);
                    if !matches {
                        return Ok(None);
                    }
                }
                Ok(table)
            }
            (None, Some(name)) => Ok(index.tables_by_name.get(name).cloned()),
            (None, None) => Err(CatalogError::Unknown(
                "missing table ID or table name".to_string(),
            )),
        }
    }

    /// Look up a table and take its read snapshot. A table observed under a
    /// stale name (mid-rename) counts as absent.
    fn find_and_read_table(
        &self,
        ident: &TableRef,
    ) -> Result<Option<(Arc<TableInfo>, CowReadGuard<PersistedTable>)>, CatalogError> {
        let Some(table) = self.find_table(ident)? else {
            return Ok(None);
        };
        let record = table.read();
        if let Some(name) = &ident.table_name {
            if &record.name != name {
                return Ok(None);
            }
        }
        Ok(Some((table, record)))
    }

    async fn find_and_write_lock_table(
        &self,
        ident: &TableRef,
    ) -> Result<Option<(Arc<TableInfo>, CowWriteGuard<PersistedTable>)>, CatalogError> {
        let Some(table) = self.find_table(ident)? else {
            return Ok(None);
        };
        let guard = table.metadata().write().await;
        if let Some(name) = &ident.table_name {
            if &guard.data().name != name {
                return Ok(None);
            }
        }
        Ok(Some((table, guard)))
    }

    fn reserve_table_name(&self, name: &str) -> Result<NameReservation<'_>, CatalogError> {
        let mut index = self.index.write().unwrap();
        if let Some(existing) = index.tables_by_name.get(name) {
            return Err(CatalogError::TableAlreadyPresent(format!(
                "table {name} already exists with id {}",
                existing.id()
            )));
        }
        if !index.reserved_names.insert(name.to_string()) {
            // A concurrent creation holds the name; the caller should retry
            // later rather than fail outright, since reservations roll back.
            return Err(CatalogError::NameReserved(name.to_string()));
        }
        Ok(NameReservation { catalog: self, name: name.to_string() })
    }

    // -----------------------------------------------------------------------
    // Fan-out helpers
    // -----------------------------------------------------------------------

    /// Send a delete to every replica in the tablet's last committed config.
    pub(crate) fn send_delete_replica_tasks(
        &self,
        table: Option<Arc<TableInfo>>,
        tablet_id: &str,
        record: &PersistedTablet,
        reason: &str,
    ) {
        let Some(cstate) = &record.consensus else {
            // The tablet never made it past PREPARING: no replicas exist.
            tracing::info!(tablet_id, "not sending DeleteTablet requests; no consensus state");
            return;
        };
        tracing::info!(
            tablet_id,
            replicas = cstate.committed_config.peers.len(),
            "sending DeleteTablet to all replicas"
        );
        for peer in &cstate.committed_config.peers {
            let task = DeleteReplicaTask::new(
                table.clone(),
                tablet_id.to_string(),
                peer.uuid.clone(),
                ReplicaDataState::Deleted,
                None,
                reason,
            );
            spawn_task(Arc::new(task), self.task_ctx());
        }
    }

    /// Send the current schema to the leader of every tablet in the table.
    pub(crate) fn send_alter_table_tasks(&self, table: &Arc<TableInfo>) {
        for tablet in table.all_tablets() {
            let task = AlterSchemaTask::new(Arc::clone(table), tablet);
            spawn_task(Arc::new(task), self.task_ctx());
        }
    }

    /// Send creates to every peer of the tablet's initial config.
    pub(crate) fn send_create_replica_tasks(
        &self,
        table: &Arc<TableInfo>,
        tablet: &Arc<TabletInfo>,
        record: &PersistedTablet,
    ) {
        tablet.set_last_create_time(tokio::time::Instant::now());
        let Some(cstate) = &record.consensus else {
            tracing::warn!(tablet_id = tablet.id(), "no consensus state; cannot send creates");
            return;
        };
        for peer in &cstate.committed_config.peers {
            let task = CreateReplicaTask::new(
                Arc::clone(table),
                tablet.id().to_string(),
                record,
                peer.uuid.clone(),
            );
            spawn_task(Arc::new(task), self.task_ctx());
        }
    }

    // -----------------------------------------------------------------------
    // CreateTable
    // -----------------------------------------------------------------------

    pub async fn create_table(
        &self,
        req: CreateTableRequest,
    ) -> Result<CreateTableResponse, CatalogError> {
        let _leader = self.leader_shared()?;
        let mut req = req;
        tracing::info!(name = %req.name, "servicing CreateTable request");

        // Fix up column defaults before validation; clients send only the
        // read default.
        for col in &mut req.schema.columns {
            process_column_defaults(col)
                .map_err(|e| CatalogError::InvalidSchema(e.to_string()))?;
        }

        validate_client_schema(
            Some(&req.name),
            &req.schema,
            self.config.max_identifier_length,
            self.config.max_num_columns,
        )
        .map_err(|e| CatalogError::InvalidSchema(e.to_string()))?;
        if req.schema.has_column_ids() {
            return Err(CatalogError::InvalidSchema(
                "user requests should not have column IDs".to_string(),
            ));
        }
        let schema = req.schema.with_assigned_ids();
        let partition_schema = PartitionSchema::default_for(&schema);

        let (split_rows, range_bounds) =
            decode_range_ops(&req.range_ops).map_err(|e| CatalogError::Unknown(e.to_string()))?;
        let partitions = create_partitions(&split_rows, &range_bounds)
            .map_err(|e| CatalogError::Unknown(e.to_string()))?;

        let num_replicas = req.num_replicas.unwrap_or(self.config.default_num_replicas);
        if num_replicas % 2 == 0 && !self.config.allow_unsafe_replication_factor {
            return Err(CatalogError::EvenReplicationFactor(num_replicas));
        }
        if num_replicas > self.config.max_num_replicas {
            return Err(CatalogError::ReplicationFactorTooHigh {
                requested: num_replicas,
                max: self.config.max_num_replicas,
            });
        }
        if num_replicas <= 0 {
            return Err(CatalogError::IllegalReplicationFactor(num_replicas));
        }

        // Sanity-check the replica count against cluster capacity.
        let live_workers = self.workers.live_workers();
        let max_replicas_total = self.config.max_create_tablets_per_worker * live_workers.len();
        if num_replicas > 1
            && max_replicas_total > 0
            && partitions.len() * num_replicas as usize > max_replicas_total
        {
            return Err(CatalogError::TooManyTablets(format!(
                "the requested number of tablet replicas ({}) is over the maximum permitted \
                 at creation time ({max_replicas_total}); additional tablets may be added by \
                 adding range partitions post-creation",
                partitions.len() * num_replicas as usize
            )));
        }
        if self.config.check_worker_count_on_create
            && num_replicas as usize > live_workers.len()
        {
            return Err(CatalogError::NotEnoughWorkers {
                requested: num_replicas,
                live: live_workers.len(),
            });
        }

        // Reserve the name; the reservation drops on every exit path.
        let _reservation = self.reserve_table_name(&req.name)?;

        // Build the in-memory table and tablets, all staged under write
        // locks and all in PREPARING.
        let record = PersistedTable {
            name: req.name.clone(),
            schema: schema.clone(),
            schema_version: 0,
            partition_schema: partition_schema.clone(),
            num_replicas,
            next_column_id: schema.max_column_id() + 1,
            state: TableState::Preparing,
            state_msg: String::new(),
            fully_applied_schema: None,
        };
        let (table, mut table_guard) = TableInfo::new_for_create(generate_id(), record);
        let mut tablets = Vec::with_capacity(partitions.len());
        for partition in partitions {
            let (tablet, guard) =
                TabletInfo::new_for_create(&table, generate_id(), partition);
            tablets.push((tablet, guard));
        }
        table_guard
            .mutable()
            .set_state(TableState::Running, String::new());

        // One atomic system-table write for the table and all its tablets.
        let actions = SysTableActions {
            tables_to_add: vec![(table.id().to_string(), table_guard.dirty().clone())],
            tablets_to_add: tablets
                .iter()
                .map(|(t, g)| (t.id().to_string(), g.dirty().clone()))
                .collect(),
            ..Default::default()
        };
        if let Err(err) = self.sys.write(actions).await {
            tracing::warn!(name = %req.name, error = %err, "CreateTable failed to persist");
            // Guards drop here, aborting all staged mutations.
            return Err(CatalogError::from_sys_write(err));
        }

        // Commit the in-memory state.
        table_guard.commit();
        let tablets: Vec<Arc<TabletInfo>> = tablets
            .into_iter()
            .map(|(tablet, guard)| {
                guard.commit();
                tablet
            })
            .collect();

        // Attach the tablets to the table. This reads the tablets' clean
        // state, hence after the commits above.
        table.add_remove_tablets(&tablets, &[]);

        // Publish into the global index.
        {
            let mut index = self.index.write().unwrap();
            index
                .tables_by_id
                .insert(table.id().to_string(), Arc::clone(&table));
            index
                .tables_by_name
                .insert(req.name.clone(), Arc::clone(&table));
            for tablet in &tablets {
                index.tablets.insert(tablet.id().to_string(), Arc::clone(tablet));
            }
        }

        tracing::info!(table = %table.describe(), tablets = tablets.len(), "created table");
        self.wake_bg();
        Ok(CreateTableResponse { table_id: table.id().to_string() })
    }

    pub async fn is_create_table_done(
        &self,
        table_ref: &TableRef,
    ) -> Result<IsCreateTableDoneResponse, CatalogError> {
        let _leader = self.leader_shared()?;
        let (table, record) = self
            .find_and_read_table(table_ref)?
            .ok_or_else(|| CatalogError::TableNotFound(describe_ref(table_ref)))?;
        check_table_usable(&record, table_ref)?;
        Ok(IsCreateTableDoneResponse { done: !table.is_create_in_progress() })
    }

    // -----------------------------------------------------------------------
    // DeleteTable
    // -----------------------------------------------------------------------

    pub async fn delete_table(&self, table_ref: &TableRef) -> Result<(), CatalogError> {
        let _leader = self.leader_shared()?;
        tracing::info!(table = ?table_ref, "servicing DeleteTable request");

        let Some((table, mut table_guard)) = self.find_and_write_lock_table(table_ref).await?
        else {
            return Err(CatalogError::TableNotFound(describe_ref(table_ref)));
        };
        if table_guard.data().is_deleted() {
            return Err(CatalogError::TableNotFound(
                table_guard.data().state_msg.clone(),
            ));
        }

        let deletion_msg = format!("table deleted at {}", now_unix_secs());
        table_guard
            .mutable()
            .set_state(TableState::Removed, deletion_msg.clone());

        // Lock all tablets and mark them deleted.
        let tablets = table.all_tablets();
        let mut tablets_lock = crate::state::lock_tablets_for_write(&tablets).await;
        for tablet in &tablets {
            tablets_lock
                .guard_mut(tablet.id())
                .mutable()
                .set_state(TabletState::Deleted, deletion_msg.clone());
        }

        let actions = SysTableActions {
            tables_to_update: vec![(table.id().to_string(), table_guard.dirty().clone())],
            tablets_to_update: tablets_lock
                .iter()
                .map(|(id, guard)| (id.clone(), guard.dirty().clone()))
                .collect(),
            ..Default::default()
        };
        if let Err(err) = self.sys.write(actions).await {
            tracing::warn!(table = %table.describe(), error = %err, "DeleteTable failed to persist");
            return Err(CatalogError::from_sys_write(err));
        }

        // The operation is durable; in-memory changes must now succeed.
        {
            let mut index = self.index.write().unwrap();
            // The ID entry is retained so replayed reports and late clients
            // observe the deletion.
            index.tables_by_name.remove(&table_guard.data().name);
        }

        // Commit tablets first, then the table.
        tablets_lock.commit_all();
        table_guard.commit();

        table.abort_tasks();

        for tablet in &tablets {
            let record = tablet.read();
            self.send_delete_replica_tasks(
                Some(Arc::clone(&table)),
                tablet.id(),
                &record,
                &deletion_msg,
            );
        }

        tracing::info!(table = %table.describe(), "deleted table");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // AlterTable
    // -----------------------------------------------------------------------

    pub async fn alter_table(
        &self,
        req: AlterTableRequest,
    ) -> Result<AlterTableResponse, CatalogError> {
        let _leader = self.leader_shared()?;
        tracing::info!(table = ?req.table, steps = req.steps.len(), "servicing AlterTable request");

        // 1. Group the steps.
        let mut schema_steps = Vec::new();
        let mut partition_steps = Vec::new();
        for step in req.steps {
            match step {
                AlterTableStep::AddColumn { .. }
                | AlterTableStep::DropColumn { .. }
                | AlterTableStep::RenameColumn { .. }
                | AlterTableStep::AlterColumn { .. } => schema_steps.push(step),
                AlterTableStep::AddRangePartition { .. }
                | AlterTableStep::DropRangePartition { .. } => partition_steps.push(step),
            }
        }

        // 2. Look up and write-lock the table.
        let Some((table, mut table_guard)) = self.find_and_write_lock_table(&req.table).await?
        else {
            return Err(CatalogError::TableNotFound(describe_ref(&req.table)));
        };
        if table_guard.data().is_deleted() {
            return Err(CatalogError::TableNotFound(
                table_guard.data().state_msg.clone(),
            ));
        }
        let old_name = table_guard.data().name.clone();

        // 3. Compute and validate the new schema.
        let mut new_schema = None;
        let mut next_col_id = table_guard.data().next_column_id;
        if !schema_steps.is_empty() {
            let current = table_guard.data();
            let mut builder = SchemaBuilder::from_schema(&current.schema, current.next_column_id);
            for step in &schema_steps {
                apply_schema_step(&mut builder, step)
                    .map_err(|e| CatalogError::InvalidSchema(e.to_string()))?;
            }
            let (schema, next_id) = builder.build();
            validate_client_schema(
                None,
                &schema,
                self.config.max_identifier_length,
                self.config.max_num_columns,
            )
            .map_err(|e| CatalogError::InvalidSchema(e.to_string()))?;
            new_schema = Some(schema);
            next_col_id = next_id;
        }

        // 4. Validate and reserve the new table name.
        let mut _name_reservation = None;
        if let Some(new_name) = &req.new_table_name {
            validate_identifier(new_name, self.config.max_identifier_length)
                .map_err(|e| CatalogError::InvalidSchema(format!("invalid table name: {e}")))?;
            _name_reservation = Some(self.reserve_table_name(new_name)?);
            table_guard.mutable().name = new_name.clone();
        }

        // 5. Alter the partitioning.
        let mut tablets_to_add: Vec<(Arc<TabletInfo>, CowWriteGuard<PersistedTablet>)> =
            Vec::new();
        let mut tablets_to_drop: Vec<Arc<TabletInfo>> = Vec::new();
        if !partition_steps.is_empty() {
            let mut existing = table.tablet_map();
            let mut staged: BTreeMap<Vec<u8>, (Arc<TabletInfo>, CowWriteGuard<PersistedTablet>)> =
                BTreeMap::new();
            for step in &partition_steps {
                match step {
                    AlterTableStep::AddRangePartition { ops } => {
                        let bound = decode_single_bound(ops)
                            .map_err(|e| CatalogError::Unknown(e.to_string()))?;
                        let partitions = create_partitions(&[], &[bound])
                            .map_err(|e| CatalogError::Unknown(e.to_string()))?;
                        for partition in partitions {
                            check_range_is_free(&existing, &staged, &partition)?;
                            let (tablet, guard) = TabletInfo::new_for_create(
                                &table,
                                generate_id(),
                                partition.clone(),
                            );
                            staged.insert(
                                partition.partition_key_start.clone(),
                                (tablet, guard),
                            );
                        }
                    }
                    AlterTableStep::DropRangePartition { ops } => {
                        let bound = decode_single_bound(ops)
                            .map_err(|e| CatalogError::Unknown(e.to_string()))?;
                        let partitions = create_partitions(&[], &[bound])
                            .map_err(|e| CatalogError::Unknown(e.to_string()))?;
                        for partition in partitions {
                            let start = &partition.partition_key_start;
                            let end = &partition.partition_key_end;
                            let found_existing = existing
                                .get(start)
                                .map(|t| &t.read().partition.partition_key_end == end)
                                .unwrap_or(false);
                            if found_existing {
                                if let Some(tablet) = existing.remove(start) {
                                    tablets_to_drop.push(tablet);
                                }
                                continue;
                            }
                            let found_staged = staged
                                .get(start)
                                .map(|(_, g)| &g.dirty().partition.partition_key_end == end)
                                .unwrap_or(false);
                            if found_staged {
                                if let Some((_, guard)) = staged.remove(start) {
                                    guard.abort();
                                }
                                continue;
                            }
                            return Err(CatalogError::Unknown(format!(
                                "no range partition found for drop range partition step {}",
                                partition.debug_string()
                            )));
                        }
                    }
                    _ => unreachable!("partition_steps only holds partition steps"),
                }
            }
            tablets_to_add = staged.into_values().collect();
        }

        let has_schema_changes = new_schema.is_some();
        let has_metadata_changes = has_schema_changes || req.new_table_name.is_some();
        let has_partitioning_changes =
            !tablets_to_add.is_empty() || !tablets_to_drop.is_empty();
        let has_metadata_changes_for_existing_tablets =
            has_metadata_changes && table.num_tablets() > tablets_to_drop.len();

        if !has_metadata_changes && !has_partitioning_changes {
            // Nothing to do.
            return Ok(AlterTableResponse { table_id: table.id().to_string() });
        }

        // 6. Serialize the schema change and bump the version.
        if has_metadata_changes_for_existing_tablets
            && table_guard.data().fully_applied_schema.is_none()
        {
            // Ongoing readers keep the pre-alter schema until every tablet
            // has acknowledged the new one.
            let snapshot = table_guard.dirty().schema.clone();
            table_guard.mutable().fully_applied_schema = Some(snapshot);
        }
        if let Some(schema) = new_schema {
            table_guard.mutable().schema = schema;
        }
        if has_metadata_changes {
            let dirty = table_guard.mutable();
            dirty.schema_version += 1;
            dirty.next_column_id = next_col_id;
        }
        if !tablets_to_add.is_empty() || has_metadata_changes_for_existing_tablets {
            let version = table_guard.dirty().schema_version;
            table_guard.mutable().set_state(
                TableState::Altering,
                format!("alter table version={version} at {}", now_unix_secs()),
            );
        }

        // 7. Persist: the table update, new tablets, and dropped tablets in
        // one write.
        let deletion_msg = format!("partition dropped at {}", now_unix_secs());
        let mut drop_lock = crate::state::lock_tablets_for_write(&tablets_to_drop).await;
        for tablet in &tablets_to_drop {
            drop_lock
                .guard_mut(tablet.id())
                .mutable()
                .set_state(TabletState::Deleted, deletion_msg.clone());
        }

        let mut actions = SysTableActions::default();
        if !tablets_to_add.is_empty() || has_metadata_changes {
            actions
                .tables_to_update
                .push((table.id().to_string(), table_guard.dirty().clone()));
        }
        actions.tablets_to_add = tablets_to_add
            .iter()
            .map(|(t, g)| (t.id().to_string(), g.dirty().clone()))
            .collect();
        actions.tablets_to_update = drop_lock
            .iter()
            .map(|(id, guard)| (id.clone(), guard.dirty().clone()))
            .collect();

        if let Err(err) = self.sys.write(actions).await {
            tracing::warn!(table = %table.describe(), error = %err, "AlterTable failed to persist");
            return Err(CatalogError::from_sys_write(err));
        }

        // 8. Commit the in-memory state.
        //
        // New tablets commit first: they are not yet reachable through any
        // index, so publishing them is safe without the global lock.
        let new_tablets: Vec<Arc<TabletInfo>> = tablets_to_add
            .into_iter()
            .map(|(tablet, guard)| {
                guard.commit();
                tablet
            })
            .collect();

        {
            let mut index = self.index.write().unwrap();
            if let Some(new_name) = &req.new_table_name {
                index.tables_by_name.remove(&old_name);
                index
                    .tables_by_name
                    .insert(new_name.clone(), Arc::clone(&table));
            }
            for tablet in &new_tablets {
                index.tablets.insert(tablet.id().to_string(), Arc::clone(tablet));
            }
        }

        // Make the new tablets visible through the table and drop the old
        // ones, then commit the drops so location lookups that already
        // returned a dropped tablet retry into the new layout.
        table.add_remove_tablets(&new_tablets, &tablets_to_drop);
        drop_lock.commit_all();
        table_guard.commit();

        self.send_alter_table_tasks(&table);
        for tablet in &tablets_to_drop {
            let record = tablet.read();
            self.send_delete_replica_tasks(
                Some(Arc::clone(&table)),
                tablet.id(),
                &record,
                &deletion_msg,
            );
        }

        self.wake_bg();
        Ok(AlterTableResponse { table_id: table.id().to_string() })
    }

    pub async fn is_alter_table_done(
        &self,
        table_ref: &TableRef,
    ) -> Result<IsAlterTableDoneResponse, CatalogError> {
        let _leader = self.leader_shared()?;
        let (_, record) = self
            .find_and_read_table(table_ref)?
            .ok_or_else(|| CatalogError::TableNotFound(describe_ref(table_ref)))?;
        check_table_usable(&record, table_ref)?;
        Ok(IsAlterTableDoneResponse {
            schema_version: record.schema_version,
            done: record.state != TableState::Altering,
        })
    }

    // -----------------------------------------------------------------------
    // Read-only handlers
    // -----------------------------------------------------------------------

    pub async fn get_table_schema(
        &self,
        table_ref: &TableRef,
    ) -> Result<GetTableSchemaResponse, CatalogError> {
        let _leader = self.leader_shared()?;
        let (table, record) = self
            .find_and_read_table(table_ref)?
            .ok_or_else(|| CatalogError::TableNotFound(describe_ref(table_ref)))?;
        check_table_usable(&record, table_ref)?;
        // While an alter is in progress the fully-applied schema is the one
        // every tablet is guaranteed to accept.
        let schema = record
            .fully_applied_schema
            .clone()
            .unwrap_or_else(|| record.schema.clone());
        Ok(GetTableSchemaResponse {
            table_id: table.id().to_string(),
            table_name: record.name.clone(),
            schema,
            partition_schema: record.partition_schema.clone(),
            num_replicas: record.num_replicas,
        })
    }

    pub async fn list_tables(
        &self,
        req: &ListTablesRequest,
    ) -> Result<ListTablesResponse, CatalogError> {
        let _leader = self.leader_shared()?;
        let tables: Vec<Arc<TableInfo>> = {
            let index = self.index.read().unwrap();
            index.tables_by_name.values().cloned().collect()
        };
        let mut out = Vec::new();
        for table in tables {
            let record = table.read();
            if !record.is_running() {
                continue;
            }
            if let Some(filter) = &req.name_filter {
                if !record.name.contains(filter.as_str()) {
                    continue;
                }
            }
            out.push(ListedTable { id: table.id().to_string(), name: record.name.clone() });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(ListTablesResponse { tables: out })
    }

    fn build_locations_for_tablet(
        &self,
        tablet: &Arc<TabletInfo>,
        filter: ReplicaTypeFilter,
    ) -> Result<TabletLocations, CatalogError> {
        let record = tablet.read();
        if record.is_deleted() {
            // Happens when a range partition is dropped concurrently; the
            // client retries into the new layout.
            return Err(CatalogError::TabletNotRunning(record.state_msg.clone()));
        }
        if !record.is_running() {
            return Err(CatalogError::TabletNotRunning(format!(
                "tablet {} is not running",
                tablet.id()
            )));
        }
        // Running tablets always carry a consensus state.
        let Some(cstate) = &record.consensus else {
            return Err(CatalogError::TabletNotRunning(format!(
                "tablet {} has no consensus state",
                tablet.id()
            )));
        };
        let mut replicas = Vec::new();
        for peer in &cstate.committed_config.peers {
            if filter == ReplicaTypeFilter::VoterReplica && peer.member_type != MemberType::Voter
            {
                continue;
            }
            // Prefer the worker's current registration; fall back to the
            // address recorded in the config for workers that have never
            // registered here.
            let addr = self
                .workers
                .lookup(&peer.uuid)
                .map(|w| w.addr().to_string())
                .unwrap_or_else(|| peer.last_known_addr.clone());
            replicas.push(ReplicaLocation {
                uuid: peer.uuid.clone(),
                addr,
                role: consensus_role(&peer.uuid, cstate),
            });
        }
        Ok(TabletLocations {
            tablet_id: tablet.id().to_string(),
            partition: record.partition.clone(),
            replicas,
        })
    }

    pub async fn get_table_locations(
        &self,
        req: &GetTableLocationsRequest,
    ) -> Result<GetTableLocationsResponse, CatalogError> {
        let _leader = self.leader_shared()?;
        if let (Some(start), Some(end)) = (&req.partition_key_start, &req.partition_key_end) {
            if start > end {
                return Err(CatalogError::Unknown(
                    "start partition key is greater than the end partition key".to_string(),
                ));
            }
        }
        if req.max_returned_locations == 0 {
            return Err(CatalogError::Unknown(
                "max_returned_locations must be greater than 0".to_string(),
            ));
        }

        let (table, record) = self
            .find_and_read_table(&req.table)?
            .ok_or_else(|| CatalogError::TableNotFound(describe_ref(&req.table)))?;
        check_table_usable(&record, &req.table)?;

        let tablets = table.tablets_in_range(
            req.partition_key_start.as_deref(),
            req.partition_key_end.as_deref(),
            req.max_returned_locations,
        );
        let mut tablet_locations = Vec::with_capacity(tablets.len());
        for tablet in &tablets {
            tablet_locations.push(self.build_locations_for_tablet(tablet, req.replica_type_filter)?);
        }
        Ok(GetTableLocationsResponse {
            tablet_locations,
            ttl: self.config.table_locations_ttl,
        })
    }

    pub async fn get_tablet_locations(
        &self,
        tablet_id: &str,
        filter: ReplicaTypeFilter,
    ) -> Result<TabletLocations, CatalogError> {
        let _leader = self.leader_shared()?;
        let tablet = {
            let index = self.index.read().unwrap();
            index.tablets.get(tablet_id).cloned()
        };
        let Some(tablet) = tablet else {
            return Err(CatalogError::TabletNotRunning(format!(
                "unknown tablet {tablet_id}"
            )));
        };
        self.build_locations_for_tablet(&tablet, filter)
    }
}

fn describe_ref(table_ref: &TableRef) -> String {
    match (&table_ref.table_id, &table_ref.table_name) {
        (Some(id), Some(name)) => format!("the table does not exist: id={id}, name={name}"),
        (Some(id), None) => format!("the table does not exist: id={id}"),
        (None, Some(name)) => format!("the table does not exist: name={name}"),
        (None, None) => "the table does not exist".to_string(),
    }
}

/// Reject operations against deleted or not-yet-running tables.
fn check_table_usable(record: &PersistedTable, table_ref: &TableRef) -> Result<(), CatalogError> {
    if record.is_deleted() {
        return Err(CatalogError::TableNotFound(record.state_msg.clone()));
    }
    if !record.is_running() {
        return Err(CatalogError::TableNotFound(format!(
            "the table is not running: {}",
            describe_ref(table_ref)
        )));
    }
    Ok(())
}

fn apply_schema_step(builder: &mut SchemaBuilder, step: &AlterTableStep) -> anyhow::Result<()> {
    match step {
        AlterTableStep::AddColumn { column } => {
            if column.id.is_some() {
                anyhow::bail!("column '{}': client should not specify column ID", column.name);
            }
            let mut column = column.clone();
            process_column_defaults(&mut column)?;
            if !column.is_nullable && column.read_default.is_none() {
                anyhow::bail!("column '{}': NOT NULL columns must have a default", column.name);
            }
            builder.add_column(column)
        }
        AlterTableStep::DropColumn { name } => builder.remove_column(name),
        AlterTableStep::RenameColumn { old_name, new_name } => {
            builder.rename_column(old_name, new_name)
        }
        AlterTableStep::AlterColumn { delta } => builder.apply_delta(delta),
        _ => anyhow::bail!("not a schema step"),
    }
}

/// Reject a new range partition overlapping an existing or staged tablet.
fn check_range_is_free(
    existing: &BTreeMap<Vec<u8>, Arc<TabletInfo>>,
    staged: &BTreeMap<Vec<u8>, (Arc<TabletInfo>, CowWriteGuard<PersistedTablet>)>,
    partition: &Partition,
) -> Result<(), CatalogError> {
    let lower = &partition.partition_key_start;
    let upper = &partition.partition_key_end;

    let conflict = |which: &str| {
        Err(CatalogError::Unknown(format!(
            "new range partition {} conflicts with {which} range partition",
            partition.debug_string()
        )))
    };

    // The first tablet starting after the new lower bound must start at or
    // past the new upper bound.
    use std::ops::Bound;
    if let Some((next_start, _)) = existing
        .range::<Vec<u8>, _>((Bound::Excluded(lower), Bound::Unbounded))
        .next()
    {
        if upper.is_empty() || next_start < upper {
            return conflict("existing");
        }
    }
    // The last tablet starting at or before the lower bound must end at or
    // before it.
    if let Some((_, tablet)) = existing.range::<Vec<u8>, _>(..=lower.clone()).next_back() {
        let end = tablet.read().partition.partition_key_end.clone();
        if end.is_empty() || &end > lower {
            return conflict("existing");
        }
    }

    if let Some((next_start, _)) = staged
        .range::<Vec<u8>, _>((Bound::Excluded(lower), Bound::Unbounded))
        .next()
    {
        if upper.is_empty() || next_start < upper {
            return conflict("another new");
        }
    }
    if let Some((_, (_, guard))) = staged.range::<Vec<u8>, _>(..=lower.clone()).next_back() {
        let end = &guard.dirty().partition.partition_key_end;
        if end.is_empty() || end > lower {
            return conflict("another new");
        }
    }

    Ok(())
}
