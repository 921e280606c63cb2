//! Shared in-memory collaborators for catalog manager integration tests:
//! a system table, a scripted consensus handle, and recording worker
//! proxies.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

use lode_master::catalog::{CatalogManager, CatalogManagerContext};
use lode_master::config::MasterConfig;
use lode_master::consensus::{ConsensusState, RaftConfig};
use lode_master::report::{ReportedReplicaState, ReportedTablet};
use lode_master::state::{PersistedTable, PersistedTablet, TableId, TabletId};
use lode_master::sys_table::{
    CatchupError, SigningKeyVisitor, SysLeadership, SysTableActions, SysTableError,
    SysTabletConsensus, SystemTable, TableVisitor, TabletVisitor,
};
use lode_master::tokens::{CaBundle, CertAuthority, RandomKeySource, TokenSigner, TokenSigningKey};
use lode_master::workers::{
    AlterSchemaRequest, ChangeConfigRequest, CreateTabletRequest, DeleteTabletRequest,
    ReplicaDataState, RpcError, WorkerDescriptor, WorkerManager, WorkerProxy, WorkerResponse,
};

pub const MASTER_UUID: &str = "master-1";

#[derive(Default)]
struct MemState {
    tables: BTreeMap<TableId, PersistedTable>,
    tablets: BTreeMap<TabletId, PersistedTablet>,
    tsks: BTreeMap<i64, TokenSigningKey>,
    ca: Option<CaBundle>,
    mutations_applied: u64,
}

/// In-memory system table. Updates whose record equals the stored one are
/// short-circuited and do not count as applied mutations.
pub struct MemSystemTable {
    state: Mutex<MemState>,
    fail_next_write: Mutex<bool>,
    write_gate: Mutex<Option<oneshot::Receiver<()>>>,
    fail_next_ca_add: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl MemSystemTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MemState::default()),
            fail_next_write: Mutex::new(false),
            write_gate: Mutex::new(None),
            fail_next_ca_add: Mutex::new(None),
        })
    }

    /// Make the next batched write fail as if this master lost system-tablet
    /// leadership.
    pub fn fail_next_write_not_leader(&self) {
        *self.fail_next_write.lock().unwrap() = true;
    }

    /// Make the next CA record insertion fail as a leadership loss, running
    /// `before_failing` (e.g. to advance the scripted term) first.
    pub fn fail_next_ca_add(&self, before_failing: impl FnOnce() + Send + 'static) {
        *self.fail_next_ca_add.lock().unwrap() = Some(Box::new(before_failing));
    }

    /// Hold the next batched write open until the returned sender fires.
    pub fn hold_next_write(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.write_gate.lock().unwrap() = Some(rx);
        tx
    }

    /// Whether a held write gate is still waiting to be entered.
    pub fn write_gate_pending(&self) -> bool {
        self.write_gate.lock().unwrap().is_some()
    }

    pub fn mutations_applied(&self) -> u64 {
        self.state.lock().unwrap().mutations_applied
    }

    pub fn table_record(&self, table_id: &str) -> Option<PersistedTable> {
        self.state.lock().unwrap().tables.get(table_id).cloned()
    }

    pub fn tablet_records(&self) -> Vec<(TabletId, PersistedTablet)> {
        self.state
            .lock()
            .unwrap()
            .tablets
            .iter()
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect()
    }

    pub fn tsk_seqs(&self) -> Vec<i64> {
        self.state.lock().unwrap().tsks.keys().copied().collect()
    }

    pub fn insert_tsk(&self, key: TokenSigningKey) {
        self.state.lock().unwrap().tsks.insert(key.seq_num, key);
    }

    pub fn ca(&self) -> Option<CaBundle> {
        self.state.lock().unwrap().ca.clone()
    }
}

#[async_trait]
impl SystemTable for MemSystemTable {
    async fn write(&self, actions: SysTableActions) -> Result<(), SysTableError> {
        let gate = self.write_gate.lock().unwrap().take();
        if let Some(rx) = gate {
            let _ = rx.await;
        }
        if std::mem::take(&mut *self.fail_next_write.lock().unwrap()) {
            return Err(SysTableError::NotLeader("injected leadership loss".to_string()));
        }
        let mut state = self.state.lock().unwrap();
        for (id, record) in actions.tables_to_add {
            state.tables.insert(id, record);
            state.mutations_applied += 1;
        }
        for (id, record) in actions.tables_to_update {
            if state.tables.get(&id) != Some(&record) {
                state.tables.insert(id, record);
                state.mutations_applied += 1;
            }
        }
        for (id, record) in actions.tablets_to_add {
            state.tablets.insert(id, record);
            state.mutations_applied += 1;
        }
        for (id, record) in actions.tablets_to_update {
            if state.tablets.get(&id) != Some(&record) {
                state.tablets.insert(id, record);
                state.mutations_applied += 1;
            }
        }
        for key in actions.tsk_entries_to_add {
            state.tsks.insert(key.seq_num, key);
            state.mutations_applied += 1;
        }
        for seq in actions.tsk_entries_to_remove {
            if state.tsks.remove(&seq).is_some() {
                state.mutations_applied += 1;
            }
        }
        Ok(())
    }

    async fn visit_tables(
        &self,
        visitor: &mut (dyn TableVisitor + Send),
    ) -> Result<(), SysTableError> {
        let tables: Vec<(TableId, PersistedTable)> = {
            let state = self.state.lock().unwrap();
            state.tables.iter().map(|(id, r)| (id.clone(), r.clone())).collect()
        };
        for (id, record) in tables {
            visitor.visit_table(&id, record)?;
        }
        Ok(())
    }

    async fn visit_tablets(
        &self,
        visitor: &mut (dyn TabletVisitor + Send),
    ) -> Result<(), SysTableError> {
        let tablets: Vec<(TabletId, PersistedTablet)> = {
            let state = self.state.lock().unwrap();
            state.tablets.iter().map(|(id, r)| (id.clone(), r.clone())).collect()
        };
        for (id, record) in tablets {
            visitor.visit_tablet(&id, record)?;
        }
        Ok(())
    }

    async fn visit_signing_keys(
        &self,
        visitor: &mut (dyn SigningKeyVisitor + Send),
    ) -> Result<(), SysTableError> {
        let keys: Vec<TokenSigningKey> = {
            let state = self.state.lock().unwrap();
            state.tsks.values().cloned().collect()
        };
        for key in keys {
            visitor.visit_key(key)?;
        }
        Ok(())
    }

    async fn ca_entry(&self) -> Result<Option<CaBundle>, SysTableError> {
        Ok(self.state.lock().unwrap().ca.clone())
    }

    async fn add_ca_entry(&self, bundle: CaBundle) -> Result<(), SysTableError> {
        let hook = self.fail_next_ca_add.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
            return Err(SysTableError::NotLeader("injected leadership loss".to_string()));
        }
        self.state.lock().unwrap().ca = Some(bundle);
        Ok(())
    }

    async fn shutdown(&self) {}
}

/// Consensus handle whose leadership is set directly by tests.
pub struct ScriptedConsensus {
    leadership: Mutex<SysLeadership>,
}

impl ScriptedConsensus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            leadership: Mutex::new(SysLeadership { term: 0, leader_uuid: None }),
        })
    }

    pub fn set_leader(&self, term: i64, leader_uuid: Option<&str>) {
        *self.leadership.lock().unwrap() = SysLeadership {
            term,
            leader_uuid: leader_uuid.map(|s| s.to_string()),
        };
    }
}

#[async_trait]
impl SysTabletConsensus for ScriptedConsensus {
    fn leadership(&self) -> SysLeadership {
        self.leadership.lock().unwrap().clone()
    }

    async fn wait_for_catchup(&self, _timeout: Duration) -> Result<(), CatchupError> {
        Ok(())
    }

    async fn shutdown(&self) {}
}

#[derive(Clone, Debug)]
pub enum RecordedRpc {
    Create(CreateTabletRequest),
    Delete(DeleteTabletRequest),
    Alter(AlterSchemaRequest),
    ChangeConfig(ChangeConfigRequest),
}

/// Worker proxy that records every request and answers success.
#[derive(Default)]
pub struct RecordingProxy {
    rpcs: Mutex<Vec<RecordedRpc>>,
}

impl RecordingProxy {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn rpcs(&self) -> Vec<RecordedRpc> {
        self.rpcs.lock().unwrap().clone()
    }

    pub fn create_requests(&self) -> Vec<CreateTabletRequest> {
        self.rpcs()
            .into_iter()
            .filter_map(|rpc| match rpc {
                RecordedRpc::Create(req) => Some(req),
                _ => None,
            })
            .collect()
    }

    pub fn delete_requests(&self) -> Vec<DeleteTabletRequest> {
        self.rpcs()
            .into_iter()
            .filter_map(|rpc| match rpc {
                RecordedRpc::Delete(req) => Some(req),
                _ => None,
            })
            .collect()
    }

    pub fn alter_requests(&self) -> Vec<AlterSchemaRequest> {
        self.rpcs()
            .into_iter()
            .filter_map(|rpc| match rpc {
                RecordedRpc::Alter(req) => Some(req),
                _ => None,
            })
            .collect()
    }

    pub fn change_config_requests(&self) -> Vec<ChangeConfigRequest> {
        self.rpcs()
            .into_iter()
            .filter_map(|rpc| match rpc {
                RecordedRpc::ChangeConfig(req) => Some(req),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl WorkerProxy for RecordingProxy {
    async fn create_tablet(&self, req: CreateTabletRequest) -> Result<WorkerResponse, RpcError> {
        self.rpcs.lock().unwrap().push(RecordedRpc::Create(req));
        Ok(WorkerResponse::ok())
    }

    async fn delete_tablet(&self, req: DeleteTabletRequest) -> Result<WorkerResponse, RpcError> {
        self.rpcs.lock().unwrap().push(RecordedRpc::Delete(req));
        Ok(WorkerResponse::ok())
    }

    async fn alter_schema(&self, req: AlterSchemaRequest) -> Result<WorkerResponse, RpcError> {
        self.rpcs.lock().unwrap().push(RecordedRpc::Alter(req));
        Ok(WorkerResponse::ok())
    }

    async fn change_config(&self, req: ChangeConfigRequest) -> Result<WorkerResponse, RpcError> {
        self.rpcs.lock().unwrap().push(RecordedRpc::ChangeConfig(req));
        Ok(WorkerResponse::ok())
    }
}

pub struct TestCa {
    pub adopted: Mutex<Option<CaBundle>>,
    pub generated: AtomicUsize,
}

impl TestCa {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { adopted: Mutex::new(None), generated: AtomicUsize::new(0) })
    }

    pub fn adopted_bundle(&self) -> Option<CaBundle> {
        self.adopted.lock().unwrap().clone()
    }
}

impl CertAuthority for TestCa {
    fn generate(&self) -> anyhow::Result<CaBundle> {
        let n = self.generated.fetch_add(1, Ordering::Relaxed) as u8;
        Ok(CaBundle {
            private_key_der: vec![0xca, n],
            certificate_der: vec![0xce, n],
        })
    }

    fn adopt(&self, bundle: CaBundle) -> anyhow::Result<()> {
        *self.adopted.lock().unwrap() = Some(bundle);
        Ok(())
    }
}

pub struct Harness {
    pub catalog: Arc<CatalogManager>,
    pub sys: Arc<MemSystemTable>,
    pub consensus: Arc<ScriptedConsensus>,
    pub workers: Arc<WorkerManager>,
    pub proxies: Vec<Arc<RecordingProxy>>,
    pub ca: Arc<TestCa>,
    pub signer: Arc<TokenSigner>,
}

pub fn worker_uuid(i: usize) -> String {
    format!("ts-{i}")
}

pub async fn new_master(num_workers: usize) -> Harness {
    let mut config = MasterConfig::default();
    // Keep virtual-time polling loops from tripping the creation timeout.
    config.tablet_creation_timeout = Duration::from_secs(60 * 60);
    new_master_with_config(num_workers, config).await
}

pub async fn new_master_with_config(num_workers: usize, config: MasterConfig) -> Harness {
    let sys = MemSystemTable::new();
    let consensus = ScriptedConsensus::new();
    let workers = Arc::new(WorkerManager::new());
    let mut proxies = Vec::with_capacity(num_workers);
    for i in 0..num_workers {
        let proxy = RecordingProxy::new();
        let uuid = worker_uuid(i);
        workers.register(WorkerDescriptor::new(
            uuid.clone(),
            format!("{uuid}.example.com:7050"),
            proxy.clone(),
        ));
        proxies.push(proxy);
    }
    let ca = TestCa::new();
    let signer = Arc::new(TokenSigner::new(
        config.tsk_rotation_interval,
        config.tsk_validity_period,
        Arc::new(RandomKeySource),
    ));

    let catalog = CatalogManager::new(CatalogManagerContext {
        uuid: MASTER_UUID.to_string(),
        config,
        sys_table: sys.clone(),
        sys_consensus: consensus.clone(),
        workers: Arc::clone(&workers),
        cert_authority: ca.clone(),
        signer: Arc::clone(&signer),
    });
    catalog.init().expect("catalog init");

    Harness { catalog, sys, consensus, workers, proxies, ca, signer }
}

impl Harness {
    /// Make this master the system-tablet leader for `term` and wait for
    /// leadership preparation to finish.
    pub async fn become_leader(&self, term: i64) {
        self.consensus.set_leader(term, Some(MASTER_UUID));
        self.catalog.elected_as_leader();
        for _ in 0..5000 {
            if self.catalog.leader_ready_term() == term {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("master did not become ready for term {term}");
    }

    pub fn proxy(&self, i: usize) -> &Arc<RecordingProxy> {
        &self.proxies[i]
    }

    pub fn proxy_for(&self, uuid: &str) -> &Arc<RecordingProxy> {
        let idx: usize = uuid
            .strip_prefix("ts-")
            .and_then(|n| n.parse().ok())
            .expect("worker uuid of the form ts-N");
        &self.proxies[idx]
    }

    pub fn all_create_requests(&self) -> Vec<CreateTabletRequest> {
        self.proxies.iter().flat_map(|p| p.create_requests()).collect()
    }

    pub fn all_delete_requests(&self) -> Vec<DeleteTabletRequest> {
        self.proxies.iter().flat_map(|p| p.delete_requests()).collect()
    }

    /// Poll until `cond` holds; virtual time advances while polling.
    pub async fn wait_until(&self, what: &str, cond: impl Fn() -> bool) {
        for _ in 0..5000 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("timed out waiting for: {what}");
    }

    /// Report every tablet of the catalog as RUNNING, each from its first
    /// assigned peer acting as leader in `term`, with config opid `opid`.
    pub async fn report_all_running(&self, term: i64, opid_index: i64) {
        for (tablet_id, record) in self.sys.tablet_records() {
            let Some(cstate) = record.consensus else {
                continue;
            };
            if record.state == lode_master::state::TabletState::Deleted
                || record.state == lode_master::state::TabletState::Replaced
            {
                continue;
            }
            let mut config = cstate.committed_config.clone();
            config.opid_index = Some(opid_index);
            let leader = config.peers[0].uuid.clone();
            let report = running_report(&tablet_id, config, &leader, term);
            self.catalog
                .process_tablet_report(&leader, &[report])
                .await
                .expect("process report");
        }
    }
}

pub fn running_report(
    tablet_id: &str,
    committed_config: RaftConfig,
    leader: &str,
    term: i64,
) -> ReportedTablet {
    ReportedTablet {
        tablet_id: tablet_id.to_string(),
        state: ReportedReplicaState::Running,
        data_state: ReplicaDataState::Ready,
        schema_version: Some(0),
        consensus: Some(ConsensusState {
            current_term: term,
            leader_uuid: Some(leader.to_string()),
            committed_config,
            has_pending_config: false,
        }),
        error: None,
    }
}
