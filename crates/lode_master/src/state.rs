//! In-memory table and tablet state.
//!
//! Each entity pairs a persisted record held in a copy-on-write cell with
//! runtime-only bookkeeping. A table owns its tablets through an ordered
//! partition-key map and tracks, per reported schema version, how many of its
//! tablets run that version; tablets keep a weak back-reference to their
//! table.
//!
//! Locking rules: read locks are wait-free snapshots and may be taken in any
//! order. Write locks on a table and its tablets are acquired table first,
//! then tablets in tablet-ID order ([`lock_tablets_for_write`]), and
//! committed in reverse (tablets before their table).

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::consensus::ConsensusState;
use crate::cow::{CowCell, CowReadGuard, CowWriteGuard};
use crate::partition::{Partition, PartitionSchema};
use crate::schema::Schema;
use crate::tasks::TaskHandle;

pub type TableId = String;
pub type TabletId = String;

/// Sentinel reported schema version for tablets that have never reported.
/// Sorts below every real version.
pub const NOT_YET_REPORTED: i64 = -1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableState {
    Preparing,
    Running,
    Altering,
    Removed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TabletState {
    Preparing,
    Creating,
    Running,
    Replaced,
    Deleted,
}

/// The durable portion of a table, as stored in the system table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistedTable {
    pub name: String,
    pub schema: Schema,
    pub schema_version: u32,
    pub partition_schema: PartitionSchema,
    pub num_replicas: i32,
    pub next_column_id: i32,
    pub state: TableState,
    pub state_msg: String,
    /// While an alter is in flight, the last schema every tablet has
    /// acknowledged; readers see this one until the alter completes.
    pub fully_applied_schema: Option<Schema>,
}

impl PersistedTable {
    pub fn set_state(&mut self, state: TableState, msg: impl Into<String>) {
        self.state = state;
        self.state_msg = msg.into();
    }

    pub fn is_deleted(&self) -> bool {
        self.state == TableState::Removed
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, TableState::Running | TableState::Altering)
    }
}

/// The durable portion of a tablet.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistedTablet {
    pub table_id: TableId,
    pub state: TabletState,
    pub state_msg: String,
    pub partition: Partition,
    /// Last-known consensus state, health reports stripped.
    pub consensus: Option<ConsensusState>,
}

impl PersistedTablet {
    pub fn new(table_id: TableId, partition: Partition) -> Self {
        Self {
            table_id,
            state: TabletState::Preparing,
            state_msg: String::new(),
            partition,
            consensus: None,
        }
    }

    pub fn set_state(&mut self, state: TabletState, msg: impl Into<String>) {
        self.state = state;
        self.state_msg = msg.into();
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self.state, TabletState::Deleted | TabletState::Replaced)
    }

    pub fn is_running(&self) -> bool {
        self.state == TabletState::Running
    }
}

struct TableRuntime {
    /// Tablets by partition-key start. Intervals are disjoint.
    tablet_map: BTreeMap<Vec<u8>, Arc<TabletInfo>>,
    /// How many tablets currently report each schema version. Totals always
    /// equal the tablet map size.
    schema_version_counts: BTreeMap<i64, usize>,
    pending_tasks: HashMap<u64, TaskHandle>,
}

/// A table and its runtime bookkeeping.
pub struct TableInfo {
    id: TableId,
    metadata: CowCell<PersistedTable>,
    runtime: RwLock<TableRuntime>,
}

impl TableInfo {
    pub fn new(id: TableId, record: PersistedTable) -> Arc<Self> {
        Arc::new(Self {
            id,
            metadata: CowCell::new(record),
            runtime: RwLock::new(TableRuntime {
                tablet_map: BTreeMap::new(),
                schema_version_counts: BTreeMap::new(),
                pending_tasks: HashMap::new(),
            }),
        })
    }

    /// Create a table whose record is staged under a write lock, the state
    /// freshly created entities are in until their first persist.
    pub fn new_for_create(
        id: TableId,
        record: PersistedTable,
    ) -> (Arc<Self>, CowWriteGuard<PersistedTable>) {
        let (metadata, guard) = CowCell::new_locked(record);
        let info = Arc::new(Self {
            id,
            metadata,
            runtime: RwLock::new(TableRuntime {
                tablet_map: BTreeMap::new(),
                schema_version_counts: BTreeMap::new(),
                pending_tasks: HashMap::new(),
            }),
        });
        (info, guard)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn metadata(&self) -> &CowCell<PersistedTable> {
        &self.metadata
    }

    pub fn read(&self) -> CowReadGuard<PersistedTable> {
        self.metadata.read()
    }

    pub fn describe(&self) -> String {
        format!("{} [id={}]", self.read().name, self.id)
    }

    pub fn num_tablets(&self) -> usize {
        self.runtime.read().unwrap().tablet_map.len()
    }

    /// All tablets in partition-key order.
    pub fn all_tablets(&self) -> Vec<Arc<TabletInfo>> {
        self.runtime.read().unwrap().tablet_map.values().cloned().collect()
    }

    /// Snapshot of the partition-key map.
    pub fn tablet_map(&self) -> BTreeMap<Vec<u8>, Arc<TabletInfo>> {
        self.runtime.read().unwrap().tablet_map.clone()
    }

    /// Tablets intersecting `[start, end)`, capped at `max`. An absent start
    /// begins at the first tablet; an absent end runs to the last.
    pub fn tablets_in_range(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        max: usize,
    ) -> Vec<Arc<TabletInfo>> {
        let runtime = self.runtime.read().unwrap();
        let lower = match start {
            Some(start) => {
                // The last tablet starting at or before `start` covers it.
                match runtime
                    .tablet_map
                    .range::<[u8], _>((std::ops::Bound::Unbounded, std::ops::Bound::Included(start)))
                    .next_back()
                    .map(|(k, _)| k.clone())
                {
                    Some(key) => key,
                    None => start.to_vec(),
                }
            }
            None => Vec::new(),
        };
        let mut out = Vec::new();
        for (key, tablet) in runtime.tablet_map.range(lower..) {
            if let Some(end) = end {
                if key.as_slice() > end {
                    break;
                }
            }
            if out.len() >= max {
                break;
            }
            out.push(Arc::clone(tablet));
        }
        out
    }

    /// Apply additions and removals to the partition map, keeping the
    /// schema-version multiset balanced. Reads the tablets' clean state, so
    /// callers pass freshly committed tablets.
    pub fn add_remove_tablets(&self, to_add: &[Arc<TabletInfo>], to_drop: &[Arc<TabletInfo>]) {
        let mut runtime = self.runtime.write().unwrap();
        for tablet in to_drop {
            let key = tablet.read().partition.partition_key_start.clone();
            if runtime.tablet_map.remove(&key).is_some() {
                let version = tablet.reported_schema_version();
                decrement_version_count(&mut runtime.schema_version_counts, version);
            }
        }
        for tablet in to_add {
            let key = tablet.read().partition.partition_key_start.clone();
            if let Some(old) = runtime.tablet_map.insert(key, Arc::clone(tablet)) {
                tracing::debug!(
                    old_tablet = old.id(),
                    new_tablet = tablet.id(),
                    "replaced tablet in partition map"
                );
                let version = old.reported_schema_version();
                decrement_version_count(&mut runtime.schema_version_counts, version);
            }
            let version = tablet.reported_schema_version();
            *runtime.schema_version_counts.entry(version).or_insert(0) += 1;
        }
    }

    /// Whether any tablet has yet to acknowledge `version`.
    pub fn is_alter_in_progress(&self, version: u32) -> bool {
        let runtime = self.runtime.read().unwrap();
        match runtime.schema_version_counts.keys().next() {
            // The lowest key is either NOT_YET_REPORTED or the lowest version
            // some tablet still runs.
            Some(&lowest) => lowest < version as i64,
            None => false,
        }
    }

    /// Whether any tablet in the partition map is not yet running.
    pub fn is_create_in_progress(&self) -> bool {
        let runtime = self.runtime.read().unwrap();
        runtime.tablet_map.values().any(|t| !t.read().is_running())
    }

    pub(crate) fn add_task(&self, handle: TaskHandle) {
        self.runtime.write().unwrap().pending_tasks.insert(handle.id(), handle);
    }

    pub(crate) fn remove_task(&self, task_id: u64) {
        self.runtime.write().unwrap().pending_tasks.remove(&task_id);
    }

    pub fn pending_task_count(&self) -> usize {
        self.runtime.read().unwrap().pending_tasks.len()
    }

    /// Abort every pending task on this table.
    pub fn abort_tasks(&self) {
        let handles: Vec<TaskHandle> = {
            let runtime = self.runtime.read().unwrap();
            runtime.pending_tasks.values().cloned().collect()
        };
        for handle in handles {
            handle.abort();
        }
    }

    /// Wait for all pending tasks to unregister themselves.
    pub async fn wait_tasks_done(&self) {
        let mut wait = Duration::from_millis(5);
        while self.pending_task_count() > 0 {
            tokio::time::sleep(wait).await;
            wait = (wait * 5 / 4).min(Duration::from_secs(10));
        }
    }

    /// Record `tablet`'s newly reported version, keeping the multiset
    /// balanced. Table runtime lock first, then the tablet's version slot.
    fn update_reported_version(&self, tablet: &Arc<TabletInfo>, key_start: &[u8], version: i64) {
        let mut runtime = self.runtime.write().unwrap();
        let mut slot = tablet.reported_schema_version.lock().unwrap();
        let old = *slot;
        if version <= old {
            return;
        }
        // The tablet may have been dropped from the partition map (or its
        // range replaced with a new tablet) before we got the table lock.
        match runtime.tablet_map.get(key_start) {
            Some(current) if Arc::ptr_eq(current, tablet) => {}
            _ => {
                tracing::debug!(
                    tablet_id = tablet.id(),
                    version,
                    "schema version report for tablet no longer in its table's partition map"
                );
                return;
            }
        }
        *slot = version;
        decrement_version_count(&mut runtime.schema_version_counts, old);
        *runtime.schema_version_counts.entry(version).or_insert(0) += 1;
    }
}

fn decrement_version_count(counts: &mut BTreeMap<i64, usize>, version: i64) {
    if let Some(count) = counts.get_mut(&version) {
        *count -= 1;
        if *count == 0 {
            counts.remove(&version);
        }
    }
}

/// A tablet and its runtime bookkeeping.
pub struct TabletInfo {
    id: TabletId,
    table: Weak<TableInfo>,
    metadata: CowCell<PersistedTablet>,
    last_create_time: Mutex<Instant>,
    reported_schema_version: Mutex<i64>,
}

impl TabletInfo {
    pub fn new(table: &Arc<TableInfo>, id: TabletId, record: PersistedTablet) -> Arc<Self> {
        Arc::new(Self {
            id,
            table: Arc::downgrade(table),
            metadata: CowCell::new(record),
            last_create_time: Mutex::new(Instant::now()),
            reported_schema_version: Mutex::new(NOT_YET_REPORTED),
        })
    }

    /// Create a tablet staged under a write lock, in `Preparing` state.
    pub fn new_for_create(
        table: &Arc<TableInfo>,
        id: TabletId,
        partition: Partition,
    ) -> (Arc<Self>, CowWriteGuard<PersistedTablet>) {
        let record = PersistedTablet::new(table.id().to_string(), partition);
        let (metadata, guard) = CowCell::new_locked(record);
        let info = Arc::new(Self {
            id,
            table: Arc::downgrade(table),
            metadata,
            last_create_time: Mutex::new(Instant::now()),
            reported_schema_version: Mutex::new(NOT_YET_REPORTED),
        });
        (info, guard)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn table(&self) -> Option<Arc<TableInfo>> {
        self.table.upgrade()
    }

    pub fn metadata(&self) -> &CowCell<PersistedTablet> {
        &self.metadata
    }

    pub fn read(&self) -> CowReadGuard<PersistedTablet> {
        self.metadata.read()
    }

    pub fn describe(&self) -> String {
        match self.table() {
            Some(table) => format!("{} (table {})", self.id, table.describe()),
            None => format!("{} (table missing)", self.id),
        }
    }

    pub fn last_create_time(&self) -> Instant {
        *self.last_create_time.lock().unwrap()
    }

    pub fn set_last_create_time(&self, when: Instant) {
        *self.last_create_time.lock().unwrap() = when;
    }

    pub fn reported_schema_version(&self) -> i64 {
        *self.reported_schema_version.lock().unwrap()
    }

    /// Record the schema version this tablet reported, rebalancing the
    /// owning table's version multiset. Versions never move backwards.
    pub fn set_reported_schema_version(self: &Arc<Self>, version: i64) {
        {
            // Fast path: no version change.
            let current = self.reported_schema_version.lock().unwrap();
            if version <= *current {
                return;
            }
        }
        let Some(table) = self.table() else {
            return;
        };
        // The partition key is immutable, so a local copy is safe.
        let key_start = self.read().partition.partition_key_start.clone();
        table.update_reported_version(self, &key_start, version);
    }
}

/// Write locks for a set of tablets, acquired in tablet-ID order and
/// committed in reverse.
pub struct TabletGroupLock {
    guards: BTreeMap<TabletId, CowWriteGuard<PersistedTablet>>,
}

/// Group-write-lock `tablets`. Duplicates are locked once.
pub async fn lock_tablets_for_write(tablets: &[Arc<TabletInfo>]) -> TabletGroupLock {
    let mut by_id: BTreeMap<TabletId, Arc<TabletInfo>> = BTreeMap::new();
    for tablet in tablets {
        by_id.entry(tablet.id().to_string()).or_insert_with(|| Arc::clone(tablet));
    }
    let mut guards = BTreeMap::new();
    for (id, tablet) in by_id {
        let guard = tablet.metadata().write().await;
        guards.insert(id, guard);
    }
    TabletGroupLock { guards }
}

impl TabletGroupLock {
    pub fn contains(&self, tablet_id: &str) -> bool {
        self.guards.contains_key(tablet_id)
    }

    pub fn guard(&self, tablet_id: &str) -> &CowWriteGuard<PersistedTablet> {
        &self.guards[tablet_id]
    }

    pub fn guard_mut(&mut self, tablet_id: &str) -> &mut CowWriteGuard<PersistedTablet> {
        self.guards
            .get_mut(tablet_id)
            .expect("tablet not part of this group lock")
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TabletId, &CowWriteGuard<PersistedTablet>)> {
        self.guards.iter()
    }

    pub fn commit_all(self) {
        for (_, guard) in self.guards.into_iter().rev() {
            guard.commit();
        }
    }

    /// Drop all locks without publishing the dirty copies.
    pub fn abort_all(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnSchema, ColumnType};

    fn table_record(name: &str) -> PersistedTable {
        let schema = Schema::new(vec![ColumnSchema::new("key", ColumnType::Int64)], 1)
            .with_assigned_ids();
        PersistedTable {
            name: name.to_string(),
            partition_schema: PartitionSchema::default_for(&schema),
            schema,
            schema_version: 0,
            num_replicas: 3,
            next_column_id: 1,
            state: TableState::Running,
            state_msg: String::new(),
            fully_applied_schema: None,
        }
    }

    fn add_tablet(table: &Arc<TableInfo>, id: &str, start: &[u8], end: &[u8]) -> Arc<TabletInfo> {
        let mut record =
            PersistedTablet::new(table.id().to_string(), Partition::new(start.to_vec(), end.to_vec()));
        record.set_state(TabletState::Running, "running");
        let tablet = TabletInfo::new(table, id.to_string(), record);
        table.add_remove_tablets(&[Arc::clone(&tablet)], &[]);
        tablet
    }

    #[tokio::test]
    async fn version_multiset_tracks_tablet_count() {
        let table = TableInfo::new("t1".to_string(), table_record("t"));
        let a = add_tablet(&table, "ta", b"", b"m");
        let b = add_tablet(&table, "tb", b"m", b"");

        // Both tablets start unreported.
        assert!(table.is_alter_in_progress(0));

        a.set_reported_schema_version(0);
        b.set_reported_schema_version(0);
        assert!(!table.is_alter_in_progress(0));
        assert!(table.is_alter_in_progress(1));

        a.set_reported_schema_version(1);
        assert!(table.is_alter_in_progress(1), "tb still runs version 0");
        b.set_reported_schema_version(1);
        assert!(!table.is_alter_in_progress(1));

        // Reports never move a tablet's version backwards.
        b.set_reported_schema_version(0);
        assert!(!table.is_alter_in_progress(1));
    }

    #[tokio::test]
    async fn dropping_a_tablet_rebalances_the_multiset() {
        let table = TableInfo::new("t1".to_string(), table_record("t"));
        let a = add_tablet(&table, "ta", b"", b"m");
        let b = add_tablet(&table, "tb", b"m", b"");
        a.set_reported_schema_version(2);

        table.add_remove_tablets(&[], &[Arc::clone(&a)]);
        assert_eq!(table.num_tablets(), 1);
        // Only tb remains, unreported.
        assert!(table.is_alter_in_progress(0));
        table.add_remove_tablets(&[], &[b]);
        assert!(!table.is_alter_in_progress(5), "empty tables have no pending alters");
    }

    #[tokio::test]
    async fn range_queries_cover_the_start_key_interval() {
        let table = TableInfo::new("t1".to_string(), table_record("t"));
        add_tablet(&table, "ta", b"", b"f");
        add_tablet(&table, "tb", b"f", b"p");
        add_tablet(&table, "tc", b"p", b"");

        let ids = |tablets: Vec<Arc<TabletInfo>>| {
            tablets.iter().map(|t| t.id().to_string()).collect::<Vec<_>>()
        };

        assert_eq!(ids(table.tablets_in_range(None, None, 10)), vec!["ta", "tb", "tc"]);
        // "g" falls inside tb's interval.
        assert_eq!(
            ids(table.tablets_in_range(Some(b"g"), Some(b"h"), 10)),
            vec!["tb"]
        );
        assert_eq!(ids(table.tablets_in_range(Some(b"g"), None, 10)), vec!["tb", "tc"]);
        assert_eq!(ids(table.tablets_in_range(None, None, 2)), vec!["ta", "tb"]);
    }

    #[tokio::test]
    async fn group_lock_commits_in_reverse_id_order() {
        let table = TableInfo::new("t1".to_string(), table_record("t"));
        let a = add_tablet(&table, "a", b"", b"m");
        let b = add_tablet(&table, "b", b"m", b"");

        let mut group = lock_tablets_for_write(&[Arc::clone(&b), Arc::clone(&a)]).await;
        group
            .guard_mut("a")
            .mutable()
            .set_state(TabletState::Deleted, "gone");
        group.commit_all();

        assert_eq!(a.read().state, TabletState::Deleted);
        assert_eq!(b.read().state, TabletState::Running);
    }

    #[tokio::test]
    async fn create_staged_tablet_publishes_on_commit() {
        let table = TableInfo::new("t1".to_string(), table_record("t"));
        let (tablet, mut guard) =
            TabletInfo::new_for_create(&table, "tx".to_string(), Partition::default());
        assert_eq!(guard.dirty().state, TabletState::Preparing);
        guard.mutable().set_state(TabletState::Creating, "creating");
        guard.commit();
        assert_eq!(tablet.read().state, TabletState::Creating);
        assert_eq!(tablet.reported_schema_version(), NOT_YET_REPORTED);
    }
}
