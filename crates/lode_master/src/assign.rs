//! The assignment loop: placing replicas for new tablets and replacing
//! tablets whose creation timed out.
//!
//! Driven by the background scheduler. Each pass scans for tablets in
//! PREPARING or CREATING, stages the state transitions under group write
//! locks, persists them in one system-table write, publishes, and fans out
//! the create/delete RPCs.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{bail, Context, Result};

use crate::catalog::{generate_id, CatalogManager};
use crate::consensus::{ConsensusState, RaftConfig, RaftPeer, INVALID_OPID_INDEX, MINIMUM_TERM};
use crate::cow::CowWriteGuard;
use crate::state::{
    lock_tablets_for_write, PersistedTablet, TableInfo, TabletId, TabletInfo, TabletState,
};
use crate::sys_table::SysTableActions;
use crate::tokens::now_unix_secs;
use crate::workers::{select_replica, WorkerDescriptor};

/// Choose `n` distinct workers for a new tablet by power-of-two-choices,
/// bumping each chosen worker's recent-creation counter so later placements
/// in the same batch see the load.
fn select_replicas(live: &[Arc<WorkerDescriptor>], n: usize) -> Vec<RaftPeer> {
    let mut rng = rand::thread_rng();
    let mut selected: HashSet<String> = HashSet::new();
    let mut peers = Vec::with_capacity(n);
    for _ in 0..n {
        let Some(worker) = select_replica(live, &selected, &mut rng) else {
            break;
        };
        selected.insert(worker.uuid().to_string());
        worker.increment_recent_replica_creations();
        peers.push(RaftPeer::voter(worker.uuid(), worker.addr()));
    }
    peers
}

impl CatalogManager {
    /// All tablets of non-deleted tables that are neither running nor
    /// deleted, in partition order per table.
    pub(crate) fn extract_tablets_to_process(&self) -> Vec<Arc<TabletInfo>> {
        let tables: Vec<Arc<TableInfo>> = {
            let index = self.index.read().unwrap();
            index.tables_by_id.values().cloned().collect()
        };
        let mut out = Vec::new();
        for table in tables {
            if table.read().is_deleted() {
                continue;
            }
            for tablet in table.all_tablets() {
                let record = tablet.read();
                if record.is_deleted() || record.is_running() {
                    continue;
                }
                out.push(Arc::clone(&tablet));
            }
        }
        out
    }

    fn select_replicas_for_tablet(
        &self,
        live: &[Arc<WorkerDescriptor>],
        tablet: &Arc<TabletInfo>,
        guard: &mut CowWriteGuard<PersistedTablet>,
    ) -> Result<()> {
        let Some(table) = tablet.table() else {
            bail!("tablet {} has no owning table (aborted create?)", tablet.id());
        };
        let record = table.read();
        let nreplicas = record.num_replicas;
        if (live.len() as i32) < nreplicas {
            bail!(
                "not enough workers are online for table '{}': need at least {} replicas, \
                 but only {} workers are available",
                record.name,
                nreplicas,
                live.len()
            );
        }
        let peers = select_replicas(live, nreplicas.max(0) as usize);
        guard.mutable().consensus = Some(ConsensusState {
            current_term: MINIMUM_TERM,
            leader_uuid: None,
            committed_config: RaftConfig { opid_index: Some(INVALID_OPID_INDEX), peers },
            has_pending_config: false,
        });
        Ok(())
    }

    /// One assignment pass over `tablets`.
    pub(crate) async fn process_pending_assignments(
        &self,
        tablets: Vec<Arc<TabletInfo>>,
    ) -> Result<()> {
        tracing::debug!(tablets = tablets.len(), "processing pending assignments");
        let tablet_by_id: HashMap<TabletId, Arc<TabletInfo>> = tablets
            .iter()
            .map(|t| (t.id().to_string(), Arc::clone(t)))
            .collect();

        let mut lock_in = lock_tablets_for_write(&tablets).await;
        // Replacement tablets created below are staged in their own locked
        // set; they commit before lock_in.
        let mut new_tablets: Vec<(Arc<TabletInfo>, CowWriteGuard<PersistedTablet>)> = Vec::new();
        let mut to_update: Vec<TabletId> = Vec::new();
        let mut needs_create: Vec<Arc<TabletInfo>> = Vec::new();

        for tablet in tablet_by_id.values() {
            let state = lock_in.guard(tablet.id()).data().state;
            match state {
                TabletState::Preparing => {
                    lock_in
                        .guard_mut(tablet.id())
                        .mutable()
                        .set_state(TabletState::Creating, "sending initial creation of tablet");
                    to_update.push(tablet.id().to_string());
                    needs_create.push(Arc::clone(tablet));
                }
                TabletState::Creating => {
                    // An unanswered create past the deadline means the
                    // tablet is replaced wholesale; the old one keeps its ID
                    // for the eventual delete.
                    let elapsed = tablet.last_create_time().elapsed();
                    if elapsed <= self.config.tablet_creation_timeout {
                        continue;
                    }
                    let Some(table) = tablet.table() else {
                        tracing::warn!(tablet_id = tablet.id(), "creating tablet has no table");
                        continue;
                    };
                    let partition = lock_in.guard(tablet.id()).data().partition.clone();
                    let (replacement, mut guard) =
                        TabletInfo::new_for_create(&table, generate_id(), partition);
                    tracing::warn!(
                        tablet_id = tablet.id(),
                        replacement_id = replacement.id(),
                        "tablet was not created within the allowed timeout; replacing"
                    );
                    lock_in.guard_mut(tablet.id()).mutable().set_state(
                        TabletState::Replaced,
                        format!("replaced by {} at {}", replacement.id(), now_unix_secs()),
                    );
                    guard
                        .mutable()
                        .set_state(TabletState::Creating, format!("replacement for {}", tablet.id()));
                    to_update.push(tablet.id().to_string());
                    needs_create.push(Arc::clone(&replacement));
                    new_tablets.push((replacement, guard));
                }
                other => {
                    tracing::debug!(tablet_id = tablet.id(), state = ?other, "nothing to do");
                }
            }
        }

        if new_tablets.is_empty() && to_update.is_empty() && needs_create.is_empty() {
            return Ok(());
        }

        // Assign replicas to every tablet created in this round. Failure
        // (typically too few live workers) aborts the pass; the next
        // scheduler tick retries unless the creation was cancelled.
        let live = self.workers.live_workers();
        for tablet in &needs_create {
            let result = if lock_in.contains(tablet.id()) {
                let guard = lock_in.guard_mut(tablet.id());
                self.select_replicas_for_tablet(&live, tablet, guard)
            } else {
                match new_tablets.iter_mut().find(|(t, _)| t.id() == tablet.id()) {
                    Some((_, guard)) => self.select_replicas_for_tablet(&live, tablet, guard),
                    None => continue,
                }
            };
            result.with_context(|| {
                format!("error selecting replicas for tablet {}", tablet.id())
            })?;
        }

        // One write for the whole round.
        let actions = SysTableActions {
            tablets_to_add: new_tablets
                .iter()
                .map(|(t, g)| (t.id().to_string(), g.dirty().clone()))
                .collect(),
            tablets_to_update: to_update
                .iter()
                .map(|id| (id.clone(), lock_in.guard(id).dirty().clone()))
                .collect(),
            ..Default::default()
        };
        self.sys
            .write(actions)
            .await
            .context("error persisting updated tablet metadata")?;

        // Publish: replacements first (they are not yet visible anywhere),
        // then the in-place updates.
        let new_tablets: Vec<Arc<TabletInfo>> = new_tablets
            .into_iter()
            .map(|(tablet, guard)| {
                guard.commit();
                tablet
            })
            .collect();
        lock_in.commit_all();

        for tablet in &new_tablets {
            if let Some(table) = tablet.table() {
                table.add_remove_tablets(&[Arc::clone(tablet)], &[]);
            }
        }
        {
            let mut index = self.index.write().unwrap();
            for tablet in &new_tablets {
                index.tablets.insert(tablet.id().to_string(), Arc::clone(tablet));
            }
        }

        // Replaced tablets get their replicas deleted.
        for id in &to_update {
            let Some(tablet) = tablet_by_id.get(id) else {
                continue;
            };
            let record = tablet.read();
            if record.is_deleted() {
                let reason = record.state_msg.clone();
                self.send_delete_replica_tasks(tablet.table(), tablet.id(), &record, &reason);
            }
        }
        // New creations fan out to every selected peer.
        for tablet in &needs_create {
            let Some(table) = tablet.table() else {
                continue;
            };
            let record = tablet.read();
            self.send_create_replica_tasks(&table, tablet, &record);
        }
        Ok(())
    }
}
