//! Tablet report processing: reconciling worker-observed state with the
//! catalog's intended state.
//!
//! A report batch is handled in phases: look up the referenced tablets,
//! snapshot their tables and group-write-lock the tablets, analyze each
//! report without I/O while queueing remote tasks, persist every mutated
//! tablet in one system-table write, publish the in-memory changes, and
//! only then fire the queued tasks.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::catalog::CatalogManager;
use crate::consensus::{
    should_add_replica, should_evict_replica, ConsensusState, MajorityHealthPolicy, MemberType,
    INVALID_OPID_INDEX,
};
use crate::cow::CowReadGuard;
use crate::error::CatalogError;
use crate::state::{
    lock_tablets_for_write, PersistedTable, PersistedTablet, TableId, TableState, TabletId,
    TabletInfo, TabletState,
};
use crate::sys_table::SysTableActions;
use crate::tasks::{
    spawn_task, AddReplicaTask, AlterSchemaTask, DeleteReplicaTask, EvictReplicaTask, TaskSpec,
};
use crate::workers::ReplicaDataState;

/// Lifecycle state of a replica as reported by its worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReportedReplicaState {
    NotStarted,
    Bootstrapping,
    Running,
    Failed,
}

/// One tablet's entry in a worker report batch.
#[derive(Clone, Debug)]
pub struct ReportedTablet {
    pub tablet_id: TabletId,
    pub state: ReportedReplicaState,
    pub data_state: ReplicaDataState,
    pub schema_version: Option<u32>,
    pub consensus: Option<ConsensusState>,
    pub error: Option<String>,
}

impl ReportedTablet {
    pub fn running(tablet_id: impl Into<String>, consensus: ConsensusState) -> Self {
        Self {
            tablet_id: tablet_id.into(),
            state: ReportedReplicaState::Running,
            data_state: ReplicaDataState::Ready,
            schema_version: Some(0),
            consensus: Some(consensus),
            error: None,
        }
    }
}

/// Per-tablet acknowledgement returned to the reporting worker.
#[derive(Clone, Debug)]
pub struct TabletReportUpdate {
    pub tablet_id: TabletId,
    pub state_msg: Option<String>,
}

/// Whether `report` should transition the tablet to RUNNING. The tablet must
/// not already be running, the replica must report RUNNING, and (unless the
/// election-wait relaxation is off) the reported leader must be a member of
/// the committed config; without that, a minority-created tablet could be
/// considered successfully created and stay wedged forever.
fn should_transition_to_running(
    current: &PersistedTablet,
    report: &ReportedTablet,
    cstate: &ConsensusState,
    wait_for_leader: bool,
) -> bool {
    if current.is_running() {
        return false;
    }
    if report.state != ReportedReplicaState::Running {
        return false;
    }
    if !wait_for_leader {
        return true;
    }
    match &cstate.leader_uuid {
        Some(leader) => cstate.committed_config.is_member(leader),
        None => false,
    }
}

impl CatalogManager {
    /// Ingest one worker's tablet report batch.
    pub async fn process_tablet_report(
        &self,
        worker_uuid: &str,
        reports: &[ReportedTablet],
    ) -> Result<Vec<TabletReportUpdate>, CatalogError> {
        let _leader = self.leader_shared()?;
        tracing::debug!(worker = worker_uuid, tablets = reports.len(), "received tablet report");

        // Phase 1: look up the reported tablets. Unknown IDs are skipped: it
        // would be unsafe to delete a tablet on the worker's say-so alone (a
        // rogue leader, or a worker heartbeating to the wrong cluster), and
        // deleted tablets are retained in the index forever.
        let mut updates: Vec<TabletReportUpdate> = Vec::with_capacity(reports.len());
        let mut update_slots: HashMap<TabletId, usize> = HashMap::new();
        let mut report_by_id: HashMap<TabletId, &ReportedTablet> = HashMap::new();
        let mut tablet_infos: BTreeMap<TabletId, Arc<TabletInfo>> = BTreeMap::new();
        {
            let index = self.index.read().unwrap();
            for report in reports {
                updates.push(TabletReportUpdate {
                    tablet_id: report.tablet_id.clone(),
                    state_msg: None,
                });
                let Some(tablet) = index.tablets.get(&report.tablet_id) else {
                    tracing::warn!(
                        tablet_id = %report.tablet_id,
                        worker = worker_uuid,
                        "ignoring report from unknown tablet"
                    );
                    continue;
                };
                // Duplicate IDs in one batch: the last report wins.
                update_slots.insert(report.tablet_id.clone(), updates.len() - 1);
                report_by_id.insert(report.tablet_id.clone(), report);
                tablet_infos.insert(report.tablet_id.clone(), Arc::clone(tablet));
            }
        }

        // Phase 2: snapshot the referenced tables (read side of the table
        // locks) and group-write-lock the tablets in ID order.
        let mut table_snapshots: HashMap<TableId, CowReadGuard<PersistedTable>> = HashMap::new();
        for tablet in tablet_infos.values() {
            let Some(table) = tablet.table() else {
                continue;
            };
            table_snapshots
                .entry(table.id().to_string())
                .or_insert_with(|| table.read());
        }
        let tablets: Vec<Arc<TabletInfo>> = tablet_infos.values().cloned().collect();
        let mut tablets_lock = lock_tablets_for_write(&tablets).await;

        // Phase 3: per-tablet analysis. No I/O; remote tasks are queued and
        // fired only after persistence.
        let mut pending_tasks: Vec<Arc<dyn TaskSpec>> = Vec::new();
        let mut mutated: Vec<TabletId> = Vec::new();
        for (tablet_id, tablet) in &tablet_infos {
            let report = report_by_id[tablet_id];
            let Some(table) = tablet.table() else {
                tracing::warn!(tablet_id = %tablet_id, "tablet has no owning table; skipping");
                continue;
            };
            let table_snapshot = &table_snapshots[table.id()];
            let mut tablet_was_mutated = false;

            // Deleted tablet (or table): tell the worker to delete its
            // replica outright.
            let clean = tablets_lock.guard(tablet_id).data().clone();
            if clean.is_deleted() || table_snapshot.is_deleted() {
                let msg = if clean.is_deleted() {
                    clean.state_msg.clone()
                } else {
                    table_snapshot.state_msg.clone()
                };
                if let Some(&slot) = update_slots.get(tablet_id) {
                    updates[slot].state_msg = Some(msg.clone());
                }
                tracing::info!(
                    tablet_id = %tablet_id,
                    worker = worker_uuid,
                    "got report from deleted tablet; sending delete request"
                );
                pending_tasks.push(Arc::new(DeleteReplicaTask::new(
                    Some(Arc::clone(&table)),
                    tablet_id.clone(),
                    worker_uuid.to_string(),
                    ReplicaDataState::Deleted,
                    None,
                    msg,
                )));
                continue;
            }

            let prev_cstate = clean.consensus.clone();
            let prev_opid_index = prev_cstate
                .as_ref()
                .map(|c| c.committed_config.opid_index_or_invalid())
                .unwrap_or(INVALID_OPID_INDEX);
            let report_opid_index = report
                .consensus
                .as_ref()
                .and_then(|c| c.committed_config.opid_index)
                .unwrap_or(INVALID_OPID_INDEX);

            // Tombstone a replica evicted from the config. The strict
            // opid-index comparison protects replicas just added to the
            // committed config that are still copying.
            if self.config.tombstone_evicted_replicas
                && report.data_state != ReplicaDataState::Tombstoned
                && report.data_state != ReplicaDataState::Deleted
                && prev_cstate
                    .as_ref()
                    .map(|c| !c.committed_config.is_member(worker_uuid))
                    .unwrap_or(false)
                && report_opid_index < prev_opid_index
            {
                let delete_msg = if report_opid_index == INVALID_OPID_INDEX {
                    "replica has no consensus available".to_string()
                } else {
                    format!("replica with old config index {report_opid_index}")
                };
                pending_tasks.push(Arc::new(DeleteReplicaTask::new(
                    Some(Arc::clone(&table)),
                    tablet_id.clone(),
                    worker_uuid.to_string(),
                    ReplicaDataState::Tombstoned,
                    Some(prev_opid_index),
                    format!(
                        "{delete_msg} (current committed config index is {prev_opid_index})"
                    ),
                )));
                continue;
            }

            // A replica reporting an error is noted and left alone.
            if let Some(error) = &report.error {
                tracing::warn!(
                    tablet_id = %tablet_id,
                    worker = worker_uuid,
                    error = %error,
                    "tablet has failed on worker"
                );
                continue;
            }

            let replication_factor = table_snapshot.num_replicas;
            if let Some(report_cstate) = &report.consensus {
                // Only committed configurations are cached; tombstoned
                // replicas may report no opid index at all.
                if report_cstate.committed_config.opid_index.is_none() {
                    continue;
                }

                // Disregard a reported leader that is not a member of the
                // committed config.
                let mut cstate = report_cstate.clone();
                if let Some(leader) = &cstate.leader_uuid {
                    if !cstate.committed_config.is_member(leader) {
                        cstate.leader_uuid = None;
                    }
                }

                if should_transition_to_running(
                    &clean,
                    report,
                    &cstate,
                    self.config.wait_for_new_tablets_to_elect_leader,
                ) {
                    tracing::info!(tablet_id = %tablet_id, "tablet is now online");
                    tablets_lock.guard_mut(tablet_id).mutable().set_state(
                        TabletState::Running,
                        "tablet reported with an active leader",
                    );
                    tablet_was_mutated = true;
                }

                // The stored cstate is replaced when a config change
                // committed, or when a leader appeared or the term moved.
                let prev_term = prev_cstate.as_ref().map(|c| c.current_term);
                let prev_leader = prev_cstate.as_ref().and_then(|c| c.leader_uuid.clone());
                let consensus_state_updated = cstate.committed_config.opid_index_or_invalid()
                    > prev_opid_index
                    || (cstate.leader_uuid.is_some()
                        && (prev_leader.is_none()
                            || Some(cstate.current_term) > prev_term));
                if consensus_state_updated {
                    // Within one term the leader is retained even if this
                    // reporter does not know it; two different leaders for
                    // one term means diverged consensus data.
                    if let Some(prev) = &prev_cstate {
                        if cstate.current_term == prev.current_term {
                            match (&cstate.leader_uuid, &prev.leader_uuid) {
                                (None, Some(prev_leader)) => {
                                    cstate.leader_uuid = Some(prev_leader.clone());
                                }
                                (Some(new_leader), Some(prev_leader))
                                    if new_leader != prev_leader =>
                                {
                                    tracing::error!(
                                        tablet_id = %tablet_id,
                                        term = cstate.current_term,
                                        prev_leader = %prev_leader,
                                        reported_leader = %new_leader,
                                        "reported cstate names a different leader for the same term"
                                    );
                                    continue;
                                }
                                _ => {}
                            }
                        }
                    }

                    tracing::info!(
                        tablet_id = %tablet_id,
                        worker = worker_uuid,
                        opid_index = cstate.committed_config.opid_index_or_invalid(),
                        term = cstate.current_term,
                        leader = cstate.leader_uuid.as_deref().unwrap_or(""),
                        "reported consensus state change"
                    );

                    // Persist the new cstate with health reports stripped.
                    tablets_lock.guard_mut(tablet_id).mutable().consensus =
                        Some(cstate.without_health_reports());
                    tablet_was_mutated = true;

                    // Tombstone replicas dropped by the new configuration.
                    if self.config.tombstone_evicted_replicas {
                        if let Some(prev) = &prev_cstate {
                            let new_opid_index =
                                cstate.committed_config.opid_index_or_invalid();
                            for peer in &prev.committed_config.peers {
                                if !cstate.committed_config.is_member(&peer.uuid) {
                                    pending_tasks.push(Arc::new(DeleteReplicaTask::new(
                                        Some(Arc::clone(&table)),
                                        tablet_id.clone(),
                                        peer.uuid.clone(),
                                        ReplicaDataState::Tombstoned,
                                        Some(new_opid_index),
                                        format!(
                                            "worker {} not found in new config with opid_index {new_opid_index}",
                                            peer.uuid
                                        ),
                                    )));
                                }
                            }
                        }
                    }
                }

                // Replica replacement, in the mode the master runs in.
                if !self.config.prepare_replacement_before_eviction {
                    // Legacy mode: top up under-replicated configs. The CAS
                    // on the committed opid index makes this idempotent.
                    if consensus_state_updated
                        && self.config.add_replica_when_underreplicated
                        && (cstate.committed_config.count_voters() as i32) < replication_factor
                    {
                        pending_tasks.push(Arc::new(AddReplicaTask::new(
                            Arc::clone(&table),
                            Arc::clone(tablet),
                            cstate.clone(),
                            MemberType::Voter,
                        )));
                    }
                } else if !cstate.has_pending_config && cstate.leader_is(worker_uuid) {
                    // Modern mode: only the leader tracks peer health, so
                    // only its reports drive add/evict decisions.
                    let policy = if self.config.replace_replica_without_majority {
                        MajorityHealthPolicy::Ignore
                    } else {
                        MajorityHealthPolicy::Honor
                    };
                    let to_evict = if self.config.evict_excess_replicas {
                        should_evict_replica(
                            &cstate.committed_config,
                            worker_uuid,
                            replication_factor,
                            policy,
                        )
                    } else {
                        None
                    };
                    if let Some(peer_uuid) = to_evict {
                        pending_tasks.push(Arc::new(EvictReplicaTask::new(
                            Arc::clone(&table),
                            Arc::clone(tablet),
                            cstate.clone(),
                            peer_uuid,
                        )));
                    } else if self.config.add_replica_when_underreplicated
                        && should_add_replica(
                            &cstate.committed_config,
                            replication_factor,
                            policy,
                        )
                    {
                        pending_tasks.push(Arc::new(AddReplicaTask::new(
                            Arc::clone(&table),
                            Arc::clone(tablet),
                            cstate.clone(),
                            MemberType::NonVoter,
                        )));
                    }
                }
            }

            // Version skew: nudge the replica's leader with the latest
            // schema. A laggy replica whose leader already got the alter is
            // fine; duplicates are ignored by the target.
            if let Some(reported_version) = report.schema_version {
                let table_version = table_snapshot.schema_version;
                if reported_version != table_version {
                    if reported_version > table_version {
                        tracing::error!(
                            tablet_id = %tablet_id,
                            worker = worker_uuid,
                            table_version,
                            reported_version,
                            "worker reported a schema version newer than the table's"
                        );
                    } else {
                        tracing::info!(
                            tablet_id = %tablet_id,
                            worker = worker_uuid,
                            table_version,
                            reported_version,
                            "worker does not have the latest schema"
                        );
                    }
                    pending_tasks.push(Arc::new(AlterSchemaTask::new(
                        Arc::clone(&table),
                        Arc::clone(tablet),
                    )));
                }
            }

            if tablet_was_mutated {
                mutated.push(tablet_id.clone());
            }
        }

        // Phase 4: persist every mutated tablet in one write. On failure
        // nothing is published and no task fires.
        if !mutated.is_empty() {
            let actions = SysTableActions {
                tablets_to_update: mutated
                    .iter()
                    .map(|id| (id.clone(), tablets_lock.guard(id).dirty().clone()))
                    .collect(),
                ..Default::default()
            };
            if let Err(err) = self.sys.write(actions).await {
                tracing::error!(
                    worker = worker_uuid,
                    error = %err,
                    "error persisting tablet mutations from report"
                );
                return Err(CatalogError::from_sys_write(err));
            }
        }

        // Phase 5: release the table snapshots and publish the tablet
        // mutations.
        drop(table_snapshots);
        tablets_lock.commit_all();

        // Reported schema versions feed the per-table version multiset and
        // may complete an in-flight alter.
        for (tablet_id, tablet) in &tablet_infos {
            let report = report_by_id[tablet_id];
            if let Some(version) = report.schema_version {
                self.handle_tablet_schema_version_report(tablet, version).await;
            }
        }

        // Phase 6: fire the queued tasks; ownership moves into the engine.
        for task in pending_tasks {
            spawn_task(task, self.task_ctx());
        }

        Ok(updates)
    }

    /// Record a tablet's reported schema version; when the last tablet
    /// catches up to an in-flight alter, move the table back to RUNNING.
    pub(crate) async fn handle_tablet_schema_version_report(
        &self,
        tablet: &Arc<TabletInfo>,
        version: u32,
    ) {
        tablet.set_reported_schema_version(version as i64);

        let Some(table) = tablet.table() else {
            return;
        };
        let mut guard = table.metadata().write().await;
        if guard.data().is_deleted() || guard.data().state != TableState::Altering {
            return;
        }
        let current_version = guard.data().schema_version;
        if table.is_alter_in_progress(current_version) {
            return;
        }

        guard.mutable().fully_applied_schema = None;
        guard.mutable().set_state(
            TableState::Running,
            format!("current schema version={current_version}"),
        );

        let actions = SysTableActions {
            tables_to_update: vec![(table.id().to_string(), guard.dirty().clone())],
            ..Default::default()
        };
        if let Err(err) = self.sys.write(actions).await {
            tracing::warn!(
                table = %table.describe(),
                error = %err,
                "error persisting alter completion"
            );
            return;
        }
        guard.commit();
        tracing::info!(
            table = %table.describe(),
            version = current_version,
            "alter complete"
        );
    }
}
