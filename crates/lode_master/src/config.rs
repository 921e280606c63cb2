//! Master catalog configuration.

use std::time::Duration;

/// Tuning knobs for the catalog manager.
///
/// Defaults match production settings; tests override individual fields.
#[derive(Clone, Debug)]
pub struct MasterConfig {
    /// Default replication factor for tables that do not specify one.
    pub default_num_replicas: i32,
    /// Maximum replication factor that may be requested for a table.
    pub max_num_replicas: i32,
    /// Maximum number of columns in a table schema.
    pub max_num_columns: usize,
    /// Maximum length of a table or column name.
    pub max_identifier_length: usize,
    /// Cap on `num_tablets * num_replicas` per live worker at creation time.
    pub max_create_tablets_per_worker: usize,
    /// Allow creating tables with an even replication factor.
    pub allow_unsafe_replication_factor: bool,
    /// Reject table creation when the replication factor exceeds the number
    /// of live workers.
    pub check_worker_count_on_create: bool,
    /// Timeout for a single master->worker RPC attempt.
    pub worker_rpc_timeout: Duration,
    /// Deadline for creating a tablet replica; an unanswered create past this
    /// deadline triggers tablet replacement.
    pub tablet_creation_timeout: Duration,
    /// Overall deadline after which the master stops retrying a worker for
    /// operations such as deleting a tablet.
    pub unresponsive_worker_timeout: Duration,
    /// Interval between background scheduler passes.
    pub bg_task_interval: Duration,
    /// Wait for a newly created tablet to elect a leader before considering
    /// it successfully created. Disabled by tests that manage elections.
    pub wait_for_new_tablets_to_elect_leader: bool,
    /// Tombstone tablet replicas that are no longer part of the latest
    /// reported committed configuration.
    pub tombstone_evicted_replicas: bool,
    /// Add a replica to a tablet configuration detected as under-replicated.
    pub add_replica_when_underreplicated: bool,
    /// Evict excess replicas from tablet configurations based on the
    /// replication factor.
    pub evict_excess_replicas: bool,
    /// Prepare a replacement replica (non-voter with promotion) before
    /// evicting a failed one; off selects the legacy evict-first scheme.
    pub prepare_replacement_before_eviction: bool,
    /// Attempt replica replacement even when the majority of voters is
    /// unhealthy.
    pub replace_replica_without_majority: bool,
    /// Time a newly elected leader is given to catch up with the replicated
    /// system table. Exceeding it crashes the process.
    pub failover_catchup_timeout: Duration,
    /// Advisory TTL clients may cache table locations for.
    pub table_locations_ttl: Duration,
    /// Cadence at which a fresh token signing key is generated ahead of use.
    pub tsk_rotation_interval: Duration,
    /// Validity period of a token signing key from generation to expiration.
    pub tsk_validity_period: Duration,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            default_num_replicas: 3,
            max_num_replicas: 7,
            max_num_columns: 300,
            max_identifier_length: 256,
            max_create_tablets_per_worker: 20,
            allow_unsafe_replication_factor: false,
            check_worker_count_on_create: true,
            worker_rpc_timeout: Duration::from_secs(30),
            tablet_creation_timeout: Duration::from_secs(30),
            unresponsive_worker_timeout: Duration::from_secs(60 * 60),
            bg_task_interval: Duration::from_secs(1),
            wait_for_new_tablets_to_elect_leader: true,
            tombstone_evicted_replicas: true,
            add_replica_when_underreplicated: true,
            evict_excess_replicas: true,
            prepare_replacement_before_eviction: true,
            replace_replica_without_majority: false,
            failover_catchup_timeout: Duration::from_secs(30),
            table_locations_ttl: Duration::from_secs(5 * 60),
            tsk_rotation_interval: Duration::from_secs(24 * 60 * 60),
            tsk_validity_period: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}
