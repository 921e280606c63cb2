//! Collaborator interfaces for the replicated system tablet.
//!
//! The system table stores every catalog record (tables, tablets, signing
//! keys, the CA entry) in a single replicated tablet. The catalog manager
//! sees it through [`SystemTable`]: one atomic batched write plus
//! visitor-style loads. Leadership of the system tablet is observed through
//! [`SysTabletConsensus`].

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::state::{PersistedTable, PersistedTablet, TableId, TabletId};
use crate::tokens::{CaBundle, TokenSigningKey};

/// Failures surfaced by the system table.
#[derive(Debug, Error)]
pub enum SysTableError {
    /// The local replica is not (or no longer) the leader of the system
    /// tablet; the write was not applied.
    #[error("not the leader of the system tablet: {0}")]
    NotLeader(String),
    /// The operation was aborted mid-replication, typically by a leadership
    /// change.
    #[error("system table operation aborted: {0}")]
    Aborted(String),
    /// Loaded records are inconsistent.
    #[error("system table corruption: {0}")]
    Corruption(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SysTableError {
    /// Both rejection flavors mean the same thing to the catalog: this
    /// master lost system-tablet leadership.
    pub fn is_leadership_loss(&self) -> bool {
        matches!(self, SysTableError::NotLeader(_) | SysTableError::Aborted(_))
    }
}

/// One batched, atomic system-table transaction.
#[derive(Clone, Debug, Default)]
pub struct SysTableActions {
    pub tables_to_add: Vec<(TableId, PersistedTable)>,
    pub tables_to_update: Vec<(TableId, PersistedTable)>,
    pub tablets_to_add: Vec<(TabletId, PersistedTablet)>,
    pub tablets_to_update: Vec<(TabletId, PersistedTablet)>,
    pub tsk_entries_to_add: Vec<TokenSigningKey>,
    pub tsk_entries_to_remove: Vec<i64>,
}

impl SysTableActions {
    pub fn is_empty(&self) -> bool {
        self.tables_to_add.is_empty()
            && self.tables_to_update.is_empty()
            && self.tablets_to_add.is_empty()
            && self.tablets_to_update.is_empty()
            && self.tsk_entries_to_add.is_empty()
            && self.tsk_entries_to_remove.is_empty()
    }
}

pub trait TableVisitor {
    fn visit_table(&mut self, table_id: &str, record: PersistedTable) -> Result<(), SysTableError>;
}

pub trait TabletVisitor {
    fn visit_tablet(&mut self, tablet_id: &str, record: PersistedTablet)
        -> Result<(), SysTableError>;
}

pub trait SigningKeyVisitor {
    fn visit_key(&mut self, key: TokenSigningKey) -> Result<(), SysTableError>;
}

/// The replicated system table. Writes are atomic: either the whole action
/// batch is applied or none of it is. Implementations are expected to
/// short-circuit updates whose record equals the stored one.
#[async_trait]
pub trait SystemTable: Send + Sync {
    async fn write(&self, actions: SysTableActions) -> Result<(), SysTableError>;

    async fn visit_tables(
        &self,
        visitor: &mut (dyn TableVisitor + Send),
    ) -> Result<(), SysTableError>;

    async fn visit_tablets(
        &self,
        visitor: &mut (dyn TabletVisitor + Send),
    ) -> Result<(), SysTableError>;

    async fn visit_signing_keys(
        &self,
        visitor: &mut (dyn SigningKeyVisitor + Send),
    ) -> Result<(), SysTableError>;

    /// The single certificate-authority record, if one has been persisted.
    async fn ca_entry(&self) -> Result<Option<CaBundle>, SysTableError>;

    async fn add_ca_entry(&self, bundle: CaBundle) -> Result<(), SysTableError>;

    async fn shutdown(&self);
}

/// Current leadership of the system tablet's consensus group.
#[derive(Clone, Debug, PartialEq)]
pub struct SysLeadership {
    pub term: i64,
    pub leader_uuid: Option<String>,
}

/// Errors from waiting for the system tablet to catch up after an election.
#[derive(Debug, Error)]
pub enum CatchupError {
    #[error("timed out waiting for system tablet transactions to finish")]
    TimedOut,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Read-side view of the system tablet's Raft state, plus shutdown control.
#[async_trait]
pub trait SysTabletConsensus: Send + Sync {
    fn leadership(&self) -> SysLeadership;

    /// Wait until every system-table transaction started before this call
    /// has finished, or `timeout` elapses.
    async fn wait_for_catchup(&self, timeout: Duration) -> Result<(), CatchupError>;

    /// Shut down consensus, aborting pending system-table operations.
    async fn shutdown(&self);
}
