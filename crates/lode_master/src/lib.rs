//! Catalog manager for the lodestore master node.
//!
//! This crate owns the master's view of the cluster: the set of tables and
//! their range-partitioned tablets, the replicated system-table records
//! backing that view, and the control loops that drive tablet replicas on
//! worker nodes toward the intended state.
//!
//! The storage engine, Raft consensus for the system tablet, RPC transport,
//! and worker liveness detection are collaborators behind traits
//! ([`sys_table::SystemTable`], [`sys_table::SysTabletConsensus`],
//! [`workers::WorkerProxy`]); this crate contains no I/O of its own.

mod assign;
mod bg_tasks;
pub mod catalog;
pub mod config;
pub mod consensus;
pub mod cow;
pub mod error;
pub mod partition;
pub mod report;
pub mod schema;
pub mod state;
pub mod sys_table;
pub mod tasks;
pub mod tokens;
pub mod workers;

pub use catalog::{CatalogManager, CatalogManagerContext};
pub use config::MasterConfig;
pub use error::{CatalogError, ErrorCode};
pub use report::{ReportedReplicaState, ReportedTablet, TabletReportUpdate};
