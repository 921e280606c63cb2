//! Client-facing error taxonomy for catalog operations.

use thiserror::Error;

use crate::sys_table::SysTableError;

/// Stable error codes surfaced on the client RPC boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    CatalogManagerNotInitialized,
    NotTheLeader,
    TableNotFound,
    TableAlreadyPresent,
    InvalidSchema,
    EvenReplicationFactor,
    ReplicationFactorTooHigh,
    IllegalReplicationFactor,
    TooManyTablets,
    TabletNotRunning,
    UnknownError,
}

/// Errors returned by catalog request handlers.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog manager is not initialized: {0}")]
    NotInitialized(String),
    #[error("not the leader: {0}")]
    NotLeader(String),
    #[error("table not found: {0}")]
    TableNotFound(String),
    #[error("table already present: {0}")]
    TableAlreadyPresent(String),
    /// A concurrent operation holds a reservation on the requested name.
    /// Retryable, unlike [`CatalogError::TableAlreadyPresent`].
    #[error("table name {0} is already reserved")]
    NameReserved(String),
    #[error("invalid schema: {0}")]
    InvalidSchema(String),
    #[error("illegal replication factor {0} (replication factor must be odd)")]
    EvenReplicationFactor(i32),
    #[error("illegal replication factor {requested} (max replication factor is {max})")]
    ReplicationFactorTooHigh { requested: i32, max: i32 },
    #[error("illegal replication factor {0} (replication factor must be positive)")]
    IllegalReplicationFactor(i32),
    #[error(
        "not enough live workers to create a table with the requested replication \
         factor {requested}; {live} workers are alive"
    )]
    NotEnoughWorkers { requested: i32, live: usize },
    #[error("too many tablets: {0}")]
    TooManyTablets(String),
    #[error("tablet not running: {0}")]
    TabletNotRunning(String),
    #[error("{0}")]
    Unknown(String),
}

impl CatalogError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CatalogError::NotInitialized(_) => ErrorCode::CatalogManagerNotInitialized,
            CatalogError::NotLeader(_) => ErrorCode::NotTheLeader,
            CatalogError::TableNotFound(_) => ErrorCode::TableNotFound,
            CatalogError::TableAlreadyPresent(_) | CatalogError::NameReserved(_) => {
                ErrorCode::TableAlreadyPresent
            }
            CatalogError::InvalidSchema(_) => ErrorCode::InvalidSchema,
            CatalogError::EvenReplicationFactor(_) => ErrorCode::EvenReplicationFactor,
            CatalogError::ReplicationFactorTooHigh { .. }
            | CatalogError::NotEnoughWorkers { .. } => ErrorCode::ReplicationFactorTooHigh,
            CatalogError::IllegalReplicationFactor(_) => ErrorCode::IllegalReplicationFactor,
            CatalogError::TooManyTablets(_) => ErrorCode::TooManyTablets,
            CatalogError::TabletNotRunning(_) => ErrorCode::TabletNotRunning,
            CatalogError::Unknown(_) => ErrorCode::UnknownError,
        }
    }

    /// Whether the caller may retry the operation verbatim and expect it to
    /// eventually succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CatalogError::NotLeader(_)
                | CatalogError::NotInitialized(_)
                | CatalogError::NameReserved(_)
                | CatalogError::TabletNotRunning(_)
        )
    }

    /// Translate a system-table write failure. Illegal-state and aborted
    /// failures mean the write was issued on a node that lost system-tablet
    /// leadership mid-operation.
    pub fn from_sys_write(err: SysTableError) -> CatalogError {
        if err.is_leadership_loss() {
            CatalogError::NotLeader(format!(
                "operation requested can only be executed on a leader master, \
                 but this master is no longer the leader: {err}"
            ))
        } else {
            CatalogError::Unknown(format!("an error occurred while writing to the system table: {err}"))
        }
    }
}
