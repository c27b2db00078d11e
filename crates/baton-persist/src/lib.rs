//! Durable run status records.
//!
//! The worker writes exactly one terminal status per run through
//! [`RunStatusStore::update_agent_run_status`]; everything else here exists to
//! create, inspect and list those records.

mod db;
pub mod query;

use async_trait::async_trait;
use baton_types::{RunRecord, RunStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use db::RunDatabase;
pub use query::{CompiledQuery, Order, Predicate, SelectQuery, SqlValue, UpdateQuery};

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database is closed")]
    Closed,

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl Serialize for PersistError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub type PersistResult<T> = Result<T, PersistError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub status: RunStatus,
    /// Only written when present; an existing error is never cleared.
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl StatusUpdate {
    pub fn new(status: RunStatus, error: Option<String>) -> Self {
        Self {
            status,
            error,
            completed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub rows_affected: usize,
}

impl UpdateOutcome {
    pub fn affected(&self) -> bool {
        self.rows_affected > 0
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunFilter {
    pub status: Option<RunStatus>,
    pub thread_id: Option<String>,
    pub started_after: Option<DateTime<Utc>>,
    pub limit: Option<u64>,
}

#[async_trait]
pub trait RunStatusStore: Send + Sync {
    async fn insert_run(&self, record: &RunRecord) -> PersistResult<()>;

    async fn get_run(&self, run_id: &str) -> PersistResult<Option<RunRecord>>;

    /// Zero affected rows is reported through [`UpdateOutcome`], not as an error.
    async fn update_agent_run_status(
        &self,
        run_id: &str,
        update: &StatusUpdate,
    ) -> PersistResult<UpdateOutcome>;

    /// Newest first.
    async fn list_runs(&self, filter: &RunFilter) -> PersistResult<Vec<RunRecord>>;
}
