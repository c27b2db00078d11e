// SQLite-backed run table

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use baton_types::{RunRecord, RunStatus};
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, Row};
use tokio::sync::Mutex;

use crate::query::{Order, Predicate, SelectQuery, SqlValue, UpdateQuery};
use crate::{
    PersistError, PersistResult, RunFilter, RunStatusStore, StatusUpdate, UpdateOutcome,
};

const RUNS_TABLE: &str = "agent_runs";
const RUN_COLUMNS: &[&str] = &[
    "agent_run_id",
    "thread_id",
    "status",
    "error",
    "started_at",
    "completed_at",
];

type RawRunRow = (
    String,
    Option<String>,
    String,
    Option<String>,
    String,
    Option<String>,
);

/// Run status database. Cloning shares the connection.
#[derive(Clone)]
pub struct RunDatabase {
    conn: Arc<Mutex<Option<Connection>>>,
    db_path: Option<PathBuf>,
}

impl RunDatabase {
    pub async fn open(db_path: &Path) -> PersistResult<Self> {
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(10))?;

        // PRAGMA journal_mode returns a row
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.execute("PRAGMA synchronous = NORMAL", [])?;

        let db = Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            db_path: Some(db_path.to_path_buf()),
        };
        db.init_schema().await?;
        tracing::debug!(path = %db_path.display(), "opened run database");
        Ok(db)
    }

    pub async fn open_in_memory() -> PersistResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            db_path: None,
        };
        db.init_schema().await?;
        Ok(db)
    }

    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Releases the connection. Later calls on any clone fail with
    /// [`PersistError::Closed`]; closing twice is a no-op.
    pub async fn close(&self) -> PersistResult<()> {
        let Some(conn) = self.conn.lock().await.take() else {
            return Ok(());
        };
        conn.close().map_err(|(_, err)| PersistError::Database(err))
    }

    pub async fn is_open(&self) -> bool {
        self.conn.lock().await.is_some()
    }

    async fn init_schema(&self) -> PersistResult<()> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS agent_runs (
                    agent_run_id TEXT PRIMARY KEY,
                    thread_id TEXT,
                    status TEXT NOT NULL,
                    error TEXT,
                    started_at TEXT NOT NULL,
                    completed_at TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_agent_runs_status ON agent_runs(status);
                CREATE INDEX IF NOT EXISTS idx_agent_runs_thread ON agent_runs(thread_id);",
            )?;
            Ok(())
        })
        .await
    }

    async fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> PersistResult<T>,
    ) -> PersistResult<T> {
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(PersistError::Closed)?;
        f(conn)
    }
}

fn read_raw(row: &Row<'_>) -> rusqlite::Result<RawRunRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn into_record(raw: RawRunRow) -> PersistResult<RunRecord> {
    let (run_id, thread_id, status, error, started_at, completed_at) = raw;
    let status = status
        .parse::<RunStatus>()
        .map_err(|err| PersistError::Corrupt(format!("run {run_id}: {err}")))?;
    Ok(RunRecord {
        started_at: parse_timestamp(&started_at)?,
        completed_at: completed_at.as_deref().map(parse_timestamp).transpose()?,
        run_id,
        thread_id,
        status,
        error,
    })
}

fn parse_timestamp(value: &str) -> PersistResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|err| PersistError::Corrupt(format!("timestamp `{value}`: {err}")))
}

#[async_trait]
impl RunStatusStore for RunDatabase {
    async fn insert_run(&self, record: &RunRecord) -> PersistResult<()> {
        let started_at = SqlValue::from(record.started_at);
        let completed_at = SqlValue::from(record.completed_at);
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO agent_runs
                    (agent_run_id, thread_id, status, error, started_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.run_id,
                    record.thread_id,
                    record.status.as_str(),
                    record.error,
                    started_at,
                    completed_at
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_run(&self, run_id: &str) -> PersistResult<Option<RunRecord>> {
        let query = SelectQuery::from(RUNS_TABLE)
            .columns(RUN_COLUMNS)
            .filter(Predicate::eq("agent_run_id", run_id))
            .limit(1)
            .compile()?;
        let raw = self
            .with_conn(|conn| {
                let mut stmt = conn.prepare(&query.sql)?;
                let mut rows = stmt.query_map(params_from_iter(query.params.iter()), read_raw)?;
                Ok(rows.next().transpose()?)
            })
            .await?;
        raw.map(into_record).transpose()
    }

    async fn update_agent_run_status(
        &self,
        run_id: &str,
        update: &StatusUpdate,
    ) -> PersistResult<UpdateOutcome> {
        let mut query = UpdateQuery::table(RUNS_TABLE)
            .set("status", update.status.as_str())
            .set("completed_at", update.completed_at);
        if let Some(error) = &update.error {
            query = query.set("error", error.as_str());
        }
        let query = query
            .filter(Predicate::eq("agent_run_id", run_id))
            .compile()?;
        let rows_affected = self
            .with_conn(|conn| {
                Ok(conn.execute(&query.sql, params_from_iter(query.params.iter()))?)
            })
            .await?;
        Ok(UpdateOutcome { rows_affected })
    }

    async fn list_runs(&self, filter: &RunFilter) -> PersistResult<Vec<RunRecord>> {
        let mut query = SelectQuery::from(RUNS_TABLE).columns(RUN_COLUMNS);
        if let Some(status) = filter.status {
            query = query.filter(Predicate::eq("status", status.as_str()));
        }
        if let Some(thread_id) = &filter.thread_id {
            query = query.filter(Predicate::eq("thread_id", thread_id.as_str()));
        }
        if let Some(started_after) = filter.started_after {
            query = query.filter(Predicate::gte("started_at", started_after));
        }
        query = query.order_by("started_at", Order::Desc);
        if let Some(limit) = filter.limit {
            query = query.limit(limit);
        }
        let query = query.compile()?;

        let raws = self
            .with_conn(|conn| {
                let mut stmt = conn.prepare(&query.sql)?;
                let rows = stmt.query_map(params_from_iter(query.params.iter()), read_raw)?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;
        raws.into_iter().map(into_record).collect()
    }
}
