//! SQLite-backed target store implementation.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};

use super::{
    PipelineStats, StoreError, TargetFile, TargetStore, TaskFilter, TaskStatus, RECOVERY_MESSAGE,
};

/// SQLite-backed task ledger. The single connection behind a mutex
/// gives the store its serialized-writer guarantee.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn new(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store (useful for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS target_files (
                path              TEXT PRIMARY KEY,
                pipeline_name     TEXT NOT NULL,
                status            TEXT NOT NULL DEFAULT 'queued',
                error_count       INTEGER NOT NULL DEFAULT 0,
                error_message     TEXT,
                queued_at         TEXT NOT NULL,
                started_at        TEXT,
                completed_at      TEXT,
                last_attempted_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_target_files_pipeline ON target_files(pipeline_name);
            CREATE INDEX IF NOT EXISTS idx_target_files_status ON target_files(status);

            CREATE TABLE IF NOT EXISTS pipeline_overrides (
                name       TEXT PRIMARY KEY,
                extra_json TEXT NOT NULL DEFAULT '{}'
            );
            "#,
        )?;
        Ok(())
    }

    fn row_to_target_file(row: &rusqlite::Row) -> rusqlite::Result<TargetFile> {
        let path: String = row.get(0)?;
        let pipeline_name: String = row.get(1)?;
        let status_str: String = row.get(2)?;
        let error_count: u32 = row.get(3)?;
        let error_message: Option<String> = row.get(4)?;
        let queued_at_str: String = row.get(5)?;
        let started_at_str: Option<String> = row.get(6)?;
        let completed_at_str: Option<String> = row.get(7)?;
        let last_attempted_at_str: Option<String> = row.get(8)?;

        let status = TaskStatus::parse(&status_str).unwrap_or(TaskStatus::Errored);

        Ok(TargetFile {
            path,
            pipeline_name,
            status,
            error_count,
            error_message,
            queued_at: parse_time(&queued_at_str).unwrap_or_else(Utc::now),
            started_at: started_at_str.as_deref().and_then(parse_time),
            completed_at: completed_at_str.as_deref().and_then(parse_time),
            last_attempted_at: last_attempted_at_str.as_deref().and_then(parse_time),
        })
    }
}

const SELECT_COLUMNS: &str = "path, pipeline_name, status, error_count, error_message, \
     queued_at, started_at, completed_at, last_attempted_at";

impl TargetStore for SqliteStore {
    fn upsert_queued(&self, path: &str, pipeline: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO target_files (path, pipeline_name, status, queued_at)
             VALUES (?1, ?2, 'queued', ?3)
             ON CONFLICT(path) DO UPDATE SET
                 status = 'queued',
                 queued_at = excluded.queued_at
             WHERE target_files.status IN ('errored', 'paused')",
            params![path, pipeline, now()],
        )?;
        Ok(())
    }

    fn mark_in_flight(&self, path: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let stamp = now();
        conn.execute(
            "UPDATE target_files
             SET status = 'in_flight', started_at = ?1, last_attempted_at = ?1
             WHERE path = ?2",
            params![stamp, path],
        )?;
        Ok(())
    }

    fn mark_completed(&self, path: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE target_files
             SET status = 'completed', completed_at = ?1
             WHERE path = ?2",
            params![now(), path],
        )?;
        Ok(())
    }

    fn mark_errored(&self, path: &str, message: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE target_files
             SET status = 'errored', error_count = error_count + 1,
                 error_message = ?1, last_attempted_at = ?2
             WHERE path = ?3",
            params![message, now(), path],
        )?;
        Ok(())
    }

    fn mark_paused(&self, path: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE target_files SET status = 'paused'
             WHERE path = ?1 AND status != 'completed'",
            params![path],
        )?;
        Ok(())
    }

    fn mark_resumed(&self, path: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE target_files SET status = 'queued', error_message = NULL
             WHERE path = ?1 AND status != 'completed'",
            params![path],
        )?;
        Ok(())
    }

    fn get_by_path(&self, path: &str) -> Result<Option<TargetFile>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let result = conn.query_row(
            &format!("SELECT {SELECT_COLUMNS} FROM target_files WHERE path = ?1"),
            params![path],
            Self::row_to_target_file,
        );
        match result {
            Ok(file) => Ok(Some(file)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<TargetFile>, StoreError> {
        let conn = self.conn.lock().unwrap();

        let mut sql = format!("SELECT {SELECT_COLUMNS} FROM target_files WHERE 1=1");
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(ref pipeline) = filter.pipeline {
            sql.push_str(" AND pipeline_name = ?");
            args.push(Box::new(pipeline.clone()));
        }
        if let Some(status) = filter.status {
            sql.push_str(" AND status = ?");
            args.push(Box::new(status.as_str()));
        }
        sql.push_str(" ORDER BY queued_at DESC");
        if filter.limit > 0 {
            sql.push_str(" LIMIT ? OFFSET ?");
            args.push(Box::new(filter.limit));
            args.push(Box::new(filter.offset));
        }

        let mut stmt = conn.prepare(&sql)?;
        let arg_refs: Vec<&dyn rusqlite::ToSql> = args.iter().map(|a| a.as_ref()).collect();
        let rows = stmt.query_map(arg_refs.as_slice(), Self::row_to_target_file)?;

        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?);
        }
        Ok(tasks)
    }

    fn pipeline_stats(&self, pipeline: &str) -> Result<PipelineStats, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM target_files
             WHERE pipeline_name = ?1 GROUP BY status",
        )?;
        let rows = stmt.query_map(params![pipeline], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut stats = PipelineStats::default();
        for row in rows {
            let (status, count) = row?;
            match TaskStatus::parse(&status) {
                Some(TaskStatus::Queued) => stats.queued = count,
                Some(TaskStatus::InFlight) => stats.in_flight = count,
                Some(TaskStatus::Completed) => stats.completed = count,
                Some(TaskStatus::Errored) => stats.errored = count,
                Some(TaskStatus::Paused) => stats.paused = count,
                None => {}
            }
        }
        Ok(stats)
    }

    fn get_pipeline_extra(&self, name: &str) -> Result<String, StoreError> {
        let conn = self.conn.lock().unwrap();
        let result = conn.query_row(
            "SELECT extra_json FROM pipeline_overrides WHERE name = ?1",
            params![name],
            |row| row.get::<_, String>(0),
        );
        match result {
            Ok(extra) => Ok(extra),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok("{}".to_string()),
            Err(e) => Err(e.into()),
        }
    }

    fn set_pipeline_extra(&self, name: &str, extra_json: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO pipeline_overrides (name, extra_json) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET extra_json = excluded.extra_json",
            params![name, extra_json],
        )?;
        Ok(())
    }

    fn recover_in_flight(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock().unwrap();
        let swept = conn.execute(
            "UPDATE target_files
             SET status = 'errored', error_count = error_count + 1,
                 error_message = ?1, last_attempted_at = ?2
             WHERE status = 'in_flight'",
            params![RECOVERY_MESSAGE, now()],
        )?;
        Ok(swept)
    }
}

/// RFC-3339 with nanoseconds, UTC.
fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}
