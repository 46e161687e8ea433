//! libSQL backend — async `JobStore` implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::info;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{JobLog, JobRecord, JobStore};
use crate::worker::state::JobStatus;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_jobs(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
        op: &str,
    ) -> Result<Vec<JobRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut jobs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            match row_to_job(&row) {
                Ok(job) => jobs.push(job),
                Err(e) => tracing::warn!("Skipping job instance row: {e}"),
            }
        }
        Ok(jobs)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format. Fixed precision keeps string comparison in
/// SQL consistent with chronological order.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn parse_uuid(s: &str, column: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("{column}: {e}")))
}

/// Column list for job instance SELECT queries.
const JOB_COLUMNS: &str = "id, job_name, status, argument, invocation_context, progress, progress_text, schedule_time, created_at, updated_at";

/// Map a libsql Row to a JobRecord. Column order matches `JOB_COLUMNS`.
fn row_to_job(row: &libsql::Row) -> Result<JobRecord, DatabaseError> {
    let get_err = |column: &str, e: libsql::Error| DatabaseError::Query(format!("job.{column}: {e}"));

    let id_str: String = row.get(0).map_err(|e| get_err("id", e))?;
    let status_str: String = row.get(2).map_err(|e| get_err("status", e))?;
    let progress: i64 = row.get(5).unwrap_or(0);
    let schedule_str: Option<String> = row.get(7).ok();
    let created_str: String = row.get(8).map_err(|e| get_err("created_at", e))?;
    let updated_str: String = row.get(9).map_err(|e| get_err("updated_at", e))?;

    Ok(JobRecord {
        id: parse_uuid(&id_str, "job.id")?,
        job_name: row.get(1).map_err(|e| get_err("job_name", e))?,
        status: status_str
            .parse()
            .map_err(DatabaseError::Serialization)?,
        argument: row.get(3).unwrap_or_else(|_| "null".to_string()),
        invocation_context: row.get(4).unwrap_or_else(|_| "{}".to_string()),
        progress: progress.clamp(0, 100) as u32,
        progress_text: row.get(6).unwrap_or_default(),
        schedule_time: parse_optional_datetime(&schedule_str),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

/// Map a libsql Row to a JobLog. Columns: id, job_instance_id, content, created_at.
fn row_to_log(row: &libsql::Row) -> Result<JobLog, DatabaseError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("log.id: {e}")))?;
    let job_str: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("log.job_instance_id: {e}")))?;
    let created_str: String = row
        .get(3)
        .map_err(|e| DatabaseError::Query(format!("log.created_at: {e}")))?;

    Ok(JobLog {
        id: parse_uuid(&id_str, "log.id")?,
        job_instance_id: parse_uuid(&job_str, "log.job_instance_id")?,
        content: row.get(2).unwrap_or_default(),
        created_at: parse_datetime(&created_str),
    })
}

/// SET clause shared by status writes: `new` resets progress and its text.
const STATUS_SET_CLAUSE: &str = "status = ?1, \
     progress = CASE ?1 WHEN 'new' THEN 0 ELSE progress END, \
     progress_text = CASE ?1 WHEN 'new' THEN '' ELSE progress_text END, \
     updated_at = ?2";

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl JobStore for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Instances ───────────────────────────────────────────────────

    async fn insert_job(&self, job: &JobRecord) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let schedule_time = job.schedule_time.as_ref().map(format_datetime);
        conn.execute(
            &format!(
                "INSERT INTO job_instances ({JOB_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
            ),
            params![
                job.id.to_string(),
                job.job_name.clone(),
                job.status.as_str(),
                job.argument.clone(),
                job.invocation_context.clone(),
                job.progress as i64,
                job.progress_text.clone(),
                schedule_time,
                format_datetime(&job.created_at),
                format_datetime(&job.updated_at),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("insert_job: {e}")))?;
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<JobRecord>, DatabaseError> {
        let mut jobs = self
            .query_jobs(
                &format!("SELECT {JOB_COLUMNS} FROM job_instances WHERE id = ?1"),
                params![id.to_string()],
                "get_job",
            )
            .await?;
        Ok(jobs.pop())
    }

    async fn get_job_status(&self, id: Uuid) -> Result<Option<JobStatus>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT status FROM job_instances WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_job_status: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_job_status: {e}")))?
        {
            Some(row) => {
                let status: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("get_job_status: {e}")))?;
                if status.is_empty() {
                    return Err(DatabaseError::Query(format!(
                        "job instance {id} has an empty status"
                    )));
                }
                status
                    .parse()
                    .map(Some)
                    .map_err(DatabaseError::Serialization)
            }
            None => Ok(None),
        }
    }

    async fn update_job_status(
        &self,
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let count = conn
            .execute(
                &format!("UPDATE job_instances SET {STATUS_SET_CLAUSE} WHERE id = ?3 AND status = ?4"),
                params![
                    to.as_str(),
                    format_datetime(&Utc::now()),
                    id.to_string(),
                    from.as_str(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_job_status: {e}")))?;
        Ok(count > 0)
    }

    async fn force_job_status(&self, id: Uuid, status: JobStatus) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let count = conn
            .execute(
                &format!("UPDATE job_instances SET {STATUS_SET_CLAUSE} WHERE id = ?3"),
                params![status.as_str(), format_datetime(&Utc::now()), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("force_job_status: {e}")))?;
        if count == 0 {
            return Err(DatabaseError::NotFound {
                entity: "job_instance".to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn update_job_progress(&self, id: Uuid, progress: u32) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let count = conn
            .execute(
                "UPDATE job_instances SET progress = ?1, updated_at = ?2 WHERE id = ?3",
                params![
                    progress.min(100) as i64,
                    format_datetime(&Utc::now()),
                    id.to_string()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_job_progress: {e}")))?;
        if count == 0 {
            return Err(DatabaseError::NotFound {
                entity: "job_instance".to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn update_job_progress_text(&self, id: Uuid, text: &str) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let count = conn
            .execute(
                "UPDATE job_instances SET progress_text = ?1, updated_at = ?2 WHERE id = ?3",
                params![text, format_datetime(&Utc::now()), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_job_progress_text: {e}")))?;
        if count == 0 {
            return Err(DatabaseError::NotFound {
                entity: "job_instance".to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn list_jobs_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<JobRecord>, DatabaseError> {
        self.query_jobs(
            &format!(
                "SELECT {JOB_COLUMNS} FROM job_instances WHERE status = ?1 ORDER BY created_at ASC LIMIT ?2"
            ),
            params![status.as_str(), limit as i64],
            "list_jobs_by_status",
        )
        .await
    }

    async fn list_dispatchable_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, DatabaseError> {
        self.query_jobs(
            &format!(
                "SELECT {JOB_COLUMNS} FROM job_instances \
                 WHERE status IN ('new', 'scheduled') \
                   AND (schedule_time IS NULL OR schedule_time <= ?1) \
                 ORDER BY created_at ASC LIMIT ?2"
            ),
            params![format_datetime(&now), limit as i64],
            "list_dispatchable_jobs",
        )
        .await
    }

    // ── Logs ────────────────────────────────────────────────────────

    async fn append_job_log(&self, job_id: Uuid, content: &str) -> Result<JobLog, DatabaseError> {
        let conn = self.conn();
        let log = JobLog {
            id: Uuid::new_v4(),
            job_instance_id: job_id,
            content: content.to_string(),
            created_at: Utc::now(),
        };
        conn.execute(
            "INSERT INTO job_logs (id, job_instance_id, content, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                log.id.to_string(),
                job_id.to_string(),
                content,
                format_datetime(&log.created_at),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("append_job_log: {e}")))?;
        Ok(log)
    }

    async fn list_job_logs(&self, job_id: Uuid) -> Result<Vec<JobLog>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT id, job_instance_id, content, created_at FROM job_logs \
                 WHERE job_instance_id = ?1 ORDER BY seq ASC",
                params![job_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_job_logs: {e}")))?;

        let mut logs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_job_logs: {e}")))?
        {
            logs.push(row_to_log(&row)?);
        }
        Ok(logs)
    }
}
