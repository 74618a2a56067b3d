use crate::job::{self, JobId, JobRecord, JobStatus, Outcome};
use crate::migrations::{self, Migrator};
use crate::stats::ReportingWindow;
use chrono::NaiveDateTime;
use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Job store busy: lock wait exceeded, retry later")]
    ContentionTimeout,

    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Unknown job status code: {0}")]
    UnknownStatus(i64),

    #[error("Unparseable timestamp in job store: {0:?}")]
    BadTimestamp(String),

    #[error("SQLite error: {0}")]
    Sqlite(rusqlite::Error),
}

impl StoreError {
    /// Contention is the only failure a caller can fix by trying again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::ContentionTimeout)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _)
                if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
            {
                StoreError::ContentionTimeout
            }
            _ => StoreError::Sqlite(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// The persisted job queue shared by the worker pools and the stats path.
///
/// Worker processes write disjoint rows concurrently; the store relies on
/// SQLite's own locking with a bounded busy wait instead of any in-process lock.
pub struct JobStore {
    conn: Connection,
    path: PathBuf,
    lock_timeout: Duration,
}

// Raw column values, converted outside the rusqlite row closure so that
// conversion failures surface as StoreError.
type RawRow = (i64, i64, Option<String>, Option<String>, Option<String>);

const SELECT_COLUMNS: &str = "SELECT id, status, submitted, started, finished FROM jobs";

impl JobStore {
    /// Create (or upgrade) a store at `path` and bring its schema up to date.
    pub fn create(path: impl AsRef<Path>, lock_timeout: Duration) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.busy_timeout(lock_timeout)?;
        // WAL lets the stats readers run while a worker holds the write lock.
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;

        let mut migrator = Migrator::new(conn);
        migrator.run_migrations()?;

        Ok(Self {
            conn: migrator.into_connection(),
            path: path.to_path_buf(),
            lock_timeout,
        })
    }

    /// Open an existing store. Never creates the file.
    pub fn open(path: impl AsRef<Path>, lock_timeout: Duration) -> Result<Self> {
        Self::open_with_flags(
            path.as_ref(),
            lock_timeout,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
    }

    fn open_with_flags(path: &Path, lock_timeout: Duration, flags: OpenFlags) -> Result<Self> {
        let conn = Connection::open_with_flags(path, flags)?;
        conn.busy_timeout(lock_timeout)?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
            lock_timeout,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    pub fn schema_version(&self) -> Result<i32> {
        Ok(migrations::current_version(&self.conn)?)
    }

    /// True when the schema matches what this build expects.
    pub fn is_initialized(&self) -> Result<bool> {
        Ok(self.schema_version()? == migrations::SCHEMA_VERSION)
    }

    pub fn submit(&self) -> Result<JobId> {
        self.submit_at(job::now())
    }

    pub fn submit_at(&self, at: NaiveDateTime) -> Result<JobId> {
        self.conn.execute(
            "INSERT INTO jobs (status, submitted) VALUES (?1, ?2)",
            params![JobStatus::Queued.code(), job::format_timestamp(&at)],
        )?;
        Ok(JobId(self.conn.last_insert_rowid()))
    }

    /// Queued -> Running for a specific job.
    pub fn claim(&mut self, id: JobId) -> Result<JobRecord> {
        self.claim_at(id, job::now())
    }

    pub fn claim_at(&mut self, id: JobId, at: NaiveDateTime) -> Result<JobRecord> {
        self.transition_at(id, JobStatus::Running, at)
    }

    /// Claim the oldest queued job, if any.
    pub fn claim_next(&mut self) -> Result<Option<JobRecord>> {
        self.claim_next_at(job::now())
    }

    pub fn claim_next_at(&mut self, at: NaiveDateTime) -> Result<Option<JobRecord>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let raw = tx
            .query_row(
                &format!("{} WHERE status = ?1 ORDER BY id LIMIT 1", SELECT_COLUMNS),
                params![JobStatus::Queued.code()],
                read_raw,
            )
            .optional()?;
        let current = match raw {
            Some(raw) => decode(raw)?,
            None => return Ok(None),
        };
        let updated = apply_transition(&tx, current, JobStatus::Running, at)?;
        tx.commit()?;
        Ok(Some(updated))
    }

    /// Running -> Done/Failed.
    pub fn complete(&mut self, id: JobId, outcome: Outcome) -> Result<JobRecord> {
        self.complete_at(id, outcome, job::now())
    }

    pub fn complete_at(
        &mut self,
        id: JobId,
        outcome: Outcome,
        at: NaiveDateTime,
    ) -> Result<JobRecord> {
        self.transition_at(id, outcome.into(), at)
    }

    fn transition_at(&mut self, id: JobId, next: JobStatus, at: NaiveDateTime) -> Result<JobRecord> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = fetch(&tx, id)?.ok_or(StoreError::NotFound(id))?;
        let updated = apply_transition(&tx, current, next, at)?;
        tx.commit()?;
        Ok(updated)
    }

    pub fn get(&self, id: JobId) -> Result<Option<JobRecord>> {
        fetch(&self.conn, id)
    }

    /// Most recent jobs first.
    pub fn list(&self, status: Option<JobStatus>, limit: Option<usize>) -> Result<Vec<JobRecord>> {
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let mut stmt = self.conn.prepare(&format!(
            "{} WHERE (?1 IS NULL OR status = ?1) ORDER BY id DESC LIMIT ?2",
            SELECT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![status.map(JobStatus::code), limit], read_raw)?;

        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(decode(row?)?);
        }
        Ok(jobs)
    }

    /// Jobs that are Queued or Running.
    pub fn pending_count(&self) -> Result<u64> {
        self.count_in(JobStatus::Queued, JobStatus::Running)
    }

    /// Jobs that are Done or Failed.
    pub fn processed_count(&self) -> Result<u64> {
        self.count_in(JobStatus::Done, JobStatus::Failed)
    }

    fn count_in(&self, a: JobStatus, b: JobStatus) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(id) FROM jobs WHERE status IN (?1, ?2)",
            params![a.code(), b.code()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// `(started, finished)` of completed jobs whose start falls inside `window`.
    ///
    /// Compared through `datetime()` so `T`-separated values written by
    /// external workers order correctly against the bound.
    pub fn completed_spans(
        &self,
        window: &ReportingWindow,
    ) -> Result<Vec<(NaiveDateTime, NaiveDateTime)>> {
        let since = window.since_bound().map(|ts| job::format_timestamp(&ts));
        let mut stmt = self.conn.prepare(
            "SELECT started, finished FROM jobs
             WHERE status IN (?1, ?2)
               AND started IS NOT NULL AND finished IS NOT NULL
               AND (?3 IS NULL OR datetime(started) > datetime(?3))",
        )?;
        let rows = stmt.query_map(
            params![JobStatus::Done.code(), JobStatus::Failed.code(), since],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        )?;

        let mut spans = Vec::new();
        for row in rows {
            let (started, finished) = row?;
            spans.push((parse_column(&started)?, parse_column(&finished)?));
        }
        Ok(spans)
    }
}

fn read_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn decode((id, status, submitted, started, finished): RawRow) -> Result<JobRecord> {
    Ok(JobRecord {
        id: JobId(id),
        status: JobStatus::from_code(status).ok_or(StoreError::UnknownStatus(status))?,
        submitted: submitted.as_deref().map(parse_column).transpose()?,
        started: started.as_deref().map(parse_column).transpose()?,
        finished: finished.as_deref().map(parse_column).transpose()?,
    })
}

fn parse_column(value: &str) -> Result<NaiveDateTime> {
    job::parse_timestamp(value).ok_or_else(|| StoreError::BadTimestamp(value.to_string()))
}

fn fetch(conn: &Connection, id: JobId) -> Result<Option<JobRecord>> {
    let raw = conn
        .query_row(
            &format!("{} WHERE id = ?1", SELECT_COLUMNS),
            params![id.0],
            read_raw,
        )
        .optional()?;
    raw.map(decode).transpose()
}

fn apply_transition(
    conn: &Connection,
    current: JobRecord,
    next: JobStatus,
    at: NaiveDateTime,
) -> Result<JobRecord> {
    if !current.status.can_transition_to(next) {
        return Err(StoreError::InvalidTransition {
            id: current.id,
            from: current.status,
            to: next,
        });
    }

    let updated = match next {
        JobStatus::Running => JobRecord {
            status: next,
            started: Some(at),
            ..current
        },
        JobStatus::Done | JobStatus::Failed => {
            // Never let a skewed clock produce finished < started.
            let finished = match current.started {
                Some(started) if at < started => {
                    log::warn!("Job {} finished before it started; clamping to start time", current.id);
                    started
                }
                _ => at,
            };
            JobRecord {
                status: next,
                finished: Some(finished),
                ..current
            }
        }
        JobStatus::Queued => {
            return Err(StoreError::InvalidTransition {
                id: current.id,
                from: current.status,
                to: next,
            })
        }
    };

    conn.execute(
        "UPDATE jobs SET status = ?1, started = ?2, finished = ?3 WHERE id = ?4",
        params![
            updated.status.code(),
            updated.started.as_ref().map(job::format_timestamp),
            updated.finished.as_ref().map(job::format_timestamp),
            updated.id.0
        ],
    )?;
    Ok(updated)
}
