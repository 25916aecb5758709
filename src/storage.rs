use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SubsecRound, TimeZone, Utc};
use rand::RngCore;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::job::{DetectionJob, JobId, JobOutcome, JobStatus, NewJob};

const ABORTED_BY_RESTART: &str = "interrupted by service restart";

/// Read/write contract for detection job records.
///
/// Every transition is a compare-and-set against the stored status, so two
/// callers racing on the same job cannot both win.
pub trait JobStore: Send + Sync {
    fn insert(&self, job: NewJob) -> Result<DetectionJob>;

    fn get(&self, id: JobId) -> Result<DetectionJob>;

    /// Newest first. `page` is 1-based.
    fn list(&self, page: u32, per_page: u32) -> Result<Page<DetectionJob>>;

    /// `uploaded -> processing`. `Conflict` if the job is already processing
    /// or terminal.
    fn begin_processing(&self, id: JobId) -> Result<DetectionJob>;

    /// `processing -> completed`.
    fn complete(&self, id: JobId, outcome: JobOutcome) -> Result<DetectionJob>;

    /// `processing -> failed`. The source image is left alone.
    fn fail(&self, id: JobId, cause: &str) -> Result<DetectionJob>;

    fn stats(&self) -> Result<JobStats>;

    /// Fail every job left in `processing` by a previous process. Returns the
    /// number of jobs recovered.
    fn recover_interrupted(&self) -> Result<usize>;
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub per_page: u32,
    pub total: u64,
    pub pages: u64,
}

impl<T> Page<T> {
    fn new(items: Vec<T>, page: u32, per_page: u32, total: u64) -> Self {
        Self {
            items,
            page,
            per_page,
            total,
            pages: total.div_ceil(per_page as u64),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct JobStats {
    pub total_detections: u64,
    pub completed_detections: u64,
    pub by_status: BTreeMap<String, u64>,
    /// Object counts per class label across completed jobs.
    pub class_distribution: BTreeMap<String, u64>,
    /// Percentage of all jobs that completed, 0 when there are none.
    pub success_rate: f64,
}

impl JobStats {
    fn from_parts<'a>(
        status_counts: impl IntoIterator<Item = (JobStatus, u64)>,
        completed_classes: impl IntoIterator<Item = &'a [String]>,
    ) -> Self {
        let mut stats = JobStats::default();
        for status in JobStatus::ALL {
            stats.by_status.insert(status.as_str().to_string(), 0);
        }
        for (status, count) in status_counts {
            stats.total_detections += count;
            if status == JobStatus::Completed {
                stats.completed_detections += count;
            }
            *stats.by_status.entry(status.as_str().to_string()).or_insert(0) += count;
        }
        for classes in completed_classes {
            for class in classes {
                *stats.class_distribution.entry(class.clone()).or_insert(0) += 1;
            }
        }
        if stats.total_detections > 0 {
            stats.success_rate =
                stats.completed_detections as f64 / stats.total_detections as f64 * 100.0;
        }
        stats
    }
}

fn check_page(page: u32, per_page: u32) -> Result<()> {
    if page == 0 {
        return Err(Error::Validation("page must be at least 1".into()));
    }
    if per_page == 0 {
        return Err(Error::Validation("per_page must be at least 1".into()));
    }
    Ok(())
}

/// Millisecond precision, matching what the SQLite store persists.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

fn transition_conflict(id: JobId, from: JobStatus, to: JobStatus) -> Error {
    if from == JobStatus::Processing && to == JobStatus::Processing {
        Error::Conflict(format!("detection {} is already processing", id))
    } else {
        Error::Conflict(format!(
            "detection {} cannot move from {} to {}",
            id, from, to
        ))
    }
}

/// Unique shared-cache in-memory database URI, handy for tests.
pub fn shared_memory_uri() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "file:roastwatch_{:x}?mode=memory&cache=shared",
        u64::from_le_bytes(bytes)
    )
}

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}

const JOB_COLUMNS: &str = "id, filename, original_path, result_path, detections_count, \
     confidence_scores, detection_classes, processing_time, status, capture_method, \
     origin_address, failure_reason, synthetic, created_at, updated_at";

/// Row as stored, before enum and JSON decoding.
struct StoredJob {
    id: i64,
    filename: String,
    original_path: String,
    result_path: Option<String>,
    detections_count: i64,
    confidence_scores: String,
    detection_classes: String,
    processing_time: Option<f64>,
    status: String,
    capture_method: String,
    origin_address: Option<String>,
    failure_reason: Option<String>,
    synthetic: bool,
    created_at: i64,
    updated_at: i64,
}

impl StoredJob {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            filename: row.get(1)?,
            original_path: row.get(2)?,
            result_path: row.get(3)?,
            detections_count: row.get(4)?,
            confidence_scores: row.get(5)?,
            detection_classes: row.get(6)?,
            processing_time: row.get(7)?,
            status: row.get(8)?,
            capture_method: row.get(9)?,
            origin_address: row.get(10)?,
            failure_reason: row.get(11)?,
            synthetic: row.get(12)?,
            created_at: row.get(13)?,
            updated_at: row.get(14)?,
        })
    }

    fn into_job(self) -> Result<DetectionJob> {
        Ok(DetectionJob {
            id: JobId(self.id),
            filename: self.filename,
            original_path: self.original_path,
            result_path: self.result_path,
            detections_count: u32::try_from(self.detections_count)
                .map_err(|_| Error::Storage("detections_count out of range".into()))?,
            confidence_scores: serde_json::from_str(&self.confidence_scores)?,
            detection_classes: serde_json::from_str(&self.detection_classes)?,
            processing_time: self.processing_time,
            status: self.status.parse()?,
            capture_method: self.capture_method.parse()?,
            origin_address: self.origin_address,
            failure_reason: self.failure_reason,
            synthetic: self.synthetic,
            created_at: from_epoch_ms(self.created_at)?,
            updated_at: from_epoch_ms(self.updated_at)?,
        })
    }
}

fn from_epoch_ms(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| Error::Storage(format!("timestamp {} out of range", ms)))
}

/// SQLite-backed job store. The connection is serialized behind a mutex;
/// transitions are single `UPDATE ... WHERE status = ?` statements.
pub struct SqliteJobStore {
    conn: Mutex<Connection>,
}

impl SqliteJobStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = open_db_connection(db_path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("job store connection lock poisoned".into()))
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS detections (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              filename TEXT NOT NULL,
              original_path TEXT NOT NULL,
              result_path TEXT,
              detections_count INTEGER NOT NULL DEFAULT 0,
              confidence_scores TEXT NOT NULL DEFAULT '[]',
              detection_classes TEXT NOT NULL DEFAULT '[]',
              processing_time REAL,
              status TEXT NOT NULL,
              capture_method TEXT NOT NULL,
              origin_address TEXT,
              failure_reason TEXT,
              synthetic INTEGER NOT NULL DEFAULT 0,
              created_at INTEGER NOT NULL,
              updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_detections_created ON detections(created_at);
            CREATE INDEX IF NOT EXISTS idx_detections_status ON detections(status);
            "#,
        )?;
        Ok(())
    }

    fn fetch(conn: &Connection, id: JobId) -> Result<Option<DetectionJob>> {
        let stored = conn
            .query_row(
                &format!("SELECT {} FROM detections WHERE id = ?1", JOB_COLUMNS),
                params![id.0],
                StoredJob::from_row,
            )
            .optional()?;
        stored.map(StoredJob::into_job).transpose()
    }

    /// Explain why a compare-and-set matched no row.
    fn cas_failure(conn: &Connection, id: JobId, to: JobStatus) -> Error {
        match Self::fetch(conn, id) {
            Ok(Some(job)) => transition_conflict(id, job.status, to),
            Ok(None) => Error::NotFound(format!("detection {} not found", id)),
            Err(err) => err,
        }
    }
}

impl JobStore for SqliteJobStore {
    fn insert(&self, new: NewJob) -> Result<DetectionJob> {
        let conn = self.conn()?;
        let created = now();
        let status = new.initial_status();
        let outcome = new.outcome.as_ref();
        let scores = serde_json::to_string(&outcome.map(|o| &o.confidence_scores).unwrap_or(&Vec::new()))?;
        let classes = serde_json::to_string(&outcome.map(|o| &o.detection_classes).unwrap_or(&Vec::new()))?;

        conn.execute(
            r#"
            INSERT INTO detections(
              filename, original_path, result_path, detections_count, confidence_scores,
              detection_classes, processing_time, status, capture_method, origin_address,
              synthetic, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)
            "#,
            params![
                new.filename,
                new.original_path,
                outcome.map(|o| o.result_path.as_str()),
                outcome.map(|o| o.detections_count).unwrap_or(0),
                scores,
                classes,
                outcome.map(|o| o.processing_time.as_secs_f64()),
                status.as_str(),
                new.capture_method.as_str(),
                new.origin_address,
                outcome.map(|o| o.synthetic).unwrap_or(false),
                created.timestamp_millis(),
            ],
        )?;
        let id = JobId(conn.last_insert_rowid());
        Ok(DetectionJob::from_new(id, new, created))
    }

    fn get(&self, id: JobId) -> Result<DetectionJob> {
        let conn = self.conn()?;
        Self::fetch(&conn, id)?.ok_or_else(|| Error::NotFound(format!("detection {} not found", id)))
    }

    fn list(&self, page: u32, per_page: u32) -> Result<Page<DetectionJob>> {
        check_page(page, per_page)?;
        let conn = self.conn()?;
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM detections", [], |row| row.get(0))?;
        let offset = (page as i64 - 1) * per_page as i64;

        let stored = {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM detections ORDER BY created_at DESC, id DESC LIMIT ?1 OFFSET ?2",
                JOB_COLUMNS
            ))?;
            let rows = stmt.query_map(params![per_page as i64, offset], StoredJob::from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        let items = stored
            .into_iter()
            .map(StoredJob::into_job)
            .collect::<Result<Vec<_>>>()?;
        Ok(Page::new(items, page, per_page, total as u64))
    }

    fn begin_processing(&self, id: JobId) -> Result<DetectionJob> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE detections SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
            params![
                JobStatus::Processing.as_str(),
                now().timestamp_millis(),
                id.0,
                JobStatus::Uploaded.as_str()
            ],
        )?;
        if changed == 0 {
            return Err(Self::cas_failure(&conn, id, JobStatus::Processing));
        }
        Self::fetch(&conn, id)?.ok_or_else(|| Error::NotFound(format!("detection {} not found", id)))
    }

    fn complete(&self, id: JobId, outcome: JobOutcome) -> Result<DetectionJob> {
        let conn = self.conn()?;
        let changed = conn.execute(
            r#"
            UPDATE detections SET
              status = ?1, result_path = ?2, detections_count = ?3, confidence_scores = ?4,
              detection_classes = ?5, processing_time = ?6, synthetic = ?7, updated_at = ?8
            WHERE id = ?9 AND status = ?10
            "#,
            params![
                JobStatus::Completed.as_str(),
                outcome.result_path,
                outcome.detections_count,
                serde_json::to_string(&outcome.confidence_scores)?,
                serde_json::to_string(&outcome.detection_classes)?,
                outcome.processing_time.as_secs_f64(),
                outcome.synthetic,
                now().timestamp_millis(),
                id.0,
                JobStatus::Processing.as_str()
            ],
        )?;
        if changed == 0 {
            return Err(Self::cas_failure(&conn, id, JobStatus::Completed));
        }
        Self::fetch(&conn, id)?.ok_or_else(|| Error::NotFound(format!("detection {} not found", id)))
    }

    fn fail(&self, id: JobId, cause: &str) -> Result<DetectionJob> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE detections SET status = ?1, failure_reason = ?2, updated_at = ?3 \
             WHERE id = ?4 AND status = ?5",
            params![
                JobStatus::Failed.as_str(),
                cause,
                now().timestamp_millis(),
                id.0,
                JobStatus::Processing.as_str()
            ],
        )?;
        if changed == 0 {
            return Err(Self::cas_failure(&conn, id, JobStatus::Failed));
        }
        Self::fetch(&conn, id)?.ok_or_else(|| Error::NotFound(format!("detection {} not found", id)))
    }

    fn stats(&self) -> Result<JobStats> {
        let conn = self.conn()?;
        let counts = {
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM detections GROUP BY status")?;
            let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        let counts = counts
            .into_iter()
            .map(|(status, count)| Ok((status.parse::<JobStatus>()?, count as u64)))
            .collect::<Result<Vec<_>>>()?;

        let classes = {
            let mut stmt =
                conn.prepare("SELECT detection_classes FROM detections WHERE status = ?1")?;
            let rows = stmt.query_map(params![JobStatus::Completed.as_str()], |row| {
                row.get::<_, String>(0)
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        let classes = classes
            .iter()
            .map(|json| serde_json::from_str::<Vec<String>>(json).map_err(Error::from))
            .collect::<Result<Vec<_>>>()?;

        Ok(JobStats::from_parts(counts, classes.iter().map(Vec::as_slice)))
    }

    fn recover_interrupted(&self) -> Result<usize> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE detections SET status = ?1, failure_reason = ?2, updated_at = ?3 \
             WHERE status = ?4",
            params![
                JobStatus::Failed.as_str(),
                ABORTED_BY_RESTART,
                now().timestamp_millis(),
                JobStatus::Processing.as_str()
            ],
        )?;
        Ok(changed)
    }
}

#[derive(Default)]
struct InMemoryState {
    next_id: i64,
    jobs: Vec<DetectionJob>,
}

impl InMemoryState {
    fn find_mut(&mut self, id: JobId) -> Result<&mut DetectionJob> {
        self.jobs
            .iter_mut()
            .find(|job| job.id == id)
            .ok_or_else(|| Error::NotFound(format!("detection {} not found", id)))
    }

    fn transition(&mut self, id: JobId, to: JobStatus) -> Result<&mut DetectionJob> {
        let job = self.find_mut(id)?;
        if !job.status.can_transition_to(to) {
            return Err(transition_conflict(id, job.status, to));
        }
        job.status = to;
        job.updated_at = now().max(job.created_at);
        Ok(job)
    }
}

/// Same semantics as [`SqliteJobStore`], kept in process memory.
#[derive(Default)]
pub struct InMemoryJobStore {
    state: Mutex<InMemoryState>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, InMemoryState>> {
        self.state
            .lock()
            .map_err(|_| Error::Storage("in-memory job store lock poisoned".into()))
    }
}

impl JobStore for InMemoryJobStore {
    fn insert(&self, new: NewJob) -> Result<DetectionJob> {
        let mut state = self.state()?;
        state.next_id += 1;
        let job = DetectionJob::from_new(JobId(state.next_id), new, now());
        state.jobs.push(job.clone());
        Ok(job)
    }

    fn get(&self, id: JobId) -> Result<DetectionJob> {
        let mut state = self.state()?;
        state.find_mut(id).map(|job| job.clone())
    }

    fn list(&self, page: u32, per_page: u32) -> Result<Page<DetectionJob>> {
        check_page(page, per_page)?;
        let state = self.state()?;
        let mut ordered: Vec<&DetectionJob> = state.jobs.iter().collect();
        ordered.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        let items = ordered
            .into_iter()
            .skip((page as usize - 1) * per_page as usize)
            .take(per_page as usize)
            .cloned()
            .collect();
        Ok(Page::new(items, page, per_page, state.jobs.len() as u64))
    }

    fn begin_processing(&self, id: JobId) -> Result<DetectionJob> {
        let mut state = self.state()?;
        state.transition(id, JobStatus::Processing).map(|job| job.clone())
    }

    fn complete(&self, id: JobId, outcome: JobOutcome) -> Result<DetectionJob> {
        let mut state = self.state()?;
        let job = state.transition(id, JobStatus::Completed)?;
        job.apply_outcome(outcome);
        Ok(job.clone())
    }

    fn fail(&self, id: JobId, cause: &str) -> Result<DetectionJob> {
        let mut state = self.state()?;
        let job = state.transition(id, JobStatus::Failed)?;
        job.failure_reason = Some(cause.to_string());
        Ok(job.clone())
    }

    fn stats(&self) -> Result<JobStats> {
        let state = self.state()?;
        let mut counts: BTreeMap<&'static str, (JobStatus, u64)> = BTreeMap::new();
        for job in &state.jobs {
            counts.entry(job.status.as_str()).or_insert((job.status, 0)).1 += 1;
        }
        let completed = state
            .jobs
            .iter()
            .filter(|job| job.status == JobStatus::Completed)
            .map(|job| job.detection_classes.as_slice());
        Ok(JobStats::from_parts(counts.into_values(), completed))
    }

    fn recover_interrupted(&self) -> Result<usize> {
        let mut state = self.state()?;
        let stamp = now();
        let mut recovered = 0;
        for job in state
            .jobs
            .iter_mut()
            .filter(|job| job.status == JobStatus::Processing)
        {
            job.status = JobStatus::Failed;
            job.failure_reason = Some(ABORTED_BY_RESTART.to_string());
            job.updated_at = stamp.max(job.created_at);
            recovered += 1;
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::CaptureMethod;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    fn stores() -> Vec<Box<dyn JobStore>> {
        vec![
            Box::new(SqliteJobStore::open(&shared_memory_uri()).unwrap()),
            Box::new(InMemoryJobStore::new()),
        ]
    }

    fn outcome(classes: &[&str]) -> JobOutcome {
        JobOutcome {
            result_path: "result_x.jpg".into(),
            detections_count: classes.len() as u32,
            confidence_scores: classes.iter().map(|_| 0.9).collect(),
            detection_classes: classes.iter().map(|c| c.to_string()).collect(),
            processing_time: Duration::from_millis(25),
            synthetic: false,
        }
    }

    #[test]
    fn insert_then_get_roundtrips_fields() {
        for store in stores() {
            let job = store
                .insert(NewJob::uploaded("beans.png", "abc.png"))
                .unwrap();
            assert_eq!(job.status, JobStatus::Uploaded);
            assert_eq!(store.get(job.id).unwrap(), job);
            job.check_invariants().unwrap();
        }
    }

    #[test]
    fn lifecycle_enforces_the_state_machine() {
        for store in stores() {
            let job = store.insert(NewJob::uploaded("a.png", "a.png")).unwrap();
            assert_eq!(
                store.complete(job.id, outcome(&[])).unwrap_err().kind(),
                crate::ErrorKind::Conflict
            );
            store.begin_processing(job.id).unwrap();
            assert_eq!(
                store.begin_processing(job.id).unwrap_err().kind(),
                crate::ErrorKind::Conflict
            );
            let done = store.complete(job.id, outcome(&["dark_roast"])).unwrap();
            assert_eq!(done.status, JobStatus::Completed);
            assert_eq!(done.detection_classes, vec!["dark_roast"]);
            done.check_invariants().unwrap();

            assert_eq!(
                store.fail(job.id, "late").unwrap_err().kind(),
                crate::ErrorKind::Conflict
            );
            assert_eq!(
                store.begin_processing(job.id).unwrap_err().kind(),
                crate::ErrorKind::Conflict
            );
        }
    }

    #[test]
    fn fail_records_the_cause_and_keeps_the_source() {
        for store in stores() {
            let job = store.insert(NewJob::uploaded("a.png", "src.png")).unwrap();
            store.begin_processing(job.id).unwrap();
            let failed = store.fail(job.id, "model exploded").unwrap();
            assert_eq!(failed.status, JobStatus::Failed);
            assert_eq!(failed.failure_reason.as_deref(), Some("model exploded"));
            assert_eq!(failed.original_path, "src.png");
            assert!(failed.result_path.is_none());
            failed.check_invariants().unwrap();
        }
    }

    #[test]
    fn unknown_ids_are_not_found() {
        for store in stores() {
            assert_eq!(
                store.get(JobId(99)).unwrap_err().kind(),
                crate::ErrorKind::NotFound
            );
            assert_eq!(
                store.begin_processing(JobId(99)).unwrap_err().kind(),
                crate::ErrorKind::NotFound
            );
        }
    }

    #[test]
    fn list_is_newest_first_and_paginated() {
        for store in stores() {
            for i in 0..5 {
                store
                    .insert(NewJob::uploaded(format!("{}.png", i), format!("{}.png", i)))
                    .unwrap();
            }
            let first = store.list(1, 2).unwrap();
            assert_eq!(first.total, 5);
            assert_eq!(first.pages, 3);
            assert_eq!(first.items.len(), 2);
            assert_eq!(first.items[0].filename, "4.png");
            assert_eq!(first.items[1].filename, "3.png");

            let last = store.list(3, 2).unwrap();
            assert_eq!(last.items.len(), 1);
            assert_eq!(last.items[0].filename, "0.png");

            assert!(store.list(4, 2).unwrap().items.is_empty());
            assert_eq!(
                store.list(0, 2).unwrap_err().kind(),
                crate::ErrorKind::Validation
            );
        }
    }

    #[test]
    fn stats_count_completed_classes_only() {
        for store in stores() {
            assert_eq!(store.stats().unwrap().success_rate, 0.0);

            let done = store
                .insert(NewJob::completed(
                    "a.jpg",
                    "a.jpg",
                    CaptureMethod::LiveStream,
                    outcome(&["dark_roast", "light_roast", "dark_roast"]),
                ))
                .unwrap();
            assert_eq!(done.status, JobStatus::Completed);

            let pending = store.insert(NewJob::uploaded("b.png", "b.png")).unwrap();
            store.begin_processing(pending.id).unwrap();

            let stats = store.stats().unwrap();
            assert_eq!(stats.total_detections, 2);
            assert_eq!(stats.completed_detections, 1);
            assert_eq!(stats.success_rate, 50.0);
            assert_eq!(stats.by_status["processing"], 1);
            assert_eq!(stats.by_status["failed"], 0);
            assert_eq!(stats.class_distribution["dark_roast"], 2);
            assert_eq!(stats.class_distribution["light_roast"], 1);
        }
    }

    #[test]
    fn completed_inserts_keep_origin_and_method() {
        for store in stores() {
            let job = store
                .insert(
                    NewJob::completed("f.jpg", "f.jpg", CaptureMethod::DirectCapture, outcome(&[]))
                        .with_origin("10.0.0.7:5000"),
                )
                .unwrap();
            let fetched = store.get(job.id).unwrap();
            assert_eq!(fetched.capture_method, CaptureMethod::DirectCapture);
            assert_eq!(fetched.origin_address.as_deref(), Some("10.0.0.7:5000"));
            assert_eq!(fetched.detections_count, 0);
            assert_eq!(fetched.result_path.as_deref(), Some("result_x.jpg"));
        }
    }

    #[test]
    fn recover_interrupted_fails_stuck_jobs() {
        for store in stores() {
            let stuck = store.insert(NewJob::uploaded("a.png", "a.png")).unwrap();
            let idle = store.insert(NewJob::uploaded("b.png", "b.png")).unwrap();
            store.begin_processing(stuck.id).unwrap();

            assert_eq!(store.recover_interrupted().unwrap(), 1);
            assert_eq!(store.get(stuck.id).unwrap().status, JobStatus::Failed);
            assert_eq!(store.get(idle.id).unwrap().status, JobStatus::Uploaded);
        }
    }

    #[test]
    fn concurrent_begin_processing_has_one_winner() {
        for store in stores() {
            let store: Arc<dyn JobStore> = Arc::from(store);
            for _ in 0..10 {
                let job = store.insert(NewJob::uploaded("a.png", "a.png")).unwrap();
                let barrier = Arc::new(Barrier::new(4));
                let handles: Vec<_> = (0..4)
                    .map(|_| {
                        let store = Arc::clone(&store);
                        let barrier = Arc::clone(&barrier);
                        thread::spawn(move || {
                            barrier.wait();
                            store.begin_processing(job.id)
                        })
                    })
                    .collect();
                let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
                assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
                for err in results.iter().filter_map(|r| r.as_ref().err()) {
                    assert_eq!(err.kind(), crate::ErrorKind::Conflict);
                }
            }
        }
    }
}
