use crate::error::{ClientError, Result};
use pbsflow_core::config::FailurePolicy;
use pbsflow_core::engine::{
    aggregate_pipeline_status, pipeline_failure_targets, JobKey, ManagedJobStatus, PipelineStatus,
};
use pbsflow_core::model::JobRef;
use pbsflow_core::tool::ResourceRequest;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::{Path, PathBuf};

const STARTED_KEY: &str = "is_started";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineRecord {
    pub key: i64,
    pub name: String,
    pub log_dir: PathBuf,
    pub status: PipelineStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub key: JobKey,
    pub pipeline: i64,
    pub name: String,
    pub script: PathBuf,
    pub workdir: PathBuf,
    pub resources: ResourceRequest,
    pub status: ManagedJobStatus,
    pub batch_id: Option<JobRef>,
    pub environment: Option<String>,
}

/// A job about to be inserted.
#[derive(Debug, Clone)]
pub struct NewJob<'a> {
    pub name: &'a str,
    pub script: &'a Path,
    pub workdir: &'a Path,
    pub resources: &'a ResourceRequest,
    pub environment: Option<String>,
}

type RawJob = (
    i64,
    i64,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
);

const JOB_COLUMNS: &str = "job.id, job.pipeline_id, job.name, job.script, job.workdir, \
                           job.resources, job.status, job.batch_id, job.environment";

fn corrupt(what: impl std::fmt::Display) -> ClientError {
    ClientError::CorruptStore(what.to_string())
}

fn read_raw_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawJob> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn job_from_raw(raw: RawJob) -> Result<JobRecord> {
    let (key, pipeline, name, script, workdir, resources, status, batch_id, environment) = raw;
    Ok(JobRecord {
        key,
        pipeline,
        name,
        script: PathBuf::from(script),
        workdir: PathBuf::from(workdir),
        resources: serde_json::from_str(&resources)?,
        status: status.parse().map_err(corrupt)?,
        batch_id: batch_id.map(JobRef),
        environment,
    })
}

/// Durable job graph behind the managed scheduler.
pub struct ManagedStore {
    conn: Connection,
    path: PathBuf,
}

impl ManagedStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn, path.to_path_buf())
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn, PathBuf::from(":memory:"))
    }

    fn with_connection(conn: Connection, path: PathBuf) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS pipeline (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                log_dir TEXT NOT NULL,
                status TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS job (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                pipeline_id INTEGER NOT NULL REFERENCES pipeline(id),
                name TEXT NOT NULL,
                script TEXT NOT NULL,
                workdir TEXT NOT NULL,
                resources TEXT NOT NULL,
                status TEXT NOT NULL,
                batch_id TEXT,
                environment TEXT
            );
            CREATE TABLE IF NOT EXISTS job_dependency (
                job_id INTEGER NOT NULL REFERENCES job(id),
                depends_on INTEGER NOT NULL REFERENCES job(id),
                PRIMARY KEY (job_id, depends_on)
            );
            CREATE INDEX IF NOT EXISTS idx_job_status ON job(status);
            CREATE INDEX IF NOT EXISTS idx_job_dependency_target
                ON job_dependency(depends_on);",
        )?;
        Ok(Self { conn, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Groups the following writes; they are rolled back unless committed.
    pub fn begin(&self) -> Result<Transaction<'_>> {
        Ok(self.conn.unchecked_transaction()?)
    }

    pub fn is_started(&self) -> Result<bool> {
        let value: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM meta WHERE key = ?1",
                params![STARTED_KEY],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.as_deref() == Some("1"))
    }

    /// Once set, the flag is never cleared.
    pub fn mark_started(&self) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, '1')",
            params![STARTED_KEY],
        )?;
        Ok(())
    }

    fn ensure_not_started(&self) -> Result<()> {
        if self.is_started()? {
            return Err(ClientError::StoreStarted(self.path.clone()));
        }
        Ok(())
    }

    pub fn add_pipeline(&self, name: &str, log_dir: &Path) -> Result<i64> {
        self.ensure_not_started()?;
        if self.pipeline(name)?.is_some() {
            return Err(ClientError::DuplicatePipeline(name.to_string()));
        }
        self.conn.execute(
            "INSERT INTO pipeline (name, log_dir, status) VALUES (?1, ?2, ?3)",
            params![
                name,
                log_dir.to_string_lossy(),
                PipelineStatus::NotSubmitted.as_str()
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn add_job(&self, pipeline: i64, job: &NewJob<'_>, depends_on: &[JobKey]) -> Result<JobKey> {
        self.ensure_not_started()?;
        self.conn.execute(
            "INSERT INTO job (pipeline_id, name, script, workdir, resources, status, environment)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                pipeline,
                job.name,
                job.script.to_string_lossy(),
                job.workdir.to_string_lossy(),
                serde_json::to_string(job.resources)?,
                ManagedJobStatus::NotSubmitted.as_str(),
                job.environment,
            ],
        )?;
        let key = self.conn.last_insert_rowid();
        for dep in depends_on {
            self.conn.execute(
                "INSERT OR IGNORE INTO job_dependency (job_id, depends_on) VALUES (?1, ?2)",
                params![key, dep],
            )?;
        }
        Ok(key)
    }

    fn read_pipelines(
        &self,
        filter: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<PipelineRecord>> {
        let sql = format!(
            "SELECT id, name, log_dir, status FROM pipeline {} ORDER BY id",
            filter
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(args, |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|(key, name, log_dir, status)| {
                Ok(PipelineRecord {
                    key,
                    name,
                    log_dir: PathBuf::from(log_dir),
                    status: status.parse().map_err(corrupt)?,
                })
            })
            .collect()
    }

    pub fn pipelines(&self) -> Result<Vec<PipelineRecord>> {
        self.read_pipelines("", params![])
    }

    /// The stored record; its status is whatever the last refresh wrote.
    pub fn pipeline(&self, name: &str) -> Result<Option<PipelineRecord>> {
        Ok(self
            .read_pipelines("WHERE name = ?1", params![name])?
            .into_iter()
            .next())
    }

    /// `tail` is everything after the join: filter, ordering, limit.
    fn read_jobs(&self, tail: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<JobRecord>> {
        let sql = format!(
            "SELECT {} FROM job JOIN pipeline ON pipeline.id = job.pipeline_id {}",
            JOB_COLUMNS, tail
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let raw = stmt
            .query_map(args, read_raw_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raw.into_iter().map(job_from_raw).collect()
    }

    pub fn jobs(&self, pipeline: i64) -> Result<Vec<JobRecord>> {
        self.read_jobs(
            "WHERE job.pipeline_id = ?1 ORDER BY job.id",
            params![pipeline],
        )
    }

    pub fn job(&self, key: JobKey) -> Result<Option<JobRecord>> {
        Ok(self
            .read_jobs("WHERE job.id = ?1", params![key])?
            .into_iter()
            .next())
    }

    /// Waiting jobs with no unfinished dependency, oldest first.
    pub fn eligible_jobs(&self, limit: usize) -> Result<Vec<JobRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.read_jobs(
            "WHERE job.status = ?1 AND pipeline.status != ?2
               AND NOT EXISTS (SELECT 1 FROM job_dependency d WHERE d.job_id = job.id)
             ORDER BY job.id LIMIT ?3",
            params![
                ManagedJobStatus::NotSubmitted.as_str(),
                PipelineStatus::Deleted.as_str(),
                limit,
            ],
        )
    }

    pub fn submitted_jobs(&self) -> Result<Vec<JobRecord>> {
        self.read_jobs(
            "WHERE job.status = ?1 ORDER BY job.id",
            params![ManagedJobStatus::Submitted.as_str()],
        )
    }

    pub fn submitted_count(&self) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM job WHERE status = ?1",
            params![ManagedJobStatus::Submitted.as_str()],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Jobs that still need the scheduler: waiting or in flight, in a live pipeline.
    pub fn active_job_count(&self) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM job JOIN pipeline ON pipeline.id = job.pipeline_id
             WHERE pipeline.status != ?1 AND job.status IN (?2, ?3, ?4, ?5)",
            params![
                PipelineStatus::Deleted.as_str(),
                ManagedJobStatus::NotSet.as_str(),
                ManagedJobStatus::NotSubmitted.as_str(),
                ManagedJobStatus::Eligible.as_str(),
                ManagedJobStatus::Submitted.as_str(),
            ],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    fn set_status(&self, key: JobKey, status: ManagedJobStatus) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE job SET status = ?1 WHERE id = ?2",
            params![status.as_str(), key],
        )?;
        if changed == 0 {
            return Err(corrupt(format!("job {} does not exist", key)));
        }
        Ok(())
    }

    pub fn mark_submitted(&self, key: JobKey, batch_id: &JobRef) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE job SET status = ?1, batch_id = ?2 WHERE id = ?3",
            params![ManagedJobStatus::Submitted.as_str(), batch_id.0, key],
        )?;
        if changed == 0 {
            return Err(corrupt(format!("job {} does not exist", key)));
        }
        Ok(())
    }

    /// Marks the job complete and drops it from its dependents' dependency sets.
    pub fn complete_job(&self, key: JobKey) -> Result<()> {
        let tx = self.begin()?;
        self.set_status(key, ManagedJobStatus::Complete)?;
        self.conn.execute(
            "DELETE FROM job_dependency WHERE depends_on = ?1",
            params![key],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn dependency_edges(&self, pipeline: i64) -> Result<Vec<(JobKey, JobKey)>> {
        let mut stmt = self.conn.prepare(
            "SELECT d.job_id, d.depends_on FROM job_dependency d
             JOIN job ON job.id = d.job_id WHERE job.pipeline_id = ?1",
        )?;
        let edges = stmt
            .query_map(params![pipeline], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(edges)
    }

    /// Marks the job failed and short-circuits the waiting jobs the policy
    /// selects. Returns the keys moved to `PipelineFailure`.
    pub fn fail_job(&self, key: JobKey, policy: FailurePolicy) -> Result<Vec<JobKey>> {
        let job = self
            .job(key)?
            .ok_or_else(|| corrupt(format!("job {} does not exist", key)))?;
        let tx = self.begin()?;
        self.set_status(key, ManagedJobStatus::Failed)?;
        let siblings: Vec<(JobKey, ManagedJobStatus)> = self
            .jobs(job.pipeline)?
            .into_iter()
            .map(|j| (j.key, j.status))
            .collect();
        let edges = self.dependency_edges(job.pipeline)?;
        let targets = pipeline_failure_targets(policy, key, &siblings, &edges);
        for target in &targets {
            self.set_status(*target, ManagedJobStatus::PipelineFailure)?;
        }
        tx.commit()?;
        Ok(targets)
    }

    /// Recomputes and stores every pipeline's aggregate status.
    pub fn refresh_pipeline_statuses(&self) -> Result<Vec<PipelineRecord>> {
        let mut refreshed = Vec::new();
        for mut pipeline in self.pipelines()? {
            let statuses: Vec<ManagedJobStatus> =
                self.jobs(pipeline.key)?.iter().map(|j| j.status).collect();
            let status = aggregate_pipeline_status(pipeline.status, &statuses);
            if status != pipeline.status {
                tracing::info!(
                    "Pipeline '{}': {} -> {}",
                    pipeline.name,
                    pipeline.status,
                    status
                );
                self.conn.execute(
                    "UPDATE pipeline SET status = ?1 WHERE id = ?2",
                    params![status.as_str(), pipeline.key],
                )?;
                pipeline.status = status;
            }
            refreshed.push(pipeline);
        }
        Ok(refreshed)
    }

    /// Marks every unfinished job and the pipeline itself deleted. Returns the
    /// jobs that were in flight so the caller can remove them from the queue.
    pub fn delete_pipeline(&self, name: &str) -> Result<Vec<JobRecord>> {
        let pipeline = self
            .pipeline(name)?
            .ok_or_else(|| ClientError::PipelineNotFound(name.to_string()))?;
        let jobs = self.jobs(pipeline.key)?;
        let tx = self.begin()?;
        for job in jobs.iter().filter(|j| !j.status.is_terminal()) {
            self.set_status(job.key, ManagedJobStatus::Deleted)?;
        }
        self.conn.execute(
            "UPDATE pipeline SET status = ?1 WHERE id = ?2",
            params![PipelineStatus::Deleted.as_str(), pipeline.key],
        )?;
        tx.commit()?;
        Ok(jobs
            .into_iter()
            .filter(|j| j.status == ManagedJobStatus::Submitted)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_job<'a>(name: &'a str, resources: &'a ResourceRequest) -> NewJob<'a> {
        NewJob {
            name,
            script: Path::new("/logs/submit/x.sh"),
            workdir: Path::new("/out"),
            resources,
            environment: None,
        }
    }

    fn chain(store: &ManagedStore) -> (i64, JobKey, JobKey, JobKey) {
        let r = ResourceRequest::default();
        let p = store.add_pipeline("p", Path::new("/logs")).unwrap();
        let a = store.add_job(p, &new_job("a", &r), &[]).unwrap();
        let b = store.add_job(p, &new_job("b", &r), &[a]).unwrap();
        let c = store.add_job(p, &new_job("c", &r), &[]).unwrap();
        (p, a, b, c)
    }

    fn names(jobs: &[JobRecord]) -> Vec<&str> {
        jobs.iter().map(|j| j.name.as_str()).collect()
    }

    #[test]
    fn test_eligible_respects_dependencies_and_limit() {
        let store = ManagedStore::open_in_memory().unwrap();
        let (_, a, _, _) = chain(&store);
        assert_eq!(names(&store.eligible_jobs(10).unwrap()), vec!["a", "c"]);
        assert_eq!(names(&store.eligible_jobs(1).unwrap()), vec!["a"]);
        assert!(store.eligible_jobs(0).unwrap().is_empty());

        store.mark_submitted(a, &JobRef("1.srv".into())).unwrap();
        assert_eq!(store.submitted_count().unwrap(), 1);
        store.complete_job(a).unwrap();
        assert_eq!(names(&store.eligible_jobs(10).unwrap()), vec!["b", "c"]);
    }

    #[test]
    fn test_failure_abort_pipeline_short_circuits_all_waiting() {
        let store = ManagedStore::open_in_memory().unwrap();
        let (p, a, b, c) = chain(&store);
        store.mark_submitted(a, &JobRef("1.srv".into())).unwrap();
        let mut targets = store.fail_job(a, FailurePolicy::AbortPipeline).unwrap();
        targets.sort();
        assert_eq!(targets, vec![b, c]);
        assert!(store.eligible_jobs(10).unwrap().is_empty());

        let pipelines = store.refresh_pipeline_statuses().unwrap();
        assert_eq!(pipelines[0].status, PipelineStatus::Failed);
        assert_eq!(store.active_job_count().unwrap(), 0);
        let statuses: Vec<_> = store.jobs(p).unwrap().iter().map(|j| j.status).collect();
        assert_eq!(
            statuses,
            vec![
                ManagedJobStatus::Failed,
                ManagedJobStatus::PipelineFailure,
                ManagedJobStatus::PipelineFailure
            ]
        );
    }

    #[test]
    fn test_failure_branch_spares_independent_jobs() {
        let store = ManagedStore::open_in_memory().unwrap();
        let (_, a, b, _) = chain(&store);
        store.mark_submitted(a, &JobRef("1.srv".into())).unwrap();
        assert_eq!(store.fail_job(a, FailurePolicy::Branch).unwrap(), vec![b]);
        assert_eq!(names(&store.eligible_jobs(10).unwrap()), vec!["c"]);
        assert_eq!(store.active_job_count().unwrap(), 1);
    }

    #[test]
    fn test_aggregate_not_invalidated_until_refresh() {
        let store = ManagedStore::open_in_memory().unwrap();
        let r = ResourceRequest::default();
        let p = store.add_pipeline("p", Path::new("/logs")).unwrap();
        let a = store.add_job(p, &new_job("a", &r), &[]).unwrap();
        let b = store.add_job(p, &new_job("b", &r), &[]).unwrap();
        store.complete_job(a).unwrap();
        store.complete_job(b).unwrap();
        store.refresh_pipeline_statuses().unwrap();
        assert_eq!(
            store.pipeline("p").unwrap().unwrap().status,
            PipelineStatus::Complete
        );

        store.add_job(p, &new_job("late", &r), &[]).unwrap();
        assert_eq!(
            store.pipeline("p").unwrap().unwrap().status,
            PipelineStatus::Complete
        );
        store.refresh_pipeline_statuses().unwrap();
        assert_eq!(
            store.pipeline("p").unwrap().unwrap().status,
            PipelineStatus::Submitted
        );
    }

    #[test]
    fn test_started_store_rejects_new_work() {
        let store = ManagedStore::open_in_memory().unwrap();
        let (p, _, _, _) = chain(&store);
        assert!(!store.is_started().unwrap());
        store.mark_started().unwrap();
        assert!(store.is_started().unwrap());
        assert!(matches!(
            store.add_pipeline("q", Path::new("/logs")),
            Err(ClientError::StoreStarted(_))
        ));
        let r = ResourceRequest::default();
        assert!(matches!(
            store.add_job(p, &new_job("d", &r), &[]),
            Err(ClientError::StoreStarted(_))
        ));
    }

    #[test]
    fn test_duplicate_pipeline_rejected() {
        let store = ManagedStore::open_in_memory().unwrap();
        store.add_pipeline("p", Path::new("/logs")).unwrap();
        assert!(matches!(
            store.add_pipeline("p", Path::new("/other")),
            Err(ClientError::DuplicatePipeline(_))
        ));
    }

    #[test]
    fn test_delete_pipeline_returns_in_flight_jobs() {
        let store = ManagedStore::open_in_memory().unwrap();
        let (p, a, _, c) = chain(&store);
        store.mark_submitted(a, &JobRef("1.srv".into())).unwrap();
        store.mark_submitted(c, &JobRef("3.srv".into())).unwrap();
        store.complete_job(c).unwrap();

        let in_flight = store.delete_pipeline("p").unwrap();
        assert_eq!(names(&in_flight), vec!["a"]);
        let pipeline = store.pipeline("p").unwrap().unwrap();
        assert_eq!(pipeline.status, PipelineStatus::Deleted);
        let statuses: Vec<_> = store.jobs(p).unwrap().iter().map(|j| j.status).collect();
        assert_eq!(
            statuses,
            vec![
                ManagedJobStatus::Deleted,
                ManagedJobStatus::Deleted,
                ManagedJobStatus::Complete
            ]
        );
        assert_eq!(store.active_job_count().unwrap(), 0);
        assert!(matches!(
            store.delete_pipeline("missing"),
            Err(ClientError::PipelineNotFound(_))
        ));
    }

    #[test]
    fn test_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.db");
        {
            let store = ManagedStore::open(&path).unwrap();
            let (_, a, _, _) = chain(&store);
            store.mark_submitted(a, &JobRef("7.srv".into())).unwrap();
            store.mark_started().unwrap();
        }
        let store = ManagedStore::open(&path).unwrap();
        assert!(store.is_started().unwrap());
        let submitted = store.submitted_jobs().unwrap();
        assert_eq!(submitted[0].batch_id, Some(JobRef("7.srv".into())));
    }
}
