use super::store::{ManagedStore, NewJob};
use crate::error::{ClientError, Result};
use crate::logdir::LogDir;
use crate::script::ScriptGenerator;
use pbsflow_core::config::{Config, FailurePolicy};
use pbsflow_core::engine::JobKey;
use pbsflow_core::files::FixUpContext;
use pbsflow_core::model::JobRef;
use pbsflow_core::pipeline::{BatchJob, GraphBuilder, JobSink, Pipeline};
use std::collections::HashMap;

/// Records jobs in the managed store instead of submitting them.
///
/// Scripts are rendered immediately; the scheduler submits them later
/// without native dependencies and owns failure fan-out. The epilogue only
/// deletes in-flight siblings after a validation or version failure.
pub struct ManagedWriter<'s> {
    store: &'s ManagedStore,
    pipeline: i64,
    scripts: ScriptGenerator,
    keys: HashMap<JobRef, JobKey>,
}

impl<'s> ManagedWriter<'s> {
    pub fn new(store: &'s ManagedStore, pipeline: i64, log_dir: LogDir, config: &Config) -> Self {
        Self {
            store,
            pipeline,
            scripts: ScriptGenerator::new(log_dir, config.clone(), FailurePolicy::Branch),
            keys: HashMap::new(),
        }
    }

    fn job_ref(key: JobKey) -> JobRef {
        JobRef(format!("task-{}", key))
    }
}

impl JobSink for ManagedWriter<'_> {
    type Error = ClientError;

    fn submit(&mut self, job: &BatchJob) -> Result<JobRef> {
        let depends_on = job
            .depends_on
            .iter()
            .map(|dep| {
                self.keys.get(dep).copied().ok_or_else(|| {
                    ClientError::CorruptStore(format!(
                        "'{}' depends on unknown task '{}'",
                        job.name, dep
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let script = self.scripts.write(job)?;
        let resources = self.scripts.resources_for(job);
        let environment = job.invocation().and_then(|inv| {
            let dirs: Vec<String> = inv
                .bin_path
                .iter()
                .map(|p| p.to_string_lossy().to_string())
                .collect();
            (!dirs.is_empty()).then(|| format!("PATH={}", dirs.join(":")))
        });
        let key = self.store.add_job(
            self.pipeline,
            &NewJob {
                name: &job.name,
                script: &script,
                workdir: &job.workdir,
                resources: &resources,
                environment,
            },
            &depends_on,
        )?;
        let job_ref = Self::job_ref(key);
        tracing::debug!("Stored '{}' as {} ({} dependencies)", job.name, job_ref, depends_on.len());
        self.keys.insert(job_ref.clone(), key);
        Ok(job_ref)
    }
}

/// Adds a prepared pipeline to the store in one transaction. Returns the
/// pipeline key and the number of jobs recorded.
pub fn add_pipeline(
    store: &ManagedStore,
    pipeline: &Pipeline,
    ctx: &FixUpContext<'_>,
    log_dir: LogDir,
    config: &Config,
) -> Result<(i64, usize)> {
    let tx = store.begin()?;
    let key = store.add_pipeline(&pipeline.name, log_dir.root())?;
    let mut writer = ManagedWriter::new(store, key, log_dir, config);
    let jobs = GraphBuilder::new(pipeline, ctx, &mut writer).run()?;
    tx.commit()?;
    tracing::info!(
        "Added pipeline '{}' with {} job(s) to {}",
        pipeline.name,
        jobs.len(),
        store.path().display()
    );
    Ok((key, jobs.len()))
}
