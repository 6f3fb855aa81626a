use crate::error::Result;
use crate::logdir::LogDir;
use crate::managed::{self, ManagedStore};
use crate::submitter::BatchSubmitter;
use crate::targets::ResourceManager;
use pbsflow_core::config::Config;
use pbsflow_core::constants::dirs;
use pbsflow_core::files::FixUpContext;
use pbsflow_core::pipeline::{GraphBuilder, Pipeline, SubmittedJob};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub pipeline: String,
    pub log_dir: PathBuf,
    pub jobs: Vec<SubmittedJob>,
    pub released: usize,
}

/// Builds the one context every path in a run is resolved against.
pub fn fix_up_context<'a>(params: &'a [String], config: &Config) -> Result<FixUpContext<'a>> {
    let mut ctx = FixUpContext::new(params)?;
    ctx.directory_version = config.submit.directory_version;
    Ok(ctx)
}

/// Loads a pipeline and resolves its files against `ctx`. Fails before
/// anything is submitted if a declared input is missing.
pub fn prepare_pipeline(path: &Path, ctx: &FixUpContext<'_>) -> Result<Pipeline> {
    let mut pipeline = Pipeline::load(path)?;
    pipeline.prepare(ctx)?;
    Ok(pipeline)
}

fn default_log_dir(pipeline: &Pipeline) -> Result<PathBuf> {
    Ok(pipeline.output_dir()?.join(dirs::LOGS))
}

/// Submits the whole DAG, then releases the held roots in one call.
pub fn submit_pipeline<R: ResourceManager>(
    path: &Path,
    params: &[String],
    config: &Config,
    rm: R,
    log_dir: Option<&Path>,
) -> Result<RunSummary> {
    let ctx = fix_up_context(params, config)?;
    let pipeline = prepare_pipeline(path, &ctx)?;
    let log_root = match log_dir {
        Some(dir) => dir.to_path_buf(),
        None => default_log_dir(&pipeline)?,
    };
    let log_dir = LogDir::prepare(&log_root)?;
    tracing::info!(
        "Submitting pipeline '{}' via {} (logs in {})",
        pipeline.name,
        rm.name(),
        log_root.display()
    );

    let mut submitter = BatchSubmitter::new(rm, log_dir, config)?;
    let jobs = match GraphBuilder::new(&pipeline, &ctx, &mut submitter).run() {
        Ok(jobs) => jobs,
        Err(e) => {
            if !submitter.held().is_empty() {
                let ids: Vec<&str> = submitter.held().iter().map(|j| j.0.as_str()).collect();
                tracing::error!(
                    "Submission of '{}' stopped; {} job(s) remain held, release with qrls or remove with qdel: {}",
                    pipeline.name,
                    ids.len(),
                    ids.join(" ")
                );
            }
            return Err(e);
        }
    };
    let released = submitter.held().len();
    submitter.release_all()?;
    Ok(RunSummary {
        pipeline: pipeline.name.clone(),
        log_dir: log_root,
        jobs,
        released,
    })
}

/// Records a pipeline in a managed store for the scheduler to run later.
pub fn add_to_store(
    store: &ManagedStore,
    path: &Path,
    params: &[String],
    config: &Config,
    log_dir: Option<&Path>,
) -> Result<(String, usize, PathBuf)> {
    let ctx = fix_up_context(params, config)?;
    let pipeline = prepare_pipeline(path, &ctx)?;
    let log_root = match log_dir {
        Some(dir) => dir.to_path_buf(),
        None => default_log_dir(&pipeline)?,
    };
    let log = LogDir::prepare(&log_root)?;
    let (_, count) = managed::add_pipeline(store, &pipeline, &ctx, log, config)?;
    Ok((pipeline.name, count, log_root))
}
