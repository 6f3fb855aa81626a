use colored::Colorize;
use pbsflow_client::managed::{delete_pipeline, ManagedScheduler, ManagedStore};
use pbsflow_client::status::render_managed_table;
use pbsflow_client::submission::add_to_store;
use pbsflow_core::config::Config;
use pbsflow_core::engine::PipelineStatus;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::{
    cli::{ManagedDeleteArgs, ManagedStartArgs, ManagedSubmitArgs, StoreArgs},
    commands::pbs_from_config,
    error::CliError,
};

fn open_existing(path: &Path) -> Result<ManagedStore, CliError> {
    if !path.exists() {
        return Err(CliError::StoreMissing(path.to_path_buf()));
    }
    Ok(ManagedStore::open(path)?)
}

pub fn handle_submit(args: ManagedSubmitArgs, config: &Config) -> Result<(), CliError> {
    let store = ManagedStore::open(&args.store)?;
    let (name, count, log_dir) = add_to_store(
        &store,
        &args.pipeline,
        &args.params,
        config,
        args.log_dir.as_deref(),
    )?;
    println!(
        "{} Added pipeline '{}' with {} job(s) to {}. Logs: {}",
        "[OK]".green(),
        name.cyan(),
        count,
        args.store.display(),
        log_dir.display()
    );
    Ok(())
}

pub fn handle_start(args: ManagedStartArgs, config: &Config) -> Result<(), CliError> {
    let store = open_existing(&args.store)?;
    let mut managed = config.managed.clone();
    if let Some(secs) = args.poll_interval {
        managed.poll_interval_secs = secs;
    }
    if let Some(max) = args.max_queued {
        managed.max_queued = max.max(1);
    }

    let stop = Arc::new(AtomicBool::new(false));
    let s = stop.clone();
    ctrlc::set_handler(move || {
        tracing::info!("Interrupted; stopping after the current poll");
        s.store(true, Ordering::SeqCst);
    })?;

    println!(
        "- Managing {} (max {} queued)... press Ctrl-C to stop",
        args.store.display().to_string().cyan(),
        managed.max_queued
    );
    let scheduler = ManagedScheduler::new(&store, pbs_from_config(config), &managed);
    let results = scheduler.run(&stop)?;

    let mut failed = 0;
    for (name, status) in &results {
        let label = match status {
            PipelineStatus::Complete => status.as_str().green(),
            PipelineStatus::Failed => status.as_str().red(),
            _ => status.as_str().yellow(),
        };
        if *status == PipelineStatus::Failed {
            failed += 1;
        }
        println!("  {} {}", name, label);
    }
    if failed > 0 {
        return Err(CliError::PipelinesFailed {
            failed,
            total: results.len(),
        });
    }
    Ok(())
}

pub fn handle_status(args: StoreArgs) -> Result<(), CliError> {
    let store = open_existing(&args.store)?;
    println!("{}", render_managed_table(&store)?);
    Ok(())
}

pub fn handle_delete(args: ManagedDeleteArgs, config: &Config) -> Result<(), CliError> {
    let store = open_existing(&args.store)?;
    let removed = delete_pipeline(&store, &pbs_from_config(config), &args.name)?;
    println!(
        "{} Deleted pipeline '{}' ({} queued job(s) removed)",
        "[OK]".green(),
        args.name.cyan(),
        removed
    );
    Ok(())
}
