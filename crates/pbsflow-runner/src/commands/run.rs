use colored::Colorize;
use pbsflow_client::submission::{submit_pipeline, RunSummary};
use pbsflow_client::targets::DryRun;
use pbsflow_core::config::Config;

use crate::{cli::RunArgs, commands::pbs_from_config, error::CliError};

pub fn handle_run(args: RunArgs, config: &Config) -> Result<(), CliError> {
    let mode = if args.no_submit { "dry-run" } else { "pbs" };
    println!(
        "- Submitting pipeline '{}' ({})...",
        args.pipeline.display().to_string().cyan(),
        mode.cyan()
    );

    let summary = if args.no_submit {
        submit_pipeline(
            &args.pipeline,
            &args.params,
            config,
            DryRun::new(),
            args.log_dir.as_deref(),
        )?
    } else {
        submit_pipeline(
            &args.pipeline,
            &args.params,
            config,
            pbs_from_config(config),
            args.log_dir.as_deref(),
        )?
    };
    print_summary(&summary, args.no_submit);
    Ok(())
}

fn print_summary(summary: &RunSummary, no_submit: bool) {
    for job in &summary.jobs {
        let deps: Vec<&str> = job.depends_on.iter().map(|d| d.0.as_str()).collect();
        if deps.is_empty() {
            println!("  {} {}", job.job_ref.0.yellow(), job.name);
        } else {
            println!(
                "  {} {} (after {})",
                job.job_ref.0.yellow(),
                job.name,
                deps.join(", ")
            );
        }
    }
    let verb = if no_submit { "Prepared" } else { "Submitted" };
    println!(
        "{} {} {} job(s) for '{}'. Logs: {}",
        "[OK]".green(),
        verb,
        summary.jobs.len(),
        summary.pipeline,
        summary.log_dir.display()
    );
}
