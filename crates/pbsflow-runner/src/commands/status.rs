use colored::Colorize;
use pbsflow_client::logdir::LogDir;
use pbsflow_client::status::{collect, render_table, summarize};
use pbsflow_core::config::Config;

use crate::{cli::LogDirArgs, commands::pbs_from_config, error::CliError};

pub fn handle_status(args: LogDirArgs, config: &Config) -> Result<(), CliError> {
    let log_dir = LogDir::open(&args.log_dir);
    let reports = collect(&log_dir, &pbs_from_config(config))?;
    if reports.is_empty() {
        println!("No jobs recorded in {}", args.log_dir.display());
        return Ok(());
    }
    println!("{}", render_table(&reports));

    let counts: Vec<String> = summarize(&reports)
        .into_iter()
        .map(|(state, n)| format!("{}: {}", state, n))
        .collect();
    println!("{} {}", "Summary:".bold(), counts.join(", "));
    Ok(())
}
