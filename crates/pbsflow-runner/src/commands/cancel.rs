use colored::Colorize;
use pbsflow_client::cancel::cancel_all;
use pbsflow_client::logdir::LogDir;
use pbsflow_core::config::Config;

use crate::{cli::LogDirArgs, commands::pbs_from_config, error::CliError};

pub fn handle_cancel(args: LogDirArgs, config: &Config) -> Result<(), CliError> {
    let log_dir = LogDir::open(&args.log_dir);
    let summary = cancel_all(&log_dir, &pbs_from_config(config))?;
    println!(
        "{} cancelled {}, already finished {}",
        "[OK]".green(),
        summary.cancelled,
        summary.already_finished
    );
    if summary.errors > 0 {
        println!(
            "{}",
            format!(
                "[WARN] {} job(s) could not be cancelled; see the log for details",
                summary.errors
            )
            .yellow()
        );
    }
    Ok(())
}
