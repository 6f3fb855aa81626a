use crate::cli::{Cli, Commands, ManagedAction};
use crate::error::CliError;
use pbsflow_core::config::{self, Config};
use pbsflow_core::logging::{self, LogLevel};

pub mod cli;
pub mod commands;
pub mod error;

pub fn load_config(cli: &Cli) -> Result<Config, CliError> {
    let config = match &cli.config {
        Some(path) => config::load_config_from(path)?,
        None => config::load_config()?,
    };
    Ok(config)
}

/// Applies `PBSFLOW_LOG_LEVEL` and `-v` before any logger is installed.
pub fn init_log_level(verbose: u8) {
    logging::set_log_level_from_env();
    if verbose > 0 {
        logging::set_log_level(LogLevel::from_verbosity(verbose));
    }
}

pub fn run(cli: Cli) -> Result<(), CliError> {
    let config = load_config(&cli)?;
    tracing::debug!("Effective configuration: {:?}", config);

    match cli.command {
        Commands::Run(args) => commands::run::handle_run(args, &config),
        Commands::Managed(args) => match args.action {
            ManagedAction::Submit(args) => commands::managed::handle_submit(args, &config),
            ManagedAction::Start(args) => commands::managed::handle_start(args, &config),
            ManagedAction::Status(args) => commands::managed::handle_status(args),
            ManagedAction::Delete(args) => commands::managed::handle_delete(args, &config),
        },
        Commands::Status(args) => commands::status::handle_status(args, &config),
        Commands::Cancel(args) => commands::cancel::handle_cancel(args, &config),
    }
}
