use clap::Parser;
use colored::Colorize;
use pbsflow_runner::cli::Cli;

fn main() {
    let cli = Cli::parse();
    pbsflow_runner::init_log_level(cli.verbose);

    let logging_config = pbsflow_runner::load_config(&cli)
        .map(|c| c.logging)
        .unwrap_or_default();
    if let Err(e) = pbsflow_core::logging::init_session_logger(&logging_config) {
        eprintln!(
            "{}",
            format!("[ERROR] Failed to initialize session logger: {}", e).red()
        );
    }

    if let Err(e) = pbsflow_runner::run(cli) {
        eprintln!("{}", format!("[ERROR] {}", e).red());
        std::process::exit(1);
    }
}
