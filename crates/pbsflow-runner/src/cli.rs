use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "pbsflow",
    author,
    version,
    about = "Runs tool pipelines as dependent PBS/TORQUE batch jobs.",
    long_about = "Reads a pipeline description, resolves its files, and submits one batch job per tool with the dependencies between them handed to the resource manager."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(
        short,
        long,
        global = true,
        help = "Path to a config.toml (defaults to the XDG config directory)"
    )]
    pub config: Option<PathBuf>,

    #[arg(short, long, action = clap::ArgAction::Count, global = true, help = "Increase verbosity level (-v for debug, -vv for trace)")]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Submit a pipeline as a DAG of dependent jobs")]
    Run(RunArgs),

    #[command(about = "Queue pipelines in a store and feed them to the cluster gradually")]
    Managed(ManagedArgs),

    #[command(about = "Show the state of every job submitted into a log directory")]
    Status(LogDirArgs),

    #[command(about = "Delete every unfinished job submitted into a log directory")]
    Cancel(LogDirArgs),
}

#[derive(Args)]
pub struct RunArgs {
    #[arg(value_name = "PIPELINE", help = "Pipeline description file")]
    pub pipeline: PathBuf,

    #[arg(
        value_name = "PARAM",
        help = "Positional parameters, bound in order to the pipeline's parameter files"
    )]
    pub params: Vec<String>,

    #[arg(
        long,
        help = "Write scripts and the submission log without contacting the resource manager"
    )]
    pub no_submit: bool,

    #[arg(long, help = "Log directory (defaults to <output dir>/logs)")]
    pub log_dir: Option<PathBuf>,
}

#[derive(Args)]
pub struct ManagedArgs {
    #[command(subcommand)]
    pub action: ManagedAction,
}

#[derive(Subcommand)]
pub enum ManagedAction {
    #[command(about = "Add a pipeline's jobs to a store without submitting them")]
    Submit(ManagedSubmitArgs),

    #[command(about = "Submit and track the jobs of every pipeline in a store")]
    Start(ManagedStartArgs),

    #[command(about = "Show per-pipeline job counts of a store")]
    Status(StoreArgs),

    #[command(about = "Delete a pipeline's queued jobs and stop scheduling it")]
    Delete(ManagedDeleteArgs),
}

#[derive(Args)]
pub struct StoreArgs {
    #[arg(value_name = "STORE", help = "Managed store database file")]
    pub store: PathBuf,
}

#[derive(Args)]
pub struct ManagedSubmitArgs {
    #[arg(value_name = "STORE", help = "Managed store database file")]
    pub store: PathBuf,

    #[arg(value_name = "PIPELINE", help = "Pipeline description file")]
    pub pipeline: PathBuf,

    #[arg(value_name = "PARAM")]
    pub params: Vec<String>,

    #[arg(long, help = "Log directory (defaults to <output dir>/logs)")]
    pub log_dir: Option<PathBuf>,
}

#[derive(Args)]
pub struct ManagedStartArgs {
    #[arg(value_name = "STORE", help = "Managed store database file")]
    pub store: PathBuf,

    #[arg(long, help = "Seconds between polls (overrides managed.poll_interval_secs)")]
    pub poll_interval: Option<u64>,

    #[arg(long, help = "Maximum jobs in the queue at once (overrides managed.max_queued)")]
    pub max_queued: Option<usize>,
}

#[derive(Args)]
pub struct ManagedDeleteArgs {
    #[arg(value_name = "STORE", help = "Managed store database file")]
    pub store: PathBuf,

    #[arg(value_name = "NAME", help = "Pipeline name")]
    pub name: String,
}

#[derive(Args)]
pub struct LogDirArgs {
    #[arg(value_name = "LOG_DIR")]
    pub log_dir: PathBuf,
}
