use crate::config::LoggingConfig;
use crate::constants::env as env_vars;
use crate::errors::ConfigError;
use chrono::{Days, Local, NaiveDate};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const SESSION_PREFIX: &str = "pbsflow_";
const SESSION_DATE: &str = "%Y-%m-%d";
const LATEST_LINK: &str = "pbsflow.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    const ALL: [LogLevel; 5] = [
        LogLevel::Error,
        LogLevel::Warn,
        LogLevel::Info,
        LogLevel::Debug,
        LogLevel::Trace,
    ];

    /// `-v` is debug, anything beyond is trace.
    pub fn from_verbosity(verbose: u8) -> Self {
        let index = (LogLevel::Info as usize).saturating_add(verbose as usize);
        Self::ALL[index.min(Self::ALL.len() - 1)]
    }

    pub fn parse(level: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|l| l.directive().eq_ignore_ascii_case(level.trim()))
    }

    fn directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

static DEFAULT_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

pub fn set_log_level(level: LogLevel) {
    DEFAULT_LEVEL.store(level as u8, Ordering::SeqCst);
}

/// Applies `PBSFLOW_LOG_LEVEL` when it names a known level.
pub fn set_log_level_from_env() {
    if let Some(level) = std::env::var(env_vars::LOG_LEVEL)
        .ok()
        .and_then(|l| LogLevel::parse(&l))
    {
        set_log_level(level);
    }
}

fn default_level() -> LogLevel {
    let index = DEFAULT_LEVEL.load(Ordering::SeqCst) as usize;
    LogLevel::ALL[index.min(LogLevel::ALL.len() - 1)]
}

struct LocalTime;

impl FormatTime for LocalTime {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%d %H:%M:%S"))
    }
}

/// `[time] [LEVEL] module:line message`
struct SessionFormat;

impl<S, N> FormatEvent<S, N> for SessionFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let meta = event.metadata();
        write!(writer, "[")?;
        LocalTime.format_time(&mut writer)?;
        write!(writer, "] [{:5}] ", meta.level())?;
        if let Some(module) = meta.module_path() {
            write!(writer, "{}:{} ", module, meta.line().unwrap_or(0))?;
        }
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Day a session log was started, read back from its file name.
fn session_date(name: &str) -> Option<NaiveDate> {
    let rest = name.strip_prefix(SESSION_PREFIX)?.strip_suffix(".log")?;
    let date = rest.split('_').next()?;
    NaiveDate::parse_from_str(date, SESSION_DATE).ok()
}

/// Deletes session logs beyond the newest `max_files` and those started more
/// than `max_age_days` ago. Zero disables either limit.
fn prune_session_logs(
    dir: &Path,
    config: &LoggingConfig,
    today: NaiveDate,
) -> Result<(), ConfigError> {
    let mut logs: Vec<(String, NaiveDate)> = fs_err::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let name = e.file_name().to_str()?.to_string();
            let date = session_date(&name)?;
            Some((name, date))
        })
        .collect();
    // Names embed the start time, so they sort oldest first.
    logs.sort();

    let over = if config.max_files > 0 {
        logs.len().saturating_sub(config.max_files)
    } else {
        0
    };
    let cutoff = (config.max_age_days > 0)
        .then(|| today.checked_sub_days(Days::new(config.max_age_days)))
        .flatten();

    for (i, (name, date)) in logs.iter().enumerate() {
        if i < over || cutoff.is_some_and(|c| *date < c) {
            tracing::trace!("Pruning session log {}", name);
            let _ = fs_err::remove_file(dir.join(name));
        }
    }
    Ok(())
}

fn install_subscriber(log_path: &Path) -> Result<(), ConfigError> {
    let file = fs_err::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level().directive()));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .event_format(SessionFormat);

    let tee = std::env::var_os(env_vars::TEST_LOG_TEE).map(|_| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .event_format(SessionFormat)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(tee)
        .init();
    Ok(())
}

/// Starts a per-process log file under the XDG cache directory and points
/// `pbsflow.log` at it.
pub fn init_session_logger(config: &LoggingConfig) -> Result<(), ConfigError> {
    let cache_home = xdg::BaseDirectories::with_prefix("pbsflow")
        .get_cache_home()
        .ok_or_else(|| {
            ConfigError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "Could not find cache home directory",
            ))
        })?;
    let logs_dir = cache_home.join("logs");
    fs_err::create_dir_all(&logs_dir)?;

    let now = Local::now();
    prune_session_logs(&logs_dir, config, now.date_naive())?;

    let file_name = format!(
        "{}{}_{}.log",
        SESSION_PREFIX,
        now.format("%Y-%m-%d_%H-%M-%S"),
        std::process::id()
    );
    install_subscriber(&logs_dir.join(&file_name))?;

    let latest = cache_home.join(LATEST_LINK);
    let _ = fs_err::remove_file(&latest);
    let _ = std::os::unix::fs::symlink(PathBuf::from("logs").join(&file_name), &latest);

    tracing::info!("pbsflow {} session started", env!("CARGO_PKG_VERSION"));
    Ok(())
}

fn display_command(command: &Command) -> String {
    std::iter::once(command.get_program())
        .chain(command.get_args())
        .map(|part| {
            let part = part.to_string_lossy();
            if part.is_empty() || part.contains(char::is_whitespace) {
                format!("'{}'", part)
            } else {
                part.into_owned()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Every external command goes through here before it runs.
pub fn log_command(command: &Command) {
    tracing::debug!("[CMD] {}", display_command(command));
}
