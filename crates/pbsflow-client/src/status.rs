use crate::error::Result;
use crate::logdir::LogDir;
use crate::managed::store::ManagedStore;
use crate::targets::{JobInfo, QueueState, ResourceManager};
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets, Attribute, Cell, Color, Table};
use pbsflow_core::engine::ManagedJobStatus;
use pbsflow_core::model::JobRef;
use pbsflow_core::status::{JobOutcome, StatusFile};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReportedState {
    NotSubmitted,
    Held,
    Queued,
    Running,
    Complete,
    Failed,
    WalltimeExceeded,
    Canceled,
    Deleted,
}

impl ReportedState {
    fn color(&self) -> Color {
        match self {
            ReportedState::Complete => Color::Green,
            ReportedState::Failed | ReportedState::WalltimeExceeded => Color::Red,
            ReportedState::Running => Color::Cyan,
            ReportedState::Held | ReportedState::Queued => Color::Yellow,
            ReportedState::NotSubmitted | ReportedState::Canceled | ReportedState::Deleted => {
                Color::DarkGrey
            }
        }
    }

    fn from_outcome(outcome: JobOutcome) -> Self {
        match outcome {
            JobOutcome::Success => ReportedState::Complete,
            JobOutcome::WalltimeExceeded => ReportedState::WalltimeExceeded,
            JobOutcome::Failed { .. } | JobOutcome::ResourceManagerFailure { .. } => {
                ReportedState::Failed
            }
        }
    }

    fn from_queue(info: &JobInfo) -> Self {
        match info.state {
            QueueState::Held => ReportedState::Held,
            QueueState::Queued | QueueState::Unknown => ReportedState::Queued,
            QueueState::Running | QueueState::Exiting => ReportedState::Running,
            QueueState::Complete => info
                .exit_status
                .map(|code| Self::from_outcome(JobOutcome::from_exit_status(code)))
                .unwrap_or(ReportedState::Complete),
        }
    }
}

impl fmt::Display for ReportedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReportedState::NotSubmitted => "NotSubmitted",
            ReportedState::Held => "Held",
            ReportedState::Queued => "Queued",
            ReportedState::Running => "Running",
            ReportedState::Complete => "Complete",
            ReportedState::Failed => "Failed",
            ReportedState::WalltimeExceeded => "WalltimeExceeded",
            ReportedState::Canceled => "Canceled",
            ReportedState::Deleted => "Deleted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub name: String,
    pub job_ref: JobRef,
    pub depends_on: Vec<String>,
    pub state: ReportedState,
    pub detail: Option<String>,
    pub walltime: String,
}

/// Classifies every job in a log directory's submission log.
///
/// The status file wins over the resource manager: it is written once the
/// job is over and survives the job leaving the queue.
pub fn collect<R: ResourceManager>(log_dir: &LogDir, rm: &R) -> Result<Vec<JobReport>> {
    let records = log_dir.read_submissions()?;
    let no_submit = log_dir.is_no_submit();
    let cancelled = log_dir.cancelled()?;
    let mut reports = Vec::with_capacity(records.len());

    for record in records {
        let mut report = JobReport {
            name: record.name.clone(),
            job_ref: record.job_ref.clone(),
            depends_on: record.depends_on.clone(),
            state: ReportedState::NotSubmitted,
            detail: None,
            walltime: "-".to_string(),
        };
        if no_submit {
            reports.push(report);
            continue;
        }

        let status = StatusFile::read(log_dir.root(), &record.name)?;
        if let Some(status) = status.as_ref().filter(|s| s.exit_status.is_some()) {
            let outcome = status.outcome();
            report.state = ReportedState::from_outcome(outcome);
            if !outcome.is_success() {
                report.detail = Some(outcome.to_string());
            }
            report.walltime = status.walltime_usage();
        } else if cancelled.contains(&record.job_ref.0) {
            report.state = ReportedState::Canceled;
        } else {
            match rm.query(&record.job_ref)? {
                Some(info) => {
                    report.state = ReportedState::from_queue(&info);
                    if let Some(used) = info.walltime {
                        report.walltime = match info.requested_walltime {
                            Some(req) => format!("{} / {}", used, req),
                            None => used.to_string(),
                        };
                    }
                }
                None => report.state = ReportedState::Deleted,
            }
        }
        if cancelled.contains(&record.job_ref.0) && report.state == ReportedState::Failed {
            report.state = ReportedState::Canceled;
        }
        reports.push(report);
    }
    Ok(reports)
}

pub fn summarize(reports: &[JobReport]) -> BTreeMap<ReportedState, usize> {
    let mut counts = BTreeMap::new();
    for report in reports {
        *counts.entry(report.state).or_insert(0) += 1;
    }
    counts
}

fn header(names: &[&str]) -> Vec<Cell> {
    names
        .iter()
        .map(|n| Cell::new(n).add_attribute(Attribute::Bold).fg(Color::Cyan))
        .collect()
}

pub fn render_table(reports: &[JobReport]) -> String {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(header(&["Job", "Id", "State", "Walltime", "Depends on", "Detail"]));
    for r in reports {
        table.add_row(vec![
            Cell::new(&r.name).fg(Color::Yellow),
            Cell::new(&r.job_ref.0),
            Cell::new(r.state.to_string()).fg(r.state.color()),
            Cell::new(&r.walltime),
            Cell::new(r.depends_on.join(",")),
            Cell::new(r.detail.as_deref().unwrap_or("")),
        ]);
    }
    table.to_string()
}

const MANAGED_COLUMNS: [ManagedJobStatus; 6] = [
    ManagedJobStatus::NotSubmitted,
    ManagedJobStatus::Submitted,
    ManagedJobStatus::Complete,
    ManagedJobStatus::Failed,
    ManagedJobStatus::PipelineFailure,
    ManagedJobStatus::Deleted,
];

/// Per-pipeline job counts from a managed store.
pub fn render_managed_table(store: &ManagedStore) -> Result<String> {
    let mut names = vec!["Pipeline", "Status"];
    names.extend(MANAGED_COLUMNS.iter().map(|s| s.as_str()));
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(header(&names));

    for pipeline in store.pipelines()? {
        let jobs = store.jobs(pipeline.key)?;
        let mut row = vec![
            Cell::new(&pipeline.name).fg(Color::Yellow),
            Cell::new(pipeline.status.as_str()),
        ];
        for column in MANAGED_COLUMNS {
            let count = jobs.iter().filter(|j| j.status == column).count();
            row.push(Cell::new(count));
        }
        table.add_row(row);
    }
    Ok(table.to_string())
}
