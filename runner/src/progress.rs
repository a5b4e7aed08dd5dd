use crate::{
    catalog::TaskCatalog,
    config::{ConfigErrors, JobDir, JobSettings, TaskKind, TaskRecord},
    executors::EXIT_SUCCESS,
};
use ignore::WalkBuilder;
use nix::sys::{
    resource::{getrusage, UsageWho},
    time::TimeVal,
};
use std::{
    collections::HashMap,
    fmt::{self, Display},
    fs,
    path::Path,
    str::FromStr,
    time::Duration,
};
use tilejob_analysis::{JobOverview, TaskStats, TaskSummary};
use tracing::{debug, warn};

/// first token of the usage line every finished task prints to stdout
pub const USAGE_PREFIX: &str = "TILEJOB_USAGE";

#[derive(Debug, Clone, PartialEq)]
/// Resources consumed by one task, as reported in the scheduler stdout files
pub struct UsageRecord {
    pub task: String,
    pub exit_code: i32,
    pub cpu_seconds: f64,
    pub wall_seconds: f64,
    pub max_rss_kb: f64,
}

fn seconds(time: TimeVal) -> f64 {
    time.tv_sec() as f64 + time.tv_usec() as f64 / 1_000_000.0
}

impl UsageRecord {
    /// Usage of all waited-for children of this process
    pub fn children(task: &str, exit_code: i32, wall: Duration) -> Result<Self, nix::Error> {
        let usage = getrusage(UsageWho::RUSAGE_CHILDREN)?;

        Ok(Self {
            task: task.to_string(),
            exit_code,
            cpu_seconds: seconds(usage.user_time()) + seconds(usage.system_time()),
            wall_seconds: wall.as_secs_f64(),
            // kilobytes on linux
            max_rss_kb: usage.max_rss() as f64,
        })
    }
}

impl Display for UsageRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{USAGE_PREFIX} task={} exit_code={} cpu_seconds={:.3} \
             wall_seconds={:.3} max_rss_kb={}",
            self.task, self.exit_code, self.cpu_seconds, self.wall_seconds, self.max_rss_kb
        )
    }
}

impl FromStr for UsageRecord {
    type Err = ();

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut tokens = line.split_whitespace();

        if tokens.next() != Some(USAGE_PREFIX) {
            return Err(());
        }

        let (mut task, mut exit_code) = (None, None);
        let (mut cpu, mut wall, mut rss) = (None, None, None);

        for token in tokens {
            match token.split_once('=').ok_or(())? {
                ("task", value) => task = Some(value.to_string()),
                ("exit_code", value) => exit_code = value.parse().ok(),
                ("cpu_seconds", value) => cpu = value.parse().ok(),
                ("wall_seconds", value) => wall = value.parse().ok(),
                ("max_rss_kb", value) => rss = value.parse().ok(),
                _ => {}
            }
        }

        Ok(Self {
            task: task.ok_or(())?,
            exit_code: exit_code.ok_or(())?,
            cpu_seconds: cpu.ok_or(())?,
            wall_seconds: wall.ok_or(())?,
            max_rss_kb: rss.ok_or(())?,
        })
    }
}

/// All usage lines found in the files below `dir` ordered by file name, unreadable
/// files are skipped
pub fn collect_usage(dir: &Path) -> Vec<UsageRecord> {
    if !dir.is_dir() {
        debug!(path = ?dir, "No stdout directory, no usage to collect");
        return Vec::new();
    }

    WalkBuilder::new(dir)
        .standard_filters(false)
        .sort_by_file_name(|a, b| a.cmp(b))
        .build()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(error) => {
                warn!("Failed to search for stdout files: {error}");
                None
            }
        })
        .filter(|entry| entry.file_type().map_or(false, |kind| kind.is_file()))
        .filter_map(|entry| match fs::read(entry.path()) {
            Ok(content) => Some(String::from_utf8_lossy(&content).into_owned()),
            Err(error) => {
                warn!("Failed to read {}: {error}", entry.path().display());
                None
            }
        })
        .flat_map(|content| {
            content
                .lines()
                .filter_map(|line| line.parse::<UsageRecord>().ok())
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Usage of the successful runs of `completed` tasks, one record per task.
///
/// Failed runs and tasks whose output is gone are dropped. If a task reported
/// several successful runs the last one found wins.
pub fn completed_usage(records: Vec<UsageRecord>, completed: &[String]) -> Vec<UsageRecord> {
    let mut latest = HashMap::new();

    for record in records {
        if record.exit_code == EXIT_SUCCESS && completed.contains(&record.task) {
            latest.insert(record.task.clone(), record);
        }
    }

    completed
        .iter()
        .filter_map(|id| latest.remove(id))
        .collect()
}

/// Completion figures for one task population, with usage if `with_usage` is set
pub fn task_stats(
    job_dir: &JobDir,
    kind: TaskKind,
    tasks: &[TaskRecord],
    with_usage: bool,
) -> Result<TaskStats, ConfigErrors> {
    let catalog = TaskCatalog::new(tasks, Some(job_dir.path()));
    let completed = catalog.completed_ids()?;
    let mut stats = TaskStats::new(completed.len() as i64, catalog.total() as i64);

    if with_usage {
        let records = collect_usage(&job_dir.stdout_dir(kind));
        let found = records.len();
        let usable = completed_usage(records, &completed);
        debug!("Using {} of {found} usage records", usable.len());

        for usage in usable {
            stats.add_usage(usage.cpu_seconds, usage.wall_seconds, usage.max_rss_kb);
        }
    }

    Ok(stats)
}

pub fn overview(settings: &JobSettings) -> JobOverview {
    JobOverview {
        version: env!("CARGO_PKG_VERSION").to_string(),
        tile_size: settings.tile_size.to_string(),
        overlap_size: settings.overlap_size.to_string(),
        disable_histeq: settings.disable_histeq,
        tiles_per_task: settings.tiles_per_task,
        tasks_per_node: settings.tasks_per_node,
        model: settings.model.display().to_string(),
        binary: settings.binary.display().to_string(),
    }
}

/// Build the status report of a job. A missing merge config is reported as
/// not available rather than failing the whole report.
pub fn job_summary(job_dir: &JobDir, with_usage: bool) -> Result<TaskSummary, ConfigErrors> {
    let config = job_dir.load_job_config()?;
    let segmentation = task_stats(job_dir, TaskKind::Segmentation, &config.tasks, with_usage)?;

    let merge = match job_dir.load_merge_config() {
        Ok(merge) => Some(task_stats(job_dir, TaskKind::Merge, &merge.tasks, with_usage)?),
        Err(ConfigErrors::ConfigNotFound(path)) => {
            debug!(path = ?path, "No merge configuration");
            None
        }
        Err(error) => return Err(error),
    };

    Ok(TaskSummary::new(
        Some(overview(&config.settings)),
        Some(segmentation),
        merge,
    ))
}
