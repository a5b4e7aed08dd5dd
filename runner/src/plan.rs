use crate::{
    batch::{BatchPlanner, PlanningError},
    catalog::TaskCatalog,
    config::{ConfigErrors, JobDir, TaskKind},
    scheduler::{JobScript, Schedulers},
};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

pub const DEFAULT_WALLTIME: &str = "12:00:00";
pub const DEFAULT_SCRATCH_DIR: &str = "/tmp";

#[derive(Error, Debug)]
pub enum PlanError {
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error(transparent)]
    Planning(#[from] PlanningError),
}

#[derive(Debug, Clone)]
pub struct PlanOptions {
    pub kind: TaskKind,
    pub cluster: String,
    pub account: Option<String>,
    pub walltime: String,
    pub required_mem_gb: Option<u32>,
    pub scratch_root: PathBuf,
}

impl PlanOptions {
    pub fn new(kind: TaskKind, cluster: impl Into<String>) -> Self {
        Self {
            kind,
            cluster: cluster.into(),
            account: None,
            walltime: DEFAULT_WALLTIME.to_string(),
            required_mem_gb: None,
            scratch_root: PathBuf::from(DEFAULT_SCRATCH_DIR),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanOutcome {
    /// nothing left to run for this population
    Complete { hint: String },
    Submit {
        batches: u32,
        script: PathBuf,
        instructions: String,
    },
}

fn job_name(kind: TaskKind) -> &'static str {
    match kind {
        TaskKind::Segmentation => "tilejob",
        TaskKind::Merge => "mergetilejob",
    }
}

fn script_name(kind: TaskKind, cluster: &str) -> String {
    match kind {
        TaskKind::Segmentation => format!("runjobs.{cluster}"),
        TaskKind::Merge => format!("runmerge.{cluster}"),
    }
}

/// Batch the incomplete tasks of a job and write a submit script running one batch
/// per array task through `runner`
pub fn plan_job(
    job_dir: &JobDir,
    options: &PlanOptions,
    runner: &Path,
) -> Result<PlanOutcome, PlanError> {
    // fail on unknown clusters before the manifest is replaced
    let mut scheduler = Schedulers::from_cluster(&options.cluster)?;
    scheduler.set_account(options.account.clone());

    let config = job_dir.load_job_config()?;
    let tasks = job_dir.load_tasks(options.kind)?;
    let incomplete = TaskCatalog::new(&tasks, Some(job_dir.path())).incomplete_ids()?;

    let batches = BatchPlanner::new(config.settings.tasks_per_node)?.generate(
        Some(incomplete.as_slice()),
        Some(job_dir.manifest_path(options.kind).as_path()),
    )?;

    if batches == 0 {
        return Ok(PlanOutcome::Complete {
            hint: completion_hint(job_dir, options, runner),
        });
    }

    let mut command = format!(
        "{} run {} \"{}\" --scratchdir \"{}\"",
        runner.display(),
        scheduler.taskid_variable(),
        job_dir.path().display(),
        options.scratch_root.display()
    );
    if options.kind == TaskKind::Merge {
        command.push_str(" --merge");
    }

    let name = script_name(options.kind, scheduler.cluster_name());
    let stdout_path = job_dir
        .stdout_dir(options.kind)
        .join(scheduler.array_job_out_file_name())
        .display()
        .to_string();

    let (instructions, script) = scheduler.write_submit_script(&JobScript {
        name: Some(&name),
        working_dir: Some(job_dir.path()),
        stdout_path,
        job_name: job_name(options.kind),
        walltime: &options.walltime,
        command,
        runner: "tilejob",
        required_mem_gb: options.required_mem_gb,
        task_count: Some(batches as usize),
    })?;

    info!(
        "Planned {batches} {} batches for {} tasks",
        options.kind,
        incomplete.len()
    );

    Ok(PlanOutcome::Submit {
        batches,
        script,
        instructions,
    })
}

fn completion_hint(job_dir: &JobDir, options: &PlanOptions, runner: &Path) -> String {
    match options.kind {
        TaskKind::Segmentation => format!(
            "\nNo segmentation tasks need to be run\n\n\
             Run this to submit merge job\n  {} plan \"{}\" --merge --cluster {}\n",
            runner.display(),
            job_dir.path().display(),
            options.cluster
        ),
        TaskKind::Merge => format!(
            "\nNo merge tasks need to be run\n\nResults are in {}\n",
            job_dir.result_dir().display()
        ),
    }
}
