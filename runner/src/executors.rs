pub mod local;
pub mod scratch;
pub mod task;

use crate::{
    batch::{load_manifest, task_ids},
    config::{ConfigErrors, JobDir, TaskKind},
};
use local::{BatchReport, CollectionOrder, PendingTask, ProcessPool};
use std::{
    io,
    path::{Path, PathBuf},
    process::Command,
};
use thiserror::Error;
use tracing::info;

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_GENERIC_FAILURE: i32 = 2;
pub const EXIT_MISSING_RESULT: i32 = 3;

/// stderr of the segmentation binary contains this when its temp dir creation
/// failed, the only failure worth a retry
pub const TRANSIENT_TMPDIR_MARKER: &str = "cannot create temporary directory";

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error("Failed to create scratch directory {}: {source}", .path.display())]
    Scratch { path: PathBuf, source: io::Error },
    #[error("Failed to spawn {program}: {source}")]
    Spawn { program: String, source: io::Error },
    #[error("Failed to wait for {program}: {source}")]
    Wait { program: String, source: io::Error },
    #[error("Failed to move {} to {}: {source}", .from.display(), .to.display())]
    Relocate {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
    },
    #[error("Failed to read resource usage: {0}")]
    Usage(#[from] nix::Error),
    #[error("I/O failure: {0}")]
    Io(#[from] io::Error),
}

impl ExecutorError {
    pub fn exit_code(&self) -> i32 {
        EXIT_GENERIC_FAILURE
    }
}

#[derive(Debug, Clone)]
/// Everything needed to fan out one batch of tasks on the local node
pub struct BatchRequest {
    pub job_dir: JobDir,
    pub batch: u32,
    pub kind: TaskKind,
    pub scratch_root: PathBuf,
    pub order: CollectionOrder,
    // forwarded to every child as --log
    pub log_level: Option<String>,
}

impl BatchRequest {
    /// one `run-task` invocation of `runner` per task id of the batch
    pub fn pending_tasks(&self, runner: &Path) -> Result<Vec<PendingTask>, ConfigErrors> {
        let manifest = load_manifest(&self.job_dir.manifest_path(self.kind))?;
        let ids = task_ids(&manifest, self.batch);

        if ids.is_empty() {
            return Err(ConfigErrors::UnknownBatch(self.batch));
        }

        Ok(ids
            .into_iter()
            .map(|id| {
                let mut command = Command::new(runner);

                if let Some(level) = &self.log_level {
                    command.arg("--log").arg(level);
                }

                command
                    .arg("run-task")
                    .arg(self.job_dir.path())
                    .arg(&id)
                    .arg("--scratchdir")
                    .arg(&self.scratch_root);

                if self.kind == TaskKind::Merge {
                    command.arg("--merge");
                }

                PendingTask { id, command }
            })
            .collect())
    }
}

/// Run every task of a batch as its own child process and collect their exits
pub fn run_batch(request: &BatchRequest, runner: &Path) -> Result<BatchReport, ExecutorError> {
    let tasks = request.pending_tasks(runner)?;

    info!(
        batch = request.batch,
        kind = %request.kind,
        "Starting {} tasks",
        tasks.len()
    );

    Ok(ProcessPool::new(request.order).run(tasks))
}
