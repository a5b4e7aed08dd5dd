use super::{
    scratch::ScratchDir, ExecutorError, EXIT_GENERIC_FAILURE, EXIT_MISSING_RESULT, EXIT_SUCCESS,
    TRANSIENT_TMPDIR_MARKER,
};
use crate::config::{ConfigErrors, JobConfig, JobSettings, TaskKind, TaskRecord};
use std::{
    fs::{self, File},
    path::{Path, PathBuf},
    process::Command,
    time::Instant,
};
use tracing::{debug, error, info, instrument, trace, warn};

/// attempts per task, the transient failure gets exactly one retry
pub const MAX_ATTEMPTS: usize = 2;

const STDOUT_SPOOL: &str = ".tilejob.stdout";
const STDERR_SPOOL: &str = ".tilejob.stderr";

#[derive(Debug, Clone, PartialEq, Eq)]
/// Result of a single invocation of the external binary
pub enum AttemptOutcome {
    Produced(PathBuf),
    // no artifact, but stderr carried the temp dir marker
    Transient,
    // binary exited cleanly without leaving an artifact
    Missing,
    Failed(i32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Final result of a task after all attempts
pub enum TaskOutcome {
    Completed { attempts: usize },
    MissingResult,
    Failed { exit_code: i32 },
}

impl TaskOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Completed { .. } => EXIT_SUCCESS,
            Self::MissingResult => EXIT_MISSING_RESULT,
            Self::Failed { exit_code } => *exit_code,
        }
    }
}

#[derive(Debug, Clone)]
/// External program run for a task and how its arguments are laid out.
///
/// Deliberately not made with dynamic dispatch, there are two kinds of tasks
/// and both are known up front.
pub enum TaskProgram {
    Segmentation {
        binary: PathBuf,
        model: PathBuf,
        disable_histeq: bool,
    },
    Merge {
        binary: PathBuf,
    },
}

impl TaskProgram {
    pub fn segmentation(settings: &JobSettings) -> Self {
        Self::Segmentation {
            binary: settings.binary.clone(),
            model: settings.model.clone(),
            disable_histeq: settings.disable_histeq,
        }
    }

    pub fn merge(settings: &JobSettings) -> Result<Self, ConfigErrors> {
        settings
            .merge_binary
            .clone()
            .map(|binary| Self::Merge { binary })
            .ok_or(ConfigErrors::MissingMergeBinary)
    }

    pub fn for_kind(kind: TaskKind, settings: &JobSettings) -> Result<Self, ConfigErrors> {
        match kind {
            TaskKind::Segmentation => Ok(Self::segmentation(settings)),
            TaskKind::Merge => Self::merge(settings),
        }
    }

    pub fn binary(&self) -> &Path {
        match self {
            Self::Segmentation { binary, .. } | Self::Merge { binary } => binary,
        }
    }

    /// Where the invocation for `task` leaves its result inside `scratch`.
    ///
    /// The segmentation binary names its result after the input image, the merge
    /// binary is handed the declared output file name.
    pub fn artifact(
        &self,
        task: &TaskRecord,
        input: &Path,
        scratch: &Path,
    ) -> Result<PathBuf, ConfigErrors> {
        let file_name = match self {
            Self::Segmentation { .. } => input
                .file_name()
                .ok_or_else(|| ConfigErrors::MissingInputPath(task.id.clone()))?,
            Self::Merge { .. } => task
                .output_path()?
                .file_name()
                .ok_or_else(|| ConfigErrors::MissingOutputPath(task.id.clone()))?,
        };

        Ok(scratch.join(file_name))
    }

    /// Build the invocation for `task` writing into `scratch`, together with the
    /// artifact path the invocation is expected to produce
    pub fn command(
        &self,
        task: &TaskRecord,
        input: &Path,
        scratch: &Path,
    ) -> Result<(Command, PathBuf), ConfigErrors> {
        let artifact = self.artifact(task, input, scratch)?;
        let mut command = Command::new(self.binary());

        match self {
            Self::Segmentation {
                model,
                disable_histeq,
                ..
            } => {
                command
                    .arg("test")
                    .arg(input)
                    .arg(scratch)
                    .arg("-m")
                    .arg(model);

                if let Some(args) = &task.args {
                    command.args(args.split_whitespace());
                }

                if *disable_histeq {
                    command.arg("-h");
                }
            }
            Self::Merge { .. } => {
                command.arg(input).arg(&artifact);
            }
        }

        Ok((command, artifact))
    }
}

#[derive(Debug, Clone)]
/// Runs single tasks of a job inside throwaway scratch directories
pub struct TaskRunner {
    program: TaskProgram,
    scratch_root: PathBuf,
    // relative task paths are resolved against this, usually the job dir
    base_dir: PathBuf,
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_relative() {
        base.join(path)
    } else {
        path.to_path_buf()
    }
}

impl TaskRunner {
    pub fn new(program: TaskProgram, scratch_root: PathBuf, base_dir: PathBuf) -> Self {
        Self {
            program,
            scratch_root,
            base_dir,
        }
    }

    pub fn load(
        config: &JobConfig,
        kind: TaskKind,
        scratch_root: PathBuf,
        base_dir: PathBuf,
    ) -> Result<Self, ConfigErrors> {
        Ok(Self::new(
            TaskProgram::for_kind(kind, &config.settings)?,
            scratch_root,
            base_dir,
        ))
    }

    /// Run `task` to completion, retrying once if the binary failed to create its
    /// temporary directory. The scratch directory is gone when this returns.
    #[instrument(skip_all, fields(task = %task.id))]
    pub fn run(&self, task: &TaskRecord) -> Result<TaskOutcome, ExecutorError> {
        let output = resolve(&self.base_dir, task.output_path()?);
        let input = resolve(&self.base_dir, task.input_path()?);
        let scratch = ScratchDir::create(&self.scratch_root)?;

        for attempt in 1..=MAX_ATTEMPTS {
            match self.attempt(task, &input, &scratch)? {
                AttemptOutcome::Produced(artifact) => {
                    relocate(&artifact, &output)?;
                    info!("Task produced {}", output.display());
                    return Ok(TaskOutcome::Completed { attempts: attempt });
                }
                AttemptOutcome::Transient if attempt < MAX_ATTEMPTS => {
                    warn!("Binary could not create its temporary directory, retrying");
                }
                AttemptOutcome::Transient | AttemptOutcome::Missing => break,
                AttemptOutcome::Failed(exit_code) => {
                    error!("Binary failed with exit code {exit_code}");
                    return Ok(TaskOutcome::Failed { exit_code });
                }
            }
        }

        error!("No result found, expected {}", output.display());
        Ok(TaskOutcome::MissingResult)
    }

    fn attempt(
        &self,
        task: &TaskRecord,
        input: &Path,
        scratch: &ScratchDir,
    ) -> Result<AttemptOutcome, ExecutorError> {
        let (mut command, artifact) = self.program.command(task, input, scratch)?;
        let stdout_path = scratch.join(STDOUT_SPOOL);
        let stderr_path = scratch.join(STDERR_SPOOL);
        let program = self.program.binary().display().to_string();

        command
            .current_dir(scratch.path())
            .stdout(File::create(&stdout_path)?)
            .stderr(File::create(&stderr_path)?);

        debug!(command = ?command, "Running task");
        let start = Instant::now();

        let status = command
            .spawn()
            .map_err(|source| ExecutorError::Spawn {
                program: program.clone(),
                source,
            })?
            .wait()
            .map_err(|source| ExecutorError::Wait { program, source })?;

        let stdout = String::from_utf8_lossy(&fs::read(&stdout_path)?).into_owned();
        let stderr = String::from_utf8_lossy(&fs::read(&stderr_path)?).into_owned();

        debug!(
            "Finished in {} s | status: {status}",
            start.elapsed().as_secs()
        );
        trace!("Output: {stdout}");
        trace!("Errors: {stderr}");

        Ok(classify(
            artifact,
            status.code().unwrap_or(EXIT_GENERIC_FAILURE),
            &stderr,
        ))
    }
}

/// An existing artifact wins over any exit code
fn classify(artifact: PathBuf, exit_code: i32, stderr: &str) -> AttemptOutcome {
    if artifact.exists() {
        AttemptOutcome::Produced(artifact)
    } else if stderr.to_lowercase().contains(TRANSIENT_TMPDIR_MARKER) {
        AttemptOutcome::Transient
    } else if exit_code != EXIT_SUCCESS {
        AttemptOutcome::Failed(exit_code)
    } else {
        AttemptOutcome::Missing
    }
}

/// Move `from` to `to`, falling back to copy and remove across filesystems
fn relocate(from: &Path, to: &Path) -> Result<(), ExecutorError> {
    let error = |source: std::io::Error| ExecutorError::Relocate {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        source,
    };

    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).map_err(error)?;
    }

    if let Err(rename_error) = fs::rename(from, to) {
        debug!("Rename failed ({rename_error}), copying instead");
        fs::copy(from, to).map_err(error)?;
        fs::remove_file(from).map_err(error)?;
    }

    Ok(())
}
