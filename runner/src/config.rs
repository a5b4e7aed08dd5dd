use crate::tiles::{TileError, TileGrid};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    fmt::{self, Display},
    fs::{self, File},
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    str::FromStr,
};
use thiserror::Error;
use tracing::{debug, error, warn};

pub const JOB_CONFIG_FILE: &str = "jobs.yml";
pub const MERGE_CONFIG_FILE: &str = "merge.jobs.yml";
pub const BATCHED_JOBS_FILE: &str = "batched.jobs.yml";
pub const BATCHED_MERGE_JOBS_FILE: &str = "batched.merge.jobs.yml";

pub const RUN_DIR: &str = "run";
pub const STDOUT_DIR: &str = "stdout";
pub const MERGE_STDOUT_DIR: &str = "mergestdout";
pub const TMP_DIR: &str = "tmp";
pub const TILES_DIR: &str = "tiles";
pub const RESULT_DIR: &str = "result";

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound(path.to_path_buf()))
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::Io(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("{} configuration file does not exist", .0.display())]
    ConfigNotFound(PathBuf),
    #[error("Failed to read {}: {source}", .path.display())]
    ReadConfig {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Task {0} has no output path")]
    MissingOutputPath(String),
    #[error("Task {0} has no input path")]
    MissingInputPath(String),
    #[error("Task {0} is not defined in the job configuration")]
    UnknownTask(String),
    #[error("Batch {0} is not defined in the batch manifest")]
    UnknownBatch(u32),
    #[error("merge_binary must be set in the job settings to run merge tasks")]
    MissingMergeBinary,
    #[error("Invalid size '{0}', expected WIDTHxHEIGHT or a single number")]
    InvalidSize(String),
    #[error(transparent)]
    Tiles(#[from] TileError),
    #[error("Cluster not supported: {0}")]
    UnsupportedCluster(String),
    #[error("Script name cannot be None")]
    InvalidScriptName,
    #[error("Working dir cannot be None")]
    InvalidWorkingDir,
    #[error("{} already contains a job", .0.display())]
    JobExists(PathBuf),
    #[error("{} is not a directory", .0.display())]
    InvalidDirectory(PathBuf),
    #[error("{} not found", .0.display())]
    FileNotFound(PathBuf),
    #[error("Globs were invalid")]
    InvalidGlobs(#[from] globset::Error),
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
/// A `WIDTHxHEIGHT` pair in pixels, used for tiles and overlaps
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl FromStr for Size {
    type Err = ConfigErrors;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigErrors::InvalidSize(value.to_string());
        let parse = |part: &str| part.trim().parse::<u32>().map_err(|_| invalid());

        match value.trim().split_once(['x', 'X']) {
            Some((width, height)) => Ok(Self::new(parse(width)?, parse(height)?)),
            None => {
                let both = parse(value)?;
                Ok(Self::new(both, both))
            }
        }
    }
}

impl TryFrom<String> for Size {
    type Error = ConfigErrors;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Size> for String {
    fn from(size: Size) -> Self {
        size.to_string()
    }
}

impl Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// The two task populations of a job, each with its own config and manifest
pub enum TaskKind {
    Segmentation,
    Merge,
}

impl TaskKind {
    pub fn config_file(&self) -> &'static str {
        match self {
            Self::Segmentation => JOB_CONFIG_FILE,
            Self::Merge => MERGE_CONFIG_FILE,
        }
    }

    pub fn manifest_file(&self) -> &'static str {
        match self {
            Self::Segmentation => BATCHED_JOBS_FILE,
            Self::Merge => BATCHED_MERGE_JOBS_FILE,
        }
    }

    pub fn stdout_dir(&self) -> &'static str {
        match self {
            Self::Segmentation => STDOUT_DIR,
            Self::Merge => MERGE_STDOUT_DIR,
        }
    }
}

impl Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Segmentation => write!(f, "segmentation"),
            Self::Merge => write!(f, "merge"),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
/// One schedulable unit of work, written once when the job is created
pub struct TaskRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<PathBuf>,
    // tile arguments passed verbatim to the segmentation binary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
}

impl TaskRecord {
    pub fn output_path(&self) -> Result<&Path, ConfigErrors> {
        self.output
            .as_deref()
            .ok_or_else(|| ConfigErrors::MissingOutputPath(self.id.clone()))
    }

    pub fn input_path(&self) -> Result<&Path, ConfigErrors> {
        self.input
            .as_deref()
            .ok_or_else(|| ConfigErrors::MissingInputPath(self.id.clone()))
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct JobSettings {
    // directory the input images were scanned from
    pub images: PathBuf,
    pub model: PathBuf,
    // external segmentation binary
    pub binary: PathBuf,
    pub tile_size: Size,
    #[serde(default)]
    pub overlap_size: Size,
    #[serde(default = "default_tiles_per_task")]
    pub tiles_per_task: usize,
    #[serde(default = "default_tasks_per_node")]
    pub tasks_per_node: usize,
    #[serde(default = "default_disable_histeq")]
    pub disable_histeq: bool,
    // external tile merging binary, required to run merge tasks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_binary: Option<PathBuf>,
}

impl JobSettings {
    /// Reject settings that can never produce a valid tile grid
    pub fn validate(&self) -> Result<(), ConfigErrors> {
        TileGrid::new(self.tile_size, self.overlap_size, self.tiles_per_task)?;

        if self.tasks_per_node == 0 {
            return Err(TileError::ZeroChunk("tasks_per_node").into());
        }

        Ok(())
    }

    /// Log every problem with the settings instead of stopping at the first one,
    /// returns true if any error was found
    pub fn preflight_checks(&self) -> bool {
        let mut contains_error = false;

        if let Err(error) = self.validate() {
            error!("Invalid job settings: {error}");
            contains_error = true;
        }

        match check_executable(&self.binary) {
            Ok(true) => {}
            Ok(false) => {
                warn!(
                    "Binary {} is not executable, this might cause problems",
                    self.binary.display()
                );
            }
            Err(error) => {
                warn!(
                    "Failed to determine if binary ({}) is an executable: {error}",
                    self.binary.display()
                );
            }
        }

        if !self.model.exists() {
            warn!("Model {} does not exist", self.model.display());
        }

        if let Some(merge_binary) = &self.merge_binary {
            if !merge_binary.is_file() {
                warn!(
                    "Failed to find merge_binary. Either not a file or not found at {}",
                    merge_binary.display()
                );
            }
        }

        contains_error
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct JobConfig {
    pub settings: JobSettings,
    #[serde(default)]
    pub tasks: Vec<TaskRecord>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MergeConfig {
    #[serde(default)]
    pub tasks: Vec<TaskRecord>,
}

/// Find a task by id, the configs are small enough for a linear scan
pub fn find_task<'a>(tasks: &'a [TaskRecord], id: &str) -> Result<&'a TaskRecord, ConfigErrors> {
    tasks
        .iter()
        .find(|task| task.id == id)
        .ok_or_else(|| ConfigErrors::UnknownTask(id.to_string()))
}

#[derive(Clone, Debug)]
/// On-disk layout of a job directory
pub struct JobDir {
    path: PathBuf,
}

impl JobDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config_path(&self, kind: TaskKind) -> PathBuf {
        self.path.join(kind.config_file())
    }

    pub fn manifest_path(&self, kind: TaskKind) -> PathBuf {
        self.path.join(kind.manifest_file())
    }

    pub fn run_dir(&self) -> PathBuf {
        self.path.join(RUN_DIR)
    }

    pub fn stdout_dir(&self, kind: TaskKind) -> PathBuf {
        self.run_dir().join(kind.stdout_dir())
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.run_dir().join(TMP_DIR)
    }

    pub fn tiles_dir(&self) -> PathBuf {
        self.run_dir().join(TILES_DIR)
    }

    pub fn result_dir(&self) -> PathBuf {
        self.run_dir().join(RESULT_DIR)
    }

    pub fn load_job_config(&self) -> Result<JobConfig, ConfigErrors> {
        let config: JobConfig = load_yaml(&self.config_path(TaskKind::Segmentation))?;
        config.settings.validate()?;

        Ok(config)
    }

    pub fn load_merge_config(&self) -> Result<MergeConfig, ConfigErrors> {
        load_yaml(&self.config_path(TaskKind::Merge))
    }

    /// task records of either population
    pub fn load_tasks(&self, kind: TaskKind) -> Result<Vec<TaskRecord>, ConfigErrors> {
        match kind {
            TaskKind::Segmentation => self.load_job_config().map(|config| config.tasks),
            TaskKind::Merge => self.load_merge_config().map(|config| config.tasks),
        }
    }
}

pub fn load_yaml<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigErrors> {
    if !path.is_file() {
        return Err(ConfigErrors::ConfigNotFound(path.to_path_buf()));
    }

    debug!(path = ?path, "Loading configuration");

    let content = fs::read_to_string(path).map_err(|source| ConfigErrors::ReadConfig {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(serde_yaml::from_str(&content)?)
}

pub fn write_yaml<T: Serialize>(path: &Path, value: &T) -> Result<(), ConfigErrors> {
    debug!(path = ?path, "Writing configuration");
    fs::write(path, serde_yaml::to_string(value)?)?;

    Ok(())
}

fn default_tiles_per_task() -> usize {
    50
}

fn default_tasks_per_node() -> usize {
    11
}

fn default_disable_histeq() -> bool {
    true
}
