use crate::config::{load_yaml, ConfigErrors};
use itertools::Itertools;
use std::{
    collections::BTreeMap,
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info};

/// appended to a manifest's file name when it gets replaced
pub const BACKUP_SUFFIX: &str = ".bak";

#[derive(Error, Debug)]
pub enum PlanningError {
    #[error("Batch manifest path cannot be None")]
    InvalidConfigFile,
    #[error("Task id list cannot be None")]
    InvalidTaskList,
    #[error("Tasks per node must be larger than 0")]
    InvalidTasksPerNode,
    #[error("Failed to serialize batch manifest")]
    Serialize(#[from] serde_yaml::Error),
    #[error("Failed to write batch manifest")]
    Io(#[from] std::io::Error),
}

/// batch id -> comma joined task ids
pub type BatchManifest = BTreeMap<u32, String>;

/// Groups incomplete tasks into batches that run concurrently on a single node
#[derive(Debug, Clone, Copy)]
pub struct BatchPlanner {
    tasks_per_node: usize,
}

pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(BACKUP_SUFFIX);

    PathBuf::from(name)
}

impl BatchPlanner {
    pub fn new(tasks_per_node: usize) -> Result<Self, PlanningError> {
        if tasks_per_node == 0 {
            return Err(PlanningError::InvalidTasksPerNode);
        }

        Ok(Self { tasks_per_node })
    }

    /// Partition `ids` into batches without touching the filesystem
    pub fn plan(&self, ids: &[String]) -> BatchManifest {
        ids.iter()
            .chunks(self.tasks_per_node)
            .into_iter()
            .zip(1..)
            .map(|(mut chunk, batch)| (batch, chunk.join(",")))
            .collect()
    }

    /// Write a fresh manifest for `ids` to `path` and return the number of batches.
    ///
    /// An existing manifest is moved aside with [`BACKUP_SUFFIX`] first, replacing
    /// any older backup. Nothing is written if there are no ids.
    pub fn generate(
        &self,
        ids: Option<&[String]>,
        path: Option<&Path>,
    ) -> Result<u32, PlanningError> {
        let path = path.ok_or(PlanningError::InvalidConfigFile)?;
        let ids = ids.ok_or(PlanningError::InvalidTaskList)?;

        if ids.is_empty() {
            info!("No incomplete tasks, not writing {}", path.display());
            return Ok(0);
        }

        let manifest = self.plan(ids);
        let batches = manifest.len() as u32;

        if path.exists() {
            let backup = backup_path(path);
            debug!(from = ?path, to = ?backup, "Backing up previous batch manifest");
            fs::rename(path, &backup)?;
        }

        fs::write(path, serde_yaml::to_string(&manifest)?)?;
        info!(
            "Wrote {batches} batches for {} tasks to {}",
            ids.len(),
            path.display()
        );

        Ok(batches)
    }
}

pub fn load_manifest(path: &Path) -> Result<BatchManifest, ConfigErrors> {
    load_yaml(path)
}

/// task ids of a single batch, empty if the batch doesn't exist
pub fn task_ids(manifest: &BatchManifest, batch: u32) -> Vec<String> {
    manifest
        .get(&batch)
        .map(|ids| {
            ids.split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|id| id.to_string()).collect()
    }

    #[test]
    fn partitions_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batched.jobs.yml");
        let planner = BatchPlanner::new(2).unwrap();

        let count = planner
            .generate(Some(ids(&["1", "2", "3", "4", "5"]).as_slice()), Some(path.as_path()))
            .unwrap();

        assert_eq!(count, 3);

        let manifest = load_manifest(&path).unwrap();
        assert_eq!(manifest.len(), 3);
        assert_eq!(manifest[&1], "1,2");
        assert_eq!(manifest[&2], "3,4");
        assert_eq!(manifest[&3], "5");
        assert_eq!(task_ids(&manifest, 2), ["3", "4"]);
        assert!(task_ids(&manifest, 4).is_empty());
    }

    #[test]
    fn every_id_in_exactly_one_batch() {
        let planner = BatchPlanner::new(3).unwrap();
        let input = (1..=11).map(|id| id.to_string()).collect::<Vec<_>>();

        let manifest = planner.plan(&input);
        let flattened = manifest
            .keys()
            .flat_map(|batch| task_ids(&manifest, *batch))
            .collect::<Vec<_>>();

        assert_eq!(manifest.keys().copied().collect::<Vec<_>>(), [1, 2, 3, 4]);
        assert!(manifest
            .values()
            .all(|batch| batch.split(',').count() <= 3));
        assert_eq!(flattened, input);
    }

    #[test]
    fn empty_list_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batched.jobs.yml");

        let count = BatchPlanner::new(2)
            .unwrap()
            .generate(Some(&[][..]), Some(path.as_path()))
            .unwrap();

        assert_eq!(count, 0);
        assert!(!path.exists());
    }

    #[test]
    fn unset_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batched.jobs.yml");
        let planner = BatchPlanner::new(2).unwrap();

        assert!(matches!(
            planner.generate(Some(ids(&["1"]).as_slice()), None),
            Err(PlanningError::InvalidConfigFile)
        ));
        assert!(matches!(
            planner.generate(None, Some(path.as_path())),
            Err(PlanningError::InvalidTaskList)
        ));
        assert!(matches!(
            planner.generate(None, None),
            Err(PlanningError::InvalidConfigFile)
        ));
        assert!(!path.exists());
    }

    #[test]
    fn zero_tasks_per_node() {
        assert!(matches!(
            BatchPlanner::new(0),
            Err(PlanningError::InvalidTasksPerNode)
        ));
    }

    #[test]
    fn replanning_keeps_one_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batched.jobs.yml");
        let backup = backup_path(&path);
        let planner = BatchPlanner::new(1).unwrap();

        assert_eq!(
            backup.file_name().unwrap().to_str().unwrap(),
            "batched.jobs.yml.bak"
        );

        planner
            .generate(Some(ids(&["1", "2"]).as_slice()), Some(path.as_path()))
            .unwrap();
        assert!(!backup.exists());

        planner
            .generate(Some(ids(&["2"]).as_slice()), Some(path.as_path()))
            .unwrap();
        assert_eq!(load_manifest(&backup).unwrap().len(), 2);

        let manifest = load_manifest(&path).unwrap();
        assert_eq!(manifest.len(), 1);
        assert_eq!(manifest[&1], "2");

        planner
            .generate(Some(ids(&["9", "8", "7"]).as_slice()), Some(path.as_path()))
            .unwrap();
        let backup_manifest = load_manifest(&backup).unwrap();
        assert_eq!(backup_manifest.len(), 1);
        assert_eq!(backup_manifest[&1], "2");
        assert_eq!(load_manifest(&path).unwrap()[&3], "7");
    }
}
