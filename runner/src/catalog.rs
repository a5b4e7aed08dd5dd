use crate::config::{ConfigErrors, TaskRecord};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone)]
/// Completion state of a task population, derived from output artifacts on disk.
///
/// Segmentation and merge tasks each get their own catalog built from their own
/// configuration, no state is shared between the two.
pub struct TaskCatalog<'a> {
    tasks: &'a [TaskRecord],
    base_dir: Option<PathBuf>,
}

impl<'a> TaskCatalog<'a> {
    pub fn new(tasks: &'a [TaskRecord], base_dir: Option<&Path>) -> Self {
        Self {
            tasks,
            base_dir: base_dir.map(Path::to_path_buf),
        }
    }

    pub fn total(&self) -> usize {
        self.tasks.len()
    }

    /// resolve relative output paths against the base directory
    pub fn resolve(&self, task: &TaskRecord) -> Result<PathBuf, ConfigErrors> {
        let output = task.output_path()?;

        Ok(match &self.base_dir {
            Some(base) if output.is_relative() => base.join(output),
            _ => output.to_path_buf(),
        })
    }

    /// Ids of tasks whose output does not exist yet, in declaration order
    pub fn incomplete_ids(&self) -> Result<Vec<String>, ConfigErrors> {
        let mut incomplete = Vec::new();

        for task in self.tasks {
            if !self.resolve(task)?.exists() {
                incomplete.push(task.id.clone());
            }
        }

        info!(
            "Found {} of {} tasks incomplete",
            incomplete.len(),
            self.tasks.len()
        );

        Ok(incomplete)
    }

    /// Ids of tasks whose output exists, in declaration order
    pub fn completed_ids(&self) -> Result<Vec<String>, ConfigErrors> {
        let mut completed = Vec::new();

        for task in self.tasks {
            if self.resolve(task)?.exists() {
                completed.push(task.id.clone());
            }
        }

        Ok(completed)
    }

    pub fn completed_count(&self) -> Result<usize, ConfigErrors> {
        Ok(self.completed_ids()?.len())
    }
}
