use super::ExecutorError;
use nix::unistd::gethostname;
use std::{
    ffi::OsString,
    fs,
    ops::Deref,
    path::{Path, PathBuf},
};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// A per-task scratch directory that is removed again when dropped, no matter
/// how the task ended
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    /// Create `<hostname>.<uuid>` below `root`
    pub fn create(root: &Path) -> Result<Self, ExecutorError> {
        let path = root.join(scratch_name());

        fs::create_dir_all(&path).map_err(|source| ExecutorError::Scratch {
            path: path.clone(),
            source,
        })?;
        debug!(path = ?path, "Created scratch directory");

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        match fs::remove_dir_all(&self.path) {
            Ok(()) => debug!(path = ?self.path, "Removed scratch directory"),
            Err(error) => {
                error!(error = ?error, path = ?self.path, "Failed to remove scratch directory")
            }
        }
    }
}

impl Deref for ScratchDir {
    type Target = Path;

    fn deref(&self) -> &Self::Target {
        &self.path
    }
}

fn scratch_name() -> OsString {
    let mut name = match gethostname() {
        Ok(hostname) => hostname,
        Err(error) => {
            warn!("Failed to get hostname for scratch directory: {error}");
            OsString::from("localhost")
        }
    };
    name.push(".");
    name.push(Uuid::new_v4().to_string());

    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removed_on_drop() {
        let root = tempfile::tempdir().unwrap();
        let path = {
            let scratch = ScratchDir::create(root.path()).unwrap();
            fs::write(scratch.join("partial.png"), "x").unwrap();
            fs::create_dir(scratch.join("nested")).unwrap();
            assert!(scratch.is_dir());
            scratch.path().to_path_buf()
        };

        assert!(!path.exists());
        assert!(root.path().is_dir());
    }

    #[test]
    fn siblings_never_collide() {
        let root = tempfile::tempdir().unwrap();
        let first = ScratchDir::create(root.path()).unwrap();
        let second = ScratchDir::create(root.path()).unwrap();

        assert_ne!(first.path(), second.path());

        let hostname = gethostname().unwrap().to_string_lossy().into_owned();
        let name = first.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(&format!("{hostname}.")));
    }

    #[test]
    fn root_is_created() {
        let root = tempfile::tempdir().unwrap();
        let nested = root.path().join("a").join("b");

        let scratch = ScratchDir::create(&nested).unwrap();
        assert!(scratch.starts_with(&nested));
    }
}
