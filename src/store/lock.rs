use std::fs::{File, OpenOptions};
use std::path::Path;

use fs2::FileExt;

use crate::error::{CubeError, Result};

/// Exclusive advisory lock over a workspace. Held for the lifetime of the
/// owning facade; released on drop.
#[derive(Debug)]
pub struct WorkspaceLock {
    file: File,
}

impl WorkspaceLock {
    /// Acquire the workspace lock file, failing loudly on contention so a
    /// second writer process cannot corrupt the index.
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = open_lock_file(path)?;
        file.try_lock_exclusive()
            .map_err(|_| CubeError::Locked(path.display().to_string()))?;
        Ok(Self { file })
    }

    /// Release explicitly (normally handled by Drop).
    pub fn release(self) -> Result<()> {
        self.file.unlock()?;
        Ok(())
    }
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// Acquire an exclusive lock on a scoped file (agent state, registry),
/// returning the locked handle. The lock is released when the handle drops.
pub fn acquire(path: &Path) -> Result<File> {
    let file = open_lock_file(path)?;
    file.try_lock_exclusive()
        .map_err(|_| CubeError::Locked(path.display().to_string()))?;
    Ok(file)
}

pub fn release(file: File) -> Result<()> {
    file.unlock()?;
    Ok(())
}

fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn workspace_lock_excludes_second_holder() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".cube.lock");

        let held = WorkspaceLock::acquire(&path).unwrap();
        let err = WorkspaceLock::acquire(&path).unwrap_err();
        assert_eq!(err.code(), "locked");

        held.release().unwrap();
        let _again = WorkspaceLock::acquire(&path).unwrap();
    }

    #[test]
    fn drop_releases_workspace_lock() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".cube.lock");
        {
            let _held = WorkspaceLock::acquire(&path).unwrap();
        }
        let _reacquired = WorkspaceLock::acquire(&path).unwrap();
    }

    #[test]
    fn scoped_lock_acquire_and_release() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("agent.lock");

        let file = acquire(&path).unwrap();
        assert!(acquire(&path).is_err());
        release(file).unwrap();
        let _file = acquire(&path).unwrap();
    }
}
