//! Master pid file.

use std::path::Path;

use tracing::info;

use crate::error::ClusterError;

/// Write `pid` as text to `path`, creating parent directories.
pub fn write_pid_file(path: &Path, pid: u32) -> Result<(), ClusterError> {
    let to_error = |source| ClusterError::PidFile {
        path: path.display().to_string(),
        source,
    };
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(to_error)?;
    }
    std::fs::write(path, pid.to_string()).map_err(to_error)?;
    info!(path = %path.display(), pid, "wrote pid file");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("nested").join("master.pid");
        write_pid_file(&path, 4321).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "4321");
    }

    #[test]
    fn reports_unwritable_path() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x").unwrap();
        let err = write_pid_file(&blocker.join("master.pid"), 1).unwrap_err();
        assert!(matches!(err, ClusterError::PidFile { .. }));
    }
}
