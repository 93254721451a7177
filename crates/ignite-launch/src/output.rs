use crate::error::{JobError, JobResult};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// An output directory that is known to exist on disk.
///
/// The training runtime writes checkpoints and logs here; the launcher only
/// makes sure the directory is there before the job starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct OutputDir(PathBuf);

impl OutputDir {
    /// Create `path` and any missing parents. A directory that already exists is left untouched.
    pub fn acquire(path: impl AsRef<Path>) -> JobResult<Self> {
        let path = path.as_ref();
        if path.is_dir() {
            debug!(path = %path.display(), "output directory already present");
            return Ok(Self(path.to_path_buf()));
        }

        std::fs::create_dir_all(path).map_err(|e| JobError::io(path, e))?;
        info!(path = %path.display(), "created output directory");
        Ok(Self(path.to_path_buf()))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl AsRef<Path> for OutputDir {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

/// Conventional location for a job's outputs: `<data_dir>/output/<project>_<use>_<version>`.
#[must_use]
pub fn default_output_dir(data_dir: &Path, project_name: &str, model_use: &str, version: &str) -> PathBuf {
    data_dir.join("output").join(format!("{project_name}_{model_use}_{version}"))
}
