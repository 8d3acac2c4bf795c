use std::{
    io,
    path::{Component, Path, PathBuf},
};

use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum WorkspaceError {
    #[error("invalid job id {0:?}")]
    InvalidJobId(String),
    #[error("invalid file name {0:?}, must be a relative path inside the workspace")]
    InvalidFileName(String),
    #[error("could not create workspace {path:?}: {source}")]
    Create { path: PathBuf, source: io::Error },
}

/// Hands out per-job directories below a common root.
#[derive(Clone, Debug)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// directory a job's workspace lives in, whether or not it exists yet
    pub fn path_for(&self, job_id: &str) -> Result<PathBuf, WorkspaceError> {
        validate_job_id(job_id)?;
        Ok(self.root.join(job_id))
    }

    /// creates the job's directory if absent, an existing one is reused
    /// the returned guard removes the directory when released or dropped
    pub async fn acquire(&self, job_id: &str) -> Result<Workspace, WorkspaceError> {
        let path = self.path_for(job_id)?;
        create_dir(&path).await?;
        info!("acquired workspace {:?}", path);
        Ok(Workspace {
            job_id: job_id.to_string(),
            path,
            released: false,
        })
    }
}

/// A job's local directory, deleted exactly once when the owning execution ends.
#[derive(Debug)]
pub struct Workspace {
    job_id: String,
    path: PathBuf,
    released: bool,
}

impl Workspace {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// resolves a staged file name inside the workspace
    pub fn file_path(&self, name: &str) -> Result<PathBuf, WorkspaceError> {
        let relative = Path::new(name);
        let is_plain = relative
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
            && relative
                .components()
                .any(|component| matches!(component, Component::Normal(_)));
        if !is_plain {
            return Err(WorkspaceError::InvalidFileName(name.to_string()));
        }
        Ok(self.path.join(relative))
    }

    pub async fn exists(&self) -> bool {
        fs::try_exists(&self.path).await.unwrap_or(false)
    }

    /// recreates the directory if something removed it after acquire
    pub async fn ensure_exists(&self) -> Result<(), WorkspaceError> {
        create_dir(&self.path).await
    }

    /// deletes the directory tree, failures are logged and swallowed
    pub async fn release(mut self) {
        self.released = true;
        match fs::remove_dir_all(&self.path).await {
            Ok(()) => info!("released workspace {:?}", self.path),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                info!("workspace {:?} already gone", self.path)
            }
            Err(err) => warn!("could not remove workspace {:?}: {}", self.path, err),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // reached on panics and cancelled tasks, async cleanup is not available here
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => info!("released dropped workspace {:?}", self.path),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!("could not remove dropped workspace {:?}: {}", self.path, err),
        }
    }
}

fn validate_job_id(job_id: &str) -> Result<(), WorkspaceError> {
    let valid = !job_id.is_empty()
        && job_id != "."
        && job_id != ".."
        && !job_id.contains(|c: char| c == '/' || c == '\\' || c == '\0');
    if valid {
        Ok(())
    } else {
        Err(WorkspaceError::InvalidJobId(job_id.to_string()))
    }
}

async fn create_dir(path: &Path) -> Result<(), WorkspaceError> {
    fs::create_dir_all(path)
        .await
        .map_err(|source| WorkspaceError::Create {
            path: path.to_path_buf(),
            source,
        })
}
