use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use nbexec_shared::{JobManifest, MANIFEST_FILE};
use thiserror::Error;
use tokio::fs;
use tracing::{info, instrument, warn};

use crate::{
    job::{JobContext, StagedJob},
    store::{object_key, ContentStore, StoreError},
    workspace::{Workspace, WorkspaceError, WorkspaceManager},
};

#[derive(Error, Debug)]
pub enum StagingError {
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error("failed to fetch manifest of job {job_id}: {source}")]
    ManifestFetch { job_id: String, source: FetchError },
    #[error("invalid manifest of job {job_id}: {source}")]
    ManifestParse {
        job_id: String,
        source: serde_json::Error,
    },
    #[error("failed to fetch entry script {name}: {source}")]
    EntryScript { name: String, source: FetchError },
}

/// failure to bring one object into the workspace
#[derive(Error, Debug)]
pub enum FetchError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error("local file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Fetches a job's manifest, entry script and resources into its workspace.
pub struct Stager {
    store: Arc<dyn ContentStore>,
    workspaces: WorkspaceManager,
}

impl Stager {
    pub fn new(store: Arc<dyn ContentStore>, workspaces: WorkspaceManager) -> Self {
        Self { store, workspaces }
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    /// stages the job into a fresh workspace
    /// the workspace is released again if staging fails
    #[instrument(skip(self))]
    pub async fn stage(&self, job_id: &str) -> Result<StagedJob, StagingError> {
        info!("try to stage job");
        let workspace = self.workspaces.acquire(job_id).await?;
        match self.populate(&workspace).await {
            Ok(context) => {
                info!(
                    "staged job, missing resources: {:?}",
                    context.missing_resources
                );
                Ok(StagedJob { context, workspace })
            }
            Err(err) => {
                warn!("staging failed: {}", err);
                workspace.release().await;
                Err(err)
            }
        }
    }

    async fn populate(&self, workspace: &Workspace) -> Result<JobContext, StagingError> {
        let job_id = workspace.job_id();
        let manifest_path = self
            .fetch_object(workspace, MANIFEST_FILE)
            .await
            .map_err(|source| StagingError::ManifestFetch {
                job_id: job_id.to_string(),
                source,
            })?;
        let manifest = read_manifest(job_id, manifest_path).await?;
        if manifest.job_id != job_id {
            warn!(
                "manifest names job {:?}, staging it as {:?}",
                manifest.job_id, job_id
            );
        }

        self.fetch_object(workspace, &manifest.entry_script)
            .await
            .map_err(|source| StagingError::EntryScript {
                name: manifest.entry_script.clone(),
                source,
            })?;

        let mut context = JobContext::new(job_id, manifest, workspace.path());
        for resource in &context.manifest.resources {
            if let Err(err) = self.fetch_object(workspace, resource).await {
                warn!("skipping resource {}: {}", resource, err);
                context.missing_resources.push(resource.clone());
            }
        }
        Ok(context)
    }

    /// downloads `<job_id>/<name>` to its place in the workspace
    /// the object lands in a `.part` sibling first and is renamed into place
    /// once complete, a failed download leaves no file behind
    async fn fetch_object(&self, workspace: &Workspace, name: &str) -> Result<PathBuf, FetchError> {
        let key = object_key(workspace.job_id(), name);
        let path = workspace.file_path(name)?;
        let partial = partial_path(&path);
        let fetched = match self.download(workspace, &key, &partial).await {
            Ok(()) => fs::rename(&partial, &path)
                .await
                .map_err(|source| FetchError::Io {
                    path: path.clone(),
                    source,
                }),
            Err(err) => Err(err),
        };
        if let Err(err) = fetched {
            discard(&partial).await;
            return Err(err);
        }
        info!("fetched {} to {:?}", key, path);
        Ok(path)
    }

    /// an existing workspace gets the object streamed straight to the file,
    /// a vanished one is recreated and the object is written from memory
    async fn download(&self, workspace: &Workspace, key: &str, target: &Path) -> Result<(), FetchError> {
        if workspace.exists().await {
            create_parent(target).await?;
            self.store.fetch_to_path(key, target).await?;
        } else {
            workspace.ensure_exists().await?;
            let bytes = self.store.fetch_bytes(key).await?;
            create_parent(target).await?;
            fs::write(target, bytes)
                .await
                .map_err(|source| FetchError::Io {
                    path: target.to_path_buf(),
                    source,
                })?;
        }
        Ok(())
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    path.with_file_name(name)
}

async fn discard(partial: &Path) {
    match fs::remove_file(partial).await {
        Ok(()) => info!("removed partial download {:?}", partial),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!("could not remove partial download {:?}: {}", partial, err),
    }
}

async fn create_parent(path: &Path) -> Result<(), FetchError> {
    match path.parent() {
        Some(parent) => fs::create_dir_all(parent)
            .await
            .map_err(|source| FetchError::Io {
                path: parent.to_path_buf(),
                source,
            }),
        None => Ok(()),
    }
}

async fn read_manifest(job_id: &str, path: PathBuf) -> Result<JobManifest, StagingError> {
    let data = fs::read(&path)
        .await
        .map_err(|source| StagingError::ManifestFetch {
            job_id: job_id.to_string(),
            source: FetchError::Io { path, source },
        })?;
    serde_json::from_slice(&data).map_err(|source| StagingError::ManifestParse {
        job_id: job_id.to_string(),
        source,
    })
}
