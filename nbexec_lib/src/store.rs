//! Object storage the job assets are fetched from.
//!
//! Objects are addressed by `<job_id>/<filename>`. The execution core only
//! needs two operations, [`ContentStore::fetch_to_path`] and
//! [`ContentStore::fetch_bytes`]; bucket setup is done once at service start.

use std::{
    io,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use aws_sdk_s3::{
    config::{BehaviorVersion, Credentials, Region},
    error::DisplayErrorContext,
    Client,
};
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt};
use tracing::{info, instrument, warn};

pub use nbexec_shared::MANIFEST_FILE;

pub const DEFAULT_BUCKET: &str = "nbexecutor";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("object {0} not found")]
    NotFound(String),
    #[error("could not fetch object {key}: {msg}")]
    Transport { key: String, msg: String },
    #[error("could not write object {key} to {path:?}: {source}")]
    Io {
        key: String,
        path: PathBuf,
        source: io::Error,
    },
}

/// key of `filename` in the job's namespace, empty names address the manifest
pub fn object_key(job_id: &str, filename: &str) -> String {
    let filename = if filename.is_empty() {
        MANIFEST_FILE
    } else {
        filename
    };
    format!("{}/{}", job_id, filename)
}

#[async_trait]
pub trait ContentStore: Send + Sync {
    /// downloads the object into a local file, overwriting it
    async fn fetch_to_path(&self, key: &str, path: &Path) -> Result<(), StoreError>;

    /// downloads the object into memory
    async fn fetch_bytes(&self, key: &str) -> Result<Vec<u8>, StoreError>;
}

/// Connection settings of an S3 compatible object store reached over plain http.
#[derive(Clone, Debug)]
pub struct S3Settings {
    pub host: String,
    pub port: u16,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub region: String,
}

pub struct S3Store {
    client: Client,
    bucket: String,
}

impl S3Store {
    pub fn new(settings: &S3Settings) -> Self {
        let credentials = Credentials::new(
            &settings.access_key,
            &settings.secret_key,
            None,
            None,
            "nbexec",
        );
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(format!("http://{}:{}", settings.host, settings.port))
            .region(Region::new(settings.region.clone()))
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();
        Self {
            client: Client::from_conf(config),
            bucket: settings.bucket.clone(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// creates the bucket unless it already exists
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    pub async fn ensure_bucket(&self) -> Result<(), StoreError> {
        if self
            .client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .is_ok()
        {
            return Ok(());
        }
        info!("bucket missing, try to create it");
        self.client
            .create_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|err| StoreError::Transport {
                key: self.bucket.clone(),
                msg: DisplayErrorContext(&err).to_string(),
            })?;
        info!("created bucket");
        Ok(())
    }

    async fn get_object(
        &self,
        key: &str,
    ) -> Result<aws_sdk_s3::operation::get_object::GetObjectOutput, StoreError> {
        self.client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| {
                let missing = err
                    .as_service_error()
                    .map(|service_err| service_err.is_no_such_key())
                    .unwrap_or(false);
                if missing {
                    StoreError::NotFound(key.to_string())
                } else {
                    StoreError::Transport {
                        key: key.to_string(),
                        msg: DisplayErrorContext(&err).to_string(),
                    }
                }
            })
    }
}

#[async_trait]
impl ContentStore for S3Store {
    #[instrument(skip(self))]
    async fn fetch_to_path(&self, key: &str, path: &Path) -> Result<(), StoreError> {
        let mut body = self.get_object(key).await?.body;
        let io_error = |source| StoreError::Io {
            key: key.to_string(),
            path: path.to_path_buf(),
            source,
        };
        let mut file = fs::File::create(path).await.map_err(io_error)?;
        let streamed = async {
            while let Some(chunk) = body.try_next().await.map_err(|err| StoreError::Transport {
                key: key.to_string(),
                msg: err.to_string(),
            })? {
                file.write_all(&chunk).await.map_err(io_error)?;
            }
            file.flush().await.map_err(io_error)
        }
        .await;
        if streamed.is_err() {
            // no truncated object is left behind
            drop(file);
            if let Err(err) = fs::remove_file(path).await {
                warn!("could not remove partial object {:?}: {}", path, err);
            }
        }
        streamed
    }

    #[instrument(skip(self))]
    async fn fetch_bytes(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let output = self.get_object(key).await?;
        let data = output
            .body
            .collect()
            .await
            .map_err(|err| StoreError::Transport {
                key: key.to_string(),
                msg: err.to_string(),
            })?;
        Ok(data.into_bytes().to_vec())
    }
}

/// Serves objects from `<root>/<key>` on the local filesystem.
#[derive(Clone, Debug)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

fn local_read_error(key: &str, path: &Path, source: io::Error) -> StoreError {
    if source.kind() == io::ErrorKind::NotFound {
        StoreError::NotFound(key.to_string())
    } else {
        StoreError::Io {
            key: key.to_string(),
            path: path.to_path_buf(),
            source,
        }
    }
}

#[async_trait]
impl ContentStore for LocalStore {
    async fn fetch_to_path(&self, key: &str, path: &Path) -> Result<(), StoreError> {
        let source = self.object_path(key);
        if !fs::try_exists(&source).await.unwrap_or(false) {
            return Err(StoreError::NotFound(key.to_string()));
        }
        fs::copy(&source, path)
            .await
            .map_err(|err| StoreError::Io {
                key: key.to_string(),
                path: path.to_path_buf(),
                source: err,
            })?;
        Ok(())
    }

    async fn fetch_bytes(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let source = self.object_path(key);
        fs::read(&source)
            .await
            .map_err(|err| local_read_error(key, &source, err))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_object_key() {
        assert_eq!("job-42/run.sh", object_key("job-42", "run.sh"));
        assert_eq!("job-42/jobConf.json", object_key("job-42", ""));
        assert_eq!("job-42/data/a.csv", object_key("job-42", "data/a.csv"));
    }

    #[tokio::test]
    async fn test_local_store_fetch() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("job-1")).unwrap();
        std::fs::write(root.path().join("job-1").join("run.sh"), "echo hi").unwrap();
        let store = LocalStore::new(root.path());

        let bytes = store.fetch_bytes("job-1/run.sh").await.unwrap();
        assert_eq!(b"echo hi".to_vec(), bytes);

        let target = tempfile::tempdir().unwrap();
        let path = target.path().join("run.sh");
        store.fetch_to_path("job-1/run.sh", &path).await.unwrap();
        assert_eq!("echo hi", std::fs::read_to_string(&path).unwrap());
    }

    #[tokio::test]
    async fn test_local_store_not_found() {
        let root = tempfile::tempdir().unwrap();
        let store = LocalStore::new(root.path());
        match store.fetch_bytes("job-1/missing.sh").await {
            Err(StoreError::NotFound(key)) => assert_eq!("job-1/missing.sh", key),
            other => panic!("expected not found, got: {:?}", other),
        }
        let target = root.path().join("out");
        match store.fetch_to_path("job-1/missing.sh", &target).await {
            Err(StoreError::NotFound(_)) => {}
            other => panic!("expected not found, got: {:?}", other),
        }
        assert!(!target.exists());
    }
}
