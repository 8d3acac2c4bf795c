use std::sync::Arc;

use nbexec_lib::{
    store::StoreError, ContentStore, Dispatcher, LocalStore, NbconvertKernel, NotebookStrategy,
    S3Store, ScriptStrategy, Stager, Strategies, WorkerPool, WorkspaceManager,
};
use tracing::info;

use crate::config::{ServiceConfig, StoreConfig};

/// rocket managed state shared by every request
pub struct AppState {
    pub dispatcher: Dispatcher,
}

impl AppState {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    pub async fn from_config(config: &ServiceConfig) -> Result<Self, StoreError> {
        let store: Arc<dyn ContentStore> = match &config.store {
            StoreConfig::S3(settings) => {
                info!(
                    "using s3 store at {}:{}, bucket {}",
                    settings.host, settings.port, settings.bucket
                );
                let store = S3Store::new(settings);
                store.ensure_bucket().await?;
                Arc::new(store)
            }
            StoreConfig::Local(root) => {
                info!("using local store at {:?}", root);
                Arc::new(LocalStore::new(root.clone()))
            }
        };
        let stager = Stager::new(store, WorkspaceManager::new(config.exe_dir.clone()));
        let strategies = Strategies::new(
            ScriptStrategy::new(&config.shell),
            NotebookStrategy::new(Arc::new(NbconvertKernel::new(
                &config.jupyter,
                &config.kernel,
            ))),
        );
        Ok(Self::new(Dispatcher::new(
            stager,
            strategies,
            WorkerPool::new(config.workers),
        )))
    }
}
