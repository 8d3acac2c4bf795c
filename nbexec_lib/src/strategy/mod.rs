//! Execution backends for staged jobs.
//!
//! The backend is picked by the extension of the entry script: `sh` runs
//! through [`ScriptStrategy`], `ipynb` through [`NotebookStrategy`]. Every
//! other extension is [`StrategyKind::Unsupported`] and never executes.

use std::{
    ffi::OsStr,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use nbexec_shared::ExecutionResult;
use thiserror::Error;
use tracing::{error, info, instrument};

use crate::{job::JobContext, workspace::Workspace};

pub mod notebook;
pub mod script;

pub use notebook::{NbconvertKernel, NotebookKernel, NotebookStrategy};
pub use script::ScriptStrategy;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StrategyKind {
    Script,
    Notebook,
    Unsupported(String),
}

impl StrategyKind {
    /// selects by the extension of the entry script's file name, a name
    /// without one is unsupported
    pub fn for_entry(entry_script: &str) -> Self {
        let extension = Path::new(entry_script)
            .extension()
            .and_then(OsStr::to_str)
            .unwrap_or_default();
        match extension {
            "sh" => StrategyKind::Script,
            "ipynb" => StrategyKind::Notebook,
            other => StrategyKind::Unsupported(other.to_string()),
        }
    }
}

#[derive(Error, Debug)]
pub enum ExecutionFault {
    #[error("failed to launch {program}: {source}")]
    Launch { program: String, source: io::Error },
    #[error("failed while waiting for {program}: {source}")]
    Wait { program: String, source: io::Error },
    #[error("could not read {path:?}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("invalid notebook {path:?}: {msg}")]
    NotebookFormat { path: PathBuf, msg: String },
    #[error("Error executing the notebook \"{}\".", document.display())]
    CellExecution { document: PathBuf },
    #[error("kernel failure: {0}")]
    Kernel(String),
}

impl From<ExecutionFault> for ExecutionResult {
    fn from(fault: ExecutionFault) -> Self {
        ExecutionResult::internal_error(fault)
    }
}

/// The set of backends a dispatcher runs jobs with.
#[derive(Clone)]
pub struct Strategies {
    script: ScriptStrategy,
    notebook: Arc<NotebookStrategy>,
}

impl Strategies {
    pub fn new(script: ScriptStrategy, notebook: NotebookStrategy) -> Self {
        Self {
            script,
            notebook: Arc::new(notebook),
        }
    }

    /// runs the job with the backend for `kind` and releases the workspace
    /// before returning, whatever the outcome
    #[instrument(skip(self, context, workspace), fields(job_id = %context.job_id))]
    pub async fn execute(
        &self,
        kind: StrategyKind,
        context: &JobContext,
        workspace: Workspace,
    ) -> ExecutionResult {
        let outcome = match &kind {
            StrategyKind::Script => self.script.run(context).await,
            StrategyKind::Notebook => self.notebook.run(context).await,
            StrategyKind::Unsupported(extension) => {
                info!("unknown file type {:?}, nothing to execute", extension);
                Ok(ExecutionResult::unknown_file_type())
            }
        };
        workspace.release().await;
        match outcome {
            Ok(result) => {
                info!("job finished with status {}", result.status_code);
                result
            }
            Err(fault) => {
                error!("job faulted: {}", fault);
                ExecutionResult::from(fault)
            }
        }
    }
}

impl Default for Strategies {
    fn default() -> Self {
        Self::new(
            ScriptStrategy::default(),
            NotebookStrategy::new(Arc::new(NbconvertKernel::default())),
        )
    }
}
