//! Job execution core: stages a job's files from a content store into a
//! private workspace, runs its entry script or notebook on a bounded worker
//! pool and turns every outcome into an [`ExecutionResult`].

pub mod dispatcher;
pub mod job;
pub mod stager;
pub mod store;
pub mod strategy;
mod util;
pub mod workspace;

pub use dispatcher::{Dispatcher, WorkerPool, DEFAULT_POOL_SIZE};
pub use nbexec_shared::{ExecutionResult, JobManifest, StatusCode};
pub use stager::Stager;
pub use store::{ContentStore, LocalStore, S3Settings, S3Store};
pub use strategy::{NbconvertKernel, NotebookStrategy, ScriptStrategy, Strategies};
pub use workspace::WorkspaceManager;
