//! Notebook execution.
//!
//! A staged `.ipynb` document is validated as an nbformat 4 notebook, handed
//! to a [`NotebookKernel`] that executes every cell in order with the
//! workspace as working directory, and the text of all cell outputs is
//! concatenated into the job's result.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use nbexec_shared::ExecutionResult;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::{fs, process::Command};
use tracing::{error, info, instrument};

use super::ExecutionFault;
use crate::{
    job::JobContext,
    util::{run_captured, ProcessError},
};

pub const DEFAULT_JUPYTER: &str = "jupyter";
pub const DEFAULT_KERNEL: &str = "python3";

const SUPPORTED_NBFORMAT: u32 = 4;
const CELL_EXECUTION_ERROR: &str = "CellExecutionError";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Notebook {
    pub cells: Vec<Cell>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub nbformat: u32,
    #[serde(default)]
    pub nbformat_minor: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    pub cell_type: String,
    #[serde(default)]
    pub source: MultilineText,
    #[serde(default)]
    pub outputs: Vec<Output>,
}

/// nbformat stores text either as one string or as a list of lines
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MultilineText {
    Single(String),
    Lines(Vec<String>),
}

impl MultilineText {
    pub fn to_text(&self) -> String {
        match self {
            MultilineText::Single(text) => text.clone(),
            MultilineText::Lines(lines) => lines.concat(),
        }
    }
}

impl Default for MultilineText {
    fn default() -> Self {
        MultilineText::Single(String::new())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "output_type", rename_all = "snake_case")]
pub enum Output {
    Stream {
        #[serde(default)]
        name: String,
        text: MultilineText,
    },
    ExecuteResult {
        #[serde(default)]
        data: Map<String, Value>,
        #[serde(default)]
        execution_count: Option<u64>,
    },
    DisplayData {
        #[serde(default)]
        data: Map<String, Value>,
    },
    Error {
        ename: String,
        evalue: String,
        #[serde(default)]
        traceback: Vec<String>,
    },
}

impl Output {
    /// textual fragment of the record, streams carry `text`, rich outputs
    /// their `text/plain` representation
    pub fn text(&self) -> Option<String> {
        match self {
            Output::Stream { text, .. } => Some(text.to_text()),
            Output::ExecuteResult { data, .. } | Output::DisplayData { data } => data
                .get("text/plain")
                .and_then(|plain| serde_json::from_value::<MultilineText>(plain.clone()).ok())
                .map(|plain| plain.to_text()),
            Output::Error { .. } => None,
        }
    }
}

impl Notebook {
    pub fn parse(data: &[u8]) -> Result<Self, String> {
        let notebook: Notebook = serde_json::from_slice(data).map_err(|err| err.to_string())?;
        if notebook.nbformat != SUPPORTED_NBFORMAT {
            return Err(format!(
                "unsupported nbformat version {}, expected {}",
                notebook.nbformat, SUPPORTED_NBFORMAT
            ));
        }
        Ok(notebook)
    }

    /// concatenated text of every output of every cell, in document order
    pub fn output_text(&self) -> String {
        self.cells
            .iter()
            .flat_map(|cell| cell.outputs.iter())
            .filter_map(Output::text)
            .collect()
    }
}

#[derive(Error, Debug)]
pub enum KernelError {
    #[error("could not start kernel runner: {0}")]
    Launch(String),
    #[error("cell execution failed: {0}")]
    CellExecution(String),
    #[error("kernel runner failed: {0}")]
    Runner(String),
    #[error("kernel runner returned an invalid notebook: {0}")]
    InvalidOutput(String),
}

/// Executes all cells of a notebook document against a fresh kernel.
#[async_trait]
pub trait NotebookKernel: Send + Sync {
    /// `document` is the staged file, `workdir` the directory relative file
    /// references inside the notebook resolve against
    /// returns the notebook with outputs filled in, a failing cell stops execution
    async fn execute(&self, document: &Path, workdir: &Path) -> Result<Notebook, KernelError>;
}

/// Runs `jupyter nbconvert --execute` and reads the executed notebook from stdout.
#[derive(Clone, Debug)]
pub struct NbconvertKernel {
    program: String,
    kernel_name: String,
}

impl NbconvertKernel {
    pub fn new(program: &str, kernel_name: &str) -> Self {
        Self {
            program: program.to_string(),
            kernel_name: kernel_name.to_string(),
        }
    }

    fn command(&self, document: &Path, workdir: &Path) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args([
                "nbconvert",
                "--to",
                "notebook",
                "--execute",
                "--stdout",
            ])
            .arg(format!(
                "--ExecutePreprocessor.kernel_name={}",
                self.kernel_name
            ))
            .arg(document)
            .current_dir(workdir);
        command
    }
}

impl Default for NbconvertKernel {
    fn default() -> Self {
        Self::new(DEFAULT_JUPYTER, DEFAULT_KERNEL)
    }
}

#[async_trait]
impl NotebookKernel for NbconvertKernel {
    #[instrument(skip(self))]
    async fn execute(&self, document: &Path, workdir: &Path) -> Result<Notebook, KernelError> {
        let output = run_captured(&mut self.command(document, workdir))
            .await
            .map_err(|err| match err {
                ProcessError::Spawn(source) => {
                    KernelError::Launch(format!("{}: {}", self.program, source))
                }
                ProcessError::Wait(source) => KernelError::Launch(source.to_string()),
            })?;
        if !output.success() {
            // nbconvert reports a faulting cell as CellExecutionError, anything
            // else is a problem with the runner or the kernel itself
            if output.stderr.contains(CELL_EXECUTION_ERROR) {
                return Err(KernelError::CellExecution(output.stderr));
            }
            return Err(KernelError::Runner(format!(
                "{} exited with {:?}: {}",
                self.program,
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Notebook::parse(output.stdout.as_bytes()).map_err(KernelError::InvalidOutput)
    }
}

/// Runs a staged notebook through a [`NotebookKernel`].
pub struct NotebookStrategy {
    kernel: Arc<dyn NotebookKernel>,
}

impl NotebookStrategy {
    pub fn new(kernel: Arc<dyn NotebookKernel>) -> Self {
        Self { kernel }
    }

    #[instrument(skip(self, context), fields(job_id = %context.job_id))]
    pub async fn run(&self, context: &JobContext) -> Result<ExecutionResult, ExecutionFault> {
        let document: PathBuf = context.entry_path();
        let data = fs::read(&document)
            .await
            .map_err(|source| ExecutionFault::Read {
                path: document.clone(),
                source,
            })?;
        let notebook =
            Notebook::parse(&data).map_err(|msg| ExecutionFault::NotebookFormat {
                path: document.clone(),
                msg,
            })?;
        info!("try to execute notebook with {} cells", notebook.cells.len());

        match self.kernel.execute(&document, &context.workdir).await {
            Ok(executed) => Ok(ExecutionResult::success(executed.output_text())),
            Err(KernelError::CellExecution(detail)) => {
                error!("cell execution failed: {}", detail);
                Err(ExecutionFault::CellExecution { document })
            }
            Err(err) => Err(ExecutionFault::Kernel(err.to_string())),
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::sync::Mutex;

    use nbexec_shared::{JobManifest, StatusCode};
    use serde_json::json;

    use super::*;

    /// Kernel stand-in: "executes" a cell by echoing its source as stream
    /// output, a cell whose source contains `raise` fails.
    #[derive(Default)]
    pub struct EchoKernel {
        pub workdirs: Mutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl NotebookKernel for EchoKernel {
        async fn execute(&self, document: &Path, workdir: &Path) -> Result<Notebook, KernelError> {
            self.workdirs.lock().unwrap().push(workdir.to_path_buf());
            let data = fs::read(document)
                .await
                .map_err(|err| KernelError::Launch(err.to_string()))?;
            let mut notebook = Notebook::parse(&data).map_err(KernelError::InvalidOutput)?;
            for cell in notebook.cells.iter_mut().filter(|cell| cell.cell_type == "code") {
                let source = cell.source.to_text();
                if source.contains("raise") {
                    return Err(KernelError::CellExecution(format!("{} failed", source)));
                }
                cell.outputs = vec![Output::Stream {
                    name: "stdout".to_string(),
                    text: MultilineText::Single(source),
                }];
            }
            Ok(notebook)
        }
    }

    pub fn notebook_json(sources: &[&str]) -> String {
        let cells: Vec<Value> = sources
            .iter()
            .map(|source| {
                json!({
                    "cell_type": "code",
                    "source": source,
                    "metadata": {},
                    "outputs": [],
                    "execution_count": null
                })
            })
            .collect();
        json!({
            "cells": cells,
            "metadata": {},
            "nbformat": 4,
            "nbformat_minor": 5
        })
        .to_string()
    }

    fn context_with_notebook(dir: &Path, content: &str) -> JobContext {
        std::fs::write(dir.join("nb.ipynb"), content).unwrap();
        let manifest = JobManifest::new("job-nb", "nb.ipynb", "", &[]);
        JobContext::new("job-nb", manifest, dir)
    }

    #[test]
    fn test_output_text_in_document_order() {
        let notebook: Notebook = serde_json::from_value(json!({
            "nbformat": 4,
            "nbformat_minor": 4,
            "metadata": {},
            "cells": [
                {
                    "cell_type": "markdown",
                    "source": ["# title"],
                    "metadata": {}
                },
                {
                    "cell_type": "code",
                    "source": "print('a')\nprint('b')",
                    "outputs": [
                        {"output_type": "stream", "name": "stdout", "text": ["a\n", "b\n"]},
                        {"output_type": "execute_result", "execution_count": 1,
                         "data": {"text/plain": "42", "text/html": "<b>42</b>"}, "metadata": {}}
                    ]
                },
                {
                    "cell_type": "code",
                    "source": "",
                    "outputs": [
                        {"output_type": "display_data",
                         "data": {"image/png": "iVBOR"}, "metadata": {}},
                        {"output_type": "stream", "name": "stderr", "text": "warn\n"}
                    ]
                }
            ]
        }))
        .unwrap();
        assert_eq!("a\nb\n42warn\n", notebook.output_text());
    }

    #[test]
    fn test_parse_rejects_old_format_and_garbage() {
        assert!(Notebook::parse(br#"{"cells": [], "nbformat": 3}"#).is_err());
        assert!(Notebook::parse(b"not a notebook").is_err());
        assert!(Notebook::parse(br#"{"nbformat": 4}"#).is_err());
        assert!(Notebook::parse(br#"{"cells": [], "nbformat": 4}"#).is_ok());
    }

    #[tokio::test]
    async fn test_notebook_success() {
        let dir = tempfile::tempdir().unwrap();
        let context = context_with_notebook(dir.path(), &notebook_json(&["one\n", "two\n"]));
        let kernel = Arc::new(EchoKernel::default());
        let result = NotebookStrategy::new(kernel.clone())
            .run(&context)
            .await
            .unwrap();
        assert_eq!(ExecutionResult::success("one\ntwo\n"), result);
        assert_eq!(
            vec![dir.path().to_path_buf()],
            *kernel.workdirs.lock().unwrap()
        );
    }

    #[tokio::test]
    async fn test_empty_notebook() {
        let dir = tempfile::tempdir().unwrap();
        let context = context_with_notebook(dir.path(), &notebook_json(&[]));
        let result = NotebookStrategy::new(Arc::new(EchoKernel::default()))
            .run(&context)
            .await
            .unwrap();
        assert_eq!(ExecutionResult::success(""), result);
    }

    #[tokio::test]
    async fn test_cell_fault_names_document() {
        let dir = tempfile::tempdir().unwrap();
        let context = context_with_notebook(
            dir.path(),
            &notebook_json(&["ok\n", "raise ValueError()", "never\n"]),
        );
        let fault = NotebookStrategy::new(Arc::new(EchoKernel::default()))
            .run(&context)
            .await
            .unwrap_err();
        let result = ExecutionResult::from(fault);
        assert_eq!(StatusCode::InternalError, result.status_code);
        assert_eq!(
            format!(
                "Internal Server Error: Error executing the notebook \"{}\".",
                dir.path().join("nb.ipynb").display()
            ),
            result.data
        );
    }

    #[tokio::test]
    async fn test_invalid_notebook_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let context = context_with_notebook(dir.path(), "{\"cells\": 5}");
        let kernel = Arc::new(EchoKernel::default());
        match NotebookStrategy::new(kernel.clone()).run(&context).await {
            Err(ExecutionFault::NotebookFormat { .. }) => {}
            other => panic!("expected notebook format fault, got: {:?}", other),
        }
        assert!(kernel.workdirs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_kernel_runner() {
        let dir = tempfile::tempdir().unwrap();
        let context = context_with_notebook(dir.path(), &notebook_json(&["x"]));
        let kernel = Arc::new(NbconvertKernel::new("abcdfg-no-jupyter", DEFAULT_KERNEL));
        match NotebookStrategy::new(kernel).run(&context).await {
            Err(ExecutionFault::Kernel(msg)) => assert!(msg.contains("abcdfg-no-jupyter")),
            other => panic!("expected kernel fault, got: {:?}", other),
        }
    }

    /// `bash nbconvert ...` runs the stub from the working directory, so the
    /// stub doubles as a check that the runner is started inside the workspace
    fn stub_nbconvert(dir: &Path, body: &str) -> Arc<NbconvertKernel> {
        std::fs::write(dir.join("nbconvert"), body).unwrap();
        Arc::new(NbconvertKernel::new("bash", DEFAULT_KERNEL))
    }

    #[test]
    fn test_nbconvert_command() {
        let kernel = NbconvertKernel::new("jupyter", "ir");
        let command = kernel.command(Path::new("/ws/job-1/nb.ipynb"), Path::new("/ws/job-1"));
        let command = command.as_std();
        let args: Vec<String> = command
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        assert_eq!("jupyter", command.get_program());
        assert_eq!(
            vec![
                "nbconvert",
                "--to",
                "notebook",
                "--execute",
                "--stdout",
                "--ExecutePreprocessor.kernel_name=ir",
                "/ws/job-1/nb.ipynb",
            ],
            args
        );
        assert_eq!(Some(Path::new("/ws/job-1")), command.get_current_dir());
    }

    #[tokio::test]
    async fn test_nbconvert_output_is_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let context = context_with_notebook(dir.path(), &notebook_json(&["print('hello')"]));
        let executed = json!({
            "nbformat": 4,
            "nbformat_minor": 5,
            "metadata": {},
            "cells": [{
                "cell_type": "code",
                "source": "print('hello')",
                "metadata": {},
                "outputs": [
                    {"output_type": "stream", "name": "stdout", "text": ["hello\n"]},
                    {"output_type": "execute_result", "execution_count": 1,
                     "data": {"text/plain": "42"}, "metadata": {}}
                ]
            }]
        });
        std::fs::write(dir.path().join("executed.json"), executed.to_string()).unwrap();
        let kernel = stub_nbconvert(
            dir.path(),
            "[ \"$4\" = --stdout ] || exit 9\n\
             [ \"$5\" = --ExecutePreprocessor.kernel_name=python3 ] || exit 9\n\
             [ -f \"$6\" ] || exit 9\n\
             cat executed.json\n",
        );
        let result = NotebookStrategy::new(kernel).run(&context).await.unwrap();
        assert_eq!(ExecutionResult::success("hello\n42"), result);
    }

    #[tokio::test]
    async fn test_nbconvert_cell_error() {
        let dir = tempfile::tempdir().unwrap();
        let context = context_with_notebook(dir.path(), &notebook_json(&["1 / 0"]));
        let kernel = stub_nbconvert(
            dir.path(),
            "echo 'nbclient.exceptions.CellExecutionError: ZeroDivisionError' >&2\nexit 1\n",
        );
        match NotebookStrategy::new(kernel).run(&context).await {
            Err(ExecutionFault::CellExecution { document }) => {
                assert_eq!(dir.path().join("nb.ipynb"), document)
            }
            other => panic!("expected cell execution fault, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_nbconvert_runner_failure_is_not_a_cell_fault() {
        let dir = tempfile::tempdir().unwrap();
        let context = context_with_notebook(dir.path(), &notebook_json(&["1"]));
        let kernel = stub_nbconvert(
            dir.path(),
            "echo 'jupyter_client.kernelspec.NoSuchKernel: No such kernel named python3' >&2\nexit 1\n",
        );
        match NotebookStrategy::new(kernel).run(&context).await {
            Err(ExecutionFault::Kernel(msg)) => assert!(msg.contains("No such kernel"), "{}", msg),
            other => panic!("expected kernel fault, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_nbconvert_garbage_output() {
        let dir = tempfile::tempdir().unwrap();
        let context = context_with_notebook(dir.path(), &notebook_json(&["1"]));
        let kernel = stub_nbconvert(dir.path(), "echo 'not a notebook'\n");
        match NotebookStrategy::new(kernel).run(&context).await {
            Err(ExecutionFault::Kernel(msg)) => assert!(msg.contains("invalid notebook"), "{}", msg),
            other => panic!("expected kernel fault, got: {:?}", other),
        }
    }
}
