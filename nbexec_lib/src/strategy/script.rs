use nbexec_shared::ExecutionResult;
use tokio::process::Command;
use tracing::{info, instrument};

use super::ExecutionFault;
use crate::{
    job::JobContext,
    util::{run_captured, ProcessError},
};

pub const DEFAULT_SHELL: &str = "bash";

/// Runs the entry script through a shell inside the job's workspace.
#[derive(Clone, Debug)]
pub struct ScriptStrategy {
    program: String,
}

impl ScriptStrategy {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
        }
    }

    /// `<program> <entry_script> <parameters> [<resources,...>]`
    /// non empty stdout is a success, otherwise stderr is reported as no output
    #[instrument(skip(self, context), fields(job_id = %context.job_id))]
    pub async fn run(&self, context: &JobContext) -> Result<ExecutionResult, ExecutionFault> {
        let mut command = Command::new(&self.program);
        command
            .arg(context.entry_script())
            .args(context.script_arguments())
            .current_dir(&context.workdir);
        info!("try to run {} {}", self.program, context.entry_script());
        let output = run_captured(&mut command).await.map_err(|err| match err {
            ProcessError::Spawn(source) => ExecutionFault::Launch {
                program: self.program.clone(),
                source,
            },
            ProcessError::Wait(source) => ExecutionFault::Wait {
                program: self.program.clone(),
                source,
            },
        })?;
        if output.stdout.is_empty() {
            info!("script wrote no stdout, exit code {:?}", output.exit_code);
            Ok(ExecutionResult::no_output(output.stderr))
        } else {
            Ok(ExecutionResult::success(output.stdout))
        }
    }
}

impl Default for ScriptStrategy {
    fn default() -> Self {
        Self::new(DEFAULT_SHELL)
    }
}
