use std::process::{ExitStatus, Stdio};

use thiserror::Error;
use tokio::{
    io::{self, AsyncRead, AsyncReadExt},
    process::Command,
};
use tracing::{error, info};

/// stdout/stderr of a finished process, decoded lossily as utf-8
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CapturedOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// spawns the command with piped std streams, reads both to the end and
/// waits for the process to exit
pub async fn run_captured(command: &mut Command) -> Result<CapturedOutput, ProcessError> {
    let mut process = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(ProcessError::Spawn)?;
    info!("process spawned, pid: {:?}", process.id());

    // continously read from stdout/stderr in background so neither pipe fills up
    let stdout_handle = tokio::spawn(read_to_end(process.stdout.take()));
    let stderr_handle = tokio::spawn(read_to_end(process.stderr.take()));

    let exit_status: ExitStatus = process.wait().await.map_err(ProcessError::Wait)?;
    let stdout = join_stream(stdout_handle, process.id()).await;
    let stderr = join_stream(stderr_handle, process.id()).await;
    info!("process exited with {:?}", exit_status.code());
    Ok(CapturedOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        exit_code: exit_status.code(),
    })
}

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("could not spawn process: {0}")]
    Spawn(#[source] io::Error),
    #[error("could not wait for process: {0}")]
    Wait(#[source] io::Error),
}

async fn join_stream(handle: tokio::task::JoinHandle<Vec<u8>>, pid: Option<u32>) -> Vec<u8> {
    match handle.await {
        Ok(bytes) => bytes,
        Err(join_error) => {
            error!(
                "unexpected error when joining output reader, pid: {:?}, err: {}",
                pid, join_error
            );
            Vec::new()
        }
    }
}

async fn read_to_end<A: AsyncRead + std::marker::Unpin>(stream: Option<A>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut stream) = stream {
        // output is returned verbatim, nothing is cut off
        if let Err(io_error) = stream.read_to_end(&mut buf).await {
            error!("unexpected io error when reading from stream: {}", io_error);
        }
    }
    buf
}
