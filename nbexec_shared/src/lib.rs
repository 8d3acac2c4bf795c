use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// name of the manifest object stored next to a job's assets
pub const MANIFEST_FILE: &str = "jobConf.json";

const INTERNAL_ERROR_PREFIX: &str = "Internal Server Error: ";
const UNKNOWN_FILE_TYPE: &str = "Unknown file type";

/// Describes what a job runs and with which inputs.
///
/// Field names on the wire follow the manifest files already stored in the
/// content store (`uniq_id`, `running_script`, ...).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobManifest {
    #[serde(rename = "uniq_id")]
    pub job_id: String,
    #[serde(rename = "running_script")]
    pub entry_script: String,
    #[serde(rename = "running_params", default)]
    pub parameters: String,
    #[serde(
        rename = "running_resources",
        default,
        deserialize_with = "null_as_empty"
    )]
    pub resources: Vec<String>,
}

impl JobManifest {
    pub fn new(job_id: &str, entry_script: &str, parameters: &str, resources: &[&str]) -> Self {
        Self {
            job_id: job_id.to_string(),
            entry_script: entry_script.to_string(),
            parameters: parameters.to_string(),
            resources: resources.iter().map(|r| r.to_string()).collect(),
        }
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Semantic outcome of a job, carried in the response body rather than in
/// the transport status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub enum StatusCode {
    Success,
    InternalError,
    NoOutput,
}

impl StatusCode {
    pub fn as_u16(self) -> u16 {
        match self {
            StatusCode::Success => 200,
            StatusCode::InternalError => 500,
            StatusCode::NoOutput => 501,
        }
    }
}

impl From<StatusCode> for u16 {
    fn from(code: StatusCode) -> Self {
        code.as_u16()
    }
}

impl TryFrom<u16> for StatusCode {
    type Error = String;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        match code {
            200 => Ok(StatusCode::Success),
            500 => Ok(StatusCode::InternalError),
            501 => Ok(StatusCode::NoOutput),
            other => Err(format!("unknown status code {}", other)),
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

/// Terminal result of one job execution, serialized as
/// `{"statusCode": <int>, "data": <string>}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    #[serde(rename = "statusCode")]
    pub status_code: StatusCode,
    pub data: String,
}

impl ExecutionResult {
    pub fn new(status_code: StatusCode, data: impl Into<String>) -> Self {
        Self {
            status_code,
            data: data.into(),
        }
    }

    pub fn success(output: impl Into<String>) -> Self {
        Self::new(StatusCode::Success, output)
    }

    /// script ran but wrote nothing to stdout, data carries its stderr
    pub fn no_output(stderr: impl Into<String>) -> Self {
        Self::new(StatusCode::NoOutput, stderr)
    }

    pub fn unknown_file_type() -> Self {
        Self::new(StatusCode::InternalError, UNKNOWN_FILE_TYPE)
    }

    pub fn internal_error(detail: impl fmt::Display) -> Self {
        Self::new(
            StatusCode::InternalError,
            format!("{}{}", INTERNAL_ERROR_PREFIX, detail),
        )
    }

    pub fn is_success(&self) -> bool {
        self.status_code == StatusCode::Success
    }
}
