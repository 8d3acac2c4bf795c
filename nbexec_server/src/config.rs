use std::{net::IpAddr, path::PathBuf, str::FromStr};

use nbexec_lib::{
    store::DEFAULT_BUCKET,
    strategy::{
        notebook::{DEFAULT_JUPYTER, DEFAULT_KERNEL},
        script::DEFAULT_SHELL,
    },
    S3Settings, DEFAULT_POOL_SIZE,
};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} has an invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
    #[error("{0} must be set")]
    Missing(&'static str),
}

/// where job assets are fetched from
#[derive(Clone, Debug)]
pub enum StoreConfig {
    S3(S3Settings),
    Local(PathBuf),
}

/// Service configuration loaded from environment variables.
///
/// | Env Var            | Default       |
/// |--------------------|---------------|
/// | `NBEXEC_EXEDIR`    | `/tmp/nbexec` |
/// | `NBEXEC_ADDRESS`   | `0.0.0.0`     |
/// | `NBEXEC_PORT`      | `8000`        |
/// | `NBEXEC_DEBUG`     | `false`       |
/// | `NBEXEC_WORKERS`   | `16`          |
/// | `NBEXEC_STORE`     | `s3`          |
/// | `NBEXEC_STORE_DIR` | -             |
/// | `NBEXEC_SHELL`     | `bash`        |
/// | `NBEXEC_JUPYTER`   | `jupyter`     |
/// | `NBEXEC_KERNEL`    | `python3`     |
/// | `S3_HOST`          | `127.0.0.1`   |
/// | `S3_PORT`          | `9000`        |
/// | `S3_ACCESS_KEY`    | -             |
/// | `S3_SECRET_KEY`    | -             |
/// | `S3_BUCKET`        | `nbexecutor`  |
/// | `S3_REGION`        | `us-east-1`   |
#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub exe_dir: PathBuf,
    pub address: IpAddr,
    pub port: u16,
    pub debug: bool,
    pub workers: usize,
    pub store: StoreConfig,
    pub shell: String,
    pub jupyter: String,
    pub kernel: String,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str, default: &str| lookup(name).unwrap_or_else(|| default.to_string());

        let workers: usize = parse(
            "NBEXEC_WORKERS",
            var("NBEXEC_WORKERS", &DEFAULT_POOL_SIZE.to_string()),
        )?;
        if workers == 0 {
            return Err(ConfigError::Invalid {
                name: "NBEXEC_WORKERS",
                value: "0".to_string(),
                reason: "at least one worker is required".to_string(),
            });
        }

        let store = match var("NBEXEC_STORE", "s3").as_str() {
            "s3" => StoreConfig::S3(S3Settings {
                host: var("S3_HOST", "127.0.0.1"),
                port: parse("S3_PORT", var("S3_PORT", "9000"))?,
                access_key: lookup("S3_ACCESS_KEY").ok_or(ConfigError::Missing("S3_ACCESS_KEY"))?,
                secret_key: lookup("S3_SECRET_KEY").ok_or(ConfigError::Missing("S3_SECRET_KEY"))?,
                bucket: var("S3_BUCKET", DEFAULT_BUCKET),
                region: var("S3_REGION", "us-east-1"),
            }),
            "local" => StoreConfig::Local(PathBuf::from(
                lookup("NBEXEC_STORE_DIR").ok_or(ConfigError::Missing("NBEXEC_STORE_DIR"))?,
            )),
            other => {
                return Err(ConfigError::Invalid {
                    name: "NBEXEC_STORE",
                    value: other.to_string(),
                    reason: "expected s3 or local".to_string(),
                })
            }
        };

        Ok(Self {
            exe_dir: PathBuf::from(var("NBEXEC_EXEDIR", "/tmp/nbexec")),
            address: parse("NBEXEC_ADDRESS", var("NBEXEC_ADDRESS", "0.0.0.0"))?,
            port: parse("NBEXEC_PORT", var("NBEXEC_PORT", "8000"))?,
            debug: parse("NBEXEC_DEBUG", var("NBEXEC_DEBUG", "false"))?,
            workers,
            store,
            shell: var("NBEXEC_SHELL", DEFAULT_SHELL),
            jupyter: var("NBEXEC_JUPYTER", DEFAULT_JUPYTER),
            kernel: var("NBEXEC_KERNEL", DEFAULT_KERNEL),
        })
    }
}

fn parse<T>(name: &'static str, value: String) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|err: T::Err| ConfigError::Invalid {
        name,
        value: value.clone(),
        reason: err.to_string(),
    })
}
