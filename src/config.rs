//! Worker configuration loaded from a YAML file.

use crate::sandbox::SandboxLimits;
use err_derive::Error;
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(display = "cannot read config file: {}", _0)]
    Io(#[error(source)] std::io::Error),

    #[error(display = "malformed config: {}", _0)]
    Parse(#[error(source)] serde_yaml::Error),
}

/// Credentials of the file store the worker downloads submissions from
/// and uploads results to.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct FileManConfig {
    pub hostname: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// Configuration surface of one worker process.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WorkerConfig {
    /// Small integer identifying this worker; doubles as the sandbox
    /// slot id.
    pub worker_id: u64,
    pub broker_uri: String,
    /// Routing label advertised to the broker.
    pub hwgroup: String,
    /// Free-text description sent on registration.
    #[serde(default)]
    pub worker_description: Option<String>,
    /// Ping interval towards the broker, in milliseconds.
    #[serde(default = "defaults::ping_interval")]
    pub broker_ping_interval: u64,
    /// Number of silent ping intervals after which the broker is
    /// considered gone.
    #[serde(default = "defaults::max_liveness")]
    pub max_broker_liveness: u64,
    #[serde(default = "defaults::working_directory")]
    pub working_directory: PathBuf,
    /// Routing headers advertised on registration. List values emit one
    /// `key=value` frame per element.
    #[serde(default, deserialize_with = "de_headers")]
    pub headers: Vec<(String, String)>,
    #[serde(default = "defaults::isolate_binary")]
    pub isolate_binary: String,
    /// Worker-wide default sandbox limits.
    #[serde(default)]
    pub limits: SandboxLimits,
    #[serde(default)]
    pub file_manager: Option<FileManConfig>,
    /// Upper bound on captured task output, in bytes.
    #[serde(default = "defaults::max_output_length")]
    pub max_output_length: usize,
    /// Upper bound on carbon-copied output files, in bytes.
    #[serde(default = "defaults::max_carboncopy_length")]
    pub max_carboncopy_length: usize,
    /// Remove the job working directory when evaluation finishes.
    #[serde(default = "defaults::cleanup_submission")]
    pub cleanup_submission: bool,
}

mod defaults {
    use std::path::PathBuf;

    pub fn ping_interval() -> u64 {
        1000
    }

    pub fn max_liveness() -> u64 {
        4
    }

    pub fn working_directory() -> PathBuf {
        PathBuf::from("/tmp/grader-worker")
    }

    pub fn isolate_binary() -> String {
        "isolate".into()
    }

    pub fn max_output_length() -> usize {
        4096
    }

    pub fn max_carboncopy_length() -> usize {
        1 << 20
    }

    pub fn cleanup_submission() -> bool {
        true
    }
}

impl WorkerConfig {
    pub fn load(path: &Path) -> Result<WorkerConfig, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<WorkerConfig, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Description frame content sent on registration.
    pub fn worker_description(&self) -> String {
        self.worker_description
            .clone()
            .unwrap_or_else(|| format!("worker_{}", self.worker_id))
    }
}

/// Headers are a map whose values are scalars or lists of scalars;
/// anything nested is a config error.
fn de_headers<'de, D>(deserializer: D) -> Result<Vec<(String, String)>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    fn scalar<E: Error>(value: &serde_yaml::Value) -> Result<String, E> {
        match value {
            serde_yaml::Value::String(s) => Ok(s.clone()),
            serde_yaml::Value::Number(n) => Ok(n.to_string()),
            serde_yaml::Value::Bool(b) => Ok(b.to_string()),
            _ => Err(E::custom("header values must be scalars or lists of scalars")),
        }
    }

    let map = BTreeMap::<String, serde_yaml::Value>::deserialize(deserializer)?;
    let mut headers = Vec::new();
    for (key, value) in map {
        match value {
            serde_yaml::Value::Sequence(items) => {
                for item in items {
                    headers.push((key.clone(), scalar(&item)?));
                }
            }
            other => headers.push((key, scalar(&other)?)),
        }
    }
    Ok(headers)
}
