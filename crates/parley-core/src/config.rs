//! File-based configuration: an optional `runner:` section (execution policy)
//! and an optional `run:` section (backend selection). YAML or JSON.

use crate::model::{ExecutionPolicy, Options, RunConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("failed to parse config {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RunnerSettings {
    pub max_concurrency: usize,
    pub timeout_seconds: f64,
    pub max_retries: u32,
    pub retry_backoff_factor: f64,
    pub retry_backoff_jitter: f64,
    pub rate_limit_per_second: Option<f64>,
    pub trace_prefix: String,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        let policy = ExecutionPolicy::default();
        Self {
            max_concurrency: policy.max_concurrency,
            timeout_seconds: policy.timeout.as_secs_f64(),
            max_retries: policy.max_retries,
            retry_backoff_factor: policy.retry_backoff_factor,
            retry_backoff_jitter: policy.retry_backoff_jitter,
            rate_limit_per_second: policy.rate_limit_per_second,
            trace_prefix: policy.trace_prefix,
        }
    }
}

impl RunnerSettings {
    pub fn to_policy(&self) -> Result<ExecutionPolicy, ConfigError> {
        if !self.timeout_seconds.is_finite() || self.timeout_seconds <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "timeout_seconds must be positive, got {}",
                self.timeout_seconds
            )));
        }
        if self.retry_backoff_factor.is_nan() || self.retry_backoff_jitter.is_nan() {
            return Err(ConfigError::Invalid("backoff settings must be numbers".into()));
        }
        let timeout = Duration::try_from_secs_f64(self.timeout_seconds).map_err(|e| {
            ConfigError::Invalid(format!(
                "timeout_seconds {} is out of range: {e}",
                self.timeout_seconds
            ))
        })?;
        Ok(ExecutionPolicy {
            max_concurrency: self.max_concurrency.max(1),
            timeout,
            max_retries: self.max_retries,
            retry_backoff_factor: self.retry_backoff_factor.max(0.0),
            retry_backoff_jitter: self.retry_backoff_jitter.max(0.0),
            rate_limit_per_second: self.rate_limit_per_second.filter(|r| *r > 0.0),
            trace_prefix: self.trace_prefix.clone(),
        })
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RunSection {
    pub backend: Option<String>,
    pub model: Option<String>,
    pub parameters: Options,
    pub backend_options: Options,
}

impl RunSection {
    /// `None` when no backend is named.
    pub fn to_run_config(&self) -> Option<RunConfig> {
        let backend = self.backend.as_ref()?;
        Some(RunConfig {
            backend: backend.clone(),
            model: self.model.clone(),
            parameters: self.parameters.clone(),
            backend_options: self.backend_options.clone(),
            metadata: None,
        })
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ParleyConfig {
    pub runner: RunnerSettings,
    pub run: RunSection,
}

impl ParleyConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ConfigError::NotFound(path.to_path_buf()),
            _ => ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            },
        })?;
        Self::parse(&text, path)
    }

    fn parse(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        let parsed = if is_json {
            serde_json::from_str(text).map_err(|e| e.to_string())
        } else {
            serde_yaml::from_str(text).map_err(|e| e.to_string())
        };
        let cfg: Self = parsed.map_err(|message| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })?;
        tracing::debug!(path = %path.display(), "loaded config");
        Ok(cfg)
    }
}

/// Parse `key=value` pairs. The value is read as JSON when it parses,
/// otherwise kept as a plain string.
pub fn parse_kv_pairs<S: AsRef<str>>(pairs: &[S]) -> Result<Options, ConfigError> {
    let mut out = Options::new();
    for pair in pairs {
        let pair = pair.as_ref();
        let Some((key, raw)) = pair.split_once('=') else {
            return Err(ConfigError::Invalid(format!(
                "expected key=value, got '{pair}'"
            )));
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(ConfigError::Invalid(format!("empty key in '{pair}'")));
        }
        let value = serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.into()));
        out.insert(key.to_string(), value);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_policy_defaults() {
        let policy = RunnerSettings::default().to_policy().unwrap();
        assert_eq!(policy, ExecutionPolicy::default());
    }

    #[test]
    fn loads_yaml_with_partial_sections() {
        let mut f = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            f,
            "runner:\n  max_concurrency: 8\n  rate_limit_per_second: 5\nrun:\n  backend: mock\n  parameters:\n    temperature: 0.2"
        )
        .unwrap();
        let cfg = ParleyConfig::load(f.path()).unwrap();
        assert_eq!(cfg.runner.max_concurrency, 8);
        assert_eq!(cfg.runner.max_retries, 2);
        let policy = cfg.runner.to_policy().unwrap();
        assert_eq!(policy.rate_limit_per_second, Some(5.0));
        let run = cfg.run.to_run_config().unwrap();
        assert_eq!(run.backend, "mock");
        assert_eq!(run.parameters["temperature"], 0.2);
    }

    #[test]
    fn loads_json_by_extension() {
        let mut f = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(f, r#"{{"runner": {{"timeout_seconds": 1.5}}}}"#).unwrap();
        let cfg = ParleyConfig::load(f.path()).unwrap();
        assert_eq!(
            cfg.runner.to_policy().unwrap().timeout,
            Duration::from_millis(1500)
        );
        assert!(cfg.run.to_run_config().is_none());
    }

    #[test]
    fn missing_and_malformed_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.yaml");
        assert!(matches!(
            ParleyConfig::load(&missing),
            Err(ConfigError::NotFound(_))
        ));

        let bad = dir.path().join("bad.yaml");
        std::fs::write(&bad, "runner: [1, 2").unwrap();
        assert!(matches!(
            ParleyConfig::load(&bad),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn rejects_non_positive_timeout() {
        let settings = RunnerSettings {
            timeout_seconds: 0.0,
            ..Default::default()
        };
        assert!(matches!(settings.to_policy(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_unrepresentable_timeout() {
        let settings = RunnerSettings {
            timeout_seconds: 1e300,
            ..Default::default()
        };
        match settings.to_policy() {
            Err(ConfigError::Invalid(msg)) => assert!(msg.contains("out of range"), "{msg}"),
            other => panic!("expected invalid timeout, got {other:?}"),
        }
    }

    #[test]
    fn kv_pairs_prefer_json_values() {
        let opts = parse_kv_pairs(&["temperature=0.3", "stop=[\"x\"]", "name=gpt", "url=http://a=b"])
            .unwrap();
        assert_eq!(opts["temperature"], 0.3);
        assert_eq!(opts["stop"][0], "x");
        assert_eq!(opts["name"], "gpt");
        assert_eq!(opts["url"], "http://a=b");
        assert!(parse_kv_pairs(&["novalue"]).is_err());
        assert!(parse_kv_pairs(&["=1"]).is_err());
    }
}
