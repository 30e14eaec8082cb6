use crate::errors::ClassifiedError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

/// Free-form key/value options (construction-time backend knobs, call parameters).
pub type Options = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Options>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
            metadata: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }
}

/// One unit of conversational input. Read-only during execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    #[serde(deserialize_with = "id_from_scalar")]
    pub id: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Options>,
}

impl Sample {
    pub fn new(id: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            id: id.into(),
            messages,
            expected: None,
            tags: None,
            metadata: None,
        }
    }
}

// Dataset files in the wild carry numeric ids as often as string ones.
fn id_from_scalar<'de, D>(de: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(de)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "sample id must be a string or number, got {other}"
        ))),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetInfo {
    #[serde(default)]
    pub dataset_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Options>,
}

/// Backend selection plus call-level and construction-level knobs. Immutable per job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub backend: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Options,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub backend_options: Options,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Options>,
}

const SECRET_MARKERS: [&str; 4] = ["key", "token", "secret", "password"];

impl RunConfig {
    pub fn new(backend: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            ..Default::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_backend_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.backend_options.insert(key.into(), value.into());
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Copy suitable for persisting: credential-like backend options are masked.
    pub fn redacted(&self) -> Self {
        let mut out = self.clone();
        for (key, value) in out.backend_options.iter_mut() {
            let lowered = key.to_ascii_lowercase();
            if SECRET_MARKERS.iter().any(|m| lowered.contains(m)) {
                *value = Value::String("***".into());
            }
        }
        out
    }
}

/// Concurrency, timeout, retry and pacing knobs for one job.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionPolicy {
    pub max_concurrency: usize,
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff_factor: f64,
    pub retry_backoff_jitter: f64,
    pub rate_limit_per_second: Option<f64>,
    pub trace_prefix: String,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            max_concurrency: 2,
            timeout: Duration::from_secs(60),
            max_retries: 2,
            retry_backoff_factor: 2.0,
            retry_backoff_jitter: 0.5,
            rate_limit_per_second: None,
            trace_prefix: "run".into(),
        }
    }
}

impl ExecutionPolicy {
    /// Gate size; a configured value below one still admits a single call.
    pub fn effective_concurrency(&self) -> usize {
        self.max_concurrency.max(1)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn to_metadata(&self) -> Value {
        serde_json::json!({
            "max_concurrency": self.max_concurrency,
            "timeout_seconds": self.timeout.as_secs_f64(),
            "max_retries": self.max_retries,
            "retry_backoff_factor": self.retry_backoff_factor,
            "retry_backoff_jitter": self.retry_backoff_jitter,
            "rate_limit_per_second": self.rate_limit_per_second,
            "trace_prefix": self.trace_prefix,
        })
    }
}

/// Everything a backend needs for one attempt.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub sample: Arc<Sample>,
    pub run_config: Arc<RunConfig>,
    pub dataset: Arc<DatasetInfo>,
    pub trace_id: String,
    pub attempt: u32,
    pub timeout: Duration,
}

impl RunRequest {
    pub fn messages(&self) -> &[Message] {
        &self.sample.messages
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(rename = "input")]
    pub input_tokens: Option<u64>,
    #[serde(rename = "output")]
    pub output_tokens: Option<u64>,
    #[serde(rename = "total")]
    pub total_tokens: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(rename = "tokens", default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    /// Provider payload, kept opaque.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Options>,
}

impl ChatResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Ok,
    /// Retryable failure with the retry budget exhausted. Terminal.
    Retry,
    Timeout,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Ok => "ok",
            RunStatus::Retry => "retry",
            RunStatus::Timeout => "timeout",
            RunStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    pub sample_tags: Option<Vec<String>>,
    pub sample_metadata: Option<Options>,
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEcho {
    pub messages: Vec<Message>,
    pub context: RequestContext,
}

/// Durable outcome for one sample. Exactly one per input sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub sample_id: String,
    pub dataset_id: Option<String>,
    pub backend: String,
    pub trace_id: String,
    pub status: RunStatus,
    pub attempts: u32,
    pub latency_ms: f64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub run_config: RunConfig,
    pub request: RequestEcho,
    pub response: Option<ChatResponse>,
    pub error: Option<ClassifiedError>,
}

impl ResultRecord {
    pub fn is_ok(&self) -> bool {
        self.status == RunStatus::Ok
    }
}
