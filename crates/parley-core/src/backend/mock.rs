//! Scripted in-process backend for tests and dry runs.
//!
//! Each sample consumes one [`MockOutcome`] per attempt from its script; the
//! last entry repeats once the script runs out. Samples without a script use
//! the default script (`[ok]` unless configured).

use super::ChatBackend;
use crate::errors::ClassifiedError;
use crate::model::{ChatResponse, Options, Role, RunRequest, TokenUsage};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

const HANG_FOR: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MockOutcome {
    Ok,
    /// Never answers; the runner's deadline fires.
    #[serde(alias = "timeout")]
    Hang,
    Retryable,
    Fatal,
    Panic,
}

#[derive(Debug, Clone)]
pub struct MockCall {
    pub sample_id: String,
    pub attempt: u32,
    pub started: Instant,
}

#[derive(Debug, Default)]
struct MockState {
    calls: Mutex<Vec<MockCall>>,
    consumed: Mutex<HashMap<String, usize>>,
}

/// Clones share call history, so a test can keep a handle on the instance it registers.
#[derive(Debug, Clone)]
pub struct MockBackend {
    delay: Duration,
    response: Option<String>,
    default_script: Vec<MockOutcome>,
    scripts: HashMap<String, Vec<MockOutcome>>,
    state: Arc<MockState>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            delay: Duration::ZERO,
            response: None,
            default_script: vec![MockOutcome::Ok],
            scripts: HashMap::new(),
            state: Arc::new(MockState::default()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_response(mut self, text: impl Into<String>) -> Self {
        self.response = Some(text.into());
        self
    }

    pub fn with_default(mut self, script: Vec<MockOutcome>) -> Self {
        if !script.is_empty() {
            self.default_script = script;
        }
        self
    }

    pub fn with_script(mut self, sample_id: impl Into<String>, script: Vec<MockOutcome>) -> Self {
        if !script.is_empty() {
            self.scripts.insert(sample_id.into(), script);
        }
        self
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state.calls.lock().expect("mock state poisoned").clone()
    }

    pub fn calls_for(&self, sample_id: &str) -> usize {
        self.calls().iter().filter(|c| c.sample_id == sample_id).count()
    }

    fn next_outcome(&self, sample_id: &str) -> MockOutcome {
        let script = self.scripts.get(sample_id).unwrap_or(&self.default_script);
        let mut consumed = self.state.consumed.lock().expect("mock state poisoned");
        let idx = consumed.entry(sample_id.to_string()).or_insert(0);
        let outcome = script[(*idx).min(script.len() - 1)];
        *idx += 1;
        outcome
    }

    fn answer(&self, request: &RunRequest) -> ChatResponse {
        let last_user = request
            .messages()
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        let text = match &self.response {
            Some(template) => template
                .replace("{sample_id}", &request.sample.id)
                .replace("{input}", last_user),
            None => format!("echo: {last_user}"),
        };
        let input = request.messages().iter().map(|m| m.content.len() as u64).sum();
        let output = text.len() as u64;
        ChatResponse {
            text,
            finish_reason: Some("stop".into()),
            status_code: Some(200),
            usage: Some(TokenUsage {
                input_tokens: Some(input),
                output_tokens: Some(output),
                total_tokens: Some(input + output),
            }),
            raw: None,
        }
    }
}

fn parse_script(value: &Value) -> Result<Vec<MockOutcome>, ClassifiedError> {
    serde_json::from_value(value.clone())
        .map_err(|e| ClassifiedError::backend_config("config", format!("invalid mock script: {e}")))
}

#[async_trait]
impl ChatBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn configure(&mut self, options: &Options) -> Result<(), ClassifiedError> {
        if let Some(ms) = options.get("delay_ms") {
            let ms = ms.as_u64().ok_or_else(|| {
                ClassifiedError::backend_config("config", "mock 'delay_ms' must be a non-negative integer")
            })?;
            self.delay = Duration::from_millis(ms);
        }
        if let Some(text) = options.get("response").and_then(Value::as_str) {
            self.response = Some(text.to_string());
        }
        if let Some(default) = options.get("outcomes") {
            let script = parse_script(default)?;
            if !script.is_empty() {
                self.default_script = script;
            }
        }
        match options.get("script") {
            Some(Value::Object(per_sample)) => {
                for (id, script) in per_sample {
                    let script = parse_script(script)?;
                    self.scripts.insert(id.clone(), script);
                }
            }
            Some(_) => {
                return Err(ClassifiedError::backend_config(
                    "config",
                    "mock 'script' must map sample ids to outcome lists",
                ))
            }
            None => {}
        }
        self.scripts.retain(|_, s| !s.is_empty());
        Ok(())
    }

    async fn send(&self, request: &RunRequest) -> Result<ChatResponse, ClassifiedError> {
        self.state
            .calls
            .lock()
            .expect("mock state poisoned")
            .push(MockCall {
                sample_id: request.sample.id.clone(),
                attempt: request.attempt,
                started: Instant::now(),
            });
        let outcome = self.next_outcome(&request.sample.id);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match outcome {
            MockOutcome::Ok => Ok(self.answer(request)),
            MockOutcome::Hang => {
                tokio::time::sleep(HANG_FOR).await;
                Err(ClassifiedError::timeout("mock backend hung"))
            }
            MockOutcome::Retryable => Err(ClassifiedError::transport(
                "mock_transient",
                format!("transient failure for {}", request.sample.id),
                true,
            )),
            MockOutcome::Fatal => Err(ClassifiedError::protocol(
                "mock_fatal",
                format!("fatal failure for {}", request.sample.id),
            )),
            MockOutcome::Panic => panic!("mock backend panicked on {}", request.sample.id),
        }
    }
}
