//! Backend capability interface and the built-in adapters.
//!
//! A backend turns one [`RunRequest`] into one [`ChatResponse`] or a
//! [`ClassifiedError`]. Backends never retry on their own: the runner owns
//! retry, timeout and pacing decisions.

pub mod freeform;
pub mod mock;
pub mod openai;
pub mod process;
pub mod registry;

pub use registry::BackendRegistry;

use crate::errors::ClassifiedError;
use crate::model::{ChatResponse, Message, Options, RunConfig, RunRequest};
use async_trait::async_trait;
use serde_json::Value;

#[async_trait]
pub trait ChatBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Apply construction-time options. Runs once, before the first `send`.
    fn configure(&mut self, options: &Options) -> Result<(), ClassifiedError> {
        let _ = options;
        Ok(())
    }

    async fn send(&self, request: &RunRequest) -> Result<ChatResponse, ClassifiedError>;
}

/// What a backend constructor gets to see about the job it is built for.
#[derive(Debug, Clone, Default)]
pub struct RunnerContext {
    pub backend: String,
    pub run_config: RunConfig,
    pub trace_prefix: String,
}

/// Wire shape of a conversation, shared by the HTTP and process adapters.
pub(crate) fn messages_payload(messages: &[Message], include_metadata: bool) -> Vec<Value> {
    messages
        .iter()
        .map(|m| {
            let mut entry = serde_json::Map::new();
            entry.insert("role".into(), serde_json::to_value(m.role).unwrap_or(Value::Null));
            entry.insert("content".into(), Value::String(m.content.clone()));
            if let Some(name) = &m.name {
                entry.insert("name".into(), Value::String(name.clone()));
            }
            if include_metadata {
                if let Some(meta) = m.metadata.as_ref().filter(|m| !m.is_empty()) {
                    entry.insert("metadata".into(), Value::Object(meta.clone()));
                }
            }
            Value::Object(entry)
        })
        .collect()
}

/// String-valued option; scalars are stringified, empty strings count as unset.
pub(crate) fn option_string(options: &Options, key: &str) -> Option<String> {
    match options.get(key)? {
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
