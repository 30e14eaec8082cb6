use super::{messages_payload, option_string, ChatBackend};
use crate::errors::ClassifiedError;
use crate::model::{ChatResponse, Options, RunRequest, TokenUsage};
use async_trait::async_trait;
use serde_json::{json, Value};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const ERROR_BODY_LIMIT: usize = 2000;

/// OpenAI-compatible `/chat/completions` adapter.
pub struct OpenAiBackend {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    default_model: Option<String>,
    request_defaults: Options,
}

impl Default for OpenAiBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenAiBackend {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            default_model: None,
            request_defaults: Options::new(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    /// Request body: `{model, messages}`, then backend defaults, then call parameters.
    pub fn build_body(&self, request: &RunRequest) -> Result<Value, ClassifiedError> {
        let model = request
            .run_config
            .model
            .clone()
            .or_else(|| self.default_model.clone())
            .ok_or_else(|| {
                ClassifiedError::backend_config("config", "a model is required for the openai backend")
            })?;
        let mut body = serde_json::Map::new();
        body.insert("model".into(), Value::String(model));
        body.insert(
            "messages".into(),
            Value::Array(messages_payload(request.messages(), false)),
        );
        for (k, v) in self.request_defaults.iter().chain(request.run_config.parameters.iter()) {
            body.insert(k.clone(), v.clone());
        }
        Ok(Value::Object(body))
    }
}

#[async_trait]
impl ChatBackend for OpenAiBackend {
    fn name(&self) -> &str {
        "openai"
    }

    fn configure(&mut self, options: &Options) -> Result<(), ClassifiedError> {
        let api_key = option_string(options, "api_key")
            .or_else(|| std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.trim().is_empty()));
        if api_key.is_none() {
            return Err(ClassifiedError::backend_config("auth", "OPENAI_API_KEY is not set"));
        }
        self.api_key = api_key;
        if let Some(url) = option_string(options, "base_url")
            .or_else(|| std::env::var("OPENAI_BASE_URL").ok().filter(|u| !u.trim().is_empty()))
        {
            self.base_url = url;
        }
        self.default_model = option_string(options, "model");
        self.request_defaults = match options.get("request_defaults") {
            Some(Value::Object(map)) => map.clone(),
            Some(_) => {
                return Err(ClassifiedError::backend_config(
                    "config",
                    "'request_defaults' must be an object",
                ))
            }
            None => Options::new(),
        };
        Ok(())
    }

    async fn send(&self, request: &RunRequest) -> Result<ChatResponse, ClassifiedError> {
        let body = self.build_body(request)?;
        let api_key = self.api_key.as_deref().unwrap_or_default();

        let resp = self
            .client
            .post(self.endpoint())
            .bearer_auth(api_key)
            .header("X-Trace-Id", request.trace_id.as_str())
            .timeout(request.timeout)
            .json(&body)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_http_status(status, &text));
        }

        let json: Value = resp.json().await.map_err(|e| {
            if e.is_timeout() {
                ClassifiedError::timeout(format!("timed out reading response: {e}"))
            } else {
                ClassifiedError::protocol("parse_error", format!("invalid JSON from provider: {e}"))
            }
        })?;
        parse_completion(json, status)
    }
}

pub fn classify_reqwest_error(e: reqwest::Error) -> ClassifiedError {
    if e.is_timeout() {
        ClassifiedError::timeout(format!("request timed out: {e}"))
    } else if e.is_connect() {
        ClassifiedError::transport("connection_error", format!("connection failed: {e}"), true)
    } else if e.is_builder() {
        ClassifiedError::backend_config("config", format!("invalid request: {e}"))
    } else {
        ClassifiedError::transport("api_error", e.to_string(), true)
    }
}

/// 429 and 5xx are transient; auth and other client errors are not.
pub fn classify_http_status(status: u16, body: &str) -> ClassifiedError {
    let body: String = body.chars().take(ERROR_BODY_LIMIT).collect();
    let message = format!("OpenAI chat API error (status {status}): {body}");
    let err = match status {
        429 => ClassifiedError::rate_limited(message),
        500..=599 => ClassifiedError::transport("api_error", message, true),
        401 | 403 => ClassifiedError::backend_config("auth", message),
        _ => ClassifiedError::protocol("request_error", message),
    };
    err.with_status(status)
}

pub fn parse_completion(json: Value, status: u16) -> Result<ChatResponse, ClassifiedError> {
    let choice = json
        .pointer("/choices/0")
        .filter(|c| c.get("message").is_some())
        .ok_or_else(|| {
            ClassifiedError::protocol("response_format", "response missing choices[0].message")
                .with_status(status)
        })?;
    let text = choice
        .pointer("/message/content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let finish_reason = choice
        .get("finish_reason")
        .and_then(Value::as_str)
        .map(str::to_string);
    let usage = json.get("usage").filter(|u| u.is_object()).map(|u| TokenUsage {
        input_tokens: u.get("prompt_tokens").and_then(Value::as_u64),
        output_tokens: u.get("completion_tokens").and_then(Value::as_u64),
        total_tokens: u.get("total_tokens").and_then(Value::as_u64),
    });
    let raw = match json {
        Value::Object(map) => Some(map),
        _ => None,
    };
    Ok(ChatResponse {
        text,
        finish_reason,
        status_code: Some(status),
        usage,
        raw,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::model::{DatasetInfo, Message, RunConfig, Sample};
    use serial_test::serial;
    use std::sync::Arc;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(cfg: RunConfig) -> RunRequest {
        RunRequest {
            sample: Arc::new(Sample::new(
                "s1",
                vec![Message::system("be brief"), Message::user("2+2?")],
            )),
            run_config: Arc::new(cfg),
            dataset: Arc::new(DatasetInfo::default()),
            trace_id: "run-s1-0000abcd".into(),
            attempt: 1,
            timeout: Duration::from_secs(5),
        }
    }

    fn configured(server_uri: &str, extra: Value) -> OpenAiBackend {
        let mut opts = json!({"api_key": "sk-test", "base_url": server_uri});
        if let (Some(o), Value::Object(e)) = (opts.as_object_mut(), extra) {
            o.extend(e);
        }
        let mut backend = OpenAiBackend::new();
        backend.configure(opts.as_object().unwrap()).unwrap();
        backend
    }

    #[test]
    fn status_classification() {
        let e = classify_http_status(429, "slow down");
        assert_eq!(e.kind, ErrorKind::RateLimited);
        assert!(e.retryable);
        assert_eq!(e.status_code, Some(429));

        assert!(classify_http_status(503, "").retryable);
        let auth = classify_http_status(401, "bad key");
        assert!(!auth.retryable);
        assert_eq!(auth.error_type, "auth");
        let bad = classify_http_status(400, "bad request");
        assert_eq!(bad.kind, ErrorKind::BackendProtocol);
        assert!(!bad.retryable);
    }

    #[test]
    fn body_merges_defaults_then_parameters() {
        let mut backend = OpenAiBackend::new();
        backend
            .configure(
                json!({"api_key": "k", "request_defaults": {"temperature": 0.0, "max_tokens": 16}})
                    .as_object()
                    .unwrap(),
            )
            .unwrap();
        let cfg = RunConfig::new("openai")
            .with_model("gpt-4o-mini")
            .with_parameter("temperature", 0.7);
        let body = backend.build_body(&request(cfg)).unwrap();
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["temperature"], 0.7);
        assert_eq!(body["max_tokens"], 16);
        assert_eq!(body["messages"][1], json!({"role": "user", "content": "2+2?"}));
    }

    #[test]
    fn missing_model_is_config_error() {
        let mut backend = OpenAiBackend::new();
        backend.configure(json!({"api_key": "k"}).as_object().unwrap()).unwrap();
        let err = backend.build_body(&request(RunConfig::new("openai"))).unwrap_err();
        assert_eq!(err.kind, ErrorKind::BackendConfig);
    }

    #[test]
    #[serial]
    fn missing_api_key_fails_configure() {
        let previous = std::env::var("OPENAI_API_KEY").ok();
        std::env::remove_var("OPENAI_API_KEY");
        let err = OpenAiBackend::new().configure(&Options::new()).unwrap_err();
        assert_eq!(err.error_type, "auth");
        assert!(!err.retryable);
        if let Some(v) = previous {
            std::env::set_var("OPENAI_API_KEY", v);
        }
    }

    #[tokio::test]
    async fn successful_completion_maps_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({"model": "gpt-4o-mini"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "4"}, "finish_reason": "stop"}],
                "usage": {"prompt_tokens": 9, "completion_tokens": 1, "total_tokens": 10}
            })))
            .mount(&server)
            .await;

        let backend = configured(&server.uri(), json!({}));
        let resp = backend
            .send(&request(RunConfig::new("openai").with_model("gpt-4o-mini")))
            .await
            .unwrap();
        assert_eq!(resp.text, "4");
        assert_eq!(resp.finish_reason.as_deref(), Some("stop"));
        assert_eq!(resp.status_code, Some(200));
        assert_eq!(resp.usage.unwrap().total_tokens, Some(10));
    }

    #[tokio::test]
    async fn rate_limit_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .mount(&server)
            .await;
        let backend = configured(&server.uri(), json!({"model": "m"}));
        let err = backend.send(&request(RunConfig::new("openai"))).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::RateLimited);
        assert!(err.retryable);
    }

    #[tokio::test]
    async fn missing_choices_is_protocol_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "x"})))
            .mount(&server)
            .await;
        let backend = configured(&server.uri(), json!({"model": "m"}));
        let err = backend.send(&request(RunConfig::new("openai"))).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::BackendProtocol);
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn slow_provider_maps_to_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_secs(2))
                    .set_body_json(json!({"choices": [{"message": {"content": "late"}}]})),
            )
            .mount(&server)
            .await;
        let backend = configured(&server.uri(), json!({"model": "m"}));
        let mut req = request(RunConfig::new("openai"));
        req.timeout = Duration::from_millis(100);
        let err = backend.send(&req).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(err.retryable);
    }
}
