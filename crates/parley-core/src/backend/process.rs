//! Local-process / on-device backend.
//!
//! The request is serialized as one JSON document on the child's stdin. With
//! a device bridge configured the command line becomes
//! `<bridge> [-s <device_id>] shell <binary> [args...]`, otherwise the binary
//! is spawned directly.

use super::freeform::parse_freeform;
use super::{messages_payload, option_string, ChatBackend};
use crate::errors::ClassifiedError;
use crate::model::{ChatResponse, Options, RunRequest, TokenUsage};
use async_trait::async_trait;
use serde_json::Value;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

const SNIPPET_LEN: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// JSON document with a `text` field; unparseable output falls back to the lenient parser.
    Json,
    /// Always use the lenient parser.
    Freeform,
}

#[derive(Debug, Clone)]
pub struct ProcessBackend {
    name: &'static str,
    default_bridge: Option<&'static str>,
    bridge: Option<String>,
    binary: Option<String>,
    device_id: Option<String>,
    binary_args: Vec<String>,
    output_mode: OutputMode,
}

impl ProcessBackend {
    /// Spawns the binary on this host unless an `adb_path` option is supplied.
    pub fn direct() -> Self {
        Self {
            name: "process",
            default_bridge: None,
            bridge: None,
            binary: None,
            device_id: None,
            binary_args: Vec::new(),
            output_mode: OutputMode::Json,
        }
    }

    /// Runs the binary on a device through `adb shell`.
    pub fn adb() -> Self {
        Self {
            name: "adb-cli",
            default_bridge: Some("adb"),
            ..Self::direct()
        }
    }

    pub fn with_output_mode(mut self, mode: OutputMode) -> Self {
        self.output_mode = mode;
        if mode == OutputMode::Freeform && self.name == "adb-cli" {
            self.name = "adb-cli-freeform";
        }
        self
    }

    pub fn command_line(&self) -> Result<Vec<String>, ClassifiedError> {
        let binary = self.binary.as_ref().ok_or_else(|| {
            ClassifiedError::backend_config("config", format!("{} backend requires 'binary' option", self.name))
        })?;
        let mut argv = Vec::new();
        let bridge = self
            .bridge
            .clone()
            .or_else(|| self.default_bridge.map(str::to_string));
        if let Some(bridge) = bridge {
            argv.push(bridge);
            if let Some(device) = &self.device_id {
                argv.push("-s".into());
                argv.push(device.clone());
            }
            argv.push("shell".into());
        } else if self.device_id.is_some() {
            tracing::debug!(backend = self.name, "device_id ignored without a device bridge");
        }
        argv.push(binary.clone());
        argv.extend(self.binary_args.iter().cloned());
        Ok(argv)
    }

    fn payload(request: &RunRequest) -> Vec<u8> {
        let payload = serde_json::json!({
            "sample_id": request.sample.id,
            "messages": messages_payload(request.messages(), true),
            "model": request.run_config.model,
            "parameters": request.run_config.parameters,
            "metadata": request.sample.metadata,
        });
        serde_json::to_vec(&payload).unwrap_or_default()
    }

    fn parse_output(&self, stdout: &str) -> Result<ChatResponse, ClassifiedError> {
        match self.output_mode {
            OutputMode::Freeform => Ok(parse_freeform(stdout)),
            OutputMode::Json => parse_json_output(stdout),
        }
    }
}

#[async_trait]
impl ChatBackend for ProcessBackend {
    fn name(&self) -> &str {
        self.name
    }

    fn configure(&mut self, options: &Options) -> Result<(), ClassifiedError> {
        self.binary = option_string(options, "binary");
        if self.binary.is_none() {
            return Err(ClassifiedError::backend_config(
                "config",
                format!("{} backend requires 'binary' option", self.name),
            ));
        }
        self.bridge = option_string(options, "adb_path");
        self.device_id = option_string(options, "device_id");
        self.binary_args = match options.get("binary_args") {
            Some(Value::String(s)) => split_args(s),
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect(),
            _ => Vec::new(),
        };
        Ok(())
    }

    async fn send(&self, request: &RunRequest) -> Result<ChatResponse, ClassifiedError> {
        let argv = self.command_line()?;
        let stdout = run_command(&argv, Self::payload(request), request.timeout).await?;
        self.parse_output(&stdout)
    }
}

/// Spawn, feed stdin, collect stdout. The child is killed if the deadline passes.
pub async fn run_command(
    argv: &[String],
    input: Vec<u8>,
    timeout: Duration,
) -> Result<String, ClassifiedError> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| ClassifiedError::backend_config("config", "empty command line"))?;

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ClassifiedError::transport(
                    "executable_missing",
                    format!("executable not found: {program}"),
                    false,
                )
            } else {
                ClassifiedError::transport("spawn_error", format!("failed to launch {program}: {e}"), false)
            }
        })?;

    let stdin = child.stdin.take();
    let feed = async move {
        if let Some(mut stdin) = stdin {
            // The child may exit without reading its input; that is not our failure.
            let _ = stdin.write_all(&input).await;
            let _ = stdin.shutdown().await;
        }
    };

    let output = match tokio::time::timeout(timeout, async {
        let (_, output) = tokio::join!(feed, child.wait_with_output());
        output
    })
    .await
    {
        Err(_) => {
            return Err(ClassifiedError::timeout(format!(
                "{program} did not finish within {:.1}s",
                timeout.as_secs_f64()
            )))
        }
        Ok(Err(e)) => {
            return Err(ClassifiedError::transport(
                "io_error",
                format!("failed waiting for {program}: {e}"),
                true,
            ))
        }
        Ok(Ok(output)) => output,
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(classify_exit(output.status.code(), stderr.trim()));
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if stdout.is_empty() {
        return Err(ClassifiedError::protocol(
            "empty_response",
            format!("{program} returned empty response"),
        ));
    }
    Ok(stdout)
}

/// Non-zero exits are transient unless the bridge says the device is gone.
pub fn classify_exit(code: Option<i32>, stderr: &str) -> ClassifiedError {
    let code_str = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
    let message = format!("process exited with code {code_str}: {stderr}");
    let lowered = stderr.to_lowercase();
    let device_missing = (lowered.contains("device '") && lowered.contains("not found"))
        || lowered.contains("no devices/emulators found");
    let err = if device_missing {
        ClassifiedError::transport("device_not_found", message, false)
    } else {
        ClassifiedError::transport("adb_exit", message, true)
    };
    match code {
        Some(c) => err.with_detail("exit_code", c),
        None => err,
    }
}

pub fn parse_json_output(stdout: &str) -> Result<ChatResponse, ClassifiedError> {
    let data = match serde_json::from_str::<Value>(stdout) {
        Ok(Value::Object(map)) => map,
        Ok(_) | Err(_) => {
            tracing::debug!(
                stdout_head = %snippet(stdout),
                "stdout is not a JSON object; using lenient parser"
            );
            return Ok(parse_freeform(stdout));
        }
    };

    let text = match data.get("text") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => {
            return Err(ClassifiedError::protocol(
                "response_format",
                "Response missing 'text' field",
            )
            .with_detail("stdout_head", snippet(stdout)))
        }
        Some(other) => other.to_string(),
    };

    let usage = data.get("usage").and_then(Value::as_object).map(|u| {
        let pick = |a: &str, b: &str| {
            u.get(a)
                .and_then(Value::as_u64)
                .or_else(|| u.get(b).and_then(Value::as_u64))
        };
        TokenUsage {
            input_tokens: pick("input", "prompt"),
            output_tokens: pick("output", "completion"),
            total_tokens: u.get("total").and_then(Value::as_u64),
        }
    });
    let finish_reason = data
        .get("finish_reason")
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(ChatResponse {
        text,
        finish_reason,
        status_code: Some(0),
        usage,
        raw: Some(data),
    })
}

fn snippet(s: &str) -> String {
    s.chars().take(SNIPPET_LEN).collect()
}

/// Shell-style argument splitting with single/double quotes and backslash escapes.
pub fn split_args(input: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_arg = false;
    let mut quote: Option<char> = None;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some('"'), '\\') => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            (Some(_), c) => current.push(c),
            (None, '\'' | '"') => {
                quote = Some(c);
                in_arg = true;
            }
            (None, '\\') => {
                if let Some(next) = chars.next() {
                    current.push(next);
                    in_arg = true;
                }
            }
            (None, c) if c.is_whitespace() => {
                if in_arg {
                    args.push(std::mem::take(&mut current));
                    in_arg = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_arg = true;
            }
        }
    }
    if in_arg {
        args.push(current);
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(v: Value) -> Options {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn adb_command_includes_device_and_args() {
        let mut b = ProcessBackend::adb();
        b.configure(&opts(serde_json::json!({
            "binary": "/data/local/tmp/runner",
            "device_id": "emulator-5554",
            "binary_args": "--temp 0.2 --prompt 'a b'"
        })))
        .unwrap();
        assert_eq!(
            b.command_line().unwrap(),
            vec![
                "adb", "-s", "emulator-5554", "shell", "/data/local/tmp/runner", "--temp", "0.2",
                "--prompt", "a b"
            ]
        );
    }

    #[test]
    fn direct_command_uses_custom_bridge_only_when_given() {
        let mut b = ProcessBackend::direct();
        b.configure(&opts(serde_json::json!({"binary": "./model", "binary_args": ["-n", 5]})))
            .unwrap();
        assert_eq!(b.command_line().unwrap(), vec!["./model", "-n", "5"]);

        let mut b = ProcessBackend::direct();
        b.configure(&opts(serde_json::json!({"binary": "./model", "adb_path": "/opt/adb"})))
            .unwrap();
        assert_eq!(b.command_line().unwrap(), vec!["/opt/adb", "shell", "./model"]);
    }

    #[test]
    fn missing_binary_is_config_error() {
        let mut b = ProcessBackend::adb();
        let err = b.configure(&Options::new()).unwrap_err();
        assert_eq!(err.kind, crate::errors::ErrorKind::BackendConfig);
        assert!(!err.retryable);
    }

    #[test]
    fn freeform_variant_renames_itself() {
        let b = ProcessBackend::adb().with_output_mode(OutputMode::Freeform);
        assert_eq!(b.name(), "adb-cli-freeform");
    }

    #[test]
    fn device_not_found_is_terminal() {
        let err = classify_exit(Some(1), "error: device 'abc' not found");
        assert_eq!(err.error_type, "device_not_found");
        assert!(!err.retryable);

        let err = classify_exit(Some(1), "adb: no devices/emulators found");
        assert!(!err.retryable);

        let err = classify_exit(Some(139), "Segmentation fault");
        assert_eq!(err.error_type, "adb_exit");
        assert!(err.retryable);
        assert_eq!(err.details.unwrap()["exit_code"], 139);
    }

    #[test]
    fn json_output_maps_usage_aliases() {
        let resp = parse_json_output(
            r#"{"text": "hi", "usage": {"prompt": 5, "completion": 2, "total": 7}, "finish_reason": "stop"}"#,
        )
        .unwrap();
        assert_eq!(resp.text, "hi");
        let usage = resp.usage.unwrap();
        assert_eq!(usage.input_tokens, Some(5));
        assert_eq!(usage.output_tokens, Some(2));
        assert_eq!(usage.total_tokens, Some(7));
        assert_eq!(resp.finish_reason.as_deref(), Some("stop"));
        assert_eq!(resp.raw.unwrap()["text"], "hi");
    }

    #[test]
    fn json_without_text_is_protocol_error() {
        let err = parse_json_output(r#"{"answer": "hi"}"#).unwrap_err();
        assert_eq!(err.error_type, "response_format");
        assert!(!err.retryable);
    }

    #[test]
    fn non_json_output_falls_back_to_lenient_text() {
        let resp = parse_json_output("> The answer is 4\n[INFO_TSK] 3, 9, 1.0, 2.0, 3.0").unwrap();
        assert_eq!(resp.text, "The answer is 4");
        assert_eq!(resp.usage.unwrap().total_tokens, Some(12));
    }

    #[test]
    fn split_args_honours_quotes_and_escapes() {
        assert_eq!(split_args("  a  b "), vec!["a", "b"]);
        assert_eq!(split_args(r#"-p "hello world" 'x y'"#), vec!["-p", "hello world", "x y"]);
        assert_eq!(split_args(r#"a\ b "q\"t" ''"#), vec!["a b", "q\"t", ""]);
        assert!(split_args("").is_empty());
    }
}
