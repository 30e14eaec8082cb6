//! Best-effort answer extraction from free-form CLI stdout.
//!
//! On-device runners (llama-cli and friends) print the answer mixed with the
//! echoed request, prompt markers and a metrics trailer of the form
//! `[INFO_TSK] <output_tokens>, <input_tokens>, <f>, <f>, <f>`.

use crate::model::{ChatResponse, TokenUsage};
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

const METRICS_SENTINEL: &str = "[INFO_TSK]";
const ECHO_KEYS: [&str; 5] = [
    "\"sample_id\"",
    "\"messages\"",
    "\"model\"",
    "\"metadata\"",
    "\"parameters\"",
];

fn metrics_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\[INFO_TSK\]\s*(\d+),\s*(\d+),\s*([\d.]+),\s*([\d.]+),\s*([\d.]+)")
            .expect("metrics sentinel regex")
    })
}

/// Token usage from the first metrics sentinel line, if any.
pub fn parse_metrics(stdout: &str) -> Option<TokenUsage> {
    let caps = stdout.lines().find_map(|line| metrics_line().captures(line))?;
    let output = caps.get(1)?.as_str().parse::<u64>().ok()?;
    let input = caps.get(2)?.as_str().parse::<u64>().ok()?;
    Some(TokenUsage {
        input_tokens: Some(input),
        output_tokens: Some(output),
        total_tokens: input.checked_add(output),
    })
}

/// Strip echo, markers and trailers; fall back to the raw output if nothing is left.
pub fn extract_text(stdout: &str) -> String {
    let mut kept: Vec<&str> = Vec::new();
    for line in stdout.lines() {
        let mut line = line.trim();
        if line.is_empty()
            || line.starts_with(METRICS_SENTINEL)
            || line.contains("EOF by user")
            || ECHO_KEYS.iter().any(|k| line.contains(k))
            || line.starts_with('{')
            || line.starts_with('}')
        {
            continue;
        }
        if line.starts_with('>') {
            line = line.trim_start_matches('>').trim();
            if line.is_empty() {
                continue;
            }
        }
        kept.push(line);
    }
    let text = kept.join("\n");
    let text = text.trim();
    if text.is_empty() {
        stdout.trim().to_string()
    } else {
        text.to_string()
    }
}

pub fn parse_freeform(stdout: &str) -> ChatResponse {
    let mut raw = serde_json::Map::new();
    raw.insert("raw_stdout".into(), Value::String(stdout.to_string()));
    ChatResponse {
        text: extract_text(stdout),
        finish_reason: None,
        status_code: Some(0),
        usage: parse_metrics(stdout),
        raw: Some(raw),
    }
}
