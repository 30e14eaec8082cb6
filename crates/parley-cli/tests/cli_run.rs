#![allow(deprecated)]
//! CLI contract: exit codes, output files, and flag handling for `parley run`.

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::path::{Path, PathBuf};

fn write_dataset(dir: &Path) -> PathBuf {
    let data = dir.join("data");
    std::fs::create_dir_all(&data).unwrap();
    std::fs::write(
        data.join("test.jsonl"),
        concat!(
            r#"{"id": "greet", "messages": [{"role": "user", "content": "hello"}]}"#,
            "\n",
            r#"{"id": "bye", "messages": [{"role": "user", "content": "goodbye"}]}"#,
            "\n",
        ),
    )
    .unwrap();
    std::fs::write(
        data.join("metadata.json"),
        r#"{"dataset_id": "smoke", "name": "Smoke", "version": "1"}"#,
    )
    .unwrap();
    data
}

fn read_records(dir: &Path) -> Vec<Value> {
    std::fs::read_to_string(dir.join("run_results.jsonl"))
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

fn parley() -> Command {
    let mut cmd = Command::cargo_bin("parley").unwrap();
    cmd.env_remove("RUST_LOG");
    cmd
}

#[test]
fn backends_lists_builtins() {
    parley()
        .arg("backends")
        .assert()
        .success()
        .stdout(predicate::str::contains("openai"))
        .stdout(predicate::str::contains("adb-cli-freeform"))
        .stdout(predicate::str::contains("mock"));
}

#[test]
fn mock_run_writes_results_and_metadata() {
    let tmp = tempfile::tempdir().unwrap();
    let data = write_dataset(tmp.path());
    let out = tmp.path().join("out");

    parley()
        .args(["run", "--backend", "mock", "--trace-prefix", "ci"])
        .arg("--dataset")
        .arg(&data)
        .arg("--output-dir")
        .arg(&out)
        .assert()
        .code(0)
        .stdout(predicate::str::contains("2 records (2 ok"));

    let records = read_records(&out);
    assert_eq!(records.len(), 2);
    for r in &records {
        assert_eq!(r["status"], "ok");
        assert_eq!(r["dataset_id"], "smoke");
        assert!(r["trace_id"].as_str().unwrap().starts_with("ci-"));
    }
    let greet = records.iter().find(|r| r["sample_id"] == "greet").unwrap();
    assert_eq!(greet["response"]["text"], "echo: hello");

    let meta: Value =
        serde_json::from_str(&std::fs::read_to_string(out.join("run_metadata.json")).unwrap())
            .unwrap();
    assert_eq!(meta["summary"]["total"], 2);
    assert_eq!(meta["dataset"]["name"], "Smoke");
    assert_eq!(meta["options"]["trace_prefix"], "ci");
}

#[test]
fn failing_samples_exit_one_in_stream_mode() {
    let tmp = tempfile::tempdir().unwrap();
    let data = write_dataset(tmp.path());
    let out = tmp.path().join("out");

    parley()
        .args(["run", "--backend", "mock", "--stream", "--max-retries", "1"])
        .args(["--backend-opt", r#"script={"bye": ["fatal"]}"#])
        .arg("--dataset")
        .arg(&data)
        .arg("--output-dir")
        .arg(&out)
        .assert()
        .code(1);

    let records = read_records(&out);
    assert_eq!(records.len(), 2);
    let bye = records.iter().find(|r| r["sample_id"] == "bye").unwrap();
    assert_eq!(bye["status"], "error");
    assert_eq!(bye["attempts"], 1);
    assert_eq!(bye["error"]["type"], "mock_fatal");
}

#[test]
fn config_file_supplies_backend_and_policy() {
    let tmp = tempfile::tempdir().unwrap();
    let data = write_dataset(tmp.path());
    let out = tmp.path().join("out");
    let cfg = tmp.path().join("parley.yaml");
    std::fs::write(
        &cfg,
        "runner:\n  max_concurrency: 1\n  timeout_seconds: 5\nrun:\n  backend: mock\n  backend_options:\n    response: \"{sample_id} says {input}\"\n",
    )
    .unwrap();

    parley()
        .args(["run", "--progress"])
        .arg("--config")
        .arg(&cfg)
        .arg("--dataset")
        .arg(&data)
        .arg("--output-dir")
        .arg(&out)
        .assert()
        .code(0)
        .stderr(predicate::str::contains("[2/2]"));

    let records = read_records(&out);
    let bye = records.iter().find(|r| r["sample_id"] == "bye").unwrap();
    assert_eq!(bye["response"]["text"], "bye says goodbye");
}

#[test]
fn unknown_backend_is_a_config_error() {
    let tmp = tempfile::tempdir().unwrap();
    let data = write_dataset(tmp.path());

    parley()
        .args(["run", "--backend", "telepathy"])
        .arg("--dataset")
        .arg(&data)
        .arg("--output-dir")
        .arg(tmp.path().join("out"))
        .assert()
        .code(2)
        .stderr(predicate::str::contains("telepathy"));
}

#[test]
fn unconfigured_backend_records_every_sample() {
    let tmp = tempfile::tempdir().unwrap();
    let data = write_dataset(tmp.path());
    let out = tmp.path().join("out");

    parley()
        .args(["run", "--backend", "process"])
        .arg("--dataset")
        .arg(&data)
        .arg("--output-dir")
        .arg(&out)
        .assert()
        .code(1)
        .stdout(predicate::str::contains("2 records (0 ok"));

    let records = read_records(&out);
    assert_eq!(records.len(), 2);
    for r in &records {
        assert_eq!(r["status"], "error");
        assert_eq!(r["attempts"], 1);
        assert_eq!(r["error"]["type"], "config");
    }
}

#[test]
fn missing_dataset_is_a_config_error() {
    let tmp = tempfile::tempdir().unwrap();
    parley()
        .args(["run", "--backend", "mock"])
        .arg("--dataset")
        .arg(tmp.path().join("nowhere.jsonl"))
        .arg("--output-dir")
        .arg(tmp.path().join("out"))
        .assert()
        .code(2)
        .stderr(predicate::str::contains("not found"));
}
