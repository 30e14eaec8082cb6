//! JSONL dataset loading.
//!
//! A dataset is either a directory holding `test.jsonl` (and optionally
//! `metadata.json`), or a single JSONL file with an optional metadata path.

use crate::model::{DatasetInfo, Options, Sample};
use serde_json::Value;
use std::path::{Path, PathBuf};

pub const SAMPLES_FILE: &str = "test.jsonl";
pub const METADATA_FILE: &str = "metadata.json";

#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("dataset samples file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("{}:{line}: {message}", .path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub fn load_dataset(
    path: &Path,
    metadata_path: Option<&Path>,
) -> Result<(DatasetInfo, Vec<Sample>), DatasetError> {
    let (samples_path, meta_path) = if path.is_dir() {
        (
            path.join(SAMPLES_FILE),
            Some(metadata_path.map_or_else(|| path.join(METADATA_FILE), Path::to_path_buf)),
        )
    } else {
        (path.to_path_buf(), metadata_path.map(Path::to_path_buf))
    };
    if !samples_path.is_file() {
        return Err(DatasetError::NotFound(samples_path));
    }

    let text = read(&samples_path)?;
    let mut samples = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let sample: Sample = serde_json::from_str(line).map_err(|e| DatasetError::Parse {
            path: samples_path.clone(),
            line: idx + 1,
            message: e.to_string(),
        })?;
        samples.push(sample);
    }

    let info = match meta_path.filter(|p| p.is_file()) {
        Some(p) => dataset_info(&p, &read(&p)?)?,
        None => DatasetInfo::default(),
    };
    tracing::debug!(
        path = %samples_path.display(),
        samples = samples.len(),
        dataset = info.dataset_id.as_deref().unwrap_or("-"),
        "loaded dataset"
    );
    Ok((info, samples))
}

fn read(path: &Path) -> Result<String, DatasetError> {
    std::fs::read_to_string(path).map_err(|source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn dataset_info(path: &Path, text: &str) -> Result<DatasetInfo, DatasetError> {
    let meta: Options = serde_json::from_str(text).map_err(|e| DatasetError::Parse {
        path: path.to_path_buf(),
        line: e.line(),
        message: e.to_string(),
    })?;
    let field = |key: &str| match meta.get(key) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    };
    Ok(DatasetInfo {
        dataset_id: field("dataset_id"),
        name: field("name"),
        version: field("version"),
        source: field("source"),
        metadata: Some(meta),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLES: &str = r#"{"id": "s1", "messages": [{"role": "user", "content": "hi"}]}

{"id": 2, "messages": [{"role": "system", "content": "be brief"}, {"role": "user", "content": "why?"}], "tags": ["smoke"]}
"#;

    #[test]
    fn loads_directory_layout() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(SAMPLES_FILE), SAMPLES).unwrap();
        std::fs::write(
            dir.path().join(METADATA_FILE),
            r#"{"dataset_id": "faq", "name": "FAQ", "version": 3}"#,
        )
        .unwrap();

        let (info, samples) = load_dataset(dir.path(), None).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[1].id, "2");
        assert_eq!(samples[1].tags.as_deref(), Some(&["smoke".to_string()][..]));
        assert_eq!(info.dataset_id.as_deref(), Some("faq"));
        assert_eq!(info.version.as_deref(), Some("3"));
        assert!(info.source.is_none());
    }

    #[test]
    fn single_file_without_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cases.jsonl");
        std::fs::write(&path, SAMPLES).unwrap();
        let (info, samples) = load_dataset(&path, None).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(info, DatasetInfo::default());
    }

    #[test]
    fn reports_bad_line_number() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cases.jsonl");
        std::fs::write(&path, "{\"id\": \"a\"}\n{not json}\n").unwrap();
        match load_dataset(&path, None) {
            Err(DatasetError::Parse { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn missing_samples_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_dataset(dir.path(), None),
            Err(DatasetError::NotFound(_))
        ));
    }
}
