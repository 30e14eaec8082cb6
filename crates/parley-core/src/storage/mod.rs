//! On-disk output of a run: `run_results.jsonl` (one record per line) and
//! `run_metadata.json` (dataset, config, policy, summary).

use crate::model::{DatasetInfo, ExecutionPolicy, ResultRecord, RunConfig};
use crate::report::RunSummary;
use anyhow::Context;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub const RESULTS_FILE: &str = "run_results.jsonl";
pub const METADATA_FILE: &str = "run_metadata.json";

/// Appends records as they complete, so a streaming run leaves partial output behind.
pub struct ResultsWriter {
    path: PathBuf,
    out: BufWriter<File>,
    written: usize,
}

impl ResultsWriter {
    pub fn create(output_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(output_dir)
            .with_context(|| format!("failed to create output dir {}", output_dir.display()))?;
        let path = output_dir.join(RESULTS_FILE);
        let file = File::create(&path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        Ok(Self {
            path,
            out: BufWriter::new(file),
            written: 0,
        })
    }

    pub fn append(&mut self, record: &ResultRecord) -> anyhow::Result<()> {
        serde_json::to_writer(&mut self.out, record)?;
        self.out.write_all(b"\n")?;
        self.out.flush()?;
        self.written += 1;
        Ok(())
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn finish(mut self) -> anyhow::Result<PathBuf> {
        self.out.flush()?;
        Ok(self.path)
    }
}

/// Batch counterpart of [`ResultsWriter`]: the file appears complete or not at
/// all, written through a temp file in `output_dir` and renamed into place.
pub fn write_run_results(records: &[ResultRecord], output_dir: &Path) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("failed to create output dir {}", output_dir.display()))?;
    let path = output_dir.join(RESULTS_FILE);
    let tmp = tempfile::NamedTempFile::new_in(output_dir)?;
    let mut out = BufWriter::new(tmp);
    for record in records {
        serde_json::to_writer(&mut out, record)?;
        out.write_all(b"\n")?;
    }
    let tmp = out.into_inner().map_err(|e| e.into_error())?;
    tmp.persist(&path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

pub fn read_run_results(path: &Path) -> anyhow::Result<Vec<ResultRecord>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("{}:{}: invalid record", path.display(), i + 1))
        })
        .collect()
}

/// Metadata is written through a temp file and renamed into place.
pub fn write_run_metadata(
    dataset: &DatasetInfo,
    run_config: &RunConfig,
    policy: &ExecutionPolicy,
    records: &[ResultRecord],
    output_dir: &Path,
) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("failed to create output dir {}", output_dir.display()))?;
    let payload = serde_json::json!({
        "generated_at": chrono::Utc::now().to_rfc3339(),
        "dataset": dataset,
        "run_config": run_config.redacted(),
        "options": policy.to_metadata(),
        "summary": RunSummary::from_records(records),
    });
    let path = output_dir.join(METADATA_FILE);
    let mut tmp = tempfile::NamedTempFile::new_in(output_dir)?;
    serde_json::to_writer_pretty(&mut tmp, &payload)?;
    tmp.write_all(b"\n")?;
    tmp.persist(&path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}
