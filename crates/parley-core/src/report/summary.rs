use crate::model::{ResultRecord, RunStatus};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Spread {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
}

impl Spread {
    fn of(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let avg = values.iter().sum::<f64>() / values.len() as f64;
        Some(Self { min, max, avg })
    }
}

/// Aggregate view of a finished job, written next to the records.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub status_counts: BTreeMap<RunStatus, usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<Spread>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<Spread>,
}

impl RunSummary {
    pub fn from_records(records: &[ResultRecord]) -> Self {
        let mut status_counts = BTreeMap::new();
        for r in records {
            *status_counts.entry(r.status).or_insert(0) += 1;
        }
        let latencies: Vec<f64> = records.iter().map(|r| r.latency_ms).collect();
        let tokens: Vec<f64> = records
            .iter()
            .filter_map(|r| r.response.as_ref()?.usage.as_ref()?.total_tokens)
            .map(|t| t as f64)
            .collect();
        Self {
            total: records.len(),
            status_counts,
            latency_ms: Spread::of(&latencies),
            total_tokens: Spread::of(&tokens),
        }
    }

    pub fn count(&self, status: RunStatus) -> usize {
        self.status_counts.get(&status).copied().unwrap_or(0)
    }

    pub fn all_ok(&self) -> bool {
        self.count(RunStatus::Ok) == self.total
    }
}
