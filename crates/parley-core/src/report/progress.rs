//! Progress reporting for job runs. The runner emits done/total in completion
//! order; the CLI (or any caller) consumes it via a sink.

use crate::model::ResultRecord;
use std::sync::{Arc, Mutex};

/// One progress update: how many samples are done and the total count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEvent {
    pub done: usize,
    pub total: usize,
}

/// Sink for progress events. Called each time a sample reaches a terminal state.
pub type ProgressSink = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// Shared completion counter. Events are emitted under the lock, so `done` is
/// strictly increasing as observed by the sink.
pub(crate) struct ProgressTracker {
    done: Mutex<usize>,
    total: usize,
    sink: Option<ProgressSink>,
}

impl ProgressTracker {
    pub(crate) fn new(total: usize, sink: Option<ProgressSink>) -> Self {
        Self {
            done: Mutex::new(0),
            total,
            sink,
        }
    }

    pub(crate) fn complete(&self, record: &ResultRecord) {
        let mut done = match self.done.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *done += 1;
        tracing::info!(
            sample = %record.sample_id,
            status = %record.status,
            attempts = record.attempts,
            "progress {}/{}",
            *done,
            self.total
        );
        if let Some(sink) = &self.sink {
            sink(ProgressEvent {
                done: *done,
                total: self.total,
            });
        }
    }
}
