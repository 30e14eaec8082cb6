//! Per-sample attempt loop.
//!
//! `Pending -> Attempting -> {Succeeded | RetryWait -> Attempting | Failed}`.
//! Attempts for one sample are strictly sequential; only the final attempt is
//! folded into the [`ResultRecord`].

use super::backoff::{backoff_delay, should_retry};
use super::rate_limit::RateLimiter;
use crate::backend::ChatBackend;
use crate::errors::{panic_message, ClassifiedError};
use crate::model::{
    ChatResponse, DatasetInfo, ExecutionPolicy, RequestContext, RequestEcho, ResultRecord,
    RunConfig, RunRequest, RunStatus, Sample,
};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Pending,
    Attempting,
    RetryWait,
    Succeeded,
    Failed,
}

impl AttemptState {
    pub fn is_terminal(self) -> bool {
        matches!(self, AttemptState::Succeeded | AttemptState::Failed)
    }

    /// Legal edges of the per-sample machine.
    pub fn can_transition_to(self, next: AttemptState) -> bool {
        use AttemptState::*;
        matches!(
            (self, next),
            (Pending, Attempting)
                | (Attempting, Succeeded)
                | (Attempting, RetryWait)
                | (Attempting, Failed)
                | (RetryWait, Attempting)
        )
    }
}

/// One try of one sample. Discarded once folded into the record.
#[derive(Debug)]
pub struct Attempt {
    pub number: u32,
    pub started_at: DateTime<Utc>,
    pub latency: Duration,
    pub outcome: Result<ChatResponse, ClassifiedError>,
}

/// Job-wide state every sample task reads. The gate and limiter are the only mutable parts.
pub(crate) struct JobContext {
    pub backend: Arc<dyn ChatBackend>,
    pub backend_name: String,
    pub run_config: Arc<RunConfig>,
    pub recorded_config: RunConfig,
    pub dataset: Arc<DatasetInfo>,
    pub policy: ExecutionPolicy,
    pub gate: Arc<Semaphore>,
    pub limiter: Arc<RateLimiter>,
}

struct SampleMachine<'a> {
    sample_id: &'a str,
    state: AttemptState,
}

impl<'a> SampleMachine<'a> {
    fn new(sample_id: &'a str) -> Self {
        Self {
            sample_id,
            state: AttemptState::Pending,
        }
    }

    fn enter(&mut self, next: AttemptState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!(sample = self.sample_id, from = ?self.state, to = ?next, "transition");
        self.state = next;
    }
}

/// `<prefix>-<sample_id>-<8 hex>`; an empty prefix becomes `run`.
pub fn build_trace_id(prefix: &str, sample_id: &str) -> String {
    let prefix = if prefix.is_empty() { "run" } else { prefix };
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", prefix, sample_id, &suffix[..8])
}

/// Terminal status for a failed sample.
pub fn failure_status(error: &ClassifiedError) -> RunStatus {
    if error.is_timeout() {
        RunStatus::Timeout
    } else if error.retryable {
        RunStatus::Retry
    } else {
        RunStatus::Error
    }
}

pub(crate) async fn run_sample(ctx: &JobContext, sample: Arc<Sample>) -> ResultRecord {
    let trace_id = build_trace_id(&ctx.policy.trace_prefix, &sample.id);
    let mut machine = SampleMachine::new(&sample.id);
    let mut number = 0u32;

    loop {
        number += 1;
        machine.enter(AttemptState::Attempting);
        let attempt = execute_attempt(ctx, &sample, &trace_id, number).await;

        let retry = match &attempt.outcome {
            Ok(_) => None,
            Err(error) => {
                warn!(
                    sample = %sample.id,
                    attempt = number,
                    kind = %error.kind,
                    error_type = %error.error_type,
                    retryable = error.retryable,
                    "attempt failed: {}",
                    error.message
                );
                Some(should_retry(error, number, ctx.policy.max_retries))
            }
        };

        let Some(retry) = retry else {
            machine.enter(AttemptState::Succeeded);
            debug!(sample = %sample.id, attempts = number, "sample ok");
            return finalize(ctx, &sample, trace_id, attempt);
        };

        if retry {
            machine.enter(AttemptState::RetryWait);
            let delay = backoff_delay(
                number,
                ctx.policy.retry_backoff_factor,
                ctx.policy.retry_backoff_jitter,
                &mut rand::thread_rng(),
            );
            debug!(sample = %sample.id, delay_ms = delay.as_millis() as u64, "backing off");
            tokio::time::sleep(delay).await;
            continue;
        }

        machine.enter(AttemptState::Failed);
        return finalize(ctx, &sample, trace_id, attempt);
    }
}

async fn execute_attempt(
    ctx: &JobContext,
    sample: &Arc<Sample>,
    trace_id: &str,
    number: u32,
) -> Attempt {
    let started_at = Utc::now();
    let clock = Instant::now();
    let request = RunRequest {
        sample: sample.clone(),
        run_config: ctx.run_config.clone(),
        dataset: ctx.dataset.clone(),
        trace_id: trace_id.to_string(),
        attempt: number,
        timeout: ctx.policy.timeout,
    };

    ctx.limiter.acquire().await;
    let outcome = match ctx.gate.acquire().await {
        Ok(_permit) => call_backend(ctx, &request).await,
        Err(_) => Err(ClassifiedError::exception("concurrency gate closed")),
    };

    Attempt {
        number,
        started_at,
        latency: clock.elapsed(),
        outcome,
    }
}

/// One backend call under the per-attempt deadline. Panics become `exception`.
async fn call_backend(ctx: &JobContext, request: &RunRequest) -> Result<ChatResponse, ClassifiedError> {
    let call = AssertUnwindSafe(ctx.backend.send(request)).catch_unwind();
    match tokio::time::timeout(ctx.policy.timeout, call).await {
        Err(_) => Err(ClassifiedError::timeout("Request timed out")),
        Ok(Ok(result)) => result,
        Ok(Err(payload)) => {
            let message = panic_message(payload.as_ref());
            tracing::error!(sample = %request.sample.id, attempt = request.attempt, "backend panicked: {message}");
            Err(ClassifiedError::exception(message))
        }
    }
}

fn finalize(ctx: &JobContext, sample: &Sample, trace_id: String, attempt: Attempt) -> ResultRecord {
    let (status, response, error) = match attempt.outcome {
        Ok(resp) => (RunStatus::Ok, Some(resp), None),
        Err(err) => (failure_status(&err), None, Some(err)),
    };
    build_record(ctx, sample, trace_id, attempt.number, attempt.started_at, attempt.latency, status, response, error)
}

/// Record for a sample whose task faulted outside the attempt loop.
pub(crate) fn fault_record(ctx: &JobContext, sample: &Sample, message: String) -> ResultRecord {
    let trace_id = build_trace_id(&ctx.policy.trace_prefix, &sample.id);
    build_record(
        ctx,
        sample,
        trace_id,
        1,
        Utc::now(),
        Duration::ZERO,
        RunStatus::Error,
        None,
        Some(ClassifiedError::exception(message)),
    )
}

#[allow(clippy::too_many_arguments)]
fn build_record(
    ctx: &JobContext,
    sample: &Sample,
    trace_id: String,
    attempts: u32,
    started_at: DateTime<Utc>,
    latency: Duration,
    status: RunStatus,
    response: Option<ChatResponse>,
    error: Option<ClassifiedError>,
) -> ResultRecord {
    ResultRecord {
        sample_id: sample.id.clone(),
        dataset_id: ctx.dataset.dataset_id.clone(),
        backend: ctx.backend_name.clone(),
        trace_id,
        status,
        attempts,
        latency_ms: latency.as_secs_f64() * 1000.0,
        started_at,
        completed_at: Utc::now(),
        run_config: ctx.recorded_config.clone(),
        request: RequestEcho {
            messages: sample.messages.clone(),
            context: RequestContext {
                sample_tags: sample.tags.clone(),
                sample_metadata: sample.metadata.clone(),
                attempt: attempts,
            },
        },
        response,
        error,
    }
}
