use super::attempt::{self, JobContext};
use super::rate_limit::RateLimiter;
use crate::backend::{BackendRegistry, ChatBackend, RunnerContext};
use crate::errors::{panic_message, ClassifiedError, RegistryError};
use crate::model::{
    ChatResponse, DatasetInfo, ExecutionPolicy, ResultRecord, RunConfig, RunRequest, Sample,
};
use crate::report::progress::{ProgressSink, ProgressTracker};
use async_trait::async_trait;
use futures::{FutureExt, Stream, StreamExt};
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;

/// Everything one job needs: what to send, where, and under which policy.
#[derive(Debug, Clone)]
pub struct Job {
    pub dataset: DatasetInfo,
    pub samples: Vec<Sample>,
    pub run_config: RunConfig,
    pub policy: ExecutionPolicy,
}

impl Job {
    pub fn new(
        dataset: DatasetInfo,
        samples: Vec<Sample>,
        run_config: RunConfig,
        policy: ExecutionPolicy,
    ) -> Self {
        Self {
            dataset,
            samples,
            run_config,
            policy,
        }
    }
}

pub struct Runner {
    registry: Arc<BackendRegistry>,
    progress: Option<ProgressSink>,
}

impl Runner {
    pub fn new(registry: BackendRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            progress: None,
        }
    }

    pub fn with_progress(mut self, sink: ProgressSink) -> Self {
        self.progress = Some(sink);
        self
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// Start the job and yield records in completion order.
    ///
    /// An unknown backend is the only error returned; every per-sample failure
    /// is a record, including a backend that rejected its configuration. Must
    /// be called from within a tokio runtime.
    pub fn run_stream(&self, job: Job) -> Result<RunStream, RegistryError> {
        let Job {
            dataset,
            samples,
            run_config,
            policy,
        } = job;
        let backend_name = run_config.backend.clone();
        let context = RunnerContext {
            backend: backend_name.clone(),
            run_config: run_config.clone(),
            trace_prefix: policy.trace_prefix.clone(),
        };
        let backend: Arc<dyn ChatBackend> = match self
            .registry
            .create(&backend_name, &context, &run_config.backend_options)
        {
            Ok(backend) => backend,
            Err(RegistryError::Configure { name, source }) => {
                tracing::warn!(
                    backend = %name,
                    error_type = %source.error_type,
                    "backend rejected its configuration, every sample will fail: {}",
                    source.message
                );
                Arc::new(Unconfigured::new(name, source))
            }
            Err(e) => return Err(e),
        };

        let total = samples.len();
        tracing::info!(
            dataset = dataset.dataset_id.as_deref().unwrap_or("-"),
            backend = %backend_name,
            model = run_config.model.as_deref().unwrap_or("-"),
            samples = total,
            concurrency = policy.effective_concurrency(),
            "starting job"
        );

        let ctx = Arc::new(JobContext {
            backend,
            backend_name,
            recorded_config: run_config.redacted(),
            run_config: Arc::new(run_config),
            dataset: Arc::new(dataset),
            gate: Arc::new(Semaphore::new(policy.effective_concurrency())),
            limiter: Arc::new(RateLimiter::new(policy.rate_limit_per_second)),
            policy,
        });
        let progress = Arc::new(ProgressTracker::new(total, self.progress.clone()));
        let (tx, rx) = mpsc::unbounded_channel();
        let mut tasks = JoinSet::new();

        for sample in samples {
            let sample = Arc::new(sample);
            let ctx = ctx.clone();
            let progress = progress.clone();
            let tx = tx.clone();
            tasks.spawn(async move {
                let outcome = AssertUnwindSafe(attempt::run_sample(&ctx, sample.clone()))
                    .catch_unwind()
                    .await;
                let record = match outcome {
                    Ok(record) => record,
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        tracing::error!(sample = %sample.id, "sample task faulted: {message}");
                        attempt::fault_record(&ctx, &sample, message)
                    }
                };
                let reported =
                    std::panic::catch_unwind(AssertUnwindSafe(|| progress.complete(&record)));
                if let Err(payload) = reported {
                    let message = panic_message(payload.as_ref());
                    tracing::error!(sample = %record.sample_id, "progress sink panicked: {message}");
                }
                // The receiver is gone only when the caller dropped the stream.
                let _ = tx.send(record);
            });
        }
        drop(tx);

        Ok(RunStream {
            records: rx,
            tasks,
            total,
            yielded: 0,
        })
    }

    /// Batch mode: the same records as [`Runner::run_stream`], collected.
    pub async fn run(&self, job: Job) -> Result<Vec<ResultRecord>, RegistryError> {
        let mut stream = self.run_stream(job)?;
        let mut records = Vec::with_capacity(stream.total());
        while let Some(record) = stream.next().await {
            records.push(record);
        }
        tracing::info!(records = records.len(), "job finished");
        Ok(records)
    }
}

/// Stands in for a backend whose `configure` failed: every attempt fails with
/// that error, without I/O. The backend is never rebuilt, so it is terminal.
struct Unconfigured {
    name: String,
    error: ClassifiedError,
}

impl Unconfigured {
    fn new(name: String, mut error: ClassifiedError) -> Self {
        error.retryable = false;
        Self { name, error }
    }
}

#[async_trait]
impl ChatBackend for Unconfigured {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, _request: &RunRequest) -> Result<ChatResponse, ClassifiedError> {
        Err(self.error.clone())
    }
}

/// Records of a running job, in completion order.
///
/// Dropping the stream cancels every outstanding sample; cancelled samples
/// produce no record.
pub struct RunStream {
    records: mpsc::UnboundedReceiver<ResultRecord>,
    tasks: JoinSet<()>,
    total: usize,
    yielded: usize,
}

impl RunStream {
    pub fn total(&self) -> usize {
        self.total
    }

    /// Abort all outstanding samples. Records already produced are still yielded.
    pub fn cancel(&mut self) {
        tracing::info!(
            pending = self.total - self.yielded,
            "cancelling job"
        );
        self.tasks.abort_all();
    }
}

impl Stream for RunStream {
    type Item = ResultRecord;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let polled = this.records.poll_recv(cx);
        if let Poll::Ready(Some(_)) = &polled {
            this.yielded += 1;
        }
        polled
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.total - self.yielded))
    }
}

impl std::fmt::Debug for RunStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunStream")
            .field("total", &self.total)
            .field("yielded", &self.yielded)
            .field("running", &self.tasks.len())
            .finish()
    }
}
