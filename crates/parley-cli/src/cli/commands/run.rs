use super::super::args::RunArgs;
use crate::exit_codes;
use anyhow::{bail, Context};
use futures::StreamExt;
use parley_core::config::{parse_kv_pairs, ParleyConfig};
use parley_core::dataset::load_dataset;
use parley_core::report::{ProgressEvent, RunSummary};
use parley_core::storage::{self, ResultsWriter};
use parley_core::{
    BackendRegistry, ExecutionPolicy, Job, RegistryError, ResultRecord, RunConfig, RunStatus,
    Runner,
};
use std::sync::Arc;

pub(crate) async fn run(args: RunArgs) -> anyhow::Result<i32> {
    let cfg = match &args.config {
        Some(path) => ParleyConfig::load(path)?,
        None => ParleyConfig::default(),
    };
    let policy = build_policy(&args, &cfg)?;
    let run_config = build_run_config(&args, &cfg)?;

    let registry = BackendRegistry::with_defaults();
    if !registry.contains(&run_config.backend) {
        return Err(RegistryError::Unknown {
            name: run_config.backend.clone(),
            available: registry.names(),
        }
        .into());
    }

    let (dataset, samples) = load_dataset(&args.dataset, args.metadata.as_deref())
        .with_context(|| format!("failed to load dataset {}", args.dataset.display()))?;

    let mut runner = Runner::new(registry);
    if args.progress {
        runner = runner.with_progress(Arc::new(|ev: ProgressEvent| {
            eprintln!("[{}/{}]", ev.done, ev.total);
        }));
    }
    let job = Job::new(dataset.clone(), samples, run_config.clone(), policy.clone());

    let (records, interrupted) = if args.stream {
        stream_to_disk(&runner, job, &args).await?
    } else {
        let records = runner.run(job).await?;
        storage::write_run_results(&records, &args.output_dir)?;
        (records, false)
    };
    let meta_path =
        storage::write_run_metadata(&dataset, &run_config, &policy, &records, &args.output_dir)?;

    let summary = RunSummary::from_records(&records);
    println!(
        "{} records ({} ok, {} retry, {} timeout, {} error) -> {}",
        summary.total,
        summary.count(RunStatus::Ok),
        summary.count(RunStatus::Retry),
        summary.count(RunStatus::Timeout),
        summary.count(RunStatus::Error),
        args.output_dir.display()
    );
    tracing::debug!(metadata = %meta_path.display(), "run metadata written");

    Ok(if interrupted {
        exit_codes::INTERRUPTED
    } else if summary.all_ok() {
        exit_codes::SUCCESS
    } else {
        exit_codes::SAMPLES_FAILED
    })
}

/// Streams records to `run_results.jsonl` as they complete. Ctrl-C cancels
/// the remaining samples and keeps what already finished.
async fn stream_to_disk(
    runner: &Runner,
    job: Job,
    args: &RunArgs,
) -> anyhow::Result<(Vec<ResultRecord>, bool)> {
    let mut stream = runner.run_stream(job)?;
    let mut writer = ResultsWriter::create(&args.output_dir)?;
    let mut records = Vec::with_capacity(stream.total());
    let mut interrupted = false;

    loop {
        tokio::select! {
            next = stream.next() => match next {
                Some(record) => {
                    writer.append(&record)?;
                    records.push(record);
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                tracing::warn!("interrupted; cancelling outstanding samples");
                stream.cancel();
                interrupted = true;
            }
        }
    }
    let path = writer.finish()?;
    tracing::info!(path = %path.display(), records = records.len(), "results written");
    Ok((records, interrupted))
}

fn build_policy(args: &RunArgs, cfg: &ParleyConfig) -> anyhow::Result<ExecutionPolicy> {
    let mut settings = cfg.runner.clone();
    if let Some(v) = args.max_concurrency {
        settings.max_concurrency = v;
    }
    if let Some(v) = args.timeout {
        settings.timeout_seconds = v;
    }
    if let Some(v) = args.max_retries {
        settings.max_retries = v;
    }
    if let Some(v) = args.rate_limit {
        settings.rate_limit_per_second = Some(v);
    }
    if let Some(v) = &args.trace_prefix {
        settings.trace_prefix = v.clone();
    }
    Ok(settings.to_policy()?)
}

fn build_run_config(args: &RunArgs, cfg: &ParleyConfig) -> anyhow::Result<RunConfig> {
    let Some(backend) = args.backend.clone().or_else(|| cfg.run.backend.clone()) else {
        bail!("no backend selected: pass --backend or set run.backend in the config file");
    };
    let mut parameters = cfg.run.parameters.clone();
    parameters.extend(parse_kv_pairs(&args.params)?);
    let mut backend_options = cfg.run.backend_options.clone();
    backend_options.extend(parse_kv_pairs(&args.backend_opts)?);
    Ok(RunConfig {
        backend,
        model: args.model.clone().or_else(|| cfg.run.model.clone()),
        parameters,
        backend_options,
        metadata: None,
    })
}
