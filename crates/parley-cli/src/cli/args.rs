use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "parley",
    version,
    about = "Run conversational test datasets against chat backends"
)]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Command,

    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(long, global = true, default_value = "info", env = "PARLEY_LOG_LEVEL")]
    pub log_level: String,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Execute every sample of a dataset against one backend
    Run(RunArgs),
    /// List the registered backend names
    Backends,
}

#[derive(Parser, Clone, Debug)]
pub struct RunArgs {
    /// Dataset JSONL file, or a directory holding test.jsonl and metadata.json
    #[arg(long)]
    pub dataset: PathBuf,

    /// metadata.json path when the dataset is a single file
    #[arg(long)]
    pub metadata: Option<PathBuf>,

    /// Backend name (openai, process, adb-cli, adb-cli-freeform, mock)
    #[arg(long)]
    pub backend: Option<String>,

    #[arg(long)]
    pub model: Option<String>,

    /// Call parameter key=value (repeatable; value parsed as JSON when possible)
    #[arg(long = "param", value_name = "KEY=VALUE")]
    pub params: Vec<String>,

    /// Backend construction option key=value (repeatable)
    #[arg(long = "backend-opt", value_name = "KEY=VALUE")]
    pub backend_opts: Vec<String>,

    /// YAML or JSON file with `runner:` and `run:` sections; flags override it
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub max_concurrency: Option<usize>,

    /// Per-attempt timeout in seconds
    #[arg(long)]
    pub timeout: Option<f64>,

    /// Retries on retryable errors (attempts = retries + 1)
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Max request starts per second across the job
    #[arg(long)]
    pub rate_limit: Option<f64>,

    #[arg(long)]
    pub trace_prefix: Option<String>,

    /// Directory for run_results.jsonl and run_metadata.json
    #[arg(long)]
    pub output_dir: PathBuf,

    /// Write each record as soon as it completes
    #[arg(long)]
    pub stream: bool,

    /// Print done/total to stderr as samples complete
    #[arg(long)]
    pub progress: bool,
}
