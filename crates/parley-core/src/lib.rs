pub mod backend;
pub mod config;
pub mod dataset;
pub mod engine;
pub mod errors;
pub mod model;
pub mod report;
pub mod storage;

pub use backend::{BackendRegistry, ChatBackend, RunnerContext};
pub use engine::{Job, RunStream, Runner};
pub use errors::{ClassifiedError, ErrorKind, RegistryError};
pub use model::{
    ChatResponse, DatasetInfo, ExecutionPolicy, Message, ResultRecord, Role, RunConfig,
    RunRequest, RunStatus, Sample, TokenUsage,
};
