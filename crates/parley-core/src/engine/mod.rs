pub mod attempt;
pub mod backoff;
pub mod rate_limit;
pub mod runner;

pub use attempt::{build_trace_id, AttemptState};
pub use rate_limit::RateLimiter;
pub use runner::{Job, RunStream, Runner};
