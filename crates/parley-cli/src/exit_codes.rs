//! Process exit codes. Part of the CLI contract; scripts and CI key off these.

pub const SUCCESS: i32 = 0;
pub const SAMPLES_FAILED: i32 = 1; // At least one record is not `ok`
pub const CONFIG_ERROR: i32 = 2; // Bad flags, config, dataset, or unknown backend
pub const INTERRUPTED: i32 = 130; // Cancelled with Ctrl-C
