//! Command layer. Each command turns its clap arguments into one config
//! value, then calls a library `run` function. The umbrella binary and the
//! per-script binaries share these.
pub mod export;
pub mod import;
pub mod merge_breeders;

use chrono::Utc;

use crate::normalization::format_run_id;

/// Explicit run id, or one derived from the current UTC time.
pub fn resolve_run_id(explicit: Option<String>) -> String {
    explicit
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| format_run_id(Utc::now()))
}
