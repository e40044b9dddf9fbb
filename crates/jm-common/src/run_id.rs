//! ULIDs for records and for this process.
//!
//! Tasks, candidates, job postings, weight records and search sessions all
//! take a fresh ULID, so lexical order follows creation order.

use once_cell::sync::Lazy;
use ulid::Ulid;

static PROCESS_ULID: Lazy<Ulid> = Lazy::new(Ulid::new);
static PROCESS_ID: Lazy<String> = Lazy::new(|| PROCESS_ULID.to_string());

/// Id of this process. Stable for its whole lifetime.
pub fn get() -> &'static str {
    PROCESS_ID.as_str()
}

pub fn generate() -> String {
    Ulid::new().to_string()
}

/// `<prefix>-<process id>`; the default `locked_by` tag of a worker.
pub fn worker_tag(prefix: &str) -> String {
    format!("{prefix}-{}", get())
}
