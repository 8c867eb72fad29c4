//! Per-run control socket addresses
//!
//! Each active run exposes a unix socket under the OS temp directory. The
//! filename is deterministic in `(dag name, run id)` and capped at 50
//! characters: a fixed prefix, the sanitized DAG name (truncated to fit),
//! and a 6-hex-char digest that keeps distinct runs from colliding.

use std::path::PathBuf;

use crate::fileutil::safe_name;

/// Prefix shared by every control socket filename.
pub const SOCK_PREFIX: &str = "@dagforge_";

/// Maximum filename length, prefix + hash + suffix included.
pub const MAX_SOCK_NAME_LEN: usize = 50;

const HASH_LEN: usize = 6;
const SUFFIX: &str = ".sock";

/// Filesystem path of the control socket for `(name, dag_run_id)`.
#[must_use]
pub fn sock_addr(name: &str, dag_run_id: &str) -> PathBuf {
    std::env::temp_dir().join(sock_name(name, dag_run_id))
}

/// Deterministic socket filename for `(name, dag_run_id)`, ≤50 chars.
#[must_use]
pub fn sock_name(name: &str, dag_run_id: &str) -> String {
    let digest = md5::compute(format!("{name}{dag_run_id}"));
    let hash = format!("{digest:x}");
    let hash = &hash[..HASH_LEN];

    // prefix + name + '_' + hash + ".sock" must fit in the cap
    let budget = MAX_SOCK_NAME_LEN - SOCK_PREFIX.len() - 1 - HASH_LEN - SUFFIX.len();
    let mut base = safe_name(name);
    base.truncate(budget);
    format!("{SOCK_PREFIX}{base}_{hash}{SUFFIX}")
}
