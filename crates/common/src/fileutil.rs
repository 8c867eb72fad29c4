//! Log-file naming and creation
//!
//! Log files live at `<logDir>/<safeName>.<yyyymmdd.HHMMSS.mmm>.<runID[:8]>`
//! with suffix `.out`/`.err` (separate streams) or `.log` (merged), mode
//! 0600.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

/// Replace every character outside `[A-Za-z0-9_.-]` with `_`.
#[must_use]
pub fn safe_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Base log filename (no stream suffix) for a step execution.
#[must_use]
pub fn log_file_base(name: &str, ts: DateTime<Utc>, dag_run_id: &str) -> String {
    let stamp = ts.format("%Y%m%d.%H%M%S.%3f");
    let short_id: String = dag_run_id.chars().take(8).collect();
    format!("{}.{stamp}.{short_id}", safe_name(name))
}

/// Full path for one stream of a step's log output.
#[must_use]
pub fn log_file_path(log_dir: &Path, base: &str, suffix: &str) -> PathBuf {
    log_dir.join(format!("{base}{suffix}"))
}

/// Open a log file for appending, creating it with permissions 0600.
pub fn open_log_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut options = OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_name_keeps_allowed_chars() {
        assert_eq!(safe_name("step_1.retry-x"), "step_1.retry-x");
        assert_eq!(safe_name("step one/two"), "step_one_two");
        assert_eq!(safe_name("päck"), "p_ck");
    }

    #[test]
    fn log_base_layout() {
        let ts = DateTime::parse_from_rfc3339("2026-03-01T12:34:56.789Z")
            .unwrap()
            .with_timezone(&Utc);
        let base = log_file_base("extract data", ts, "0194b1c2d3e4f5a6");
        assert_eq!(base, "extract_data.20260301.123456.789.0194b1c2");
    }

    #[cfg(unix)]
    #[test]
    fn log_files_are_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("step.out");
        let _file = open_log_file(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
