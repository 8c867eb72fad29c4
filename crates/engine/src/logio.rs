//! Per-node log IO
//!
//! Each node exclusively owns its writers; readers (the continue-on
//! pattern scanner) go through the same lock. Writers are buffered with a
//! periodic background flush so in-progress logs stay visible.

use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use dagforge_common::error::{Error, Result};
use dagforge_common::fileutil::{log_file_path, open_log_file};
use dagforge_core::step::LogOutput;

/// Interval of the background flush task.
pub const FLUSH_INTERVAL: Duration = Duration::from_millis(500);

struct WriterInner {
    file: Option<BufWriter<std::fs::File>>,
}

/// Cloneable handle to one buffered log file.
///
/// Clones share the same file and lock; with merged output both streams
/// hold clones of a single writer and interleave in arrival order.
#[derive(Clone)]
pub struct SharedWriter {
    path: PathBuf,
    inner: Arc<Mutex<WriterInner>>,
}

impl SharedWriter {
    pub fn open(path: &Path) -> Result<Self> {
        let file = open_log_file(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            inner: Arc::new(Mutex::new(WriterInner {
                file: Some(BufWriter::new(file)),
            })),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(file) = inner.file.as_mut() {
            file.flush()?;
        }
        Ok(())
    }

    /// Flush and drop the underlying file. Idempotent.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(mut file) = inner.file.take() {
            file.flush()?;
        }
        Ok(())
    }

    /// Flush, then read back up to `max_bytes` of the file under the
    /// writer's own lock.
    pub fn read_to_string_capped(&self, max_bytes: usize) -> Result<String> {
        let mut inner = self.inner.lock();
        if let Some(file) = inner.file.as_mut() {
            file.flush()?;
        }
        let file = std::fs::File::open(&self.path)?;
        let mut buf = String::new();
        file.take(max_bytes as u64).read_to_string(&mut buf)?;
        Ok(buf)
    }
}

impl Write for SharedWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut inner = self.inner.lock();
        match inner.file.as_mut() {
            Some(file) => file.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut inner = self.inner.lock();
        if let Some(file) = inner.file.as_mut() {
            file.flush()?;
        }
        Ok(())
    }
}

/// The open log writers of one node execution
pub struct NodeLog {
    pub mode: LogOutput,
    pub stdout: SharedWriter,
    pub stderr: SharedWriter,
    flusher: Option<JoinHandle<()>>,
}

impl NodeLog {
    /// Open writers under `log_dir` for the given base filename.
    /// `separate` yields `.out` and `.err`; `merged` yields one `.log`
    /// shared by both streams.
    pub fn open(log_dir: &Path, base: &str, mode: LogOutput) -> Result<Self> {
        let (stdout, stderr) = match mode {
            LogOutput::Separate => {
                let out = SharedWriter::open(&log_file_path(log_dir, base, ".out"))?;
                let err = SharedWriter::open(&log_file_path(log_dir, base, ".err"))?;
                (out, err)
            }
            LogOutput::Merged => {
                let merged = SharedWriter::open(&log_file_path(log_dir, base, ".log"))?;
                (merged.clone(), merged)
            }
        };
        Ok(Self {
            mode,
            stdout,
            stderr,
            flusher: None,
        })
    }

    /// Start the periodic flush task keeping in-progress logs visible.
    pub fn start_flusher(&mut self) {
        let stdout = self.stdout.clone();
        let stderr = self.stderr.clone();
        self.flusher = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(FLUSH_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let _ = stdout.flush();
                let _ = stderr.flush();
            }
        }));
    }

    #[must_use]
    pub fn stdout_path(&self) -> PathBuf {
        self.stdout.path().to_path_buf()
    }

    #[must_use]
    pub fn stderr_path(&self) -> PathBuf {
        self.stderr.path().to_path_buf()
    }

    /// Stop the flusher and close both writers. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if let Some(flusher) = self.flusher.take() {
            flusher.abort();
        }
        self.stdout.close()?;
        self.stderr.close()?;
        Ok(())
    }
}

impl Drop for NodeLog {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Writes every byte to both sinks; used to layer user-declared redirect
/// files and remote log streams on top of the run log.
pub struct TeeWriter {
    first: Box<dyn Write + Send>,
    second: Box<dyn Write + Send>,
}

impl TeeWriter {
    #[must_use]
    pub fn new(first: Box<dyn Write + Send>, second: Box<dyn Write + Send>) -> Self {
        Self { first, second }
    }
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.first.write_all(buf)?;
        self.second.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.first.flush()?;
        self.second.flush()
    }
}

/// Open a user-declared redirect file (step `stdout:` / `stderr:`),
/// resolving relative paths against the working directory.
pub fn open_redirect(path: &str, working_dir: Option<&Path>) -> Result<SharedWriter> {
    let mut target = PathBuf::from(path);
    if target.is_relative() {
        if let Some(dir) = working_dir {
            target = dir.join(target);
        }
    }
    SharedWriter::open(&target).map_err(|e| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("redirect {path:?}: {e}"),
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn separate_mode_creates_two_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = NodeLog::open(dir.path(), "step.20260301.000000.000.abcd1234", LogOutput::Separate).unwrap();
        write!(log.stdout, "to stdout").unwrap();
        write!(log.stderr, "to stderr").unwrap();
        log.close().unwrap();

        let out = std::fs::read_to_string(log.stdout_path()).unwrap();
        let err = std::fs::read_to_string(log.stderr_path()).unwrap();
        assert_eq!(out, "to stdout");
        assert_eq!(err, "to stderr");
        assert_ne!(log.stdout_path(), log.stderr_path());
    }

    #[tokio::test]
    async fn merged_mode_interleaves_into_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = NodeLog::open(dir.path(), "step.20260301.000000.000.abcd1234", LogOutput::Merged).unwrap();
        write!(log.stdout, "a").unwrap();
        write!(log.stderr, "b").unwrap();
        write!(log.stdout, "c").unwrap();
        log.close().unwrap();

        assert_eq!(log.stdout_path(), log.stderr_path());
        let merged = std::fs::read_to_string(log.stdout_path()).unwrap();
        assert_eq!(merged, "abc");
    }

    #[tokio::test]
    async fn close_is_idempotent_and_writes_after_close_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = NodeLog::open(dir.path(), "s.20260301.000000.000.abcd1234", LogOutput::Separate).unwrap();
        write!(log.stdout, "kept").unwrap();
        log.close().unwrap();
        log.close().unwrap();
        write!(log.stdout, "dropped").unwrap();
        let out = std::fs::read_to_string(log.stdout_path()).unwrap();
        assert_eq!(out, "kept");
    }

    #[tokio::test]
    async fn capped_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SharedWriter::open(&dir.path().join("x.out")).unwrap();
        let mut clone = writer.clone();
        write!(clone, "0123456789").unwrap();
        assert_eq!(writer.read_to_string_capped(4).unwrap(), "0123");
        assert_eq!(writer.read_to_string_capped(100).unwrap(), "0123456789");
    }

    #[tokio::test]
    async fn flusher_makes_progress_visible() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = NodeLog::open(dir.path(), "s.20260301.000000.000.abcd1234", LogOutput::Separate).unwrap();
        log.start_flusher();
        write!(log.stdout, "early").unwrap();
        tokio::time::sleep(FLUSH_INTERVAL + Duration::from_millis(100)).await;
        let out = std::fs::read_to_string(log.stdout_path()).unwrap();
        assert_eq!(out, "early");
        log.close().unwrap();
    }

    #[test]
    fn tee_duplicates_writes() {
        let a = Arc::new(Mutex::new(Vec::<u8>::new()));
        let b = Arc::new(Mutex::new(Vec::<u8>::new()));

        struct VecSink(Arc<Mutex<Vec<u8>>>);
        impl Write for VecSink {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let mut tee = TeeWriter::new(
            Box::new(VecSink(Arc::clone(&a))),
            Box::new(VecSink(Arc::clone(&b))),
        );
        tee.write_all(b"xy").unwrap();
        assert_eq!(a.lock().as_slice(), b"xy");
        assert_eq!(b.lock().as_slice(), b"xy");
    }
}
