//! Per-run text log sink.
//!
//! [`RunLogFile`] is a `tracing_subscriber` writer that the daemon binary
//! installs as an extra fmt layer. The controller points it at the active
//! run's `run_log.txt` when a run starts and detaches it when the run ends;
//! while detached, everything written to it is discarded.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use tracing_subscriber::fmt::MakeWriter;

type Slot = Arc<Mutex<Option<File>>>;

/// Switchable log file shared by the logging layer and the controller.
#[derive(Clone, Default)]
pub struct RunLogFile {
    file: Slot,
}

impl RunLogFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes subsequent log lines to `path`, appending.
    pub fn attach(&self, path: &Path) -> io::Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        *lock(&self.file) = Some(file);
        Ok(())
    }

    /// Stops writing to the current file.
    pub fn detach(&self) {
        if let Some(mut file) = lock(&self.file).take() {
            let _ = file.flush();
        }
    }

    pub fn is_attached(&self) -> bool {
        lock(&self.file).is_some()
    }
}

fn lock(slot: &Slot) -> std::sync::MutexGuard<'_, Option<File>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<'a> MakeWriter<'a> for RunLogFile {
    type Writer = RunLogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        RunLogWriter {
            file: Arc::clone(&self.file),
        }
    }
}

/// Writer handed out per log event.
pub struct RunLogWriter {
    file: Slot,
}

impl Write for RunLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match lock(&self.file).as_mut() {
            Some(file) => file.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match lock(&self.file).as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_attached_lines_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run_log.txt");
        let sink = RunLogFile::new();

        let subscriber = tracing_subscriber::fmt()
            .with_writer(sink.clone())
            .with_ansi(false)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("before the run");
            sink.attach(&path).unwrap();
            assert!(sink.is_attached());
            tracing::info!(run_id = 3, "Start of run");
            sink.detach();
            tracing::info!("after the run");
        });

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("Start of run"));
        assert!(contents.contains("run_id=3"));
        assert!(!contents.contains("before the run"));
        assert!(!contents.contains("after the run"));
        assert!(!sink.is_attached());
    }
}
