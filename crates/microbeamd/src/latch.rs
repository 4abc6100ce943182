//! Latch-up channel.
//!
//! An external detector watches the device supply current and, when it
//! sees a latch-up, writes the captured waveform into a named pipe as raw
//! little-endian `f64` samples. The scan reads the pipe once per poll tick
//! without blocking; any data at all means a latch-up happened.

use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::net::unix::pipe;

/// Largest waveform taken in one read.
pub const MAX_WAVEFORM_BYTES: usize = 1024 * 1024;

/// Where latch-up waveforms come from.
#[derive(Debug, Clone)]
pub enum LatchSource {
    /// Named pipe written by the detector
    Fifo(PathBuf),
    /// In-process queue
    Queue(LatchQueue),
}

impl LatchSource {
    /// Opens the channel for one scan.
    pub fn open(&self) -> io::Result<LatchMonitor> {
        let inner = match self {
            Self::Fifo(path) => {
                let mut options = pipe::OpenOptions::new();
                // keep the pipe open across detector restarts instead of reading EOF
                #[cfg(target_os = "linux")]
                options.read_write(true);
                Inner::Fifo(options.open_receiver(path)?)
            }
            Self::Queue(queue) => Inner::Queue(queue.clone()),
        };
        Ok(LatchMonitor {
            inner,
            buf: vec![0; MAX_WAVEFORM_BYTES],
        })
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Fifo(path) => path.display().to_string(),
            Self::Queue(_) => "in-process queue".to_string(),
        }
    }
}

/// Shared queue standing in for the pipe.
#[derive(Debug, Clone, Default)]
pub struct LatchQueue {
    chunks: Arc<Mutex<VecDeque<Vec<u8>>>>,
}

impl LatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues raw bytes as the detector would write them.
    pub fn push(&self, bytes: Vec<u8>) {
        self.chunks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(bytes);
    }

    pub fn push_waveform(&self, samples: &[f64]) {
        self.push(encode_waveform(samples));
    }

    fn pop(&self) -> Option<Vec<u8>> {
        self.chunks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }
}

enum Inner {
    Fifo(pipe::Receiver),
    Queue(LatchQueue),
}

/// Open latch channel, owned by the scan for its duration.
pub struct LatchMonitor {
    inner: Inner,
    buf: Vec<u8>,
}

impl LatchMonitor {
    /// One non-blocking read. Returns the waveform if the detector wrote one.
    pub fn try_read(&mut self) -> io::Result<Option<Vec<f64>>> {
        match &mut self.inner {
            Inner::Fifo(receiver) => match receiver.try_read(&mut self.buf) {
                Ok(0) => Ok(None),
                Ok(n) => Ok(Some(decode_waveform(self.buf.get(..n).unwrap_or_default()))),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
                Err(e) => Err(e),
            },
            Inner::Queue(queue) => Ok(queue
                .pop()
                .filter(|bytes| !bytes.is_empty())
                .map(|bytes| decode_waveform(&bytes))),
        }
    }
}

/// Raw little-endian `f64` samples. A trailing partial sample is dropped.
pub fn decode_waveform(bytes: &[u8]) -> Vec<f64> {
    bytes
        .chunks_exact(8)
        .filter_map(|chunk| <[u8; 8]>::try_from(chunk).ok())
        .map(f64::from_le_bytes)
        .collect()
}

pub fn encode_waveform(samples: &[f64]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}
