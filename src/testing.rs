//! Test doubles for the camera, the destination volume and log output.

use crate::catalog::{Catalog, Fetch};
use crate::error::SyncError;
use crate::guard::UsageProbe;
use crate::types::{parse_recording_filename, RecordingType, RemoteRecording};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

/// Builds a remote recording whose capture time comes from its filename.
pub(crate) fn recording(filename: &str, kind: RecordingType, size: u64) -> RemoteRecording {
    let (_, captured, _) = parse_recording_filename(filename).expect("test filename");
    RemoteRecording {
        filename: filename.to_string(),
        remote_path: format!(r"A:\Novatek\Movie\{}", filename),
        captured,
        kind,
        size,
    }
}

/// Deterministic file content of `size` bytes.
pub(crate) fn content(size: u64) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

const CHUNK: usize = 16;

/// In-memory camera.
#[derive(Default)]
pub(crate) struct MockCatalog {
    recordings: Vec<RemoteRecording>,
    data: HashMap<String, Vec<u8>>,
    /// Recording id -> absolute byte position at which the next transfer breaks.
    cuts: Mutex<HashMap<String, u64>>,
    requests: Mutex<Vec<(String, u64)>>,
    unreachable: AtomicBool,
    ignore_range: bool,
}

impl MockCatalog {
    pub(crate) fn new(recordings: Vec<RemoteRecording>) -> Self {
        let data = recordings
            .iter()
            .map(|r| (r.filename.clone(), content(r.size)))
            .collect();
        Self {
            recordings,
            data,
            ..Self::default()
        }
    }

    /// Makes the next transfer of `id` break once `at` bytes of the file exist.
    pub(crate) fn cut_once(&self, id: &str, at: u64) {
        self.cuts.lock().unwrap().insert(id.to_string(), at);
    }

    pub(crate) fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Replaces the bytes served for `id`, adjusting its listed size.
    pub(crate) fn with_content(mut self, id: &str, data: Vec<u8>) -> Self {
        if let Some(r) = self.recordings.iter_mut().find(|r| r.filename == id) {
            r.size = data.len() as u64;
        }
        self.data.insert(id.to_string(), data);
        self
    }

    pub(crate) fn recordings(&self) -> &[RemoteRecording] {
        &self.recordings
    }

    pub(crate) fn ignoring_range(mut self) -> Self {
        self.ignore_range = true;
        self
    }

    /// Every `(id, offset)` passed to `fetch`, in order.
    pub(crate) fn requests(&self) -> Vec<(String, u64)> {
        self.requests.lock().unwrap().clone()
    }

    fn unreachable_error(&self) -> SyncError {
        SyncError::Unreachable {
            address: "mock".to_string(),
            reason: "connection refused".to_string(),
        }
    }
}

#[async_trait]
impl Catalog for MockCatalog {
    fn address(&self) -> &str {
        "mock"
    }

    async fn list(&self) -> Result<Vec<RemoteRecording>, SyncError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(self.unreachable_error());
        }
        Ok(self.recordings.clone())
    }

    async fn fetch(&self, recording: &RemoteRecording, offset: u64) -> Result<Fetch, SyncError> {
        self.requests
            .lock()
            .unwrap()
            .push((recording.filename.clone(), offset));
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(self.unreachable_error());
        }

        let data = self.data.get(recording.id()).cloned().unwrap_or_default();
        let start = if self.ignore_range { 0 } else { offset };
        let cut = self.cuts.lock().unwrap().remove(recording.id());
        let end = cut.unwrap_or(data.len() as u64).min(data.len() as u64);

        let mut items: Vec<Result<Bytes, SyncError>> = data
            [start.min(end) as usize..end as usize]
            .chunks(CHUNK)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        if cut.is_some() {
            items.push(Err(SyncError::transfer(recording.id(), "connection reset")));
        }
        Ok(Fetch {
            offset: start,
            stream: Box::pin(futures_util::stream::iter(items)),
        })
    }
}

/// Usage probe replaying a fixed sequence of readings; the last one repeats.
pub(crate) struct ScriptedProbe {
    readings: Mutex<VecDeque<f64>>,
}

impl ScriptedProbe {
    pub(crate) fn new(readings: impl IntoIterator<Item = f64>) -> Self {
        Self {
            readings: Mutex::new(readings.into_iter().collect()),
        }
    }
}

impl UsageProbe for ScriptedProbe {
    fn used_percent(&self) -> Result<f64, SyncError> {
        let mut readings = self.readings.lock().unwrap();
        let reading = if readings.len() > 1 {
            readings.pop_front()
        } else {
            readings.front().copied()
        };
        reading.ok_or_else(|| SyncError::IoError(std::io::Error::other("no reading")))
    }
}

/// In-memory log sink for asserting what a given filter lets through.
#[derive(Clone, Default)]
pub(crate) struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    /// A subscriber writing to this sink, filtered like `RUST_LOG`.
    pub(crate) fn subscriber(&self, filter: &str) -> impl tracing::Subscriber + Send + Sync {
        let sink = self.clone();
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(filter))
            .with_writer(move || sink.clone())
            .with_ansi(false)
            .finish()
    }

    pub(crate) fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
