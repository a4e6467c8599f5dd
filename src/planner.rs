//! Sync planning: local inventory, set difference and queue ordering.

use crate::error::SyncError;
use crate::types::{
    parse_recording_filename, Grouping, LocalRecording, Priority, RemoteRecording, SyncConfig,
    PARTIAL_SUFFIX,
};
use chrono::NaiveDate;
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One recording scheduled for download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedDownload {
    pub recording: RemoteRecording,
    /// Group directory under the destination root, if any.
    pub group: Option<String>,
    /// Final path of the completed file.
    pub destination: PathBuf,
}

impl PlannedDownload {
    /// Path the file is written to until its transfer completes.
    pub fn partial_path(&self) -> PathBuf {
        partial_path(&self.destination)
    }
}

/// Returns `<path>.part`.
pub fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

/// Recordings already present and complete under the destination root.
///
/// Rebuilt from the filesystem at the start of every pass; there is no
/// persisted index.
#[derive(Debug, Default)]
pub struct SyncState {
    complete: HashMap<String, (PathBuf, u64)>,
}

impl SyncState {
    /// Scans `root` and builds the state from its complete recordings.
    pub fn scan(root: &Path) -> Result<Self, SyncError> {
        Ok(Self::from_local(&scan_destination(root)?))
    }

    pub fn from_local(recordings: &[LocalRecording]) -> Self {
        let complete = recordings
            .iter()
            .filter(|r| r.complete)
            .map(|r| (r.filename.clone(), (r.path.clone(), r.size)))
            .collect();
        Self { complete }
    }

    /// A recording counts as synced only if a complete local copy exists with
    /// exactly the size the camera reports.
    pub fn is_synced(&self, recording: &RemoteRecording) -> bool {
        self.complete
            .get(recording.id())
            .is_some_and(|(_, size)| *size == recording.size)
    }

    pub fn len(&self) -> usize {
        self.complete.len()
    }

    pub fn is_empty(&self) -> bool {
        self.complete.is_empty()
    }
}

/// Lists recordings stored directly under `root` or in one of its group
/// subdirectories, including partial transfers.
///
/// Only directories named like a group (`YYYY`, `YYYY-MM`, `YYYY-MM-DD`) are
/// entered; anything else under the root belongs to someone else. A group
/// directory that cannot be read is skipped with a warning. A missing root
/// yields an empty inventory.
pub fn scan_destination(root: &Path) -> Result<Vec<LocalRecording>, SyncError> {
    let mut recordings = Vec::new();
    if !root.exists() {
        return Ok(recordings);
    }

    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            let group = entry.file_name().to_string_lossy().into_owned();
            if !Grouping::is_group_name(&group) {
                debug!("Ignoring directory {}", entry.path().display());
                continue;
            }
            let inner = match fs::read_dir(entry.path()) {
                Ok(inner) => inner,
                Err(e) => {
                    warn!("Skipping unreadable group {}: {}", entry.path().display(), e);
                    continue;
                }
            };
            for inner in inner.flatten() {
                if inner.file_type().is_ok_and(|t| t.is_file()) {
                    if let Some(recording) = to_local_recording(&inner, Some(group.clone()))? {
                        recordings.push(recording);
                    }
                }
            }
        } else if file_type.is_file() {
            if let Some(recording) = to_local_recording(&entry, None)? {
                recordings.push(recording);
            }
        }
    }
    Ok(recordings)
}

fn to_local_recording(
    entry: &fs::DirEntry,
    group: Option<String>,
) -> Result<Option<LocalRecording>, SyncError> {
    let name = entry.file_name();
    let Some((filename, captured, complete)) = name.to_str().and_then(parse_recording_filename)
    else {
        return Ok(None);
    };
    let size = entry.metadata()?.len();
    Ok(Some(LocalRecording {
        path: entry.path(),
        group,
        filename,
        captured,
        size,
        complete,
    }))
}

/// Builds the ordered download queue for one pass.
///
/// The queue holds every remote recording not yet synced, once, with its
/// destination path assigned by the configured grouping. Filename filters
/// and the retention cutoff narrow the candidates; priority only orders
/// them.
///
/// # Arguments
///
/// * `remote` - Camera listing for this pass
/// * `state` - Local sync state scanned at the start of the pass
/// * `config` - Engine configuration (grouping, priority, filters, keep)
/// * `today` - Reference date for the retention cutoff
pub fn plan(
    remote: &[RemoteRecording],
    state: &SyncState,
    config: &SyncConfig,
    today: NaiveDate,
) -> Vec<PlannedDownload> {
    let mut seen = HashSet::new();
    let mut queue = Vec::new();

    for recording in remote {
        if !seen.insert(recording.id()) {
            continue;
        }
        if !config.filters.is_empty()
            && !config.filters.iter().any(|f| recording.filename.contains(f.as_str()))
        {
            debug!("Filtered out {}", recording.filename);
            continue;
        }
        if let Some(keep) = config.keep {
            if keep.is_expired(recording.captured, today) {
                debug!("Not downloading {}: older than retention", recording.filename);
                continue;
            }
        }
        if state.is_synced(recording) {
            debug!("Already synced: {}", recording.filename);
            continue;
        }

        let group = config.grouping.group_name(recording.captured);
        let dir = match &group {
            Some(name) => config.destination.join(name),
            None => config.destination.clone(),
        };
        queue.push(PlannedDownload {
            destination: dir.join(&recording.filename),
            recording: recording.clone(),
            group,
        });
    }

    order(&mut queue, config.priority);
    queue
}

/// Sorts the queue per priority; ties fall back to capture time ascending,
/// then filename.
pub fn order(queue: &mut [PlannedDownload], priority: Priority) {
    match priority {
        Priority::Date => {
            queue.sort_by(|a, b| {
                (a.recording.captured, &a.recording.filename)
                    .cmp(&(b.recording.captured, &b.recording.filename))
            });
        }
        Priority::Rdate => {
            queue.sort_by_key(|p| (Reverse(p.recording.captured), p.recording.filename.clone()));
        }
        Priority::Type => {
            queue.sort_by(|a, b| {
                (a.recording.kind, a.recording.captured, &a.recording.filename).cmp(&(
                    b.recording.kind,
                    b.recording.captured,
                    &b.recording.filename,
                ))
            });
        }
    }
}
