//! Retention: pruning recordings older than the keep threshold.

use crate::error::SyncError;
use crate::planner::scan_destination;
use crate::types::{LocalRecording, RetentionPolicy};
use chrono::NaiveDate;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Outcome of one retention run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetentionReport {
    /// Recordings past the threshold.
    pub expired: usize,
    /// Recordings actually removed.
    pub deleted: usize,
    /// Recordings whose video file could not be removed.
    pub failed: usize,
}

/// Removes every recording under `root` older than the policy allows.
///
/// Age is taken from the capture time in the filename, not from file
/// timestamps. A recording's video and its companions (`.gpx`, `.part`) are
/// removed together; only a failure to remove the video counts as failed.
///
/// # Arguments
///
/// * `root` - Destination root
/// * `policy` - Retention threshold
/// * `today` - Reference date
/// * `dry_run` - Log candidates without deleting
pub fn prune(
    root: &Path,
    policy: RetentionPolicy,
    today: NaiveDate,
    dry_run: bool,
) -> Result<RetentionReport, SyncError> {
    let cutoff = policy.cutoff(today);
    debug!("Retention cutoff date: {}", cutoff);

    let mut report = RetentionReport::default();
    let mut touched_groups = BTreeSet::new();

    // A video and its leftover `.part` are one recording.
    let mut expired: BTreeMap<PathBuf, LocalRecording> = BTreeMap::new();
    for recording in scan_destination(root)? {
        if !policy.is_expired(recording.captured, today) {
            continue;
        }
        match expired.entry(recording.path.with_file_name(&recording.filename)) {
            Entry::Vacant(slot) => {
                slot.insert(recording);
            }
            Entry::Occupied(mut slot) if recording.complete => {
                slot.insert(recording);
            }
            Entry::Occupied(_) => {}
        }
    }

    for recording in expired.into_values() {
        report.expired += 1;
        if dry_run {
            info!("[dry-run] Would remove {}", recording.path.display());
            continue;
        }
        match delete_recording(&recording) {
            Ok(()) => {
                info!("🗑️  Removed old recording {}", recording.path.display());
                report.deleted += 1;
                if let Some(parent) = recording.group.as_ref().and(recording.path.parent()) {
                    touched_groups.insert(parent.to_path_buf());
                }
            }
            Err(e) => {
                warn!("{}", e);
                report.failed += 1;
            }
        }
    }

    for dir in touched_groups {
        remove_if_empty(&dir);
    }
    Ok(report)
}

/// Deletes a recording's file, then every companion sharing its name.
fn delete_recording(recording: &LocalRecording) -> Result<(), SyncError> {
    remove_file(&recording.path).map_err(|source| SyncError::RetentionDeleteFailed {
        path: recording.path.clone(),
        source,
    })?;

    for companion in companions(recording) {
        if let Err(e) = remove_file(&companion) {
            warn!("Failed to remove companion {}: {}", companion.display(), e);
        }
    }
    Ok(())
}

/// Missing files count as removed.
fn remove_file(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn companions(recording: &LocalRecording) -> Vec<PathBuf> {
    let prefix = format!("{}.", recording.filename);
    let Some(dir) = recording.path.parent() else {
        return Vec::new();
    };
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| *p != recording.path)
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&prefix))
        })
        .collect()
}

fn remove_if_empty(dir: &Path) {
    let is_empty = fs::read_dir(dir).map(|mut e| e.next().is_none()).unwrap_or(false);
    if is_empty {
        match fs::remove_dir(dir) {
            Ok(()) => debug!("Removed empty group directory {}", dir.display()),
            Err(e) => debug!("Could not remove {}: {}", dir.display(), e),
        }
    }
}
