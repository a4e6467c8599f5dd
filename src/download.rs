//! Recording download functionality.

use crate::catalog::{ByteStream, Catalog};
use crate::error::SyncError;
use crate::gps;
use crate::guard::{DiskGuard, DiskStatus};
use crate::planner::PlannedDownload;
use crate::types::{RemoteRecording, SyncConfig};
use futures_util::StreamExt;
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use std::io;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::watch;
use tokio_retry2::strategy::FixedInterval;
use tokio_retry2::{Retry, RetryError};
use tracing::{debug, info, warn};

/// Counters for the download stage of one pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DownloadReport {
    /// Items in the queue.
    pub planned: usize,
    /// Items completed and renamed into place.
    pub downloaded: usize,
    /// Items a dry run would have downloaded.
    pub would_download: usize,
    /// Items whose transfer failed; their partial files stay for resuming.
    pub failed: usize,
    /// Items not started because the disk limit was reached.
    pub skipped_disk: usize,
    /// Items not started because shutdown was requested.
    pub skipped_cancelled: usize,
    /// GPX tracks written.
    pub tracks: usize,
    /// Bytes received over the network.
    pub bytes: u64,
}

/// Executes a planned queue against the camera, one transfer at a time.
pub struct Downloader<'a> {
    catalog: &'a dyn Catalog,
    guard: &'a DiskGuard,
    config: &'a SyncConfig,
    shutdown: watch::Receiver<bool>,
}

impl<'a> Downloader<'a> {
    pub fn new(
        catalog: &'a dyn Catalog,
        guard: &'a DiskGuard,
        config: &'a SyncConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            catalog,
            guard,
            config,
            shutdown,
        }
    }

    fn is_cancelled(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Downloads the queue in order.
    ///
    /// Before each item the shutdown flag and the disk guard are consulted;
    /// either one ends the stage early without error. A failed item is
    /// counted and the next one is tried.
    ///
    /// # Returns
    ///
    /// The stage counters, or an error only for local I/O failures.
    pub async fn run(&self, queue: &[PlannedDownload]) -> Result<DownloadReport, SyncError> {
        let mut report = DownloadReport {
            planned: queue.len(),
            ..DownloadReport::default()
        };

        for (index, item) in queue.iter().enumerate() {
            if self.is_cancelled() {
                report.skipped_cancelled = queue.len() - index;
                info!(
                    "Shutdown requested, leaving {} queued recordings for a later pass",
                    report.skipped_cancelled
                );
                break;
            }

            if let DiskStatus::OverLimit { used_percent } = self.guard.check() {
                let remaining = &queue[index..];
                warn!(
                    "Disk usage {:.1}% reached the {}% limit, skipping {} queued recordings",
                    used_percent,
                    self.config.max_used_disk,
                    remaining.len()
                );
                for skipped in remaining {
                    info!("Skipped (disk limit): {}", skipped.recording.filename);
                }
                report.skipped_disk = remaining.len();
                break;
            }

            if self.config.dry_run {
                info!(
                    "[dry-run] Would download {} ({}, {}) to {}",
                    item.recording.filename,
                    item.recording.kind,
                    HumanBytes(item.recording.size),
                    item.destination.display()
                );
                report.would_download += 1;
                continue;
            }

            match self.download(item).await {
                Ok(bytes) => {
                    report.downloaded += 1;
                    report.bytes += bytes;
                    if self.config.gps_extract && self.extract_track(&item.destination).await {
                        report.tracks += 1;
                    }
                }
                Err(e) if e.is_recoverable() => {
                    warn!("❌ {}", e);
                    report.failed += 1;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(report)
    }

    /// Downloads one item with bounded retries; every attempt resumes from
    /// whatever the previous one left on disk. No retry starts once shutdown
    /// has been requested.
    async fn download(&self, item: &PlannedDownload) -> Result<u64, SyncError> {
        let retry = self.config.retry;
        let strategy = FixedInterval::from_millis(retry.delay.as_millis() as u64)
            .take(retry.attempts.saturating_sub(1));
        let mut attempt = 0;

        Retry::spawn(strategy, || {
            attempt += 1;
            let attempt = attempt;
            async move {
                if attempt > 1 && self.is_cancelled() {
                    return RetryError::to_permanent(SyncError::transfer(
                        &item.recording.filename,
                        "shutdown requested before retrying",
                    ));
                }
                match self.transfer(item).await {
                    Ok(bytes) => Ok(bytes),
                    Err(e) if e.is_recoverable() => {
                        warn!(
                            "Attempt {}/{} for {} failed: {}",
                            attempt, retry.attempts, item.recording.filename, e
                        );
                        RetryError::to_transient(e)
                    }
                    Err(e) => RetryError::to_permanent(e),
                }
            }
        })
        .await
    }

    /// A single transfer attempt.
    ///
    /// Bytes go to `<destination>.part`; the rename to the final name happens
    /// only once the received length equals the listed size.
    async fn transfer(&self, item: &PlannedDownload) -> Result<u64, SyncError> {
        let recording = &item.recording;
        let partial = item.partial_path();
        if let Some(parent) = item.destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let existing = partial_len(&partial).await?;
        let mut offset = match existing {
            Some(len) if len > recording.size => {
                warn!(
                    "Discarding partial {} larger than the listed size",
                    partial.display()
                );
                0
            }
            Some(len) => len,
            None => 0,
        };
        if existing == Some(recording.size) {
            tokio::fs::rename(&partial, &item.destination).await?;
            info!("✅ Completed {} from an earlier transfer", recording.filename);
            return Ok(0);
        }

        if offset > 0 {
            info!(
                "Resuming {} at {} of {}",
                recording.filename,
                HumanBytes(offset),
                HumanBytes(recording.size)
            );
        } else {
            info!("⬇️  Downloading {} ({})", recording.filename, HumanBytes(recording.size));
        }

        let fetch = self.catalog.fetch(recording, offset).await?;
        if fetch.offset != offset {
            if fetch.offset != 0 {
                return Err(SyncError::transfer(
                    &recording.filename,
                    format!("camera resumed at {} instead of {}", fetch.offset, offset),
                ));
            }
            debug!("Restarting {} from the beginning", recording.filename);
            offset = 0;
        }

        let file = if offset == 0 {
            File::create(&partial).await?
        } else {
            OpenOptions::new().append(true).open(&partial).await?
        };
        let mut writer = BufWriter::new(file);
        let progress = self.progress_bar(recording, offset);
        let started = Instant::now();

        // Whatever arrived is flushed even when the stream breaks, so the
        // next attempt resumes after it.
        let copied = copy_stream(fetch.stream, &mut writer, recording, offset, &progress).await;
        writer.flush().await?;
        writer.get_ref().sync_all().await?;
        drop(writer);
        progress.finish_and_clear();
        let received = copied?;

        if received != recording.size {
            return Err(SyncError::transfer(
                &recording.filename,
                format!("stream ended at {} of {} bytes", received, recording.size),
            ));
        }
        tokio::fs::rename(&partial, &item.destination).await?;

        let transferred = received - offset;
        let elapsed = started.elapsed();
        let per_second = transferred as f64 / elapsed.as_secs_f64().max(0.001);
        info!(
            "✅ Downloaded {}: {} in {} ({}/s)",
            recording.filename,
            HumanBytes(transferred),
            humantime::format_duration(Duration::from_millis(elapsed.as_millis() as u64)),
            HumanBytes(per_second as u64)
        );
        Ok(transferred)
    }

    fn progress_bar(&self, recording: &RemoteRecording, offset: u64) -> ProgressBar {
        if !self.config.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(recording.size);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.cyan} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg} | {bytes_per_sec}, ETA {eta}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("█▓▒░ "),
        );
        pb.set_message(recording.filename.clone());
        pb.set_position(offset);
        pb
    }

    /// Writes the GPX track for a finished video. Extraction problems never
    /// undo the download.
    async fn extract_track(&self, video: &Path) -> bool {
        let path = video.to_path_buf();
        let result = tokio::task::spawn_blocking(move || gps::write_track(&path))
            .await
            .map_err(|e| SyncError::IoError(io::Error::other(format!("Task join error: {}", e))))
            .and_then(|r| r);

        match result {
            Ok(Some(track)) => {
                info!("🛰️  Wrote GPS track {}", track.display());
                true
            }
            Ok(None) => {
                debug!("No GPS data in {}", video.display());
                false
            }
            Err(e) => {
                warn!("GPS extraction failed for {}: {}", video.display(), e);
                false
            }
        }
    }
}

async fn partial_len(path: &Path) -> Result<Option<u64>, SyncError> {
    match tokio::fs::metadata(path).await {
        Ok(m) => Ok(Some(m.len())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Copies the stream into the writer and returns the total length of the
/// file afterwards.
async fn copy_stream(
    mut stream: ByteStream,
    writer: &mut BufWriter<File>,
    recording: &RemoteRecording,
    offset: u64,
    progress: &ProgressBar,
) -> Result<u64, SyncError> {
    let mut received = offset;
    while let Some(piece) = stream.next().await {
        let chunk = piece?;
        received += chunk.len() as u64;
        if received > recording.size {
            return Err(SyncError::transfer(
                &recording.filename,
                format!("camera sent more than the listed {} bytes", recording.size),
            ));
        }
        writer.write_all(&chunk).await?;
        progress.set_position(received);
    }
    Ok(received)
}
