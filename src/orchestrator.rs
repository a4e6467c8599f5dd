//! Main orchestration logic: sync passes and the monitor loop.

use crate::catalog::{Catalog, HttpCatalog};
use crate::download::{DownloadReport, Downloader};
use crate::error::SyncError;
use crate::guard::DiskGuard;
use crate::planner::{plan, SyncState};
use crate::retention::{prune, RetentionReport};
use crate::types::{Mode, SyncConfig};
use chrono::NaiveDate;
use std::io;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Summary of one {list, plan, download, retain} pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassReport {
    /// Recordings reported by the camera.
    pub listed: usize,
    /// Complete local recordings found before planning.
    pub synced: usize,
    pub download: DownloadReport,
    /// `None` when no retention policy is configured.
    pub retention: Option<RetentionReport>,
}

/// The recording synchronization engine for one camera.
///
/// # Example
///
/// ```no_run
/// use dashsync::{Mode, SyncConfig, SyncEngine};
/// use tokio::sync::watch;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let engine = SyncEngine::new(SyncConfig::default())?;
/// let (_stop, shutdown) = watch::channel(false);
/// engine.run(Mode::RunOnce, shutdown).await?;
/// # Ok(())
/// # }
/// ```
pub struct SyncEngine {
    catalog: Arc<dyn Catalog>,
    guard: DiskGuard,
    config: SyncConfig,
}

impl SyncEngine {
    /// Creates an engine talking HTTP to `config.address` and guarding the
    /// volume holding `config.destination`.
    pub fn new(config: SyncConfig) -> Result<Self, SyncError> {
        let catalog = HttpCatalog::new(&config.address, config.timeout)?;
        let guard = DiskGuard::new(&config.destination, config.max_used_disk);
        Ok(Self::with_parts(Arc::new(catalog), guard, config))
    }

    pub fn with_parts(catalog: Arc<dyn Catalog>, guard: DiskGuard, config: SyncConfig) -> Self {
        Self {
            catalog,
            guard,
            config,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Runs passes according to `mode`.
    ///
    /// A pass that fails recoverably (camera unreachable) is logged; in
    /// monitor mode the loop then waits for the next interval. The interval
    /// is measured from the end of a pass, so passes never overlap.
    ///
    /// # Returns
    ///
    /// `Ok(())` once run-once finishes or shutdown is signalled, or the
    /// first unrecoverable error.
    pub async fn run(&self, mode: Mode, mut shutdown: watch::Receiver<bool>) -> Result<(), SyncError> {
        match mode {
            Mode::RunOnce => self.logged_pass(&shutdown).await,
            Mode::Monitor { interval } => {
                info!(
                    "Entering monitor loop, polling every {}",
                    humantime::format_duration(interval)
                );
                while !*shutdown.borrow() {
                    self.logged_pass(&shutdown).await?;
                    if *shutdown.borrow() {
                        break;
                    }

                    debug!("Next pass in {}", humantime::format_duration(interval));
                    let pause = tokio::time::sleep(interval);
                    tokio::pin!(pause);
                    let signalled = tokio::select! {
                        _ = &mut pause => false,
                        changed = shutdown.changed() => changed.is_ok(),
                    };
                    // Sender gone: nothing can interrupt the wait any more.
                    if !signalled && !pause.is_elapsed() {
                        pause.await;
                    }
                }
                info!("Monitor loop stopped");
                Ok(())
            }
        }
    }

    async fn logged_pass(&self, shutdown: &watch::Receiver<bool>) -> Result<(), SyncError> {
        let today = chrono::Local::now().date_naive();
        match self.run_pass(shutdown, today).await {
            Ok(report) => {
                let d = report.download;
                info!(
                    "Sync pass complete: {} listed, {} downloaded, {} failed, {} skipped (disk), {} tracks, {} pruned",
                    report.listed,
                    d.downloaded,
                    d.failed,
                    d.skipped_disk,
                    d.tracks,
                    report.retention.map(|r| r.deleted).unwrap_or(0)
                );
                Ok(())
            }
            Err(e) if e.is_recoverable() => {
                warn!("Sync pass aborted: {}", e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Executes one pass: list the camera, scan the destination, plan,
    /// download, then apply retention.
    ///
    /// # Arguments
    ///
    /// * `shutdown` - Checked between downloads
    /// * `today` - Reference date for retention
    pub async fn run_pass(
        &self,
        shutdown: &watch::Receiver<bool>,
        today: NaiveDate,
    ) -> Result<PassReport, SyncError> {
        let config = &self.config;
        info!("Starting sync of {}", self.catalog.address());
        self.ensure_destination()?;

        let remote = self.catalog.list().await?;
        let state = SyncState::scan(&config.destination)?;
        let queue = plan(&remote, &state, config, today);
        info!(
            "{} recordings to download ({} already synced)",
            queue.len(),
            state.len()
        );

        let downloader = Downloader::new(self.catalog.as_ref(), &self.guard, config, shutdown.clone());
        let download = downloader.run(&queue).await?;

        let retention = match config.keep {
            Some(policy) => Some(prune(&config.destination, policy, today, config.dry_run)?),
            None => None,
        };

        Ok(PassReport {
            listed: remote.len(),
            synced: state.len(),
            download,
            retention,
        })
    }

    /// Creates the destination root if needed. A dry run never creates it.
    fn ensure_destination(&self) -> Result<(), SyncError> {
        let root = &self.config.destination;
        if root.exists() {
            if !root.is_dir() {
                return Err(SyncError::IoError(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("destination {} is not a directory", root.display()),
                )));
            }
        } else if !self.config.dry_run {
            std::fs::create_dir_all(root)?;
            info!("Created destination {}", root.display());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{recording, MockCatalog, ScriptedProbe};
    use crate::types::{Grouping, RecordingType, RetentionPolicy, RetryPolicy};
    use std::fs;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    const OLD: &str = "2024_0301_080000_000001F.MP4";
    const NEW: &str = "2024_0319_080000_000002F.MP4";
    const EVENT: &str = "2024_0320_080000_000003F.MP4";

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 20).unwrap()
    }

    fn mock() -> Arc<MockCatalog> {
        Arc::new(MockCatalog::new(vec![
            recording(NEW, RecordingType::Normal, 50),
            recording(EVENT, RecordingType::Event, 30),
        ]))
    }

    fn engine(catalog: Arc<MockCatalog>, root: &Path, dry_run: bool) -> SyncEngine {
        let config = SyncConfig {
            destination: root.to_path_buf(),
            grouping: Grouping::Daily,
            keep: Some(RetentionPolicy { days: 7 }),
            dry_run,
            retry: RetryPolicy {
                attempts: 1,
                delay: Duration::ZERO,
            },
            ..SyncConfig::default()
        };
        let guard = DiskGuard::with_probe(Box::new(ScriptedProbe::new([20.0])), 90);
        SyncEngine::with_parts(catalog, guard, config)
    }

    fn seed_old_recording(root: &Path) -> std::path::PathBuf {
        let group = root.join("2024-03-01");
        fs::create_dir_all(&group).unwrap();
        let old = group.join(OLD);
        fs::write(&old, b"old").unwrap();
        old
    }

    fn tree(root: &Path) -> Vec<String> {
        let mut names: Vec<String> = walk(root)
            .into_iter()
            .map(|p| p.strip_prefix(root).unwrap().display().to_string())
            .collect();
        names.sort();
        names
    }

    fn walk(dir: &Path) -> Vec<std::path::PathBuf> {
        let mut out = Vec::new();
        for entry in fs::read_dir(dir).unwrap().flatten() {
            let path = entry.path();
            if path.is_dir() {
                out.extend(walk(&path));
            }
            out.push(path);
        }
        out
    }

    #[tokio::test]
    async fn test_pass_downloads_then_prunes() {
        let dir = TempDir::new().unwrap();
        let old = seed_old_recording(dir.path());
        let catalog = mock();
        let (_tx, rx) = watch::channel(false);

        let report = engine(catalog.clone(), dir.path(), false)
            .run_pass(&rx, today())
            .await
            .unwrap();

        assert_eq!(report.listed, 2);
        assert_eq!(report.download.downloaded, 2);
        assert_eq!(report.retention.unwrap().deleted, 1);
        assert!(!old.exists());
        assert_eq!(
            tree(dir.path()),
            vec![
                "2024-03-19".to_string(),
                format!("2024-03-19/{}", NEW),
                "2024-03-20".to_string(),
                format!("2024-03-20/{}", EVENT),
            ]
        );

        // Second pass: everything is synced.
        let report = engine(catalog, dir.path(), false)
            .run_pass(&rx, today())
            .await
            .unwrap();
        assert_eq!(report.download.planned, 0);
        assert_eq!(report.synced, 2);
    }

    #[tokio::test]
    async fn test_dry_run_plans_the_same_and_mutates_nothing() {
        let dir = TempDir::new().unwrap();
        seed_old_recording(dir.path());
        let before = tree(dir.path());
        let (_tx, rx) = watch::channel(false);

        let dry = engine(mock(), dir.path(), true).run_pass(&rx, today()).await.unwrap();
        assert_eq!(tree(dir.path()), before);

        let real = engine(mock(), dir.path(), false).run_pass(&rx, today()).await.unwrap();
        assert_eq!(dry.download.planned, real.download.planned);
        assert_eq!(dry.download.would_download, real.download.downloaded);
        assert_eq!(dry.retention.unwrap().expired, real.retention.unwrap().deleted);
    }

    #[tokio::test]
    async fn test_dry_run_does_not_create_destination() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("missing");
        let (_tx, rx) = watch::channel(false);
        engine(mock(), &root, true).run_pass(&rx, today()).await.unwrap();
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn test_unreachable_run_once_is_not_fatal() {
        let dir = TempDir::new().unwrap();
        let catalog = mock();
        catalog.set_unreachable(true);
        let (_tx, rx) = watch::channel(false);

        let engine = engine(catalog, dir.path(), false);
        assert!(matches!(
            engine.run_pass(&rx, today()).await,
            Err(SyncError::Unreachable { .. })
        ));
        engine.run(Mode::RunOnce, rx).await.unwrap();
    }

    #[tokio::test]
    async fn test_destination_not_a_directory_is_fatal() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("file");
        fs::write(&file, b"x").unwrap();
        let (_tx, rx) = watch::channel(false);

        let result = engine(mock(), &file, false).run(Mode::RunOnce, rx).await;
        assert!(matches!(result, Err(SyncError::IoError(_))));
    }

    #[tokio::test]
    async fn test_monitor_survives_unreachable_and_stops_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let catalog = mock();
        catalog.set_unreachable(true);
        let mut engine = engine(catalog.clone(), dir.path(), false);
        // Passes use the real date here; keep every recording.
        engine.config.keep = None;
        let (tx, rx) = watch::channel(false);
        let mode = Mode::Monitor {
            interval: Duration::from_millis(20),
        };

        let control = async {
            tokio::time::sleep(Duration::from_millis(70)).await;
            catalog.set_unreachable(false);
            tokio::time::sleep(Duration::from_millis(150)).await;
            tx.send(true).unwrap();
        };
        let (result, ()) = tokio::join!(engine.run(mode, rx), control);

        result.unwrap();
        let day = dir.path().join("2024-03-19").join(NEW);
        assert!(day.exists());
    }
}
