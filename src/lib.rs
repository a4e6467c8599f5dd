//! dashsync - Unattended recording sync for Wi-Fi dashcams
//!
//! This library mirrors the recordings of a Novatek-based dashcam (Viofo and
//! similar) onto local storage, optionally extracts their embedded GPS
//! tracks, and prunes old recordings while staying under a disk-usage
//! ceiling.
//!
//! # Features
//!
//! - **Filesystem as state**: no index; every pass re-scans the destination
//! - **Resumable Downloads**: interrupted transfers continue from their `.part` file
//! - **Atomic Completion**: a recording gets its final name only when complete
//! - **Priority Ordering**: oldest, newest or most important recordings first
//! - **Retention**: recordings older than the keep threshold are removed
//! - **GPS Tracks**: embedded telemetry written out as GPX
//!
//! # Example
//!
//! ```no_run
//! use dashsync::{Mode, SyncConfig, SyncEngine};
//! use std::time::Duration;
//! use tokio::sync::watch;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SyncConfig {
//!     address: "192.168.1.254".to_string(),
//!     destination: "/srv/dashcam".into(),
//!     ..SyncConfig::default()
//! };
//! let engine = SyncEngine::new(config)?;
//! let (_stop, shutdown) = watch::channel(false);
//! engine
//!     .run(Mode::Monitor { interval: Duration::from_secs(600) }, shutdown)
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod download;
pub mod error;
pub mod gps;
pub mod guard;
pub mod orchestrator;
pub mod planner;
pub mod retention;
pub mod types;

#[cfg(test)]
mod testing;

pub use catalog::{Catalog, HttpCatalog};
pub use error::SyncError;
pub use orchestrator::{PassReport, SyncEngine};
pub use types::{
    Grouping, Mode, Priority, RecordingType, RemoteRecording, RetentionPolicy, RetryPolicy,
    SyncConfig,
};
