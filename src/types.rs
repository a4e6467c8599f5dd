//! Data structures for sync operations.

use crate::error::SyncError;
use chrono::{Datelike, Days, NaiveDate, NaiveDateTime};
use regex::Regex;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

/// Suffix carried by a recording while its transfer is incomplete.
pub const PARTIAL_SUFFIX: &str = ".part";

static RECORDING_FILENAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<year>\d{4})_(?P<month>\d{2})(?P<day>\d{2})_(?P<hour>\d{2})(?P<minute>\d{2})(?P<second>\d{2})_(?P<sequence>\d{6})(?P<camera>[FR])\.MP4(?P<partial>\.part)?$",
    )
    .expect("recording filename pattern is valid")
});

static GROUP_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{4}(-\d{2}(-\d{2})?)?$").expect("group name pattern is valid")
});

/// How the camera classified a recording.
///
/// The declaration order is the download order under [`Priority::Type`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RecordingType {
    Manual,
    Event,
    Normal,
    Parking,
}

impl RecordingType {
    /// Classifies a recording from the camera folder in its remote path.
    ///
    /// Novatek firmware stores G-sensor events under `EMR`, user-locked clips
    /// under `RO` and parking-mode clips under `Parking`.
    pub fn from_remote_path(remote_path: &str) -> Self {
        let folders = remote_path
            .split(['\\', '/'])
            .rev()
            .skip(1)
            .map(str::to_ascii_lowercase);
        for folder in folders {
            match folder.as_str() {
                "emr" => return Self::Event,
                "ro" => return Self::Manual,
                "parking" => return Self::Parking,
                _ => {}
            }
        }
        Self::Normal
    }
}

impl fmt::Display for RecordingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Manual => "manual",
            Self::Event => "event",
            Self::Normal => "normal",
            Self::Parking => "parking",
        };
        f.write_str(name)
    }
}

/// A recording as reported by the camera at listing time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRecording {
    /// File name, unique on the camera. Used as the recording identifier.
    pub filename: String,
    /// Camera-side path, e.g. `A:\Novatek\Movie\2024_0315_142530_000123F.MP4`.
    pub remote_path: String,
    /// Capture time in camera-local time.
    pub captured: NaiveDateTime,
    pub kind: RecordingType,
    /// Size in bytes as reported by the listing.
    pub size: u64,
}

impl RemoteRecording {
    pub fn id(&self) -> &str {
        &self.filename
    }
}

/// A recording found under the destination root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalRecording {
    pub path: PathBuf,
    /// Name of the group directory holding the file, `None` at the root.
    pub group: Option<String>,
    /// Recording identifier, without any partial suffix.
    pub filename: String,
    pub captured: NaiveDateTime,
    pub size: u64,
    /// `false` for `.part` files still waiting to be resumed.
    pub complete: bool,
}

/// Parses a downloaded recording filename into its identifier, capture time
/// and completeness.
///
/// Returns `None` for files that are not recordings (GPX tracks, strays).
pub fn parse_recording_filename(name: &str) -> Option<(String, NaiveDateTime, bool)> {
    let caps = RECORDING_FILENAME.captures(name)?;
    let field = |key: &str| caps[key].parse::<u32>().ok();
    let date = NaiveDate::from_ymd_opt(field("year")? as i32, field("month")?, field("day")?)?;
    let captured = date.and_hms_opt(field("hour")?, field("minute")?, field("second")?)?;
    let complete = caps.name("partial").is_none();
    let id = name.strip_suffix(PARTIAL_SUFFIX).unwrap_or(name).to_string();
    Some((id, captured, complete))
}

/// Directory bucketing of downloaded recordings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Grouping {
    #[default]
    None,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl Grouping {
    /// Returns the group directory name for a capture time, or `None` when
    /// recordings are stored directly under the destination root.
    ///
    /// Weekly groups are named after the Monday starting the week.
    pub fn group_name(&self, captured: NaiveDateTime) -> Option<String> {
        let date = captured.date();
        match self {
            Self::None => None,
            Self::Daily => Some(date.format("%Y-%m-%d").to_string()),
            Self::Weekly => {
                let back = u64::from(date.weekday().num_days_from_monday());
                let monday = date.checked_sub_days(Days::new(back)).unwrap_or(date);
                Some(monday.format("%Y-%m-%d").to_string())
            }
            Self::Monthly => Some(date.format("%Y-%m").to_string()),
            Self::Yearly => Some(date.format("%Y").to_string()),
        }
    }

    /// Whether a directory name has the shape of a group produced by any
    /// grouping, so recordings survive a change of `--grouping`.
    pub fn is_group_name(name: &str) -> bool {
        GROUP_NAME.is_match(name)
    }
}

/// Download queue ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Priority {
    /// Oldest first.
    #[default]
    Date,
    /// Newest first.
    Rdate,
    /// Manual, then event, then normal, then parking; oldest first within each.
    Type,
}

/// How long local recordings are kept, in whole days.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub days: u32,
}

impl RetentionPolicy {
    /// The oldest capture date that is still kept on `today`.
    pub fn cutoff(&self, today: NaiveDate) -> NaiveDate {
        today
            .checked_sub_days(Days::new(u64::from(self.days)))
            .unwrap_or(NaiveDate::MIN)
    }

    /// A recording is expired once its age in days exceeds the threshold.
    pub fn is_expired(&self, captured: NaiveDateTime, today: NaiveDate) -> bool {
        captured.date() < self.cutoff(today)
    }
}

impl FromStr for RetentionPolicy {
    type Err = SyncError;

    /// Parses `<number>[d|w]`, e.g. `30`, `30d` or `2w`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SyncError::ConfigInvalid(format!("keep must be <number>[d|w], got '{}'", s));
        let s = s.trim();
        let (number, factor) = match s.strip_suffix('w') {
            Some(weeks) => (weeks, 7),
            None => (s.strip_suffix('d').unwrap_or(s), 1),
        };
        let number: u32 = number.parse().map_err(|_| invalid())?;
        let days = number.checked_mul(factor).ok_or_else(invalid)?;
        Ok(Self { days })
    }
}

/// Bounded in-pass retries of one transfer.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts per item and pass, including the first.
    pub attempts: usize,
    /// Pause between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(5),
        }
    }
}

/// Configuration for a sync engine instance.
///
/// # Example
///
/// ```
/// use dashsync::{Grouping, Priority, SyncConfig};
///
/// let config = SyncConfig {
///     address: "192.168.1.254".to_string(),
///     destination: "/srv/dashcam".into(),
///     grouping: Grouping::Daily,
///     priority: Priority::Type,
///     ..SyncConfig::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Camera host, optionally with port (e.g. `192.168.1.254`)
    pub address: String,
    /// Root output directory
    pub destination: PathBuf,
    pub grouping: Grouping,
    pub priority: Priority,
    /// Only recordings whose filename contains one of these substrings are
    /// synced. Empty means all.
    pub filters: Vec<String>,
    /// Retention threshold; `None` keeps everything.
    pub keep: Option<RetentionPolicy>,
    /// Maximum used-space percentage of the destination volume (0-100).
    pub max_used_disk: u8,
    /// Connect and read timeout for camera requests.
    pub timeout: Duration,
    /// Plan and log without writing or deleting anything.
    pub dry_run: bool,
    /// Extract GPX tracks from downloaded videos.
    pub gps_extract: bool,
    /// Draw per-file progress bars.
    pub show_progress: bool,
    pub retry: RetryPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            address: "192.168.1.254".to_string(),
            destination: PathBuf::from("."),
            grouping: Grouping::None,
            priority: Priority::Date,
            filters: Vec::new(),
            keep: None,
            max_used_disk: 90,
            timeout: Duration::from_secs(10),
            dry_run: false,
            gps_extract: false,
            show_progress: false,
            retry: RetryPolicy::default(),
        }
    }
}

/// Execution mode of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Run exactly one pass.
    RunOnce,
    /// Repeat passes, waiting `interval` after each one completes.
    Monitor { interval: Duration },
}
