//! Error types for sync operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while synchronizing a dashcam.
///
/// Running out of disk budget and finding no GPS data in a video are not
/// errors; see [`DiskStatus`](crate::guard::DiskStatus) and
/// [`extract`](crate::gps::extract).
#[derive(Error, Debug)]
pub enum SyncError {
    /// The camera did not answer within the configured timeout.
    #[error("Camera at {address} is unreachable: {reason}")]
    Unreachable { address: String, reason: String },

    /// A single recording's transfer broke off.
    #[error("Transfer of {id} failed: {reason}")]
    TransferFailed { id: String, reason: String },

    /// A policy or flag value is malformed.
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    /// A local recording could not be removed.
    #[error("Failed to delete {}: {source}", path.display())]
    RetentionDeleteFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The camera answered but the listing could not be understood.
    #[error("Malformed catalog listing: {0}")]
    CatalogInvalid(String),

    /// The telemetry subchannel is present but structurally broken.
    #[error("Malformed telemetry in {}: {reason}", path.display())]
    TelemetryInvalid { path: PathBuf, reason: String },

    /// I/O error during file operations.
    #[error(transparent)]
    IoError(#[from] io::Error),

    /// HTTP error not otherwise classified.
    #[error(transparent)]
    ReqwestError(#[from] reqwest::Error),
}

impl SyncError {
    /// Returns `true` if the failure is limited to one pass or one item and
    /// the next pass may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Unreachable { .. }
                | Self::TransferFailed { .. }
                | Self::RetentionDeleteFailed { .. }
                | Self::CatalogInvalid(_)
                | Self::TelemetryInvalid { .. }
        )
    }

    pub(crate) fn transfer(id: &str, reason: impl ToString) -> Self {
        Self::TransferFailed {
            id: id.to_string(),
            reason: reason.to_string(),
        }
    }
}
