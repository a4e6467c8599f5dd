//! Remote catalog: listing recordings on the camera and fetching their bytes.

use crate::error::SyncError;
use crate::types::{RecordingType, RemoteRecording};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::NaiveDateTime;
use futures_util::{Stream, StreamExt};
use reqwest::header::RANGE;
use reqwest::StatusCode;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Novatek command returning the full file list as XML.
const LIST_FILES_QUERY: &str = "?custom=1&cmd=3015&par=1";

/// Timestamp format of the listing's `TIME` element.
const LISTING_TIME_FORMAT: &str = "%Y/%m/%d %H:%M:%S";

/// Chunks of a recording's bytes.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, SyncError>> + Send>>;

/// An open transfer.
pub struct Fetch {
    /// Byte offset the stream actually starts at. Equals the requested offset
    /// when the camera honoured the range, `0` when it sent the whole file.
    pub offset: u64,
    pub stream: ByteStream,
}

/// Source of recordings.
///
/// The HTTP implementation talks to the camera; tests drive the engine with
/// an in-memory catalog.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Camera address, for logging.
    fn address(&self) -> &str;

    /// Enumerates the recordings currently stored on the camera.
    ///
    /// Fails with [`SyncError::Unreachable`] when the camera does not answer.
    async fn list(&self) -> Result<Vec<RemoteRecording>, SyncError>;

    /// Opens a byte stream of `recording` starting at `offset`.
    async fn fetch(&self, recording: &RemoteRecording, offset: u64) -> Result<Fetch, SyncError>;
}

/// Catalog client for the camera's built-in HTTP server.
///
/// # Example
///
/// ```no_run
/// use dashsync::{Catalog, HttpCatalog};
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let catalog = HttpCatalog::new("192.168.1.254", Duration::from_secs(10))?;
/// let recordings = catalog.list().await?;
/// # Ok(())
/// # }
/// ```
pub struct HttpCatalog {
    address: String,
    base_url: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpCatalog {
    /// Creates a client for the camera at `address`.
    ///
    /// # Arguments
    ///
    /// * `address` - Host name or IP, optionally with port or `http://` scheme
    /// * `timeout` - Connect and read timeout for every request
    pub fn new(address: &str, timeout: Duration) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()?;
        let trimmed = address.trim_end_matches('/');
        let base_url = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            trimmed.to_string()
        } else {
            format!("http://{}", trimmed)
        };
        Ok(Self {
            address: address.to_string(),
            base_url,
            timeout,
            client,
        })
    }

    fn listing_url(&self) -> String {
        format!("{}/{}", self.base_url, LIST_FILES_QUERY)
    }

    /// Maps a camera path such as `A:\Novatek\Movie\x.MP4` to its download URL.
    fn file_url(&self, remote_path: &str) -> String {
        let cleaned = remote_path.replace("A:", "").replace('\\', "/");
        format!("{}/{}", self.base_url, cleaned.trim_start_matches('/'))
    }

    fn unreachable(&self, reason: impl ToString) -> SyncError {
        SyncError::Unreachable {
            address: self.address.clone(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl Catalog for HttpCatalog {
    fn address(&self) -> &str {
        &self.address
    }

    async fn list(&self) -> Result<Vec<RemoteRecording>, SyncError> {
        let url = self.listing_url();
        debug!("Retrieving file list from {}", url);

        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.unreachable(format!("file list request returned HTTP {}", status)));
        }

        let body = response.text().await.map_err(|e| self.unreachable(e))?;
        let recordings = parse_listing(&body)?;
        info!("Found {} recordings on dashcam", recordings.len());
        Ok(recordings)
    }

    async fn fetch(&self, recording: &RemoteRecording, offset: u64) -> Result<Fetch, SyncError> {
        let url = self.file_url(&recording.remote_path);
        let mut request = self.client.get(&url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={}-", offset));
        }

        let response = request.send().await.map_err(|e| self.unreachable(e))?;
        let start = match response.status() {
            StatusCode::PARTIAL_CONTENT => offset,
            status if status.is_success() => {
                if offset > 0 {
                    debug!("Camera ignored range request for {}, restarting", recording.filename);
                }
                0
            }
            status => {
                return Err(SyncError::transfer(
                    &recording.filename,
                    format!("HTTP {} from {}", status, url),
                ))
            }
        };

        let id = recording.filename.clone();
        let stream = response
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| SyncError::transfer(&id, e)));
        Ok(Fetch {
            offset: start,
            stream: Box::pin(stream),
        })
    }
}

/// Parses the camera's XML file list.
///
/// Entries missing a field or carrying an unparseable value are skipped
/// with a warning; a document without a `LIST` root is rejected.
pub(crate) fn parse_listing(xml: &str) -> Result<Vec<RemoteRecording>, SyncError> {
    if !xml.contains("<LIST") {
        let head: String = xml.chars().take(80).collect();
        return Err(SyncError::CatalogInvalid(format!(
            "expected a LIST document, got '{}'",
            head.trim()
        )));
    }

    let mut recordings = Vec::new();
    for entry in xml_sections(xml, "File") {
        match parse_entry(entry) {
            Some(recording) => recordings.push(recording),
            None => warn!("Skipping unreadable catalog entry: {}", entry.trim()),
        }
    }
    Ok(recordings)
}

fn parse_entry(entry: &str) -> Option<RemoteRecording> {
    let filename = xml_value(entry, "NAME")?;
    let remote_path = xml_value(entry, "FPATH")?;
    let size = xml_value(entry, "SIZE")?.trim().parse().ok()?;
    let time = xml_value(entry, "TIME")?;
    let captured = NaiveDateTime::parse_from_str(time.trim(), LISTING_TIME_FORMAT).ok()?;
    let kind = RecordingType::from_remote_path(&remote_path);
    Some(RemoteRecording {
        filename,
        remote_path,
        captured,
        kind,
        size,
    })
}

/// Returns the inner text of every `<tag>...</tag>` element, in order.
fn xml_sections<'a>(xml: &'a str, tag: &str) -> Vec<&'a str> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let mut sections = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find(open.as_str()) {
        let after = &rest[start + open.len()..];
        let Some(end) = after.find(close.as_str()) else {
            break;
        };
        sections.push(&after[..end]);
        rest = &after[end + close.len()..];
    }
    sections
}

fn xml_value(xml: &str, tag: &str) -> Option<String> {
    xml_sections(xml, tag).first().map(|raw| unescape(raw.trim()))
}

fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
