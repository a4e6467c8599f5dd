//! GPS track extraction from Novatek MP4 recordings.
//!
//! The camera embeds one telemetry record per second. The `moov` atom holds a
//! `gps ` atom whose payload is a table of `(offset, size)` pairs, each
//! pointing at a `free` atom tagged `GPS ` that carries a fixed-size record.
//! Extracted tracks are written next to the video as GPX 1.0.

use crate::error::SyncError;
use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use chrono::{NaiveDate, NaiveDateTime};
use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::{self, BufReader, Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Bytes before the table inside a `gps ` atom: header plus version/count.
const GPS_TABLE_OFFSET: u64 = 16;

/// `free` atom header plus the `GPS ` tag.
const RECORD_HEADER_LEN: usize = 12;

/// Six time fields, three flag bytes plus padding, four floats.
const RECORD_PAYLOAD_LEN: usize = 24 + 4 + 16;

/// Upper bound on a single telemetry record, to reject garbage tables.
const MAX_RECORD_LEN: u32 = 64 * 1024;

const KNOTS_TO_METERS_PER_SECOND: f64 = 0.514444;

/// One decoded GPS fix.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackPoint {
    /// Fix time, UTC as reported by the receiver.
    pub time: NaiveDateTime,
    /// Decimal degrees, negative south.
    pub latitude: f64,
    /// Decimal degrees, negative west.
    pub longitude: f64,
    /// Meters per second.
    pub speed: f64,
    /// Degrees from true north.
    pub bearing: f64,
}

/// Extracts the GPS track embedded in a video.
///
/// # Returns
///
/// Time-ordered points, `Ok(None)` when the video carries no telemetry, or
/// [`SyncError::TelemetryInvalid`] when the file is not a readable MP4.
pub fn extract(video: &Path) -> Result<Option<Vec<TrackPoint>>, SyncError> {
    let file = File::open(video)?;
    let len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    extract_from(&mut reader, len).map_err(|e| SyncError::TelemetryInvalid {
        path: video.to_path_buf(),
        reason: e.to_string(),
    })
}

fn extract_from<R: Read + Seek>(reader: &mut R, len: u64) -> io::Result<Option<Vec<TrackPoint>>> {
    let Some(table) = find_gps_table(reader, len)? else {
        return Ok(None);
    };

    let mut points = Vec::with_capacity(table.len());
    for (pos, size) in table {
        if size > MAX_RECORD_LEN || u64::from(pos) + u64::from(size) > len {
            debug!("Skipping GPS table entry outside the file: {}+{}", pos, size);
            continue;
        }
        reader.seek(SeekFrom::Start(u64::from(pos)))?;
        let mut record = vec![0u8; size as usize];
        reader.read_exact(&mut record)?;
        if let Some(point) = decode_record(&record, size) {
            points.push(point);
        }
    }

    points.sort_by(|a, b| a.time.cmp(&b.time));
    points.dedup_by(|later, earlier| later.time == earlier.time);
    Ok((!points.is_empty()).then_some(points))
}

/// Reads an atom header at the current position.
///
/// Handles 64-bit sizes and the "extends to end of file" size of zero.
fn read_atom<R: Read>(reader: &mut R, offset: u64, len: u64) -> io::Result<(u64, [u8; 4])> {
    let size = reader.read_u32::<BigEndian>()?;
    let mut kind = [0u8; 4];
    reader.read_exact(&mut kind)?;
    let size = match size {
        0 => len - offset,
        1 => reader.read_u64::<BigEndian>()?,
        n => u64::from(n),
    };
    if size < 8 || offset.checked_add(size).map_or(true, |end| end > len) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("atom '{}' at {} has bad size {}", String::from_utf8_lossy(&kind), offset, size),
        ));
    }
    Ok((size, kind))
}

fn find_gps_table<R: Read + Seek>(reader: &mut R, len: u64) -> io::Result<Option<Vec<(u32, u32)>>> {
    let mut offset = 0;
    while offset + 8 <= len {
        reader.seek(SeekFrom::Start(offset))?;
        let (size, kind) = read_atom(reader, offset, len)?;

        if &kind == b"moov" {
            let end = offset + size;
            let mut child = offset + 8;
            while child + 8 <= end {
                reader.seek(SeekFrom::Start(child))?;
                let (child_size, child_kind) = read_atom(reader, child, end)?;
                if &child_kind == b"gps " {
                    return read_gps_table(reader, child, child_size).map(Some);
                }
                child += child_size;
            }
            return Ok(None);
        }
        offset += size;
    }
    Ok(None)
}

fn read_gps_table<R: Read + Seek>(reader: &mut R, atom: u64, size: u64) -> io::Result<Vec<(u32, u32)>> {
    let mut entries = Vec::new();
    let mut entry = atom + GPS_TABLE_OFFSET;
    reader.seek(SeekFrom::Start(entry))?;
    while entry + 8 <= atom + size {
        let pos = reader.read_u32::<BigEndian>()?;
        let len = reader.read_u32::<BigEndian>()?;
        if pos != 0 && len != 0 {
            entries.push((pos, len));
        }
        entry += 8;
    }
    Ok(entries)
}

/// Decodes one `free`/`GPS ` record; `None` if the sentinel does not match,
/// the fix is void or the date is impossible.
fn decode_record(record: &[u8], table_size: u32) -> Option<TrackPoint> {
    if record.len() < RECORD_HEADER_LEN + RECORD_PAYLOAD_LEN {
        return None;
    }
    let declared = u32::from_be_bytes(record[0..4].try_into().ok()?);
    if declared != table_size || &record[4..8] != b"free" || &record[8..12] != b"GPS " {
        return None;
    }

    let mut payload = Cursor::new(&record[RECORD_HEADER_LEN..]);
    let mut fields = [0u32; 6];
    for field in fields.iter_mut() {
        *field = payload.read_u32::<LittleEndian>().ok()?;
    }
    let [hour, minute, second, year, month, day] = fields;
    let mut flags = [0u8; 4];
    payload.read_exact(&mut flags).ok()?;
    let [active, lat_hemisphere, lon_hemisphere, _] = flags;
    let latitude = payload.read_f32::<LittleEndian>().ok()?;
    let longitude = payload.read_f32::<LittleEndian>().ok()?;
    let knots = payload.read_f32::<LittleEndian>().ok()?;
    let bearing = payload.read_f32::<LittleEndian>().ok()?;

    if active != b'A' {
        return None;
    }
    let year = i32::try_from(year).ok()?.checked_add(2000)?;
    let time = NaiveDate::from_ymd_opt(year, month, day)?
        .and_hms_opt(hour, minute, second)?;

    Some(TrackPoint {
        time,
        latitude: nmea_to_degrees(latitude.into(), lat_hemisphere),
        longitude: nmea_to_degrees(longitude.into(), lon_hemisphere),
        speed: f64::from(knots) * KNOTS_TO_METERS_PER_SECOND,
        bearing: bearing.into(),
    })
}

/// Converts NMEA `dddmm.mmmm` into signed decimal degrees.
fn nmea_to_degrees(value: f64, hemisphere: u8) -> f64 {
    let degrees = (value / 100.0).trunc();
    let minutes = value - degrees * 100.0;
    let decimal = degrees + minutes / 60.0;
    match hemisphere {
        b'S' | b'W' => -decimal,
        _ => decimal,
    }
}

/// Path of the track file written for a video.
pub fn track_path(video: &Path) -> PathBuf {
    let mut name = video.as_os_str().to_os_string();
    name.push(".gpx");
    PathBuf::from(name)
}

/// Renders points as a GPX 1.0 document.
pub fn to_gpx(name: &str, points: &[TrackPoint]) -> String {
    let mut gpx = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    gpx.push_str("<gpx version=\"1.0\" creator=\"dashsync\">\n");
    let _ = writeln!(gpx, "<trk><name>{}</name><trkseg>", escape(name));
    for p in points {
        let _ = writeln!(
            gpx,
            "\t<trkpt lat=\"{:.6}\" lon=\"{:.6}\"><time>{}</time><speed>{:.2}</speed><course>{:.1}</course></trkpt>",
            p.latitude,
            p.longitude,
            p.time.format("%Y-%m-%dT%H:%M:%SZ"),
            p.speed,
            p.bearing
        );
    }
    gpx.push_str("</trkseg></trk>\n</gpx>\n");
    gpx
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Extracts the track of `video` and writes it alongside as `<video>.gpx`.
///
/// The track file is written to a temporary name and renamed, so a crash
/// never leaves a truncated GPX behind.
///
/// # Returns
///
/// The track path, or `None` when the video has no telemetry.
pub fn write_track(video: &Path) -> Result<Option<PathBuf>, SyncError> {
    let Some(points) = extract(video)? else {
        return Ok(None);
    };
    let target = track_path(video);
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = crate::planner::partial_path(&target);
    fs::write(&temp, to_gpx(&name, &points))?;
    fs::rename(&temp, &target)?;
    debug!("Wrote {} track points to {}", points.len(), target.display());
    Ok(Some(target))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use byteorder::WriteBytesExt;

    pub(crate) struct Fix {
        pub time: (u32, u32, u32, u32, u32, u32),
        pub active: u8,
        pub lat: (f32, u8),
        pub lon: (f32, u8),
        pub knots: f32,
    }

    fn record(fix: &Fix) -> Vec<u8> {
        let mut payload = Vec::new();
        let (h, mi, s, y, mo, d) = fix.time;
        for v in [h, mi, s, y, mo, d] {
            payload.write_u32::<LittleEndian>(v).unwrap();
        }
        payload.extend([fix.active, fix.lat.1, fix.lon.1, 0]);
        for v in [fix.lat.0, fix.lon.0, fix.knots, 90.0] {
            payload.write_f32::<LittleEndian>(v).unwrap();
        }
        let mut atom = Vec::new();
        atom.write_u32::<BigEndian>((RECORD_HEADER_LEN + payload.len()) as u32).unwrap();
        atom.extend(b"free");
        atom.extend(b"GPS ");
        atom.extend(payload);
        atom
    }

    fn atom(kind: &[u8; 4], body: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.write_u32::<BigEndian>(8 + body.len() as u32).unwrap();
        out.extend(kind);
        out.extend(body);
        out
    }

    /// Builds `ftyp | moov(mvhd, gps ) | records...`.
    pub(crate) fn build_mp4(fixes: &[Fix]) -> Vec<u8> {
        let ftyp = atom(b"ftyp", b"isom\0\0\0\0");
        let mvhd = atom(b"mvhd", &[0u8; 8]);
        let records: Vec<Vec<u8>> = fixes.iter().map(record).collect();

        let gps_len = GPS_TABLE_OFFSET as usize + 8 * records.len();
        let moov_len = 8 + mvhd.len() + gps_len;
        let mut pos = ftyp.len() + moov_len;

        let mut gps_body = vec![0u8; 8];
        for r in &records {
            gps_body.write_u32::<BigEndian>(pos as u32).unwrap();
            gps_body.write_u32::<BigEndian>(r.len() as u32).unwrap();
            pos += r.len();
        }
        let moov_body: Vec<u8> = mvhd.into_iter().chain(atom(b"gps ", &gps_body)).collect();

        let mut file = ftyp;
        file.extend(atom(b"moov", &moov_body));
        for r in records {
            file.extend(r);
        }
        file
    }

    pub(crate) fn fix(second: u32, active: u8) -> Fix {
        Fix {
            time: (14, 25, second, 24, 3, 15),
            active,
            lat: (5130.0, b'N'),
            lon: (7.5, b'W'),
            knots: 10.0,
        }
    }

    fn parse(bytes: Vec<u8>) -> Option<Vec<TrackPoint>> {
        let len = bytes.len() as u64;
        extract_from(&mut Cursor::new(bytes), len).unwrap()
    }

    #[test]
    fn test_decodes_and_orders_fixes() {
        let points = parse(build_mp4(&[fix(2, b'A'), fix(1, b'A'), fix(1, b'A'), fix(3, b'V')])).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].time.to_string(), "2024-03-15 14:25:01");
        assert_eq!(points[1].time.to_string(), "2024-03-15 14:25:02");

        let p = &points[0];
        assert!((p.latitude - 51.5).abs() < 1e-6);
        assert!((p.longitude + 0.125).abs() < 1e-6);
        assert!((p.speed - 5.14444).abs() < 1e-4);
    }

    #[test]
    fn test_no_telemetry() {
        let mut plain = atom(b"ftyp", b"isom\0\0\0\0");
        plain.extend(atom(b"moov", &atom(b"mvhd", &[0u8; 8])));
        plain.extend(atom(b"mdat", &[1, 2, 3, 4]));
        assert!(parse(plain).is_none());

        assert!(parse(build_mp4(&[fix(1, b'V')])).is_none());
    }

    #[test]
    fn test_garbage_is_invalid() {
        let dir = tempfile::TempDir::new().unwrap();
        let video = dir.path().join("junk.MP4");
        fs::write(&video, b"\0\0\0\x02junkjunk").unwrap();
        assert!(matches!(extract(&video), Err(SyncError::TelemetryInvalid { .. })));
    }

    #[test]
    fn test_corrupt_sizes_do_not_overflow() {
        let mut huge = atom(b"ftyp", &[]);
        huge.write_u32::<BigEndian>(1).unwrap();
        huge.extend(b"moov");
        huge.write_u64::<BigEndian>(u64::MAX).unwrap();
        let len = huge.len() as u64;
        assert!(extract_from(&mut Cursor::new(huge), len).is_err());

        let mut bad_year = fix(1, b'A');
        bad_year.time.3 = u32::MAX;
        let bytes = record(&bad_year);
        assert!(decode_record(&bytes, bytes.len() as u32).is_none());
    }

    #[test]
    fn test_write_track() {
        let dir = tempfile::TempDir::new().unwrap();
        let video = dir.path().join("2024_0315_142500_000001F.MP4");
        fs::write(&video, build_mp4(&[fix(1, b'A'), fix(2, b'A')])).unwrap();

        let track = write_track(&video).unwrap().unwrap();
        assert_eq!(track, dir.path().join("2024_0315_142500_000001F.MP4.gpx"));
        let gpx = fs::read_to_string(&track).unwrap();
        assert!(gpx.contains("<name>2024_0315_142500_000001F.MP4.gpx</name>"));
        assert_eq!(gpx.matches("<trkpt").count(), 2);
        assert!(gpx.contains("<time>2024-03-15T14:25:01Z</time>"));
        assert!(!crate::planner::partial_path(&track).exists());
    }
}
