//! Record types and append-only sinks.
//!
//! Three kinds of records leave this process, all as CSV: raw spectra (one
//! file per channel), position fixes, and corrected head orientations. The
//! downstream calibration and plotting tools parse these files as-is, so the
//! headers and the bracketed spectrum column are part of the contract.

use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::fs::File;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

/// One completed spectrum acquisition for one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementRecord {
    /// Wall-clock time the head acknowledged the trigger.
    pub time: DateTime<Local>,
    /// Sensor integration time, raw units.
    pub integration_time: u16,
    /// Number of pixels in the spectrum.
    pub length: u16,
    /// Head inclination before the exposure, degrees.
    pub pre_inclination: f32,
    /// Head inclination after the exposure, degrees.
    pub post_inclination: f32,
    /// The decoded spectrum, always [`ORDINATE_LEN`](crate::registers::ORDINATE_LEN) values.
    pub ordinate: Vec<f32>,
}

/// One decoded position fix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionRecord {
    /// Wall-clock time the fix was recorded.
    pub date_time: DateTime<Local>,
    /// Degrees north, negative south.
    pub latitude: f64,
    /// Degrees east, negative west.
    pub longitude: f64,
    /// Meters above sea level.
    pub altitude: f64,
}

/// One corrected head orientation sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrientationRecord {
    /// Wall-clock time the sample was recorded.
    pub date_time: DateTime<Local>,
    /// Quaternion x component.
    pub x: f64,
    /// Quaternion y component.
    pub y: f64,
    /// Quaternion z component.
    pub z: f64,
    /// Quaternion w component.
    pub w: f64,
}

/// Failures writing records out.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Could not create the output file or its directory.
    #[error("failed to create {path}: {source}")]
    Create {
        /// The path that could not be created.
        path: PathBuf,
        /// The underlying I/O failure.
        source: std::io::Error,
    },
    /// A row could not be serialized or written.
    #[error("csv write failed: {0}")]
    Csv(#[from] csv::Error),
    /// Buffered rows could not be flushed to disk.
    #[error("flush failed: {0}")]
    Flush(#[from] std::io::Error),
}

/// A record type that knows its CSV shape.
pub trait CsvRecord: Send + Sync {
    /// Column names, written once when the file is created.
    const HEADER: &'static [&'static str];

    /// The row, one string per column.
    fn fields(&self) -> Vec<String>;
}

const RECORD_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

impl CsvRecord for MeasurementRecord {
    const HEADER: &'static [&'static str] = &[
        "time",
        "integration_time",
        "length",
        "pre_inclination",
        "post_inclination",
        "ordinate",
    ];

    fn fields(&self) -> Vec<String> {
        vec![
            self.time.format(RECORD_TIME_FORMAT).to_string(),
            self.integration_time.to_string(),
            self.length.to_string(),
            self.pre_inclination.to_string(),
            self.post_inclination.to_string(),
            format_ordinate(&self.ordinate),
        ]
    }
}

impl CsvRecord for PositionRecord {
    const HEADER: &'static [&'static str] = &["date_time", "latitude", "longitude", "altitude"];

    fn fields(&self) -> Vec<String> {
        vec![
            self.date_time.format(RECORD_TIME_FORMAT).to_string(),
            self.latitude.to_string(),
            self.longitude.to_string(),
            self.altitude.to_string(),
        ]
    }
}

impl CsvRecord for OrientationRecord {
    const HEADER: &'static [&'static str] = &["date_time", "x", "y", "z", "w"];

    fn fields(&self) -> Vec<String> {
        vec![
            self.date_time.format(RECORD_TIME_FORMAT).to_string(),
            self.x.to_string(),
            self.y.to_string(),
            self.z.to_string(),
            self.w.to_string(),
        ]
    }
}

/// Serialize the spectrum as one bracketed list column, the form the
/// calibration pipeline parses.
fn format_ordinate(values: &[f32]) -> String {
    let mut out = String::with_capacity(values.len() * 8 + 2);
    out.push('[');
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(&value.to_string());
    }
    out.push(']');
    out
}

/// Append-only destination for one record type.
#[async_trait]
pub trait RecordSink<R: CsvRecord>: Send + Sync {
    /// Append one record.
    async fn append(&mut self, record: &R) -> Result<(), SinkError>;

    /// Push buffered records to durable storage.
    async fn flush(&mut self) -> Result<(), SinkError>;
}

/// CSV file sink. Creates the file (and its directory) up front and writes
/// the header immediately, so a crashed run still leaves a parseable file.
pub struct CsvSink<R> {
    path: PathBuf,
    writer: csv::Writer<File>,
    _record: PhantomData<R>,
}

impl<R: CsvRecord> CsvSink<R> {
    /// Create the file at `path`, together with any missing parent directory,
    /// and write the header row.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| SinkError::Create {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }
        let file = File::create(&path).map_err(|source| SinkError::Create {
            path: path.clone(),
            source,
        })?;
        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(R::HEADER)?;
        Ok(Self {
            path,
            writer,
            _record: PhantomData,
        })
    }

    /// Where this sink writes.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl<R: CsvRecord> RecordSink<R> for CsvSink<R> {
    async fn append(&mut self, record: &R) -> Result<(), SinkError> {
        self.writer.write_record(record.fields())?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// In-memory sink. Clones share storage, so a test can hand one clone to a
/// task and inspect the other after the task finishes.
#[derive(Debug, Clone, Default)]
pub struct MemorySink<R> {
    records: Arc<Mutex<Vec<R>>>,
}

impl<R: Clone> MemorySink<R> {
    /// Empty sink.
    pub fn new() -> Self {
        Self {
            records: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Snapshot of everything appended so far.
    pub async fn records(&self) -> Vec<R> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl<R: CsvRecord + Clone> RecordSink<R> for MemorySink<R> {
    async fn append(&mut self, record: &R) -> Result<(), SinkError> {
        self.records.lock().await.push(record.clone());
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

const FILE_STAMP_FORMAT: &str = "%Y%m%dT%H%M";

/// Path of a channel's raw spectrum log, e.g. `Es_buoy_20240301T1230__RAW.csv`.
pub fn raw_spectrum_path(
    dir: &Path,
    prefix: &str,
    station: &str,
    stamp: &DateTime<Local>,
) -> PathBuf {
    dir.join(format!(
        "{prefix}_{station}_{}__RAW.csv",
        stamp.format(FILE_STAMP_FORMAT)
    ))
}

/// Path of the position log.
pub fn position_path(dir: &Path, station: &str, stamp: &DateTime<Local>) -> PathBuf {
    dir.join(format!(
        "position_{station}_{}.csv",
        stamp.format(FILE_STAMP_FORMAT)
    ))
}

/// Path of the orientation log.
pub fn orientation_path(dir: &Path, station: &str, stamp: &DateTime<Local>) -> PathBuf {
    dir.join(format!(
        "orientation_{station}_{}.csv",
        stamp.format(FILE_STAMP_FORMAT)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::ORDINATE_LEN;
    use chrono::TimeZone;

    fn stamp() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap()
    }

    #[test]
    fn file_names_follow_station_stamp_convention() {
        let dir = Path::new("out");
        assert_eq!(
            raw_spectrum_path(dir, "Es", "buoy", &stamp()),
            Path::new("out/Es_buoy_20240301T1230__RAW.csv")
        );
        assert_eq!(
            raw_spectrum_path(dir, "Lw", "buoy", &stamp()),
            Path::new("out/Lw_buoy_20240301T1230__RAW.csv")
        );
        assert_eq!(
            position_path(dir, "buoy", &stamp()),
            Path::new("out/position_buoy_20240301T1230.csv")
        );
        assert_eq!(
            orientation_path(dir, "buoy", &stamp()),
            Path::new("out/orientation_buoy_20240301T1230.csv")
        );
    }

    #[test]
    fn ordinate_column_is_a_bracketed_list() {
        assert_eq!(format_ordinate(&[1.5, -2.25, 0.0]), "[1.5, -2.25, 0]");
        assert_eq!(format_ordinate(&[]), "[]");
    }

    #[tokio::test]
    async fn csv_sink_writes_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spectra.csv");
        let mut sink: CsvSink<MeasurementRecord> = CsvSink::create(&path).unwrap();

        let record = MeasurementRecord {
            time: stamp(),
            integration_time: 512,
            length: 255,
            pre_inclination: 1.5,
            post_inclination: -0.5,
            ordinate: vec![10.0, 20.5],
        };
        sink.append(&record).await.unwrap();
        sink.flush().await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let mut lines = contents.lines();
        assert_eq!(
            lines.next().unwrap(),
            "time,integration_time,length,pre_inclination,post_inclination,ordinate"
        );
        let row = lines.next().unwrap();
        assert!(row.starts_with("2024-03-01 12:30:00"));
        assert!(row.contains(",512,255,1.5,-0.5,"));
        assert!(row.contains("[10, 20.5]"));
    }

    #[tokio::test]
    async fn csv_sink_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/position.csv");
        let mut sink: CsvSink<PositionRecord> = CsvSink::create(&path).unwrap();
        sink.append(&PositionRecord {
            date_time: stamp(),
            latitude: 54.3233,
            longitude: 10.1228,
            altitude: 1.2,
        })
        .await
        .unwrap();
        sink.flush().await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("date_time,latitude,longitude,altitude\n"));
        assert!(contents.contains("54.3233,10.1228,1.2"));
    }

    #[tokio::test]
    async fn memory_sink_clones_share_storage() {
        let sink = MemorySink::<OrientationRecord>::new();
        let mut handle = sink.clone();
        handle
            .append(&OrientationRecord {
                date_time: stamp(),
                x: 0.0,
                y: 0.0,
                z: 0.38268,
                w: 0.92388,
            })
            .await
            .unwrap();
        assert_eq!(sink.records().await.len(), 1);
    }

    #[test]
    fn measurement_record_always_spans_the_full_spectrum() {
        // Compile-time companion of the decode contract: downstream code
        // sizes buffers off this constant.
        assert_eq!(ORDINATE_LEN, 255);
    }
}
