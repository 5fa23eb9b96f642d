//! Buffered writer for per-frame tracked object records.
//!
//! Two formats are supported:
//! - JSON lines: one `{frame_number, timestamp, objects}` document per frame
//! - CSV: one row per object with its centroid and oriented box corners;
//!   frames without objects produce no rows

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::warn;
use serde::Serialize;
use thiserror::Error;

use super::points::Point;
use super::writers::{create_buffered_writer, ensure_parent_dirs, WriteError};
use crate::processors::clustering::Cluster;

/// Default number of frame records buffered between flushes.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

#[derive(Error, Debug)]
pub enum OutputError {
    #[error(transparent)]
    Open(#[from] WriteError),

    #[error("failed to write output '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode JSON record for '{path}': {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write CSV row to '{path}': {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("unknown output format '{0}', expected 'json' or 'csv'")]
    UnknownFormat(String),
}

/// Result type for output operations.
pub type Result<T> = std::result::Result<T, OutputError>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Json,
    Csv,
}

impl FromStr for OutputFormat {
    type Err = OutputError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "csv" => Ok(OutputFormat::Csv),
            _ => Err(OutputError::UnknownFormat(s.to_string())),
        }
    }
}

/// One tracked object in an output record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectRecord {
    pub id: Option<u64>,
    pub size: usize,
    pub centroid: Point,
    /// `[min, max]` corners
    pub aabb: [Point; 2],
    pub oobb: [Point; 8],
}

impl From<&Cluster> for ObjectRecord {
    fn from(cluster: &Cluster) -> Self {
        Self {
            id: cluster.track_id,
            size: cluster.size,
            centroid: cluster.centroid,
            aabb: [cluster.aabb.0, cluster.aabb.1],
            oobb: cluster.oobb,
        }
    }
}

/// All objects of one frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameRecord {
    pub frame_number: usize,
    pub timestamp: f64,
    pub objects: Vec<ObjectRecord>,
}

impl FrameRecord {
    pub fn new(frame_number: usize, timestamp: f64, clusters: &[Cluster]) -> Self {
        Self {
            frame_number,
            timestamp,
            objects: clusters.iter().map(ObjectRecord::from).collect(),
        }
    }
}

/// CSV header matching [`csv_row`].
fn csv_header() -> Vec<String> {
    let mut header: Vec<String> = ["frame_number", "timestamp", "id", "size", "cx", "cy", "cz"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    for i in 0..8 {
        for axis in ["x", "y", "z"] {
            header.push(format!("{}{}", axis, i));
        }
    }
    header
}

fn csv_row(record: &FrameRecord, object: &ObjectRecord) -> Vec<String> {
    let mut row = vec![
        record.frame_number.to_string(),
        format!("{:.6}", record.timestamp),
        object.id.map(|id| id.to_string()).unwrap_or_default(),
        object.size.to_string(),
        format!("{:.6}", object.centroid[0]),
        format!("{:.6}", object.centroid[1]),
        format!("{:.6}", object.centroid[2]),
    ];
    for corner in &object.oobb {
        for v in corner {
            row.push(format!("{:.6}", v));
        }
    }
    row
}

enum Sink {
    Json(BufWriter<File>),
    Csv(csv::Writer<BufWriter<File>>),
}

/// Writes frame records to a file, flushing every `batch_size` records.
pub struct OutputWriter {
    path: PathBuf,
    sink: Sink,
    buffer: Vec<FrameRecord>,
    batch_size: usize,
    written: usize,
}

impl OutputWriter {
    /// Create the output file, truncating any existing content.
    pub fn create<P: AsRef<Path>>(
        path: P,
        format: OutputFormat,
        batch_size: usize,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        ensure_parent_dirs(&path)?;
        let writer = create_buffered_writer(&path)?;

        let sink = match format {
            OutputFormat::Json => Sink::Json(writer),
            OutputFormat::Csv => {
                let mut csv_writer = csv::Writer::from_writer(writer);
                csv_writer
                    .write_record(csv_header())
                    .map_err(|e| OutputError::Csv {
                        path: path.clone(),
                        source: e,
                    })?;
                Sink::Csv(csv_writer)
            }
        };

        Ok(Self {
            path,
            sink,
            buffer: Vec::new(),
            batch_size: batch_size.max(1),
            written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of records flushed to the file so far.
    pub fn written(&self) -> usize {
        self.written
    }

    /// Queue a record, flushing once the batch is full.
    pub fn add(&mut self, record: FrameRecord) -> Result<()> {
        self.buffer.push(record);
        if self.buffer.len() >= self.batch_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Write all queued records to the file.
    pub fn flush(&mut self) -> Result<()> {
        let path = &self.path;
        match &mut self.sink {
            Sink::Json(writer) => {
                for record in &self.buffer {
                    serde_json::to_writer(&mut *writer, record).map_err(|e| OutputError::Json {
                        path: path.clone(),
                        source: e,
                    })?;
                    writer.write_all(b"\n").map_err(|e| OutputError::Io {
                        path: path.clone(),
                        source: e,
                    })?;
                }
                writer.flush().map_err(|e| OutputError::Io {
                    path: path.clone(),
                    source: e,
                })?;
            }
            Sink::Csv(writer) => {
                for record in &self.buffer {
                    for object in &record.objects {
                        writer
                            .write_record(csv_row(record, object))
                            .map_err(|e| OutputError::Csv {
                                path: path.clone(),
                                source: e,
                            })?;
                    }
                }
                writer.flush().map_err(|e| OutputError::Io {
                    path: path.clone(),
                    source: e,
                })?;
            }
        }
        self.written += self.buffer.len();
        self.buffer.clear();
        Ok(())
    }

    /// Flush remaining records and close the file.
    pub fn close(mut self) -> Result<usize> {
        self.flush()?;
        Ok(self.written)
    }
}

impl Drop for OutputWriter {
    /// Queued records are flushed even when the writer is never closed.
    fn drop(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        if let Err(e) = self.flush() {
            warn!("dropping {} unwritten records: {e}", self.buffer.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn cluster(id: u64, offset: f32) -> Cluster {
        let mut c = Cluster::from_points(vec![
            [offset, 0.0, 0.0],
            [offset + 1.0, 0.0, 0.5],
            [offset + 1.0, 2.0, 1.0],
            [offset, 2.0, 0.0],
        ])
        .unwrap();
        c.track_id = Some(id);
        c
    }

    #[test]
    fn test_json_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.json");
        let mut writer = OutputWriter::create(&path, OutputFormat::Json, 10).unwrap();
        writer.add(FrameRecord::new(0, 1.5, &[cluster(7, 0.0)])).unwrap();
        writer.add(FrameRecord::new(1, 1.6, &[])).unwrap();
        assert_eq!(writer.close().unwrap(), 2);

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["frame_number"], 0);
        assert_eq!(first["objects"][0]["id"], 7);
        assert_eq!(first["objects"][0]["size"], 4);
        assert_eq!(first["objects"][0]["oobb"].as_array().unwrap().len(), 8);
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["objects"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn test_csv_rows_per_object() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let mut writer = OutputWriter::create(&path, OutputFormat::Csv, 1000).unwrap();
        writer.add(FrameRecord::new(0, 0.1, &[cluster(0, 0.0), cluster(1, 5.0)])).unwrap();
        writer.add(FrameRecord::new(1, 0.2, &[])).unwrap();
        writer.add(FrameRecord::new(2, 0.3, &[cluster(1, 5.5)])).unwrap();
        writer.close().unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(headers.len(), 7 + 24);
        assert_eq!(&headers[0], "frame_number");

        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 3);
        assert_eq!(&rows[2][0], "2");
        assert_eq!(&rows[2][2], "1");
        assert_eq!(&rows[0][4], "0.500000");
    }

    #[test]
    fn test_batching_and_truncation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.json");
        fs::write(&path, "stale content\n").unwrap();

        let mut writer = OutputWriter::create(&path, OutputFormat::Json, 2).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "");

        writer.add(FrameRecord::new(0, 0.0, &[])).unwrap();
        assert_eq!(writer.written(), 0);
        writer.add(FrameRecord::new(1, 0.0, &[])).unwrap();
        assert_eq!(writer.written(), 2);
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 2);

        writer.add(FrameRecord::new(2, 0.0, &[])).unwrap();
        assert_eq!(writer.close().unwrap(), 3);
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 3);
    }

    #[test]
    fn test_dropped_writer_flushes_queue() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.json");
        let mut writer = OutputWriter::create(&path, OutputFormat::Json, 10).unwrap();
        writer.add(FrameRecord::new(0, 0.0, &[cluster(3, 0.0)])).unwrap();
        writer.add(FrameRecord::new(1, 0.1, &[])).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "");

        drop(writer);
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 2);
    }

    #[test]
    fn test_format_from_str() {
        assert_eq!("JSON".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert_eq!("csv".parse::<OutputFormat>().unwrap(), OutputFormat::Csv);
        assert!("xml".parse::<OutputFormat>().is_err());
    }
}
