//! Loader for background frame tables.
//!
//! The table is plain text with one header row followed by one row per sample:
//!
//! ```text
//! # id,elevation,azimuth,distance,intensity
//! 0         -30.67000 0.00000   12.34000  14.00000
//! ```
//!
//! Values are whitespace separated and padded to fixed width.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use thiserror::Error;

use super::frame::{Frame, MAX_FRAME_SAMPLES};
use super::packet::LASERS;

/// Number of columns in a background table row.
const COLUMNS: usize = 5;

/// Failure reading a background table.
#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Empty file: {0}")]
    EmptyFile(PathBuf),

    #[error("Parse error in '{path}' line {line}: {message}")]
    ParseError {
        path: PathBuf,
        line: usize,
        message: String,
    },
}

/// Loader result.
pub type Result<T> = std::result::Result<T, LoaderError>;

/// Load a background frame from a text table.
///
/// The header row is skipped and at most [`MAX_FRAME_SAMPLES`] rows are read.
///
/// # Errors
///
/// Returns an error if the file cannot be read, has no data rows, or a row is
/// truncated or contains a non-numeric value.
pub fn load_background<P: AsRef<Path>>(path: P) -> Result<Frame> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let reader = BufReader::new(file);

    let mut channel = Vec::new();
    let mut elevation = Vec::new();
    let mut azimuth = Vec::new();
    let mut distance = Vec::new();
    let mut intensity = Vec::new();

    for (idx, line) in reader.lines().enumerate().skip(1) {
        if channel.len() >= MAX_FRAME_SAMPLES {
            break;
        }

        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let values: Vec<&str> = line.split_whitespace().collect();
        if values.len() < COLUMNS {
            return Err(LoaderError::ParseError {
                path: path.to_path_buf(),
                line: idx + 1,
                message: format!("expected {} columns, found {}", COLUMNS, values.len()),
            });
        }

        let mut parsed = [0.0f64; COLUMNS];
        for (slot, value) in parsed.iter_mut().zip(&values) {
            *slot = value.parse().map_err(|_| LoaderError::ParseError {
                path: path.to_path_buf(),
                line: idx + 1,
                message: format!("invalid number '{}'", value),
            })?;
        }

        let id = parsed[0];
        if id.fract() != 0.0 || !(0.0..LASERS as f64).contains(&id) {
            return Err(LoaderError::ParseError {
                path: path.to_path_buf(),
                line: idx + 1,
                message: format!("channel '{}' outside 0..{}", values[0], LASERS),
            });
        }
        channel.push(id as u8);
        elevation.push(parsed[1] as f32);
        azimuth.push(parsed[2] as f32);
        distance.push(parsed[3] as f32);
        intensity.push(parsed[4].round().clamp(0.0, 255.0) as u8);
    }

    if channel.is_empty() {
        return Err(LoaderError::EmptyFile(path.to_path_buf()));
    }

    Frame::from_columns(channel, elevation, azimuth, distance, intensity).ok_or_else(|| {
        LoaderError::ParseError {
            path: path.to_path_buf(),
            line: 0,
            message: "column length mismatch".to_string(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_background() -> Result<()> {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "# id,elevation,azimuth,distance,intensity").unwrap();
        writeln!(file, "0         -30.67000 0.00000   12.34000  14.00000  ").unwrap();
        writeln!(file, "1         -9.33000  0.00000   0.00000   0.00000   ").unwrap();
        file.flush().unwrap();

        let frame = load_background(file.path())?;
        assert_eq!(frame.len(), 2);
        assert_eq!(frame.channels(), &[0, 1]);
        assert!((frame.elevations()[0] + 30.67).abs() < 1e-5);
        assert!((frame.distances()[0] - 12.34).abs() < 1e-5);
        assert_eq!(frame.intensities()[0], 14);
        assert_eq!(frame.to_points().len(), 1);

        Ok(())
    }

    #[test]
    fn test_truncated_row_is_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "# id,elevation,azimuth,distance,intensity").unwrap();
        writeln!(file, "0 -30.67 0.0 12.3 14.0").unwrap();
        writeln!(file, "1 -9.33 0.0").unwrap();
        file.flush().unwrap();

        let result = load_background(file.path());
        assert!(matches!(result, Err(LoaderError::ParseError { line: 3, .. })));
    }

    #[test]
    fn test_header_only_is_empty() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "# id,elevation,azimuth,distance,intensity").unwrap();
        file.flush().unwrap();

        assert!(matches!(
            load_background(file.path()),
            Err(LoaderError::EmptyFile(_))
        ));
    }

    #[test]
    fn test_channel_out_of_range() {
        for id in ["300", "32", "-1", "2.5"] {
            let mut file = NamedTempFile::new().unwrap();
            writeln!(file, "# id,elevation,azimuth,distance,intensity").unwrap();
            writeln!(file, "31 -30.67 0.0 12.3 14.0").unwrap();
            writeln!(file, "{} -9.33 0.0 12.3 14.0", id).unwrap();
            file.flush().unwrap();

            let result = load_background(file.path());
            assert!(
                matches!(result, Err(LoaderError::ParseError { line: 3, .. })),
                "channel {id} accepted"
            );
        }
    }

    #[test]
    fn test_invalid_number() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "# header").unwrap();
        writeln!(file, "0 -30.67 abc 12.3 14.0").unwrap();
        file.flush().unwrap();

        assert!(matches!(
            load_background(file.path()),
            Err(LoaderError::ParseError { .. })
        ));
    }
}
