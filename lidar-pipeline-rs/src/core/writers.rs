//! Writer for background frame tables.
//!
//! Produces the fixed-width text format read back by
//! [`load_background`](super::loaders::load_background).

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use thiserror::Error;

use super::frame::Frame;

/// Header row of a background table.
pub const BACKGROUND_HEADER: &str = "# id,elevation,azimuth,distance,intensity";

/// Failure writing a background table or output file.
#[derive(Error, Debug)]
pub enum WriteError {
    /// Parent directory could not be created.
    #[error("failed to create parent directories for '{path}': {source}")]
    CreateDirectory {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Target file could not be opened.
    #[error("failed to create file '{path}': {source}")]
    CreateFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Write or flush failed part-way.
    #[error("failed to write to file '{path}': {source}")]
    WriteFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Writer result.
pub type Result<T> = std::result::Result<T, WriteError>;

/// Make sure the directory holding `path` exists.
pub(crate) fn ensure_parent_dirs(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| WriteError::CreateDirectory {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
    }
    Ok(())
}

/// Creates a buffered writer for the given path, truncating existing content.
pub(crate) fn create_buffered_writer(path: &Path) -> Result<BufWriter<File>> {
    let file = File::create(path).map_err(|e| WriteError::CreateFile {
        path: path.display().to_string(),
        source: e,
    })?;
    Ok(BufWriter::new(file))
}

/// Write a frame as a background table.
///
/// # Errors
///
/// Returns an error if parent directories cannot be created or the file
/// cannot be written.
pub fn write_background(path: &Path, frame: &Frame) -> Result<()> {
    ensure_parent_dirs(path)?;
    let mut writer = create_buffered_writer(path)?;
    let path_str = path.display().to_string();
    let io_err = |e| WriteError::WriteFile {
        path: path_str.clone(),
        source: e,
    };

    writeln!(writer, "{}", BACKGROUND_HEADER).map_err(io_err)?;
    for sample in frame.samples() {
        writeln!(
            writer,
            "{:<10}{:<10.5}{:<10.5}{:<10.5}{:<10.5}",
            sample.channel,
            sample.elevation_deg,
            sample.azimuth_deg,
            sample.range_m,
            sample.intensity as f32,
        )
        .map_err(io_err)?;
    }
    writer.flush().map_err(io_err)?;

    Ok(())
}
