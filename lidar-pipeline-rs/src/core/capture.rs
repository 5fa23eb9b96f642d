//! Pull-based capture replay: pcap datagrams in, assembled frames out.

use std::collections::VecDeque;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use pcap_file::pcap::PcapReader;
use thiserror::Error;

use super::frame::{Frame, FrameAssembler};
use super::packet::{Packet, BLOCKS};

/// Errors that can occur while reading a capture.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("failed to open capture '{path}': {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid pcap stream in '{path}': {source}")]
    Pcap {
        path: PathBuf,
        #[source]
        source: pcap_file::PcapError,
    },
}

/// Result type for capture operations.
pub type Result<T> = std::result::Result<T, CaptureError>;

/// One captured datagram with its capture time in seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct Datagram {
    pub timestamp: f64,
    pub data: Vec<u8>,
}

/// Reads datagrams one at a time from a pcap file.
pub struct CaptureReader {
    reader: PcapReader<BufReader<File>>,
    path: PathBuf,
    done: bool,
}

impl CaptureReader {
    /// Open a pcap capture file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| CaptureError::Open {
            path: path.clone(),
            source: e,
        })?;
        let reader = PcapReader::new(BufReader::new(file)).map_err(|e| CaptureError::Pcap {
            path: path.clone(),
            source: e,
        })?;
        Ok(Self {
            reader,
            path,
            done: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Iterator for CaptureReader {
    type Item = Result<Datagram>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.reader.next_packet() {
            Some(Ok(packet)) => Some(Ok(Datagram {
                timestamp: packet.timestamp.as_secs_f64(),
                data: packet.data.into_owned(),
            })),
            Some(Err(e)) => {
                self.done = true;
                Some(Err(CaptureError::Pcap {
                    path: self.path.clone(),
                    source: e,
                }))
            }
            None => {
                self.done = true;
                None
            }
        }
    }
}

/// Turns a datagram stream into complete frames.
///
/// Only full rotations are yielded; the partial accumulation at end of stream
/// is discarded so the frame count matches [`peek_frame_count`].
pub struct FrameReader<I> {
    source: I,
    assembler: FrameAssembler,
    pending: VecDeque<(f64, Frame)>,
    dropped: usize,
    done: bool,
}

impl<I> FrameReader<I>
where
    I: Iterator<Item = Result<Datagram>>,
{
    pub fn new(source: I) -> Self {
        Self {
            source,
            assembler: FrameAssembler::new(),
            pending: VecDeque::new(),
            dropped: 0,
            done: false,
        }
    }

    /// Number of datagrams rejected by the sensor signature check.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    fn feed(&mut self, datagram: &Datagram) {
        let Some(packet) = Packet::parse(&datagram.data) else {
            self.dropped += 1;
            debug!(
                "skipping {}-byte datagram at t={:.6}",
                datagram.data.len(),
                datagram.timestamp
            );
            return;
        };
        for firing in packet.firings() {
            if let Some(frame) = self.assembler.push(datagram.timestamp, &firing) {
                self.pending.push_back(frame);
            }
        }
    }
}

impl<I> Iterator for FrameReader<I>
where
    I: Iterator<Item = Result<Datagram>>,
{
    type Item = Result<(f64, Frame)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Some(Ok(frame));
            }
            if self.done {
                return None;
            }
            match self.source.next() {
                Some(Ok(datagram)) => self.feed(&datagram),
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                }
                None => {
                    self.done = true;
                    if self.assembler.skipped() > 0 {
                        warn!(
                            "{} firings skipped because frames exceeded capacity",
                            self.assembler.skipped()
                        );
                    }
                }
            }
        }
    }
}

/// Open a capture file as a stream of complete frames.
pub fn open_frames<P: AsRef<Path>>(path: P) -> Result<FrameReader<CaptureReader>> {
    Ok(FrameReader::new(CaptureReader::open(path)?))
}

/// Count frame boundaries in a datagram stream without decoding samples.
///
/// Only the first and last block azimuths of each valid datagram are read.
pub fn peek_frame_count<I>(datagrams: I) -> Result<usize>
where
    I: Iterator<Item = Result<Datagram>>,
{
    let mut count = 0;
    let mut prev_max: u16 = 0;

    for datagram in datagrams {
        let datagram = datagram?;
        let Some(packet) = Packet::parse(&datagram.data) else {
            continue;
        };
        let min_rot = packet.block_azimuth(0);
        let max_rot = packet.block_azimuth(BLOCKS - 1);
        if max_rot < min_rot || prev_max > min_rot {
            count += 1;
        }
        prev_max = max_rot;
    }

    Ok(count)
}

/// Count the frames available in a capture file.
pub fn count_frames<P: AsRef<Path>>(path: P) -> Result<usize> {
    peek_frame_count(CaptureReader::open(path)?)
}
