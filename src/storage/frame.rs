//! Length-prefixed, checksummed record frames
//!
//! Shared on-disk framing for binlog segments, snapshot files and the kv
//! store's WAL and SSTable blocks:
//!
//! ```text
//! [len: u32 LE][bincode(Frame { checksum, compressed, payload })]
//! ```
//!
//! `payload` is `bincode(record)`, optionally Snappy-compressed. The CRC32 is
//! computed over the stored payload bytes. Readers stop at the first
//! incomplete or damaged frame and report it, they never skip ahead: a torn
//! tail is the normal result of a crash mid-append.

use crate::{Result, StorageError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Frames larger than this are treated as garbage length prefixes
const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
struct Frame {
    checksum: u32,
    compressed: bool,
    payload: Vec<u8>,
}

/// Result of reading one frame
#[derive(Debug)]
pub enum ReadOutcome<T> {
    Record(T),
    /// Clean end of file on a frame boundary
    End,
    /// The file ends in the middle of a frame
    Truncated { offset: u64 },
    /// A complete frame failed its checksum or could not be decoded
    Corrupt { offset: u64, reason: String },
}

impl<T> ReadOutcome<T> {
    pub fn is_clean_end(&self) -> bool {
        matches!(self, ReadOutcome::End)
    }
}

/// Append-only frame writer
pub struct FrameWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    bytes_written: u64,
    compress: bool,
}

impl FrameWriter {
    /// Create (or truncate) a frame file
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            bytes_written: 0,
            compress: false,
        })
    }

    /// Open an existing frame file for appending
    pub fn open_append(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let bytes_written = file.metadata()?.len();
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            bytes_written,
            compress: false,
        })
    }

    /// Snappy-compress the payload of every subsequent frame
    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Serialize and append one record, returning the frame's size in bytes
    pub fn append<T: Serialize>(&mut self, record: &T) -> Result<u64> {
        let raw = bincode::serialize(record)?;
        let payload = if self.compress {
            snap::raw::Encoder::new().compress_vec(&raw)?
        } else {
            raw
        };
        let frame = Frame {
            checksum: crc32fast::hash(&payload),
            compressed: self.compress,
            payload,
        };
        let body = bincode::serialize(&frame)?;
        if body.len() > MAX_FRAME_LEN {
            return Err(StorageError::InvalidArgument(format!(
                "frame of {} bytes exceeds the {} byte limit",
                body.len(),
                MAX_FRAME_LEN
            )));
        }

        self.writer.write_all(&(body.len() as u32).to_le_bytes())?;
        self.writer.write_all(&body)?;

        let size = 4 + body.len() as u64;
        self.bytes_written += size;
        Ok(size)
    }

    /// Append bytes outside any frame, for trailers read back by position
    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes)?;
        self.bytes_written += bytes.len() as u64;
        Ok(())
    }

    /// Push buffered frames to the OS
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Flush and fsync
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Total file size, including frames written before this writer opened
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Sequential frame reader
pub struct FrameReader<R: Read> {
    reader: R,
    offset: u64,
}

impl FrameReader<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: Read> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader, offset: 0 }
    }

    /// Byte offset of the next frame
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read and decode the next record
    pub fn read_next<T: DeserializeOwned>(&mut self) -> Result<ReadOutcome<T>> {
        let start = self.offset;

        let mut len_buf = [0u8; 4];
        match read_full(&mut self.reader, &mut len_buf)? {
            0 => return Ok(ReadOutcome::End),
            n if n < len_buf.len() => return Ok(ReadOutcome::Truncated { offset: start }),
            _ => {}
        }

        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_FRAME_LEN {
            return Ok(ReadOutcome::Corrupt {
                offset: start,
                reason: format!("frame length {} exceeds limit", len),
            });
        }

        let mut body = vec![0u8; len];
        if read_full(&mut self.reader, &mut body)? < len {
            return Ok(ReadOutcome::Truncated { offset: start });
        }
        self.offset += 4 + len as u64;

        let frame: Frame = match bincode::deserialize(&body) {
            Ok(frame) => frame,
            Err(e) => {
                return Ok(ReadOutcome::Corrupt {
                    offset: start,
                    reason: format!("undecodable frame: {}", e),
                })
            }
        };

        let actual = crc32fast::hash(&frame.payload);
        if actual != frame.checksum {
            return Ok(ReadOutcome::Corrupt {
                offset: start,
                reason: format!(
                    "checksum mismatch: expected {:#010x}, got {:#010x}",
                    frame.checksum, actual
                ),
            });
        }

        let raw = if frame.compressed {
            match snap::raw::Decoder::new().decompress_vec(&frame.payload) {
                Ok(raw) => raw,
                Err(e) => {
                    return Ok(ReadOutcome::Corrupt {
                        offset: start,
                        reason: format!("snappy: {}", e),
                    })
                }
            }
        } else {
            frame.payload
        };

        match bincode::deserialize(&raw) {
            Ok(record) => Ok(ReadOutcome::Record(record)),
            Err(e) => Ok(ReadOutcome::Corrupt {
                offset: start,
                reason: format!("undecodable record: {}", e),
            }),
        }
    }
}

/// Like `read_exact`, but reports how many bytes were read before EOF.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}
