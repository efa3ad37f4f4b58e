//! Binlog writer
//!
//! Assigns log indexes, appends entries to the current segment and rolls
//! to a new one by size or on demand. A new segment is registered in
//! [`LogParts`] before its header is written, so readers can always locate
//! the segment that holds a given offset.

use super::binlog::{segment_path, BinlogRecord};
use super::log_parts::LogParts;
use crate::config::{BinlogConfig, DurabilityLevel};
use crate::storage::frame::FrameWriter;
use crate::types::LogEntry;
use crate::{Result, StorageError};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

struct WriterState {
    segment: Option<(u32, FrameWriter)>,
    last_offset: u64,
    term: u64,
    closed: bool,
}

pub struct BinlogWriter {
    dir: PathBuf,
    log_parts: LogParts,
    max_segment_size: u64,
    durability: DurabilityLevel,
    state: Mutex<WriterState>,
}

impl BinlogWriter {
    /// Writer continuing after `last_offset`. The first append opens a new
    /// segment numbered after every segment in `log_parts`.
    pub fn new(
        dir: impl Into<PathBuf>,
        log_parts: LogParts,
        last_offset: u64,
        config: &BinlogConfig,
        durability: DurabilityLevel,
    ) -> Self {
        Self {
            dir: dir.into(),
            log_parts,
            max_segment_size: config.max_segment_size,
            durability,
            state: Mutex::new(WriterState {
                segment: None,
                last_offset,
                term: 0,
                closed: false,
            }),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn last_offset(&self) -> u64 {
        self.state.lock().last_offset
    }

    /// Term stamped on entries that do not carry one
    pub fn set_term(&self, term: u64) {
        self.state.lock().term = term;
    }

    pub fn current_segment(&self) -> Option<u32> {
        self.state.lock().segment.as_ref().map(|(segment, _)| *segment)
    }

    /// Append an entry, assigning the next log index. Returns that index.
    pub fn append(&self, mut entry: LogEntry) -> Result<u64> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(StorageError::InvalidState(format!(
                "binlog writer at {} is closed",
                self.dir.display()
            )));
        }

        let needs_roll = match &state.segment {
            None => true,
            Some((_, writer)) => self.max_segment_size > 0 && writer.bytes_written() >= self.max_segment_size,
        };
        if needs_roll {
            self.roll_locked(&mut state)?;
        }

        let log_index = state.last_offset + 1;
        entry.log_index = log_index;
        if entry.term == 0 {
            entry.term = state.term;
        }

        let sync = self.durability.requires_immediate_sync();
        let Some((segment, writer)) = state.segment.as_mut() else {
            return Err(StorageError::InvalidState("binlog segment is not open".into()));
        };
        let segment = *segment;
        let written = writer.append(&BinlogRecord::Entry(entry)).and_then(|_| {
            if sync {
                writer.sync()
            } else {
                writer.flush()
            }
        });
        if let Err(e) = written {
            warn!(segment, log_index, error = %e, "binlog append failed");
            return Err(StorageError::Write(format!("binlog append {}: {}", log_index, e)));
        }

        state.last_offset = log_index;
        Ok(log_index)
    }

    /// Close the current segment with an end marker and open the next one
    pub fn roll(&self) -> Result<u32> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(StorageError::InvalidState("binlog writer is closed".into()));
        }
        self.roll_locked(&mut state)
    }

    fn roll_locked(&self, state: &mut WriterState) -> Result<u32> {
        Self::finish_segment(state, !self.durability.is_no_sync())?;

        let segment = self.log_parts.last().map_or(0, |(last, _)| last + 1);
        self.log_parts.insert(segment, state.last_offset)?;

        let path = segment_path(&self.dir, segment);
        let mut writer = FrameWriter::create(&path)?;
        writer.append(&BinlogRecord::SegmentStart {
            start_offset: state.last_offset,
        })?;
        if self.durability.is_no_sync() {
            writer.flush()?;
        } else {
            writer.sync()?;
        }
        info!(segment, start_offset = state.last_offset, path = %path.display(), "binlog segment opened");
        state.segment = Some((segment, writer));
        Ok(segment)
    }

    fn finish_segment(state: &mut WriterState, sync: bool) -> Result<()> {
        if let Some((segment, mut writer)) = state.segment.take() {
            writer.append(&BinlogRecord::EndOfSegment {
                last_offset: state.last_offset,
            })?;
            if sync {
                writer.sync()?;
            } else {
                writer.flush()?;
            }
            debug!(segment, last_offset = state.last_offset, "binlog segment closed");
        }
        Ok(())
    }

    /// Write the end marker of the current segment and refuse further appends
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        Self::finish_segment(&mut state, !self.durability.is_no_sync())
    }
}

impl Drop for BinlogWriter {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(dir = %self.dir.display(), error = %e, "closing binlog writer failed");
        }
    }
}
