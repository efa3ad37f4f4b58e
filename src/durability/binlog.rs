//! Segmented binlog: on-disk records, segment discovery, replay and purge
//!
//! A segment `{segment:08}.log` is a frame file:
//!
//! ```text
//! SegmentStart { start_offset }
//! Entry(LogEntry)*
//! EndOfSegment { last_offset }      written on clean roll / close only
//! ```
//!
//! A segment without the end marker is the tail that was being written at
//! crash time. Replay takes its complete prefix. A damaged segment followed
//! by one that starts past the replayed prefix leaves a hole in the log, and
//! replay fails with `Corruption` instead of skipping over it.

use super::apply_entry;
use super::log_parts::LogParts;
use crate::storage::frame::{FrameReader, ReadOutcome};
use crate::table::Table;
use crate::types::LogEntry;
use crate::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

const SEGMENT_SUFFIX: &str = ".log";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinlogRecord {
    SegmentStart { start_offset: u64 },
    Entry(LogEntry),
    EndOfSegment { last_offset: u64 },
}

pub fn segment_file_name(segment: u32) -> String {
    format!("{:08}{}", segment, SEGMENT_SUFFIX)
}

pub fn segment_path(dir: &Path, segment: u32) -> PathBuf {
    dir.join(segment_file_name(segment))
}

fn parse_segment_name(name: &str) -> Option<u32> {
    name.strip_suffix(SEGMENT_SUFFIX)
        .filter(|stem| stem.len() == 8)
        .and_then(|stem| stem.parse().ok())
}

/// Segment numbers present in `dir`, ascending
pub fn list_segments(dir: &Path) -> Result<Vec<u32>> {
    let mut segments = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(segment) = entry.file_name().to_str().and_then(parse_segment_name) {
            segments.push(segment);
        }
    }
    segments.sort_unstable();
    Ok(segments)
}

/// Read side of one partition's binlog
pub struct Binlog {
    dir: PathBuf,
    log_parts: LogParts,
}

impl Binlog {
    pub fn new(dir: impl Into<PathBuf>, log_parts: LogParts) -> Self {
        Self {
            dir: dir.into(),
            log_parts,
        }
    }

    /// Open `dir`, creating it if needed, and rebuild the segment index from
    /// the segment headers found there.
    ///
    /// A trailing segment whose header never made it to disk is removed; a
    /// damaged header anywhere else is corruption.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let log_parts = LogParts::new();
        let segments = list_segments(&dir)?;
        for (i, &segment) in segments.iter().enumerate() {
            let path = segment_path(&dir, segment);
            let mut reader = FrameReader::open(&path)?;
            match reader.read_next::<BinlogRecord>()? {
                ReadOutcome::Record(BinlogRecord::SegmentStart { start_offset }) => {
                    log_parts.insert(segment, start_offset)?;
                }
                ReadOutcome::End | ReadOutcome::Truncated { .. } if i + 1 == segments.len() => {
                    warn!(path = %path.display(), "removing binlog segment without header");
                    std::fs::remove_file(&path)?;
                }
                _ => {
                    return Err(StorageError::Corruption(format!(
                        "{}: missing segment header",
                        path.display()
                    )))
                }
            }
        }

        debug!(dir = %dir.display(), segments = log_parts.len(), "binlog opened");
        Ok(Self { dir, log_parts })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn log_parts(&self) -> &LogParts {
        &self.log_parts
    }

    /// Replay every entry with `log_index > after_offset` into `table`.
    ///
    /// Returns the last applied offset, or `after_offset` when nothing was
    /// applied, and leaves the table's offset there.
    pub fn recover_from_binlog(&self, table: &dyn Table, after_offset: u64) -> Result<u64> {
        let start = Instant::now();
        let Some(first_segment) = self.log_parts.find_segment_for(after_offset) else {
            if let Some((segment, start_offset)) = self.log_parts.first() {
                return Err(StorageError::Corruption(format!(
                    "binlog begins at segment {} after offset {}, entries after {} are missing",
                    segment, start_offset, after_offset
                )));
            }
            table.set_offset(after_offset);
            return Ok(after_offset);
        };

        let segments = self.log_parts.segments_from(first_segment);
        let last_segment = segments.last().map(|&(segment, _)| segment);
        let mut latest = after_offset;
        let mut applied = 0u64;
        let mut failed = 0u64;

        for (segment, start_offset) in segments {
            let path = segment_path(&self.dir, segment);
            if !path.exists() {
                return Err(StorageError::Corruption(format!(
                    "binlog segment {} is indexed but missing",
                    path.display()
                )));
            }
            if start_offset > latest {
                return Err(StorageError::Corruption(format!(
                    "binlog segment {} starts after offset {} but replay stopped at {}",
                    segment, start_offset, latest
                )));
            }

            let mut reader = FrameReader::open(&path)?;
            match reader.read_next::<BinlogRecord>()? {
                ReadOutcome::Record(BinlogRecord::SegmentStart { .. }) => {}
                other => {
                    warn!(segment, empty = other.is_clean_end(), "binlog segment has no header, skipped");
                    continue;
                }
            }

            loop {
                match reader.read_next::<BinlogRecord>()? {
                    ReadOutcome::Record(BinlogRecord::Entry(entry)) => {
                        if entry.log_index <= latest {
                            continue;
                        }
                        if let Err(e) = apply_entry(table, &entry) {
                            failed += 1;
                            warn!(
                                tid = table.tid(),
                                pid = table.pid(),
                                log_index = entry.log_index,
                                error = %e,
                                "binlog entry rejected during replay"
                            );
                        }
                        latest = entry.log_index;
                        applied += 1;
                    }
                    ReadOutcome::Record(BinlogRecord::EndOfSegment { .. }) => break,
                    ReadOutcome::Record(BinlogRecord::SegmentStart { .. }) => {
                        warn!(segment, "unexpected segment header inside segment");
                        break;
                    }
                    ReadOutcome::End => {
                        if Some(segment) != last_segment {
                            debug!(segment, "segment without end marker");
                        }
                        break;
                    }
                    ReadOutcome::Truncated { offset } => {
                        warn!(segment, offset, "binlog segment ends mid-frame, keeping its prefix");
                        break;
                    }
                    ReadOutcome::Corrupt { offset, reason } => {
                        warn!(segment, offset, reason = %reason, "corrupt binlog frame, keeping segment prefix");
                        break;
                    }
                }
            }
        }

        table.set_offset(latest);
        info!(
            tid = table.tid(),
            pid = table.pid(),
            after_offset,
            latest_offset = latest,
            applied,
            failed,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "binlog replay done"
        );
        Ok(latest)
    }

    /// Remove segments whose entries are all at or below `offset`.
    ///
    /// The newest segment is always kept.
    pub fn purge_before(&self, offset: u64) -> Result<usize> {
        let Some((first, _)) = self.log_parts.first() else {
            return Ok(0);
        };
        let segments = self.log_parts.segments_from(first);

        let mut keep_from = first;
        for pair in segments.windows(2) {
            let (segment, _) = pair[0];
            let (next, next_start) = pair[1];
            if next_start > offset {
                break;
            }
            let path = segment_path(&self.dir, segment);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            keep_from = next;
        }

        let removed = self.log_parts.remove_before(keep_from);
        if removed > 0 {
            info!(dir = %self.dir.display(), offset, removed, "binlog segments purged");
        }
        Ok(removed)
    }
}
