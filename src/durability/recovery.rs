//! Partition recovery: newest snapshot, then the binlog after it

use super::binlog::Binlog;
use super::snapshot::Snapshot;
use crate::table::Table;
use crate::Result;
use std::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPhase {
    LoadManifest,
    ReplaySnapshot,
    LocateBinlogResumePoint,
    ReplayBinlog,
    Ready,
}

/// Outcome of one recovery run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Watermark of the replayed snapshot, 0 without one
    pub snapshot_offset: u64,
    /// Last offset applied from the binlog, or `snapshot_offset`
    pub latest_offset: u64,
    pub term: u64,
    /// Segment replay started from, `None` when the binlog is empty
    pub resume_segment: Option<u32>,
}

/// Rebuild `table` from `snapshot` and `binlog`.
///
/// `table` must be freshly initialized. Snapshot replay completes before
/// binlog replay starts, and binlog entries are applied in offset order.
pub fn recover(table: &dyn Table, snapshot: &Snapshot, binlog: &Binlog) -> Result<RecoveryReport> {
    let start = Instant::now();
    let mut report = RecoveryReport::default();
    let mut has_snapshot = false;
    let mut phase = RecoveryPhase::LoadManifest;

    while phase != RecoveryPhase::Ready {
        debug!(tid = table.tid(), pid = table.pid(), ?phase, "recovery phase");
        phase = match phase {
            RecoveryPhase::LoadManifest => {
                if let Some(manifest) = snapshot.manifest()? {
                    has_snapshot = true;
                    report.term = manifest.term;
                }
                RecoveryPhase::ReplaySnapshot
            }
            RecoveryPhase::ReplaySnapshot => {
                if has_snapshot {
                    report.snapshot_offset = snapshot.recover(table)?;
                }
                RecoveryPhase::LocateBinlogResumePoint
            }
            RecoveryPhase::LocateBinlogResumePoint => {
                report.resume_segment = binlog.log_parts().find_segment_for(report.snapshot_offset);
                RecoveryPhase::ReplayBinlog
            }
            RecoveryPhase::ReplayBinlog => {
                report.latest_offset = binlog.recover_from_binlog(table, report.snapshot_offset)?;
                RecoveryPhase::Ready
            }
            RecoveryPhase::Ready => RecoveryPhase::Ready,
        };
    }

    info!(
        tid = table.tid(),
        pid = table.pid(),
        snapshot_offset = report.snapshot_offset,
        latest_offset = report.latest_offset,
        term = report.term,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "recovery done"
    );
    Ok(report)
}
