//! tskv-inspect: read-only dump of a partition's durability files

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tskv::durability::binlog::{list_segments, segment_path, Binlog, BinlogRecord};
use tskv::durability::Manifest;
use tskv::storage::{FrameReader, ReadOutcome};

#[derive(Debug, Parser)]
#[command(name = "tskv-inspect", about = "Inspect tskv partition snapshot and binlog files", version)]
struct Args {
    /// Partition directory, `{root}/{tid}_{pid}`
    partition: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the snapshot manifest
    Manifest,
    /// Summarize every binlog segment
    Binlog {
        /// Print each entry as well
        #[arg(short, long)]
        entries: bool,
    },
    /// Print the segment index rebuilt from segment headers
    Parts,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    if !args.partition.is_dir() {
        bail!("{} is not a partition directory", args.partition.display());
    }
    match args.command {
        Command::Manifest => print_manifest(&args.partition.join("snapshot")),
        Command::Binlog { entries } => print_binlog(&args.partition.join("binlog"), entries),
        Command::Parts => print_parts(&args.partition.join("binlog")),
    }
}

fn print_manifest(dir: &Path) -> anyhow::Result<()> {
    match Manifest::load(dir).context("reading manifest")? {
        Some(manifest) => {
            print!("{}", manifest.encode());
            let snapshot = dir.join(&manifest.name);
            if !snapshot.exists() {
                println!("warning: {} is missing", snapshot.display());
            }
        }
        None => println!("no snapshot yet"),
    }
    Ok(())
}

fn print_binlog(dir: &Path, entries: bool) -> anyhow::Result<()> {
    let segments = list_segments(dir).with_context(|| format!("listing {}", dir.display()))?;
    if segments.is_empty() {
        println!("no binlog segments");
        return Ok(());
    }

    for segment in segments {
        let path = segment_path(dir, segment);
        let mut reader = FrameReader::open(&path).with_context(|| format!("opening {}", path.display()))?;
        let mut start = None;
        let mut count = 0u64;
        let mut range: Option<(u64, u64)> = None;
        let tail = loop {
            match reader.read_next::<BinlogRecord>()? {
                ReadOutcome::Record(BinlogRecord::SegmentStart { start_offset }) => start = Some(start_offset),
                ReadOutcome::Record(BinlogRecord::Entry(entry)) => {
                    count += 1;
                    range = Some(match range {
                        Some((first, _)) => (first, entry.log_index),
                        None => (entry.log_index, entry.log_index),
                    });
                    if entries {
                        println!(
                            "  {:>10} {:?} term={} pk={:?} ts={:?} dims={} ts_dims={}",
                            entry.log_index,
                            entry.method_type,
                            entry.term,
                            entry.pk.as_deref().map(String::from_utf8_lossy),
                            entry.ts,
                            entry.dimensions.len(),
                            entry.ts_dimensions.len()
                        );
                    }
                }
                ReadOutcome::Record(BinlogRecord::EndOfSegment { last_offset }) => {
                    break format!("sealed at {}", last_offset)
                }
                ReadOutcome::End => break "open tail".to_string(),
                ReadOutcome::Truncated { offset } => break format!("truncated at byte {}", offset),
                ReadOutcome::Corrupt { offset, reason } => break format!("corrupt at byte {}: {}", offset, reason),
            }
        };

        let start = start.map_or_else(|| "-".to_string(), |s| s.to_string());
        let range = range.map_or_else(|| "-".to_string(), |(a, b)| format!("{}..={}", a, b));
        println!(
            "{} start={} entries={} offsets={} {}",
            path.display(),
            start,
            count,
            range,
            tail
        );
    }
    Ok(())
}

fn print_parts(dir: &Path) -> anyhow::Result<()> {
    if !dir.is_dir() {
        bail!("{} does not exist", dir.display());
    }
    // Binlog::open removes a headerless tail segment, so refuse to touch such a directory
    let segments = list_segments(dir)?;
    let mut complete = true;
    for &segment in &segments {
        let mut reader = FrameReader::open(segment_path(dir, segment))?;
        if !matches!(
            reader.read_next::<BinlogRecord>()?,
            ReadOutcome::Record(BinlogRecord::SegmentStart { .. })
        ) {
            complete = false;
        }
    }
    if !complete {
        bail!("a segment lacks its header; run `binlog` for details");
    }

    let binlog = Binlog::open(dir)?;
    let parts = binlog.log_parts();
    let Some((first, _)) = parts.first() else {
        println!("no binlog segments");
        return Ok(());
    };
    for (segment, start) in parts.segments_from(first) {
        println!("{:08} {}", segment, start);
    }
    Ok(())
}
