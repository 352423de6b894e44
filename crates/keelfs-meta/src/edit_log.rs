//! Edit log: the write-ahead log of namespace mutations.
//!
//! Records are appended to an in-progress segment and fsynced before the
//! mutation becomes visible. Rolling closes the in-progress segment under
//! its final name so a checkpoint can cover it, after which it may be purged.
//!
//! Segment files in the metadata directory:
//!
//! ```text
//! edits_inprogress_<first>      open segment, first record <first>
//! edits_<first>-<last>          closed segment holding records first..=last
//! ```
//!
//! Each record is framed as `len:u32 | crc32:u32 | bincode(LogRecord)`. A
//! frame that is short or fails its CRC at the end of the in-progress
//! segment is a torn write from a crash and is dropped on recovery.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::types::*;

const INPROGRESS_PREFIX: &str = "edits_inprogress_";
const FINALIZED_PREFIX: &str = "edits_";
const FRAME_HEADER_LEN: usize = 8;

/// A namespace mutation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogOp {
    /// Create a file or directory
    Create {
        /// Parent directory
        parent: InodeId,
        /// Name within the parent
        name: String,
        /// Id of the new inode
        inode: InodeId,
        /// File or directory
        kind: InodeKind,
        /// Replication factor (files)
        replication: u16,
        /// Creation time
        mtime_ms: u64,
    },
    /// Delete an inode and everything below it
    Delete {
        /// Inode to delete
        inode: InodeId,
        /// Time of the deletion, stamped on the parent
        mtime_ms: u64,
    },
    /// Move and/or rename an inode
    Rename {
        /// Inode to move
        inode: InodeId,
        /// Destination directory
        new_parent: InodeId,
        /// Destination name
        new_name: String,
        /// Time of the rename
        mtime_ms: u64,
    },
    /// Append a new under-construction block to a file
    AddBlock {
        /// Owning file
        inode: InodeId,
        /// The new block
        block: BlockId,
    },
    /// Mark a block complete with its final length
    CommitBlock {
        /// Owning file
        inode: InodeId,
        /// The block
        block: BlockId,
        /// Final length
        size: u64,
        /// Time of the commit
        mtime_ms: u64,
    },
    /// Drop the last, never-committed block of a file
    AbandonBlock {
        /// Owning file
        inode: InodeId,
        /// The block
        block: BlockId,
    },
}

/// A sequenced log entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Monotonic sequence number, starting at 1
    pub seq: u64,
    /// The mutation
    pub op: LogOp,
}

/// A segment file found in the metadata directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentInfo {
    /// Path of the segment file
    pub path: PathBuf,
    /// Sequence number of the first record
    pub first: u64,
    /// Sequence number of the last record; None while in progress
    pub last: Option<u64>,
}

fn inprogress_name(first: u64) -> String {
    format!("{}{:019}", INPROGRESS_PREFIX, first)
}

fn finalized_name(first: u64, last: u64) -> String {
    format!("{}{:019}-{:019}", FINALIZED_PREFIX, first, last)
}

fn parse_segment_name(name: &str) -> Option<(u64, Option<u64>)> {
    if let Some(first) = name.strip_prefix(INPROGRESS_PREFIX) {
        return first.parse().ok().map(|f| (f, None));
    }
    let range = name.strip_prefix(FINALIZED_PREFIX)?;
    let (first, last) = range.split_once('-')?;
    Some((first.parse().ok()?, Some(last.parse().ok()?)))
}

/// Lists segment files in `dir`, ordered by first sequence number.
pub fn list_segments(dir: &Path) -> Result<Vec<SegmentInfo>, MetaError> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some((first, last)) = parse_segment_name(name) {
            segments.push(SegmentInfo {
                path: entry.path(),
                first,
                last,
            });
        }
    }
    segments.sort_by_key(|s| (s.first, s.last.is_none()));
    Ok(segments)
}

fn encode_frame(record: &LogRecord) -> Result<Vec<u8>, MetaError> {
    let payload = bincode::serialize(record)?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decodes the valid prefix of a segment buffer.
///
/// Returns the records and the byte length they occupy; decoding stops at
/// the first short or damaged frame.
fn decode_frames(buf: &[u8]) -> (Vec<LogRecord>, usize) {
    let mut records = Vec::new();
    let mut pos = 0;
    while buf.len() - pos >= FRAME_HEADER_LEN {
        let len = u32::from_le_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]]) as usize;
        let crc = u32::from_le_bytes([buf[pos + 4], buf[pos + 5], buf[pos + 6], buf[pos + 7]]);
        let start = pos + FRAME_HEADER_LEN;
        if buf.len() - start < len {
            break;
        }
        let payload = &buf[start..start + len];
        if crc32fast::hash(payload) != crc {
            break;
        }
        match bincode::deserialize::<LogRecord>(payload) {
            Ok(record) => records.push(record),
            Err(_) => break,
        }
        pos = start + len;
    }
    (records, pos)
}

/// Reads every intact record of a segment file.
///
/// Readable on its own, without a running coordinator, for recovery tooling.
pub fn read_segment(path: &Path) -> Result<Vec<LogRecord>, MetaError> {
    let buf = fs::read(path)?;
    let (records, valid) = decode_frames(&buf);
    if valid < buf.len() {
        warn!(
            segment = %path.display(),
            valid_bytes = valid,
            total_bytes = buf.len(),
            "ignoring torn tail of edit log segment"
        );
    }
    Ok(records)
}

/// Reads all records with `seq > watermark` across every segment, checking
/// that sequence numbers are contiguous.
pub fn replay_after(dir: &Path, watermark: u64) -> Result<Vec<LogRecord>, MetaError> {
    let mut out: Vec<LogRecord> = Vec::new();
    for segment in list_segments(dir)? {
        if matches!(segment.last, Some(last) if last <= watermark) {
            continue;
        }
        let records = read_segment(&segment.path)?;
        if let Some(last) = segment.last {
            let complete = records.first().map(|r| r.seq) == Some(segment.first)
                && records.last().map(|r| r.seq) == Some(last);
            if !complete {
                return Err(MetaError::Corrupted(format!(
                    "closed segment {} is incomplete",
                    segment.path.display()
                )));
            }
        }
        for record in records {
            if record.seq <= watermark {
                continue;
            }
            let expected = out.last().map(|r| r.seq + 1).unwrap_or(watermark + 1);
            if record.seq < expected {
                // Overlapping segments after a crash during roll; keep the first copy.
                continue;
            }
            if record.seq != expected {
                return Err(MetaError::Corrupted(format!(
                    "gap in edit log: expected record {}, found {}",
                    expected, record.seq
                )));
            }
            out.push(record);
        }
    }
    Ok(out)
}

/// Deletes closed segments whose records are all at or below `watermark`.
pub fn purge_through(dir: &Path, watermark: u64) -> Result<usize, MetaError> {
    let mut purged = 0;
    for segment in list_segments(dir)? {
        if let Some(last) = segment.last {
            if last <= watermark {
                fs::remove_file(&segment.path)?;
                purged += 1;
            }
        }
    }
    if purged > 0 {
        debug!(watermark, purged, "purged edit log segments");
    }
    Ok(purged)
}

struct OpenSegment {
    file: File,
    path: PathBuf,
    first: u64,
    records: u64,
}

/// Append-only writer for the edit log.
pub struct EditLog {
    dir: PathBuf,
    current: OpenSegment,
    last_seq: u64,
    sync: bool,
}

impl EditLog {
    /// Opens the log for appending after recovery has replayed up to
    /// `last_seq`.
    ///
    /// Leftover in-progress segments from an earlier run are trimmed to
    /// their intact prefix and closed (or removed when empty), then a fresh
    /// in-progress segment is started at `last_seq + 1`.
    pub fn open(dir: &Path, last_seq: u64, sync: bool) -> Result<Self, MetaError> {
        fs::create_dir_all(dir)?;
        for segment in list_segments(dir)? {
            if segment.last.is_none() {
                close_leftover(&segment)?;
            }
        }
        let current = start_segment(dir, last_seq + 1)?;
        info!(dir = %dir.display(), next_seq = last_seq + 1, "opened edit log");
        Ok(Self {
            dir: dir.to_path_buf(),
            current,
            last_seq,
            sync,
        })
    }

    /// Sequence number of the last appended record.
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// Records written to the in-progress segment.
    pub fn records_in_segment(&self) -> u64 {
        self.current.records
    }

    /// Durably appends a mutation and returns its record.
    pub fn append(&mut self, op: LogOp) -> Result<LogRecord, MetaError> {
        let record = LogRecord {
            seq: self.last_seq + 1,
            op,
        };
        let frame = encode_frame(&record)?;
        self.current.file.write_all(&frame)?;
        if self.sync {
            self.current.file.sync_data()?;
        }
        self.last_seq = record.seq;
        self.current.records += 1;
        Ok(record)
    }

    /// Closes the in-progress segment and starts a new one.
    ///
    /// Returns the sequence number of the last record covered by closed
    /// segments. Rolling an empty segment is a no-op.
    pub fn roll(&mut self) -> Result<u64, MetaError> {
        if self.current.records == 0 {
            return Ok(self.last_seq);
        }
        self.current.file.sync_all()?;
        let closed = self.dir.join(finalized_name(self.current.first, self.last_seq));
        let next = start_segment(&self.dir, self.last_seq + 1)?;
        let old = std::mem::replace(&mut self.current, next);
        drop(old.file);
        fs::rename(&old.path, &closed)?;
        info!(
            first = old.first,
            last = self.last_seq,
            records = old.records,
            "rolled edit log segment"
        );
        Ok(self.last_seq)
    }
}

fn start_segment(dir: &Path, first: u64) -> Result<OpenSegment, MetaError> {
    let path = dir.join(inprogress_name(first));
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&path)?;
    Ok(OpenSegment {
        file,
        path,
        first,
        records: 0,
    })
}

fn close_leftover(segment: &SegmentInfo) -> Result<(), MetaError> {
    let buf = fs::read(&segment.path)?;
    let (records, valid) = decode_frames(&buf);
    let Some(last) = records.last().map(|r| r.seq) else {
        fs::remove_file(&segment.path)?;
        return Ok(());
    };
    if valid < buf.len() {
        let file = OpenOptions::new().write(true).open(&segment.path)?;
        file.set_len(valid as u64)?;
        file.sync_all()?;
    }
    let dir = segment.path.parent().unwrap_or_else(|| Path::new("."));
    fs::rename(&segment.path, dir.join(finalized_name(segment.first, last)))?;
    info!(first = segment.first, last, "closed leftover edit log segment");
    Ok(())
}
