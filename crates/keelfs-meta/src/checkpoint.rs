//! Checkpoints: serialized images of the namespace at a log watermark.
//!
//! A checkpoint file `fsimage_<watermark>` holds the namespace as of record
//! `watermark`. It is written to a temporary file, fsynced and renamed into
//! place, so a crash mid-write never leaves a partial image under the final
//! name. On-disk format: `magic | crc32(payload) | bincode(Checkpoint)`.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::namespace::Namespace;
use crate::types::*;

const CHECKPOINT_PREFIX: &str = "fsimage_";
const TMP_SUFFIX: &str = ".ckpt";
const MAGIC: &[u8; 8] = b"KFSIMG01";

/// Serialized namespace state covering all records up to `watermark`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Last log sequence number reflected in the image
    pub watermark: u64,
    /// When the image was taken, ms since epoch
    pub created_at_ms: u64,
    /// The namespace image
    pub namespace: Namespace,
}

impl Checkpoint {
    /// Captures `namespace` at its current watermark.
    pub fn capture(namespace: &Namespace, created_at_ms: u64) -> Self {
        Self {
            watermark: namespace.last_applied(),
            created_at_ms,
            namespace: namespace.clone(),
        }
    }

    /// Encodes the checkpoint for writing to disk.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MetaError> {
        let payload = bincode::serialize(self)?;
        let mut buf = Vec::with_capacity(MAGIC.len() + 4 + payload.len());
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    /// Decodes a checkpoint, verifying magic and checksum.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, MetaError> {
        let header = MAGIC.len() + 4;
        if buf.len() < header || &buf[..MAGIC.len()] != MAGIC {
            return Err(MetaError::Corrupted("bad checkpoint header".to_string()));
        }
        let crc = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let payload = &buf[header..];
        if crc32fast::hash(payload) != crc {
            return Err(MetaError::Corrupted("checkpoint checksum mismatch".to_string()));
        }
        let checkpoint: Checkpoint = bincode::deserialize(payload)?;
        if checkpoint.namespace.last_applied() != checkpoint.watermark {
            return Err(MetaError::Corrupted(format!(
                "checkpoint watermark {} does not match image at {}",
                checkpoint.watermark,
                checkpoint.namespace.last_applied()
            )));
        }
        Ok(checkpoint)
    }
}

fn checkpoint_name(watermark: u64) -> String {
    format!("{}{:019}", CHECKPOINT_PREFIX, watermark)
}

/// Lists complete checkpoint files as `(watermark, path)`, oldest first.
pub fn list(dir: &Path) -> Result<Vec<(u64, PathBuf)>, MetaError> {
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(rest) = name.strip_prefix(CHECKPOINT_PREFIX) else {
            continue;
        };
        if let Ok(watermark) = rest.parse::<u64>() {
            found.push((watermark, entry.path()));
        }
    }
    found.sort_by_key(|(w, _)| *w);
    Ok(found)
}

/// Writes a checkpoint atomically and returns its path.
pub fn write(dir: &Path, checkpoint: &Checkpoint, sync: bool) -> Result<PathBuf, MetaError> {
    let bytes = checkpoint.to_bytes()?;
    let final_path = dir.join(checkpoint_name(checkpoint.watermark));
    let tmp_path = dir.join(format!("{}{}", checkpoint_name(checkpoint.watermark), TMP_SUFFIX));

    let mut file = File::create(&tmp_path)?;
    file.write_all(&bytes)?;
    if sync {
        file.sync_all()?;
    }
    drop(file);
    fs::rename(&tmp_path, &final_path)?;
    if sync {
        sync_dir(dir)?;
    }
    info!(
        watermark = checkpoint.watermark,
        bytes = bytes.len(),
        "wrote checkpoint"
    );
    Ok(final_path)
}

/// Flushes a directory so a rename inside it survives a crash.
fn sync_dir(dir: &Path) -> Result<(), MetaError> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

/// Loads the newest readable checkpoint, skipping damaged ones.
///
/// Leftover temporary files from an interrupted write are removed.
pub fn load_latest(dir: &Path) -> Result<Option<Checkpoint>, MetaError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if name
            .to_str()
            .is_some_and(|n| n.starts_with(CHECKPOINT_PREFIX) && n.ends_with(TMP_SUFFIX))
        {
            debug!(path = %entry.path().display(), "removing partial checkpoint");
            fs::remove_file(entry.path())?;
        }
    }

    for (watermark, path) in list(dir)?.into_iter().rev() {
        let loaded = fs::read(&path)
            .map_err(MetaError::from)
            .and_then(|buf| Checkpoint::from_bytes(&buf));
        match loaded {
            Ok(checkpoint) if checkpoint.watermark == watermark => return Ok(Some(checkpoint)),
            Ok(checkpoint) => warn!(
                path = %path.display(),
                found = checkpoint.watermark,
                "checkpoint name does not match its watermark, skipping"
            ),
            Err(e) => warn!(path = %path.display(), error = %e, "unreadable checkpoint, skipping"),
        }
    }
    Ok(None)
}

/// Deletes all but the newest `keep` checkpoints.
///
/// Returns the watermark of the oldest retained checkpoint; log segments at
/// or below it are no longer needed.
pub fn purge_older(dir: &Path, keep: usize) -> Result<Option<u64>, MetaError> {
    let all = list(dir)?;
    let keep = keep.max(1);
    let cut = all.len().saturating_sub(keep);
    for (watermark, path) in &all[..cut] {
        fs::remove_file(path)?;
        debug!(watermark, "purged checkpoint");
    }
    Ok(all.get(cut).map(|(w, _)| *w))
}
