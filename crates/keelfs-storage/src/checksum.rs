//! Per-chunk CRC32 checksums for block data integrity.
//!
//! Block data is split into fixed-size chunks (512 bytes by default) and each
//! chunk carries a 4-byte CRC32. The checksum list is persisted next to the
//! replica in a `.meta` file and checked on every read, so a single flipped
//! bit is pinned to the chunk that holds it.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Default number of data bytes covered by one checksum.
pub const DEFAULT_BYTES_PER_CHECKSUM: u32 = 512;

/// Size in bytes of one stored checksum.
pub const CHECKSUM_SIZE: usize = 4;

const META_VERSION: u16 = 1;
const META_HEADER_LEN: usize = 6;

/// Computes the CRC32 of a byte slice.
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Checksums of a block, one CRC32 per fixed-size chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkedChecksum {
    bytes_per_chunk: u32,
    sums: Vec<u32>,
}

impl ChunkedChecksum {
    /// Creates an empty checksum list for the given chunk size.
    pub fn new(bytes_per_chunk: u32) -> Self {
        Self {
            bytes_per_chunk: bytes_per_chunk.max(1),
            sums: Vec::new(),
        }
    }

    /// Computes the checksums for `data`.
    pub fn compute(data: &[u8], bytes_per_chunk: u32) -> Self {
        let mut checksum = Self::new(bytes_per_chunk);
        checksum.sums = data
            .chunks(checksum.bytes_per_chunk as usize)
            .map(crc32)
            .collect();
        checksum
    }

    /// Number of data bytes covered by each checksum.
    pub fn bytes_per_chunk(&self) -> u32 {
        self.bytes_per_chunk
    }

    /// The per-chunk checksum values.
    pub fn sums(&self) -> &[u32] {
        &self.sums
    }

    /// Number of chunks covered.
    pub fn chunk_count(&self) -> usize {
        self.sums.len()
    }

    /// Returns the index of the first chunk of `data` that does not match, if any.
    ///
    /// A length mismatch is reported at the first chunk that is missing on
    /// either side.
    pub fn first_mismatch(&self, data: &[u8]) -> Option<usize> {
        let mut chunks = data.chunks(self.bytes_per_chunk as usize);
        for (idx, expected) in self.sums.iter().enumerate() {
            match chunks.next() {
                Some(chunk) if crc32(chunk) == *expected => {}
                _ => {
                    debug!(chunk = idx, expected = *expected, "chunk checksum mismatch");
                    return Some(idx);
                }
            }
        }
        if chunks.next().is_some() {
            return Some(self.sums.len());
        }
        None
    }

    /// Returns true if every chunk of `data` matches.
    pub fn verify(&self, data: &[u8]) -> bool {
        self.first_mismatch(data).is_none()
    }

    /// A single value summarising the whole checksum list.
    ///
    /// Two replicas of the same block agree on their digest iff every chunk
    /// checksum agrees.
    pub fn digest(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.bytes_per_chunk.to_le_bytes());
        for sum in &self.sums {
            hasher.update(&sum.to_le_bytes());
        }
        hasher.finalize()
    }

    /// Encodes the checksum list in the `.meta` file format:
    /// `version:u16 | bytes_per_chunk:u32 | crc:u32 * n`, little endian.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(META_HEADER_LEN + self.sums.len() * CHECKSUM_SIZE);
        out.extend_from_slice(&META_VERSION.to_le_bytes());
        out.extend_from_slice(&self.bytes_per_chunk.to_le_bytes());
        for sum in &self.sums {
            out.extend_from_slice(&sum.to_le_bytes());
        }
        out
    }

    /// Decodes a `.meta` file. Returns None if the buffer is malformed.
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < META_HEADER_LEN || (buf.len() - META_HEADER_LEN) % CHECKSUM_SIZE != 0 {
            return None;
        }
        let version = u16::from_le_bytes([buf[0], buf[1]]);
        if version != META_VERSION {
            return None;
        }
        let bytes_per_chunk = u32::from_le_bytes([buf[2], buf[3], buf[4], buf[5]]);
        if bytes_per_chunk == 0 {
            return None;
        }
        let sums = buf[META_HEADER_LEN..]
            .chunks_exact(CHECKSUM_SIZE)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Some(Self {
            bytes_per_chunk,
            sums,
        })
    }
}

/// Incrementally builds a [`ChunkedChecksum`] from appended data.
///
/// Appends need not be chunk aligned: the trailing partial chunk is kept and
/// its checksum recomputed as more bytes arrive.
#[derive(Debug, Clone)]
pub struct StreamingChecksum {
    checksum: ChunkedChecksum,
    tail: Vec<u8>,
}

impl StreamingChecksum {
    /// Creates an empty accumulator.
    pub fn new(bytes_per_chunk: u32) -> Self {
        Self {
            checksum: ChunkedChecksum::new(bytes_per_chunk),
            tail: Vec::with_capacity(bytes_per_chunk as usize),
        }
    }

    /// Feeds more data.
    pub fn update(&mut self, data: &[u8]) {
        let chunk = self.checksum.bytes_per_chunk as usize;
        let mut rest = data;

        if !self.tail.is_empty() {
            // The last sum covers a partial chunk; replace it.
            self.checksum.sums.pop();
            let take = (chunk - self.tail.len()).min(rest.len());
            self.tail.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            self.checksum.sums.push(crc32(&self.tail));
            if self.tail.len() < chunk {
                return;
            }
            self.tail.clear();
        }

        let mut chunks = rest.chunks_exact(chunk);
        for c in &mut chunks {
            self.checksum.sums.push(crc32(c));
        }
        let remainder = chunks.remainder();
        if !remainder.is_empty() {
            self.tail.extend_from_slice(remainder);
            self.checksum.sums.push(crc32(&self.tail));
        }
    }

    /// Current checksums covering all bytes fed so far.
    pub fn current(&self) -> &ChunkedChecksum {
        &self.checksum
    }

    /// Consumes the accumulator.
    pub fn finish(self) -> ChunkedChecksum {
        self.checksum
    }
}
