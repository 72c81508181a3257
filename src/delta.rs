//! Single-compressed-stream binary delta: a bincode op stream (copy ranges
//! out of the base file, insert literal bytes) produced by block-signature
//! matching. Patch blobs in a package store this encoding behind the same
//! zstd framing as content payloads.

use std::collections::HashMap;
use std::io::{self, Read, Seek, SeekFrom, Write};

use serde::{Deserialize, Serialize};

use crate::errors::{InstallerError, Result};

const DELTA_MAGIC: &[u8; 8] = b"KDELTA01";
const BLOCK_SIZE: usize = 4096;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum DeltaOp {
    Copy { offset: u64, len: u64 },
    Insert { data: Vec<u8> },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DeltaPatch {
    pub target_size: u64,
    pub ops: Vec<DeltaOp>,
}

/// Greedy block-match diff. The base is indexed by xxh64 over fixed-size
/// blocks; the new stream is scanned block-aligned and matches are extended
/// byte-wise. Deterministic: the candidate with the longest extension wins,
/// ties broken by the lowest base offset.
pub fn generate(old: &[u8], new: &[u8]) -> DeltaPatch {
    let mut table: HashMap<u64, Vec<usize>> = HashMap::new();
    let mut at = 0;
    while at + BLOCK_SIZE <= old.len() {
        let digest = xxhash_rust::xxh64::xxh64(&old[at..at + BLOCK_SIZE], 0);
        table.entry(digest).or_default().push(at);
        at += BLOCK_SIZE;
    }

    let mut ops = Vec::new();
    let mut literal: Vec<u8> = Vec::new();
    let mut pos = 0;
    while pos < new.len() {
        let remaining = new.len() - pos;
        if remaining < BLOCK_SIZE {
            literal.extend_from_slice(&new[pos..]);
            break;
        }
        let digest = xxhash_rust::xxh64::xxh64(&new[pos..pos + BLOCK_SIZE], 0);
        let mut best: Option<(usize, usize)> = None;
        for &candidate in table.get(&digest).map(Vec::as_slice).unwrap_or_default() {
            if old[candidate..candidate + BLOCK_SIZE] != new[pos..pos + BLOCK_SIZE] {
                continue;
            }
            let mut len = BLOCK_SIZE;
            while candidate + len < old.len()
                && pos + len < new.len()
                && old[candidate + len] == new[pos + len]
            {
                len += 1;
            }
            let better = match best {
                None => true,
                Some((_, best_len)) => len > best_len,
            };
            if better {
                best = Some((candidate, len));
            }
        }
        match best {
            Some((offset, len)) => {
                if !literal.is_empty() {
                    ops.push(DeltaOp::Insert {
                        data: std::mem::take(&mut literal),
                    });
                }
                ops.push(DeltaOp::Copy {
                    offset: offset as u64,
                    len: len as u64,
                });
                pos += len;
            }
            None => {
                literal.extend_from_slice(&new[pos..pos + BLOCK_SIZE]);
                pos += BLOCK_SIZE;
            }
        }
    }
    if !literal.is_empty() {
        ops.push(DeltaOp::Insert { data: literal });
    }
    DeltaPatch {
        target_size: new.len() as u64,
        ops,
    }
}

/// Replay the op stream against a seekable base, writing the target.
/// Returns the number of bytes written, which must equal `target_size`.
pub fn apply<B, W>(base: &mut B, patch: &DeltaPatch, out: &mut W) -> io::Result<u64>
where
    B: Read + Seek,
    W: Write,
{
    let mut written = 0u64;
    let mut buffer = vec![0u8; 256 * 1024];
    for op in &patch.ops {
        match op {
            DeltaOp::Copy { offset, len } => {
                base.seek(SeekFrom::Start(*offset))?;
                let mut remaining = *len;
                while remaining > 0 {
                    let take = (remaining as usize).min(buffer.len());
                    base.read_exact(&mut buffer[..take])?;
                    out.write_all(&buffer[..take])?;
                    remaining -= take as u64;
                }
                written += len;
            }
            DeltaOp::Insert { data } => {
                out.write_all(data)?;
                written += data.len() as u64;
            }
        }
    }
    if written != patch.target_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "patch produced {written} bytes, expected {}",
                patch.target_size
            ),
        ));
    }
    Ok(written)
}

pub fn encode(patch: &DeltaPatch) -> Vec<u8> {
    let mut out = DELTA_MAGIC.to_vec();
    // DeltaPatch has no representation bincode can reject
    out.extend_from_slice(&bincode::serialize(patch).expect("delta serialization"));
    out
}

pub fn decode(bytes: &[u8]) -> Result<DeltaPatch> {
    if bytes.len() < DELTA_MAGIC.len() || &bytes[..DELTA_MAGIC.len()] != DELTA_MAGIC {
        return Err(InstallerError::Patch("delta stream magic missing".into()));
    }
    bincode::deserialize(&bytes[DELTA_MAGIC.len()..])
        .map_err(|err| InstallerError::Patch(format!("delta stream malformed: {err}")))
}
