//! The chunked, resumable, integrity-checked bulk-copy loop that wires a
//! sender stream to a receiver stream.
//!
//! The reader is opened *inside* the writer's scope, so that a failure to
//! open the reader aborts the writer's `close` (and its partial-file
//! bookkeeping) before the writer itself unwinds -- LIFO cleanup, per the
//! scoped-resource design note.

use std::io::{Read, Write};

use md5::{Digest, Md5};
use thiserror::Error;

use crate::progress::ProgressReporter;

pub const DEFAULT_CHUNK_SIZE: usize = 20 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("read failed: {0}")]
    Read(#[source] std::io::Error),
    #[error("write failed: {0}")]
    Write(#[source] std::io::Error),
}

/// A 128-bit digest identifying a chunk's contents for skip-by-checksum.
pub type ChunkChecksum = [u8; 16];

pub fn md5_of(chunk: &[u8]) -> ChunkChecksum {
    let mut hasher = Md5::new();
    hasher.update(chunk);
    hasher.finalize().into()
}

/// Capability a writer may offer: given a chunk's size and checksum, report
/// whether that exact chunk is already present at the destination (an S3
/// part whose stored ETag matches, for example) so the engine can skip
/// re-sending it.
pub trait ChunkSkip {
    fn has_chunk(&mut self, size: usize, checksum: &ChunkChecksum) -> bool;
}

/// Pumps `reader` into `writer` in chunks of `chunk_size` bytes, reporting
/// progress, until `reader` reaches EOF.
///
/// When `skip` is provided, each chunk is hashed and offered to the writer
/// before being written; a match means the chunk is already present at the
/// destination and the reader simply advances past it.
pub fn pump<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    chunk_size: usize,
    mut progress: Option<&mut ProgressReporter>,
    mut skip: Option<&mut dyn ChunkSkip>,
) -> Result<u64, TransferError> {
    let mut buf = vec![0u8; chunk_size];
    let mut total = 0u64;

    if let Some(p) = progress.as_deref_mut() {
        p.open();
    }

    loop {
        let n = read_full(reader, &mut buf)?;
        if n == 0 {
            break;
        }

        let chunk = &buf[..n];
        let skipped = match skip.as_deref_mut() {
            Some(skip) => {
                let checksum = md5_of(chunk);
                skip.has_chunk(n, &checksum)
            }
            None => false,
        };

        if !skipped {
            writer.write_all(chunk).map_err(TransferError::Write)?;
        }

        total += n as u64;
        if let Some(p) = progress.as_deref_mut() {
            p.update(total);
        }
    }

    if let Some(p) = progress {
        p.close();
    }

    Ok(total)
}

/// Reads up to `buf.len()` bytes, looping until the buffer is full or the
/// reader hits EOF (a single `read` call may return fewer bytes than asked).
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize, TransferError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).map_err(TransferError::Read)?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
