//! Dump file emission.
//!
//! Each assembled chunk becomes one `.dmp` file laid out as a contiguous
//! image of the chunk: a segment captured at process address `A` lands at
//! file offset `A - chunk.address`. Reads are best-effort; a segment the
//! target refuses to hand over is written as zeros so the surrounding
//! offsets stay stable.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::chunk::DumpableChunk;
use crate::error::{Error, Result};
use crate::process::MemoryReader;

/// Upper bound on a single read/write burst, so a multi-gigabyte segment is
/// streamed rather than materialized in one allocation.
pub const MAX_BURST_BYTES: u64 = 1_000_000_000;

fn burst_len(remaining: u64) -> usize {
    remaining.min(MAX_BURST_BYTES) as usize
}

/// Write one chunk to `<out_dir>/<file_stem>.dmp` and return the path.
pub fn write_chunk<R: MemoryReader + ?Sized>(
    chunk: &DumpableChunk,
    reader: &R,
    out_dir: &Path,
) -> Result<PathBuf> {
    let path = out_dir.join(format!("{}.dmp", chunk.file_stem()));
    let mut file = File::create(&path)?;

    for segment in &chunk.segments {
        let offset = segment.address.checked_sub(chunk.address).ok_or_else(|| {
            Error::ChunkGeometry {
                chunk: chunk.address,
                segment: segment.address,
            }
        })?;

        let mut taken = 0u64;
        while taken < segment.size {
            let burst = burst_len(segment.size - taken);
            let mut buffer = vec![0u8; burst];
            let read = reader.read_memory(segment.address + taken, &mut buffer);
            if read == 0 {
                warn!(
                    "unreadable segment at {:#x}, writing {} zero bytes",
                    segment.address + taken,
                    burst
                );
            }
            file.seek(SeekFrom::Start(offset + taken))?;
            file.write_all(&buffer)?;
            taken += burst as u64;
        }

        debug!(
            "segment {:#x} ({} bytes) written at offset {:#x}",
            segment.address, segment.size, offset
        );
    }

    Ok(path)
}
