//! The `.zstf` container: an STF stream split into independently
//! zstd-compressed chunks.
//!
//! ```text
//! "ZSTF" | chunk size u64 | end of last chunk u64 | chunk 0 | chunk 1 | ... | index
//! index = count u64 | count * { offset u64, start pc u64, uncompressed size u64 }
//! ```
//!
//! Every chunk holds `chunk size` marker records, only the last one may hold
//! fewer. The index always sits right behind the last chunk.

use std::io::{Read, Write};

use anyhow::Error;

pub mod reader;
pub mod writer;

pub const MAGIC: [u8; 4] = *b"ZSTF";

/// Marker records per chunk unless configured otherwise
pub const DEFAULT_CHUNK_SIZE: u64 = 10_000_000;

pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// Offset of the end-of-last-chunk field inside the file
pub(crate) const END_OF_LAST_CHUNK_OFFSET: u64 = MAGIC.len() as u64 + 8;

/// Position and size of one compressed chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkIndexEntry {
    pub offset: u64,
    pub start_pc: u64,
    pub uncompressed_size: u64,
}

impl ChunkIndexEntry {
    const ENCODED_LEN: usize = 3 * std::mem::size_of::<u64>();

    pub(crate) fn write_to<W: Write>(&self, output: &mut W) -> Result<(), Error> {
        output.write_all(&self.offset.to_le_bytes())?;
        output.write_all(&self.start_pc.to_le_bytes())?;
        output.write_all(&self.uncompressed_size.to_le_bytes())?;
        Ok(())
    }

    pub(crate) fn read_from<R: Read>(input: &mut R) -> Result<Self, Error> {
        let mut buffer = [0; Self::ENCODED_LEN];
        input.read_exact(&mut buffer)?;

        let field = |i: usize| {
            let mut bytes = [0; 8];
            bytes.copy_from_slice(&buffer[i * 8..(i + 1) * 8]);
            u64::from_le_bytes(bytes)
        };

        Ok(Self {
            offset: field(0),
            start_pc: field(1),
            uncompressed_size: field(2),
        })
    }
}
