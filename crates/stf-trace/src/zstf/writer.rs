use std::{
    fmt,
    io::{self, Seek, SeekFrom, Write},
};

use anyhow::{Error, ensure};
use log::{debug, warn};

use super::{ChunkIndexEntry, END_OF_LAST_CHUNK_OFFSET, MAGIC};

/// Writes an STF byte stream into a `.zstf` container.
///
/// Bytes are buffered until [`ZstfWriter::marker_record`] has been called
/// `chunk_size` times, then the chunk is compressed and appended together
/// with an updated chunk index.
pub struct ZstfWriter<W: Write + Seek> {
    output: W,
    level: i32,
    chunk_size: u64,
    chunk: Vec<u8>,
    chunk_markers: u64,
    // Length of `chunk` up to and including the latest marker record
    complete_len: usize,
    next_pc: u64,
    index: Vec<ChunkIndexEntry>,
    finished: bool,
}

impl<W: Write + Seek> ZstfWriter<W> {
    /// Writes the container header to `output`.
    ///
    /// # Errors
    ///
    /// Fails if `chunk_size` is 0 or if the header cannot be written.
    pub fn new(mut output: W, chunk_size: u64, level: i32) -> Result<Self, Error> {
        ensure!(chunk_size > 0, "Chunk size must be greater than 0");

        output.write_all(&MAGIC)?;
        output.write_all(&chunk_size.to_le_bytes())?;
        // Placeholder for the end of the last chunk
        output.write_all(&0_u64.to_le_bytes())?;

        let first_chunk = output.stream_position()?;

        Ok(Self {
            output,
            level,
            chunk_size,
            chunk: Vec::new(),
            chunk_markers: 0,
            complete_len: 0,
            next_pc: 0,
            index: vec![ChunkIndexEntry {
                offset: first_chunk,
                start_pc: 0,
                uncompressed_size: 0,
            }],
            finished: false,
        })
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Number of chunks written so far
    pub fn num_chunks(&self) -> usize {
        self.index.len() - 1
    }

    /// Signals that the bytes written so far end with a marker record.
    /// `next_pc` is the PC of the instruction following it.
    pub fn marker_record(&mut self, next_pc: u64) -> Result<(), Error> {
        self.complete_len = self.chunk.len();
        self.next_pc = next_pc;
        self.chunk_markers += 1;

        if self.chunk_markers >= self.chunk_size {
            self.write_chunk(self.complete_len, next_pc)?;
        }

        Ok(())
    }

    fn write_chunk(&mut self, len: usize, next_pc: u64) -> Result<(), Error> {
        let compressed = zstd::stream::encode_all(&self.chunk[..len], self.level)?;
        self.output.write_all(&compressed)?;

        let end = self.output.stream_position()?;
        if let Some(current) = self.index.last_mut() {
            current.uncompressed_size = u64::try_from(len)?;
        }

        self.output
            .write_all(&u64::try_from(self.index.len())?.to_le_bytes())?;
        for entry in &self.index {
            entry.write_to(&mut self.output)?;
        }

        self.output.seek(SeekFrom::Start(END_OF_LAST_CHUNK_OFFSET))?;
        self.output.write_all(&end.to_le_bytes())?;
        // The next chunk overwrites the index
        self.output.seek(SeekFrom::Start(end))?;

        debug!(
            "Wrote zstf chunk {} ({len} bytes, {} compressed)",
            self.index.len() - 1,
            compressed.len()
        );

        self.index.push(ChunkIndexEntry {
            offset: end,
            start_pc: next_pc,
            uncompressed_size: 0,
        });
        self.chunk.drain(..len);
        self.complete_len = 0;
        self.chunk_markers = 0;

        Ok(())
    }

    /// Writes the pending chunk and the final index. Trailing bytes that
    /// do not end with a marker record are dropped, since readers could not
    /// decode them.
    pub fn finish(&mut self) -> Result<(), Error> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        if self.complete_len < self.chunk.len() {
            warn!(
                "Dropping {} bytes of trailing records that do not end with an instruction",
                self.chunk.len() - self.complete_len
            );
        }
        if self.complete_len > 0 {
            self.write_chunk(self.complete_len, self.next_pc)?;
        }
        self.chunk.clear();

        self.output.flush()?;

        Ok(())
    }

    pub fn get_ref(&self) -> &W {
        &self.output
    }
}

impl<W: Write + Seek> Write for ZstfWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.finished {
            return Err(io::Error::other("zstf writer has already been finished"));
        }
        self.chunk.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.output.flush()
    }
}

impl<W: Write + Seek> fmt::Debug for ZstfWriter<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZstfWriter")
            .field("level", &self.level)
            .field("chunk_size", &self.chunk_size)
            .field("num_chunks", &self.index.len())
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl<W: Write + Seek> Drop for ZstfWriter<W> {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!("Failed to finish zstf container: {e}");
        }
    }
}
