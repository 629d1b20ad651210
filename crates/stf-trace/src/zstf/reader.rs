use std::{
    fmt,
    io::{self, Cursor, Read, Seek, SeekFrom},
    thread::{self, JoinHandle},
};

use anyhow::{Error, anyhow, bail, ensure};
use log::debug;

use super::{ChunkIndexEntry, MAGIC};

/// Where a compressed chunk lives inside the container
#[derive(Debug, Clone, Copy)]
struct ChunkLocation {
    offset: u64,
    compressed_len: usize,
    uncompressed_size: u64,
}

impl ChunkLocation {
    fn load<R: Read + Seek>(&self, input: &mut R) -> Result<Vec<u8>, Error> {
        input.seek(SeekFrom::Start(self.offset))?;

        let mut compressed = vec![0; self.compressed_len];
        input.read_exact(&mut compressed)?;

        let chunk = zstd::stream::decode_all(compressed.as_slice())?;
        ensure!(
            u64::try_from(chunk.len())? == self.uncompressed_size,
            "Failed to decompress entire chunk at offset {}",
            self.offset
        );

        Ok(chunk)
    }
}

type PendingChunk<R> = JoinHandle<Result<(R, Vec<u8>), Error>>;

/// Reads the STF byte stream stored in a `.zstf` container.
///
/// Unless running single threaded, the chunk following the current one is
/// decompressed on a background thread while the current chunk is consumed.
pub struct ZstfReader<R: Read + Seek + Send + 'static> {
    input: Option<R>,
    chunk_size: u64,
    index: Vec<ChunkIndexEntry>,
    end_of_last_chunk: u64,
    next_chunk: usize,
    current: Cursor<Vec<u8>>,
    pending: Option<PendingChunk<R>>,
    single_threaded: bool,
}

impl<R: Read + Seek + Send + 'static> ZstfReader<R> {
    /// Validates the container header and loads the chunk index.
    ///
    /// # Errors
    ///
    /// Fails if the magic does not match, the chunk size is 0 or the end of
    /// the last chunk does not lie inside the file.
    pub fn new(mut input: R, single_threaded: bool) -> Result<Self, Error> {
        let mut magic = [0; MAGIC.len()];
        input.read_exact(&mut magic)?;
        ensure!(magic == MAGIC, "Not a ZSTF file");

        let mut word = [0; 8];
        input.read_exact(&mut word)?;
        let chunk_size = u64::from_le_bytes(word);
        ensure!(
            chunk_size > 0,
            "Invalid chunk size. Trace file may be corrupt."
        );

        input.read_exact(&mut word)?;
        let end_of_last_chunk = u64::from_le_bytes(word);
        ensure!(
            end_of_last_chunk != 0,
            "Last chunk pointer is 0. Trace file may be corrupt."
        );

        let file_size = input.seek(SeekFrom::End(0))?;
        ensure!(
            end_of_last_chunk < file_size,
            "Last chunk pointer ({end_of_last_chunk}) is larger than the trace file size ({file_size}). Trace file may be corrupt."
        );

        input.seek(SeekFrom::Start(end_of_last_chunk))?;
        input.read_exact(&mut word)?;
        let num_chunks = u64::from_le_bytes(word);
        let index = (0..num_chunks)
            .map(|_| ChunkIndexEntry::read_from(&mut input))
            .collect::<Result<Vec<_>, Error>>()?;

        debug!("Opened zstf container with {num_chunks} chunks of {chunk_size} marker records");

        Ok(Self {
            input: Some(input),
            chunk_size,
            index,
            end_of_last_chunk,
            next_chunk: 0,
            current: Cursor::new(Vec::new()),
            pending: None,
            single_threaded,
        })
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn index(&self) -> &[ChunkIndexEntry] {
        &self.index
    }

    fn location(&self, chunk: usize) -> Result<ChunkLocation, Error> {
        let Some(entry) = self.index.get(chunk) else {
            bail!("Chunk {chunk} is not part of the index");
        };
        let end = self
            .index
            .get(chunk + 1)
            .map_or(self.end_of_last_chunk, |next| next.offset);
        ensure!(
            end >= entry.offset,
            "Chunk {chunk} has a negative size. Trace file may be corrupt."
        );

        Ok(ChunkLocation {
            offset: entry.offset,
            compressed_len: usize::try_from(end - entry.offset)?,
            uncompressed_size: entry.uncompressed_size,
        })
    }

    fn prefetch(&mut self) -> Result<(), Error> {
        let location = self.location(self.next_chunk)?;
        let Some(mut input) = self.input.take() else {
            bail!("zstf input is held by another chunk");
        };

        self.pending = Some(thread::spawn(move || {
            let chunk = location.load(&mut input)?;
            Ok((input, chunk))
        }));

        Ok(())
    }

    fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, Error> {
        let chunk = if let Some(pending) = self.pending.take() {
            let (input, chunk) = pending
                .join()
                .map_err(|_| anyhow!("Chunk decompression thread panicked!"))??;
            self.input = Some(input);
            chunk
        } else if self.next_chunk < self.index.len() {
            let location = self.location(self.next_chunk)?;
            let Some(input) = self.input.as_mut() else {
                bail!("zstf input is held by another chunk");
            };
            location.load(input)?
        } else {
            return Ok(None);
        };

        debug!("Decompressed zstf chunk {}", self.next_chunk);
        self.next_chunk += 1;

        if !self.single_threaded && self.next_chunk < self.index.len() {
            self.prefetch()?;
        }

        Ok(Some(chunk))
    }
}

impl<R: Read + Seek + Send + 'static> Read for ZstfReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let n = self.current.read(buf)?;
            if n > 0 || buf.is_empty() {
                return Ok(n);
            }

            match self.next_chunk().map_err(io::Error::other)? {
                Some(chunk) => self.current = Cursor::new(chunk),
                None => return Ok(0),
            }
        }
    }
}

impl<R: Read + Seek + Send + 'static> fmt::Debug for ZstfReader<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZstfReader")
            .field("chunk_size", &self.chunk_size)
            .field("num_chunks", &self.index.len())
            .field("next_chunk", &self.next_chunk)
            .field("single_threaded", &self.single_threaded)
            .finish_non_exhaustive()
    }
}

impl<R: Read + Seek + Send + 'static> Drop for ZstfReader<R> {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            let _ = pending.join();
        }
    }
}
