//! Segmented encoder output buffers.
//!
//! Every compressor writes into a chain of fixed 64 KiB chunks instead of
//! one growable allocation: a frame's worth of encodes reuses the same
//! chunks over and over through a per-client free list, and a failed encode
//! simply hands its chain back. The chain is also the marshalling unit — the
//! sender walks chunks without copying them together.
//!
//! Invariants:
//! * Every chunk except the last is completely full.
//! * `EncodedData::len` equals the sum of used bytes across chunks.

use std::io;

/// Fixed chunk payload size.
pub const ENCODE_CHUNK_SIZE: usize = 64 * 1024;

type Chunk = Box<[u8; ENCODE_CHUNK_SIZE]>;

/// Per-client recycle list for encode chunks. Dropped wholesale when the
/// client disconnects.
#[derive(Default)]
pub struct ChunkPool {
    free: Vec<Chunk>,
    allocated: usize,
}

impl ChunkPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn acquire(&mut self) -> Chunk {
        self.free.pop().unwrap_or_else(|| {
            self.allocated += 1;
            Box::new([0u8; ENCODE_CHUNK_SIZE])
        })
    }

    /// Return a finished (or abandoned) chain's chunks for reuse.
    pub fn recycle(&mut self, data: EncodedData) {
        self.free.extend(data.chunks);
    }

    /// Drop all cached chunks (client disconnect).
    pub fn drain(&mut self) {
        self.free.clear();
    }

    /// Total chunks ever allocated through this pool; recycled chunks do
    /// not count twice.
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }
}

/// A finished encode: an ordered chunk chain plus total byte length.
pub struct EncodedData {
    chunks: Vec<Chunk>,
    len: usize,
}

impl EncodedData {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterate the used byte slices, chunk by chunk.
    pub fn segments(&self) -> impl Iterator<Item = &[u8]> {
        let mut remaining = self.len;
        self.chunks.iter().map(move |c| {
            let take = remaining.min(ENCODE_CHUNK_SIZE);
            remaining -= take;
            &c[..take]
        })
    }

    /// Copy out into one contiguous vector (tests, small payloads).
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for seg in self.segments() {
            out.extend_from_slice(seg);
        }
        out
    }
}

/// Incremental writer appending across chunk boundaries. Implements
/// [`io::Write`] so ecosystem encoders (JPEG, zlib) can emit straight into
/// the chain.
pub struct ChunkWriter<'a> {
    pool: &'a mut ChunkPool,
    chunks: Vec<Chunk>,
    used_in_last: usize,
    len: usize,
}

impl<'a> ChunkWriter<'a> {
    pub fn new(pool: &'a mut ChunkPool) -> Self {
        Self {
            pool,
            chunks: Vec::new(),
            used_in_last: ENCODE_CHUNK_SIZE, // forces first acquire
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push(&mut self, byte: u8) {
        if self.used_in_last == ENCODE_CHUNK_SIZE {
            let chunk = self.pool.acquire();
            self.chunks.push(chunk);
            self.used_in_last = 0;
        }
        let last = self.chunks.last_mut().expect("chunk just ensured");
        last[self.used_in_last] = byte;
        self.used_in_last += 1;
        self.len += 1;
    }

    pub fn push_slice(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            if self.used_in_last == ENCODE_CHUNK_SIZE {
                let chunk = self.pool.acquire();
                self.chunks.push(chunk);
                self.used_in_last = 0;
            }
            let space = ENCODE_CHUNK_SIZE - self.used_in_last;
            let take = space.min(bytes.len());
            let last = self.chunks.last_mut().expect("chunk just ensured");
            last[self.used_in_last..self.used_in_last + take].copy_from_slice(&bytes[..take]);
            self.used_in_last += take;
            self.len += take;
            bytes = &bytes[take..];
        }
    }

    /// Seal the chain.
    pub fn finish(self) -> EncodedData {
        EncodedData {
            chunks: self.chunks,
            len: self.len,
        }
    }

    /// Abandon the chain, recycling its chunks (encoder failure path).
    pub fn abandon(self) {
        self.pool.free.extend(self.chunks);
    }
}

impl io::Write for ChunkWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.push_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_across_chunk_boundary() {
        let mut pool = ChunkPool::new();
        let mut w = ChunkWriter::new(&mut pool);
        let payload = vec![0xAB; ENCODE_CHUNK_SIZE + 100];
        w.push_slice(&payload);
        let data = w.finish();
        assert_eq!(data.len(), payload.len());
        let segs: Vec<usize> = data.segments().map(|s| s.len()).collect();
        assert_eq!(segs, vec![ENCODE_CHUNK_SIZE, 100]);
        assert_eq!(data.to_vec(), payload);
    }

    #[test]
    fn pool_recycles_chunks() {
        let mut pool = ChunkPool::new();
        let mut w = ChunkWriter::new(&mut pool);
        w.push_slice(&[1, 2, 3]);
        let data = w.finish();
        pool.recycle(data);
        assert_eq!(pool.free_count(), 1);
        let mut w = ChunkWriter::new(&mut pool);
        w.push(9);
        let data = w.finish();
        assert_eq!(data.to_vec(), vec![9]);
        assert_eq!(pool.allocated(), 1, "second write reused the chunk");
        pool.recycle(data);
        pool.drain();
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn abandon_returns_chunks() {
        let mut pool = ChunkPool::new();
        let mut w = ChunkWriter::new(&mut pool);
        w.push_slice(&[0; 10]);
        w.abandon();
        assert_eq!(pool.free_count(), 1);
    }
}
