//! zlib outer wrap for dictionary-compressed images.
//!
//! Low-bandwidth clients get GLZ output squeezed once more through zlib
//! when the GLZ payload is big enough to make the header overhead worth it.

use std::io::Write;

use flate2::Compression;
use flate2::write::ZlibEncoder;

use crate::CodecError;
use crate::buf::{ChunkPool, ChunkWriter, EncodedData};

/// GLZ payloads below this size skip the wrap.
pub const ZLIB_GLZ_MIN: usize = 100;

pub fn should_zlib_wrap(low_bandwidth: bool, glz_len: usize) -> bool {
    low_bandwidth && glz_len >= ZLIB_GLZ_MIN
}

/// Compress a finished GLZ chain into a new chain. The caller keeps the
/// original around until it has compared sizes.
pub fn zlib_wrap(pool: &mut ChunkPool, glz: &EncodedData) -> Result<EncodedData, CodecError> {
    // Collect the input first: the encoder borrows the pool for its output.
    let input: Vec<&[u8]> = glz.segments().collect();
    let w = ChunkWriter::new(pool);
    let mut enc = ZlibEncoder::new(w, Compression::default());
    for seg in input {
        enc.write_all(seg)
            .map_err(|e| CodecError::Encoder(e.to_string()))?;
    }
    match enc.finish() {
        Ok(w) => Ok(w.finish()),
        Err(e) => Err(CodecError::Encoder(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::ZlibDecoder;
    use std::io::Read;

    #[test]
    fn wrap_threshold() {
        assert!(!should_zlib_wrap(false, 10_000));
        assert!(!should_zlib_wrap(true, 99));
        assert!(should_zlib_wrap(true, 100));
    }

    #[test]
    fn wrap_round_trips() {
        let mut pool = ChunkPool::new();
        let mut w = ChunkWriter::new(&mut pool);
        let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        w.push_slice(&payload);
        let glz = w.finish();

        let wrapped = zlib_wrap(&mut pool, &glz).unwrap();
        assert!(wrapped.len() < glz.len());

        let bytes = wrapped.to_vec();
        let mut dec = ZlibDecoder::new(bytes.as_slice());
        let mut out = Vec::new();
        dec.read_to_end(&mut out).unwrap();
        assert_eq!(out, payload);
    }
}
