//! Per-image LZ codec.
//!
//! The always-available fallback encoder: a flag-grouped LZSS over the
//! image's row bytes with a 4 KiB sliding window and hash-chain matching.
//! Palette images encode their index bytes and carry the palette by
//! reference in the enclosing message; RGB images encode their native row
//! bytes. The same token format also packs the alpha plane appended to
//! JPEG-alpha images.
//!
//! Token stream: a flag byte governs the next 8 items, LSB first. Flag bit
//! clear = one literal byte; set = a 2-byte match: `len-3` in the low
//! nibble of the first byte, the 12-bit back distance minus one split
//! across the high nibble and the second byte. Matches cover 3..=18 bytes
//! at distances 1..=4096.

use crate::CodecError;
use crate::buf::{ChunkPool, ChunkWriter, EncodedData};

use core_canvas::Bitmap;

const WINDOW: usize = 4096;
const MIN_MATCH: usize = 3;
const MAX_MATCH: usize = 18;
const HASH_BITS: u32 = 13;
const MAX_CHAIN: usize = 32;

#[inline]
fn hash3(bytes: &[u8]) -> usize {
    let v = (bytes[0] as u32) | (bytes[1] as u32) << 8 | (bytes[2] as u32) << 16;
    (v.wrapping_mul(0x9E37_79B1) >> (32 - HASH_BITS)) as usize
}

/// Encode a byte stream. The output chain is never larger than
/// `input.len() * 9 / 8 + 2`; callers compare against the input size and
/// fall back to raw when compression loses.
pub fn lz_encode(pool: &mut ChunkPool, input: &[u8]) -> EncodedData {
    let mut w = ChunkWriter::new(pool);
    let mut head = vec![usize::MAX; 1 << HASH_BITS];
    let mut chain = vec![usize::MAX; input.len()];

    let mut group: [Option<(usize, usize)>; 8] = [None; 8]; // match (dist, len)
    let mut group_lits: [u8; 8] = [0; 8];
    let mut group_len = 0usize;
    let mut flags = 0u8;

    let mut flush_group =
        |w: &mut ChunkWriter<'_>, flags: u8, lits: &[u8; 8], items: &[Option<(usize, usize)>; 8], n: usize| {
            if n == 0 {
                return;
            }
            w.push(flags);
            for i in 0..n {
                match items[i] {
                    Some((dist, len)) => {
                        let d = dist - 1;
                        w.push(((d >> 8) as u8) << 4 | (len - MIN_MATCH) as u8);
                        w.push((d & 0xFF) as u8);
                    }
                    None => w.push(lits[i]),
                }
            }
        };

    let mut pos = 0usize;
    while pos < input.len() {
        let mut best: Option<(usize, usize)> = None;
        if pos + MIN_MATCH <= input.len() {
            let h = hash3(&input[pos..]);
            let mut cand = head[h];
            let mut depth = 0;
            while cand != usize::MAX && pos - cand <= WINDOW && depth < MAX_CHAIN {
                let limit = (input.len() - pos).min(MAX_MATCH);
                let mut l = 0;
                while l < limit && input[cand + l] == input[pos + l] {
                    l += 1;
                }
                if l >= MIN_MATCH && best.map_or(true, |(_, bl)| l > bl) {
                    best = Some((pos - cand, l));
                    if l == MAX_MATCH {
                        break;
                    }
                }
                cand = chain[cand];
                depth += 1;
            }
            // Insert current position into the chain.
            chain[pos] = head[h];
            head[h] = pos;
        }

        let advance = match best {
            Some((dist, len)) => {
                flags |= 1 << group_len;
                group[group_len] = Some((dist, len));
                len
            }
            None => {
                group[group_len] = None;
                group_lits[group_len] = input[pos];
                1
            }
        };
        group_len += 1;
        if group_len == 8 {
            flush_group(&mut w, flags, &group_lits, &group, 8);
            flags = 0;
            group_len = 0;
        }
        // Register the skipped positions of a match so later data can
        // reference into it.
        for p in pos + 1..(pos + advance).min(input.len().saturating_sub(MIN_MATCH - 1)) {
            let h = hash3(&input[p..]);
            chain[p] = head[h];
            head[h] = p;
        }
        pos += advance;
    }
    flush_group(&mut w, flags, &group_lits, &group, group_len);
    w.finish()
}

/// Decode a token stream produced by [`lz_encode`]. `expected_len` bounds
/// the output; overruns and truncated matches are decode errors, not
/// panics.
pub fn lz_decode(data: &[u8], expected_len: usize) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::with_capacity(expected_len);
    let mut i = 0usize;
    while i < data.len() && out.len() < expected_len {
        let flags = data[i];
        i += 1;
        for bit in 0..8 {
            if out.len() >= expected_len || i >= data.len() {
                break;
            }
            if flags & (1 << bit) != 0 {
                if i + 1 >= data.len() {
                    return Err(CodecError::Truncated);
                }
                let b0 = data[i] as usize;
                let b1 = data[i + 1] as usize;
                i += 2;
                let len = (b0 & 0x0F) + MIN_MATCH;
                let dist = ((b0 >> 4) << 8 | b1) + 1;
                if dist > out.len() {
                    return Err(CodecError::BadReference);
                }
                for _ in 0..len {
                    let b = out[out.len() - dist];
                    out.push(b);
                }
            } else {
                out.push(data[i]);
                i += 1;
            }
        }
    }
    if out.len() != expected_len {
        return Err(CodecError::Truncated);
    }
    Ok(out)
}

/// Gather a bitmap's visual-order row bytes as the LZ input stream.
pub fn bitmap_stream(bitmap: &Bitmap) -> Vec<u8> {
    let row_bytes = bitmap.format.min_stride(bitmap.width) as usize;
    let mut out = Vec::with_capacity(row_bytes * bitmap.height as usize);
    for y in 0..bitmap.height {
        out.extend_from_slice(&bitmap.row(y)[..row_bytes]);
    }
    out
}

/// Encode a bitmap (RGB or palette-indexed) into an LZ chain.
pub fn lz_encode_bitmap(pool: &mut ChunkPool, bitmap: &Bitmap) -> EncodedData {
    lz_encode(pool, &bitmap_stream(bitmap))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn round_trip(input: &[u8]) -> Vec<u8> {
        let mut pool = ChunkPool::new();
        let enc = lz_encode(&mut pool, input);
        let out = lz_decode(&enc.to_vec(), input.len()).expect("decode");
        pool.recycle(enc);
        out
    }

    #[test]
    fn empty_input() {
        assert_eq!(round_trip(&[]), Vec::<u8>::new());
    }

    #[test]
    fn repetitive_input_compresses() {
        let input = vec![0x42u8; 10_000];
        let mut pool = ChunkPool::new();
        let enc = lz_encode(&mut pool, &input);
        assert!(enc.len() < input.len() / 4, "len={}", enc.len());
        assert_eq!(lz_decode(&enc.to_vec(), input.len()).unwrap(), input);
    }

    #[test]
    fn incompressible_input_round_trips() {
        // Pseudo-random bytes: no 3-byte repeats to speak of.
        let mut x = 0x12345678u32;
        let input: Vec<u8> = (0..4096)
            .map(|_| {
                x = x.wrapping_mul(1664525).wrapping_add(1013904223);
                (x >> 24) as u8
            })
            .collect();
        assert_eq!(round_trip(&input), input);
    }

    #[test]
    fn pattern_with_period_shorter_than_match() {
        // dist < len exercises the overlapping-copy path of the decoder.
        let input = b"abababababababababababab".to_vec();
        assert_eq!(round_trip(&input), input);
    }

    #[test]
    fn decode_rejects_bad_distance() {
        // Flag byte says match, but nothing has been emitted yet.
        let bogus = vec![0b0000_0001, 0x00, 0x05];
        assert!(matches!(
            lz_decode(&bogus, 8),
            Err(CodecError::BadReference)
        ));
    }

    #[test]
    fn decode_rejects_truncation() {
        let input = vec![7u8; 64];
        let mut pool = ChunkPool::new();
        let enc = lz_encode(&mut pool, &input);
        let bytes = enc.to_vec();
        assert!(matches!(
            lz_decode(&bytes[..bytes.len() - 1], input.len()),
            Err(CodecError::Truncated)
        ));
    }

    proptest! {
        #[test]
        fn round_trip_arbitrary(input in proptest::collection::vec(any::<u8>(), 0..2048)) {
            prop_assert_eq!(round_trip(&input), input);
        }

        #[test]
        fn round_trip_structured(reps in 1usize..60, chunk in proptest::collection::vec(any::<u8>(), 1..32)) {
            let mut input = Vec::new();
            for _ in 0..reps {
                input.extend_from_slice(&chunk);
            }
            prop_assert_eq!(round_trip(&input), input);
        }
    }
}
