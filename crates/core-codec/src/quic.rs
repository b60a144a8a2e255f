//! Lossless predictive image coder ("quic" wire method).
//!
//! The exact-pixel path for photographic RGB content: a median predictor
//! over the causal neighborhood feeds folded residuals into an adaptive
//! Rice coder, one context per color channel. Palette sources never come
//! here, and the chooser only selects this method for images at least
//! 3×3 with high graduality — small or flat images do better under LZ.

use crate::CodecError;
use crate::buf::{ChunkPool, ChunkWriter, EncodedData};

use core_canvas::Bitmap;

/// Unary quotients longer than this escape to a raw 8-bit residual.
const ESCAPE_Q: u32 = 24;

struct BitWriter<'a, 'p> {
    out: &'a mut ChunkWriter<'p>,
    acc: u64,
    bits: u32,
}

impl<'a, 'p> BitWriter<'a, 'p> {
    fn new(out: &'a mut ChunkWriter<'p>) -> Self {
        Self { out, acc: 0, bits: 0 }
    }

    fn put(&mut self, value: u32, count: u32) {
        debug_assert!(count <= 32);
        self.acc = (self.acc << count) | value as u64;
        self.bits += count;
        while self.bits >= 8 {
            self.bits -= 8;
            self.out.push((self.acc >> self.bits) as u8);
        }
    }

    fn finish(mut self) {
        if self.bits > 0 {
            let pad = 8 - self.bits;
            self.put(0, pad);
        }
    }
}

struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
    acc: u64,
    bits: u32,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            acc: 0,
            bits: 0,
        }
    }

    fn fill(&mut self) {
        while self.bits <= 56 && self.pos < self.data.len() {
            self.acc = (self.acc << 8) | self.data[self.pos] as u64;
            self.pos += 1;
            self.bits += 8;
        }
    }

    fn get(&mut self, count: u32) -> Result<u32, CodecError> {
        self.fill();
        if self.bits < count {
            return Err(CodecError::Truncated);
        }
        self.bits -= count;
        Ok(((self.acc >> self.bits) & ((1u64 << count) - 1)) as u32)
    }

    fn get_bit(&mut self) -> Result<u32, CodecError> {
        self.get(1)
    }
}

/// Per-channel Rice parameter adaptation.
struct RiceCtx {
    a: u32,
    n: u32,
}

impl RiceCtx {
    fn new() -> Self {
        Self { a: 4, n: 1 }
    }

    fn k(&self) -> u32 {
        let mut k = 0;
        while (self.n << k) < self.a && k < 7 {
            k += 1;
        }
        k
    }

    fn update(&mut self, m: u32) {
        self.a += m;
        self.n += 1;
        if self.n >= 64 {
            self.a >>= 1;
            self.n >>= 1;
        }
    }
}

/// Median (LOCO-I) prediction from left / above / above-left.
#[inline]
fn predict(left: i32, above: i32, corner: i32) -> i32 {
    let mn = left.min(above);
    let mx = left.max(above);
    if corner >= mx {
        mn
    } else if corner <= mn {
        mx
    } else {
        left + above - corner
    }
}

#[inline]
fn fold(err: i32) -> u32 {
    // Map signed prediction error (mod 256) to non-negative.
    let e = ((err + 128) & 0xFF) - 128;
    if e >= 0 { (e as u32) << 1 } else { ((-e as u32) << 1) - 1 }
}

#[inline]
fn unfold(m: u32) -> i32 {
    if m & 1 == 0 {
        (m >> 1) as i32
    } else {
        -(((m + 1) >> 1) as i32)
    }
}

fn channels(px: u32) -> [i32; 3] {
    [
        ((px >> 16) & 0xFF) as i32,
        ((px >> 8) & 0xFF) as i32,
        (px & 0xFF) as i32,
    ]
}

/// Encode an RGB bitmap losslessly. The output is raw entropy-coded
/// residuals; width/height travel in the enclosing image descriptor.
pub fn quic_encode(pool: &mut ChunkPool, bitmap: &Bitmap) -> EncodedData {
    let w = bitmap.width as usize;
    let h = bitmap.height as usize;
    let mut out = ChunkWriter::new(pool);
    let mut bw = BitWriter::new(&mut out);
    let mut ctx = [RiceCtx::new(), RiceCtx::new(), RiceCtx::new()];

    let mut prev_row: Vec<[i32; 3]> = vec![[0; 3]; w];
    let mut cur_row: Vec<[i32; 3]> = vec![[0; 3]; w];
    for y in 0..h {
        for x in 0..w {
            let px = channels(bitmap.pixel(x as u32, y as u32));
            for c in 0..3 {
                let left = if x > 0 { cur_row[x - 1][c] } else { 128 };
                let above = if y > 0 { prev_row[x][c] } else { left };
                let corner = if y > 0 && x > 0 { prev_row[x - 1][c] } else { above };
                let pred = predict(left, above, corner).clamp(0, 255);
                let m = fold(px[c] - pred);
                let k = ctx[c].k();
                let q = m >> k;
                if q < ESCAPE_Q {
                    // q ones, a zero, then k remainder bits.
                    for _ in 0..q {
                        bw.put(1, 1);
                    }
                    bw.put(0, 1);
                    if k > 0 {
                        bw.put(m & ((1 << k) - 1), k);
                    }
                } else {
                    for _ in 0..ESCAPE_Q {
                        bw.put(1, 1);
                    }
                    bw.put(m, 8);
                }
                ctx[c].update(m);
            }
            cur_row[x] = px;
        }
        std::mem::swap(&mut prev_row, &mut cur_row);
    }
    bw.finish();
    out.finish()
}

/// Decode back to opaque ARGB words, row-major top-down.
pub fn quic_decode(data: &[u8], width: u32, height: u32) -> Result<Vec<u32>, CodecError> {
    let w = width as usize;
    let h = height as usize;
    let mut br = BitReader::new(data);
    let mut ctx = [RiceCtx::new(), RiceCtx::new(), RiceCtx::new()];
    let mut out = Vec::with_capacity(w * h);

    let mut prev_row: Vec<[i32; 3]> = vec![[0; 3]; w];
    let mut cur_row: Vec<[i32; 3]> = vec![[0; 3]; w];
    for y in 0..h {
        for x in 0..w {
            let mut px = [0i32; 3];
            for c in 0..3 {
                let k = ctx[c].k();
                let mut q = 0u32;
                while br.get_bit()? == 1 {
                    q += 1;
                    if q == ESCAPE_Q {
                        break;
                    }
                }
                let m = if q == ESCAPE_Q {
                    br.get(8)?
                } else if k > 0 {
                    (q << k) | br.get(k)?
                } else {
                    q
                };
                let left = if x > 0 { cur_row[x - 1][c] } else { 128 };
                let above = if y > 0 { prev_row[x][c] } else { left };
                let corner = if y > 0 && x > 0 { prev_row[x - 1][c] } else { above };
                let pred = predict(left, above, corner).clamp(0, 255);
                px[c] = (pred + unfold(m)) & 0xFF;
                ctx[c].update(m);
            }
            cur_row[x] = px;
            out.push(
                0xFF00_0000 | (px[0] as u32) << 16 | (px[1] as u32) << 8 | px[2] as u32,
            );
        }
        std::mem::swap(&mut prev_row, &mut cur_row);
    }
    Ok(out)
}
