//! JPEG encode paths: single images for low-bandwidth clients and the
//! motion-JPEG encoder behind promoted streams.
//!
//! RGBA sources split: the color planes go through JPEG, the alpha plane is
//! LZ-packed and appended to the tail of the same buffer chain; the image
//! descriptor carries the split offset.

use image::ExtendedColorType;
use image::codecs::jpeg::JpegEncoder;

use crate::CodecError;
use crate::buf::{ChunkPool, ChunkWriter, EncodedData};
use crate::lz::lz_encode;

use core_canvas::Bitmap;

fn rgb_plane(bitmap: &Bitmap) -> Vec<u8> {
    let mut rgb = Vec::with_capacity((bitmap.width * bitmap.height * 3) as usize);
    for y in 0..bitmap.height {
        for x in 0..bitmap.width {
            let px = bitmap.pixel(x, y);
            rgb.push((px >> 16) as u8);
            rgb.push((px >> 8) as u8);
            rgb.push(px as u8);
        }
    }
    rgb
}

fn alpha_plane(bitmap: &Bitmap) -> Vec<u8> {
    let mut a = Vec::with_capacity((bitmap.width * bitmap.height) as usize);
    for y in 0..bitmap.height {
        for x in 0..bitmap.width {
            a.push((bitmap.pixel(x, y) >> 24) as u8);
        }
    }
    a
}

/// Lossy-encode the color planes at the given quality (1..=100).
pub fn jpeg_encode(
    pool: &mut ChunkPool,
    bitmap: &Bitmap,
    quality: u8,
) -> Result<EncodedData, CodecError> {
    let rgb = rgb_plane(bitmap);
    let mut w = ChunkWriter::new(pool);
    let mut enc = JpegEncoder::new_with_quality(&mut w, quality.clamp(1, 100));
    match enc.encode(&rgb, bitmap.width, bitmap.height, ExtendedColorType::Rgb8) {
        Ok(()) => Ok(w.finish()),
        Err(e) => {
            w.abandon();
            Err(CodecError::Encoder(e.to_string()))
        }
    }
}

pub struct JpegAlphaOut {
    pub data: EncodedData,
    /// Byte offset where the LZ-packed alpha plane begins.
    pub jpeg_size: usize,
}

/// JPEG the color planes, LZ the alpha plane into the chain tail.
pub fn jpeg_alpha_encode(
    pool: &mut ChunkPool,
    bitmap: &Bitmap,
    quality: u8,
) -> Result<JpegAlphaOut, CodecError> {
    let jpeg = jpeg_encode(pool, bitmap, quality)?;
    let jpeg_size = jpeg.len();
    let alpha = lz_encode(pool, &alpha_plane(bitmap));
    // Re-chain both into one contiguous stream.
    let mut w = ChunkWriter::new(pool);
    for seg in jpeg.segments() {
        w.push_slice(seg);
    }
    for seg in alpha.segments() {
        w.push_slice(seg);
    }
    let data = w.finish();
    pool.recycle(jpeg);
    pool.recycle(alpha);
    Ok(JpegAlphaOut { data, jpeg_size })
}

/// Per-stream motion-JPEG encoder. Quality follows the stream's bit budget:
/// the rate controller squeezes quality down when the target rate would be
/// blown and relaxes it when frames come in well under budget.
pub struct MjpegEncoder {
    width: u32,
    height: u32,
    quality: u8,
    bit_rate: u64,
}

impl MjpegEncoder {
    pub const MIN_QUALITY: u8 = 20;
    pub const MAX_QUALITY: u8 = 90;

    pub fn new(width: u32, height: u32, bit_rate: u64) -> Self {
        Self {
            width,
            height,
            quality: 70,
            bit_rate,
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn bit_rate(&self) -> u64 {
        self.bit_rate
    }

    pub fn set_bit_rate(&mut self, bit_rate: u64) {
        self.bit_rate = bit_rate.max(1);
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    /// Encode one frame and adapt quality toward the byte budget implied by
    /// the bit rate at `fps`.
    pub fn encode_frame(
        &mut self,
        pool: &mut ChunkPool,
        frame: &Bitmap,
        fps: u32,
    ) -> Result<EncodedData, CodecError> {
        debug_assert_eq!((frame.width, frame.height), (self.width, self.height));
        let data = jpeg_encode(pool, frame, self.quality)?;
        let budget = (self.bit_rate / 8 / u64::from(fps.max(1))).max(1) as usize;
        if data.len() > budget && self.quality > Self::MIN_QUALITY {
            self.quality -= 5;
        } else if data.len() * 2 < budget && self.quality < Self::MAX_QUALITY {
            self.quality += 5;
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn photo(width: u32, height: u32) -> Bitmap {
        let mut px = Vec::new();
        for y in 0..height {
            for x in 0..width {
                let r = (x * 2) as u32 & 0xFF;
                let g = (y * 3) as u32 & 0xFF;
                let b = ((x ^ y) & 0xFF) as u32;
                px.push(0xFF00_0000 | r << 16 | g << 8 | b);
            }
        }
        Bitmap::from_argb(width, height, px)
    }

    #[test]
    fn jpeg_emits_soi_marker() {
        let mut pool = ChunkPool::new();
        let data = jpeg_encode(&mut pool, &photo(32, 32), 70).unwrap();
        let bytes = data.to_vec();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8], "JPEG SOI marker");
        assert!(bytes.len() > 100);
    }

    #[test]
    fn jpeg_alpha_appends_alpha_tail() {
        let mut pool = ChunkPool::new();
        let out = jpeg_alpha_encode(&mut pool, &photo(16, 16), 70).unwrap();
        assert!(out.jpeg_size > 0);
        assert!(out.data.len() > out.jpeg_size, "alpha tail present");
        let bytes = out.data.to_vec();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        // Alpha plane of an opaque photo is constant: the LZ tail stays tiny.
        assert!(out.data.len() - out.jpeg_size < 64);
    }

    #[test]
    fn mjpeg_quality_drops_under_budget_pressure() {
        let mut pool = ChunkPool::new();
        // Absurdly low rate forces the controller down to MIN_QUALITY.
        let mut enc = MjpegEncoder::new(64, 64, 8_000);
        let frame = photo(64, 64);
        let q0 = enc.quality();
        for _ in 0..20 {
            let data = enc.encode_frame(&mut pool, &frame, 30).unwrap();
            pool.recycle(data);
        }
        assert!(enc.quality() < q0);
        assert!(enc.quality() >= MjpegEncoder::MIN_QUALITY);
    }
}
