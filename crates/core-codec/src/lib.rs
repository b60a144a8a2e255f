//! Image compression engines for the display pipeline.
//!
//! Five wire methods share one segmented output-buffer protocol
//! ([`buf::ChunkPool`] / [`buf::EncodedData`]):
//!
//! * `quic` — lossless predictive coder for gradual RGB content.
//! * `lz` — per-image LZSS; the always-available fallback and the only
//!   method that preserves palette indices.
//! * `glz` — LZ against a dictionary window shared across the channels of
//!   one end-user.
//! * `jpeg` (+ LZ-packed alpha tail) — lossy path for thin links.
//! * zlib-over-glz — an outer squeeze applied to large GLZ payloads.
//!
//! Encoders are fallible and unwind their chunk chains on failure; the
//! caller falls back to a raw bitmap message. Nothing in here touches
//! client state: selection inputs (lossy permission, bandwidth class) are
//! computed by the pipeline and passed in via [`chooser::ChooseCtx`].

pub mod buf;
pub mod chooser;
pub mod glz;
pub mod grad;
pub mod jpeg;
pub mod lz;
pub mod quic;
pub mod zlib;

use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::time::Duration;

use thiserror::Error;

pub use buf::{ChunkPool, ChunkWriter, ENCODE_CHUNK_SIZE, EncodedData};
pub use chooser::{ChooseCtx, CompressMode, ImageMethod, choose};
pub use grad::{Graduality, graduality};

#[derive(Debug, Error)]
pub enum CodecError {
    /// Input ended before the declared pixel count was produced.
    #[error("encoded stream truncated")]
    Truncated,
    /// A back-reference points outside the transmitted history.
    #[error("bad history reference")]
    BadReference,
    /// An ecosystem encoder rejected the input.
    #[error("encoder failure: {0}")]
    Encoder(String),
}

/// Per-method counters, mirrored into the stats shm by the worker.
#[derive(Default)]
pub struct MethodStat {
    pub count: AtomicU64,
    pub orig_bytes: AtomicU64,
    pub comp_bytes: AtomicU64,
    pub cpu_ns: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MethodStatSnapshot {
    pub count: u64,
    pub orig_bytes: u64,
    pub comp_bytes: u64,
    pub cpu_ns: u64,
}

impl MethodStat {
    pub fn record(&self, orig: usize, comp: usize, cpu: Duration) {
        self.count.fetch_add(1, Relaxed);
        self.orig_bytes.fetch_add(orig as u64, Relaxed);
        self.comp_bytes.fetch_add(comp as u64, Relaxed);
        self.cpu_ns.fetch_add(cpu.as_nanos() as u64, Relaxed);
    }

    pub fn snapshot(&self) -> MethodStatSnapshot {
        MethodStatSnapshot {
            count: self.count.load(Relaxed),
            orig_bytes: self.orig_bytes.load(Relaxed),
            comp_bytes: self.comp_bytes.load(Relaxed),
            cpu_ns: self.cpu_ns.load(Relaxed),
        }
    }
}

/// All per-codec counters for one channel.
#[derive(Default)]
pub struct CodecStats {
    pub raw: MethodStat,
    pub quic: MethodStat,
    pub lz: MethodStat,
    pub glz: MethodStat,
    pub zlib_glz: MethodStat,
    pub jpeg: MethodStat,
    pub jpeg_alpha: MethodStat,
}

impl CodecStats {
    pub fn for_method(&self, method: ImageMethod) -> &MethodStat {
        match method {
            ImageMethod::Raw => &self.raw,
            ImageMethod::Quic => &self.quic,
            ImageMethod::LzRgb | ImageMethod::LzPalette => &self.lz,
            ImageMethod::Glz => &self.glz,
            ImageMethod::Jpeg => &self.jpeg,
            ImageMethod::JpegAlpha => &self.jpeg_alpha,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_accumulate() {
        let stats = CodecStats::default();
        stats
            .for_method(ImageMethod::LzRgb)
            .record(1000, 300, Duration::from_micros(15));
        stats
            .for_method(ImageMethod::LzPalette)
            .record(500, 100, Duration::from_micros(5));
        let snap = stats.lz.snapshot();
        assert_eq!(snap.count, 2);
        assert_eq!(snap.orig_bytes, 1500);
        assert_eq!(snap.comp_bytes, 400);
        assert!(snap.cpu_ns >= 20_000);
    }
}
