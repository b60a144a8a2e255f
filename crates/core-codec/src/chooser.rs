//! Compression method selection.
//!
//! One place decides how a bitmap leaves the server. Inputs: the configured
//! mode, whether the drawable tolerates lossy output (the caller has
//! already folded in lossy-forbidden destination regions and
//! destination-combining ROPs), client bandwidth class, whether the shared
//! dictionary can take the image, and the graduality score.

use core_canvas::{Bitmap, PixelFormat};

use crate::grad::Graduality;

/// Configured compression mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressMode {
    Off,
    #[default]
    AutoGlz,
    AutoLz,
    Quic,
    Glz,
    Lz,
}

/// The concrete wire method chosen for one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageMethod {
    Raw,
    Quic,
    LzRgb,
    LzPalette,
    Glz,
    Jpeg,
    JpegAlpha,
}

impl ImageMethod {
    pub fn is_lossy(self) -> bool {
        matches!(self, ImageMethod::Jpeg | ImageMethod::JpegAlpha)
    }
}

/// Everything the decision needs besides the bitmap itself.
#[derive(Debug, Clone, Copy)]
pub struct ChooseCtx {
    pub mode: CompressMode,
    pub lossy_allowed: bool,
    pub low_bandwidth: bool,
    pub glz_fits: bool,
    pub graduality: Graduality,
}

/// Smallest dimension the lossless predictive coder accepts.
pub const QUIC_MIN_DIM: u32 = 3;

fn quic_eligible(bitmap: &Bitmap) -> bool {
    !bitmap.format.is_palette()
        && !bitmap.format.has_alpha()
        && bitmap.width >= QUIC_MIN_DIM
        && bitmap.height >= QUIC_MIN_DIM
}

pub fn choose(bitmap: &Bitmap, ctx: &ChooseCtx) -> ImageMethod {
    if ctx.mode == CompressMode::Off {
        return ImageMethod::Raw;
    }
    if bitmap.format.is_palette() {
        // Palette sources carry indices; only the LZ path preserves them.
        return ImageMethod::LzPalette;
    }
    // Lossy shortcut for photographic content on thin links.
    if ctx.lossy_allowed && ctx.low_bandwidth && ctx.graduality == Graduality::High {
        return if bitmap.format == PixelFormat::Argb32 {
            ImageMethod::JpegAlpha
        } else {
            ImageMethod::Jpeg
        };
    }
    match ctx.mode {
        CompressMode::Off => unreachable!("handled above"),
        CompressMode::Quic => {
            if quic_eligible(bitmap) {
                ImageMethod::Quic
            } else {
                ImageMethod::LzRgb
            }
        }
        CompressMode::Lz => ImageMethod::LzRgb,
        CompressMode::Glz => {
            if ctx.glz_fits {
                ImageMethod::Glz
            } else {
                ImageMethod::LzRgb
            }
        }
        CompressMode::AutoGlz | CompressMode::AutoLz => {
            if ctx.graduality == Graduality::High && quic_eligible(bitmap) {
                ImageMethod::Quic
            } else if ctx.mode == CompressMode::AutoGlz && ctx.glz_fits {
                ImageMethod::Glz
            } else {
                ImageMethod::LzRgb
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(mode: CompressMode) -> ChooseCtx {
        ChooseCtx {
            mode,
            lossy_allowed: false,
            low_bandwidth: false,
            glz_fits: true,
            graduality: Graduality::Low,
        }
    }

    fn rgb(w: u32, h: u32) -> Bitmap {
        let mut b = Bitmap::new_argb(w, h);
        b.format = PixelFormat::Rgb32;
        b
    }

    fn palette_bitmap() -> Bitmap {
        Bitmap {
            format: PixelFormat::Pal8,
            width: 8,
            height: 8,
            stride: 8,
            top_down: true,
            data: vec![0; 64],
            palette: None,
        }
    }

    #[test]
    fn off_means_raw() {
        assert_eq!(choose(&rgb(64, 64), &ctx(CompressMode::Off)), ImageMethod::Raw);
    }

    #[test]
    fn palette_always_lz() {
        for mode in [CompressMode::AutoGlz, CompressMode::Quic, CompressMode::Glz] {
            assert_eq!(choose(&palette_bitmap(), &ctx(mode)), ImageMethod::LzPalette);
        }
    }

    #[test]
    fn lossy_shortcut_needs_all_three_conditions() {
        let bmp = rgb(64, 64);
        let mut c = ctx(CompressMode::AutoGlz);
        c.lossy_allowed = true;
        c.low_bandwidth = true;
        c.graduality = Graduality::High;
        assert_eq!(choose(&bmp, &c), ImageMethod::Jpeg);
        // Any one condition missing falls back to lossless.
        assert_ne!(
            choose(&bmp, &ChooseCtx { lossy_allowed: false, ..c }),
            ImageMethod::Jpeg
        );
        assert_ne!(
            choose(&bmp, &ChooseCtx { low_bandwidth: false, ..c }),
            ImageMethod::Jpeg
        );
        assert_ne!(
            choose(&bmp, &ChooseCtx { graduality: Graduality::Medium, ..c }),
            ImageMethod::Jpeg
        );
    }

    #[test]
    fn alpha_source_gets_jpeg_alpha() {
        let bmp = Bitmap::new_argb(64, 64);
        let mut c = ctx(CompressMode::AutoGlz);
        c.lossy_allowed = true;
        c.low_bandwidth = true;
        c.graduality = Graduality::High;
        assert_eq!(choose(&bmp, &c), ImageMethod::JpegAlpha);
    }

    #[test]
    fn auto_glz_prefers_quic_for_gradual_content() {
        let mut c = ctx(CompressMode::AutoGlz);
        c.graduality = Graduality::High;
        assert_eq!(choose(&rgb(64, 64), &c), ImageMethod::Quic);
        // Below the minimum dimension the predictive coder is skipped.
        assert_eq!(choose(&rgb(2, 64), &c), ImageMethod::Glz);
    }

    #[test]
    fn auto_glz_falls_back_to_lz_when_window_full() {
        let mut c = ctx(CompressMode::AutoGlz);
        c.glz_fits = false;
        assert_eq!(choose(&rgb(64, 64), &c), ImageMethod::LzRgb);
    }

    #[test]
    fn auto_lz_never_picks_glz() {
        let c = ctx(CompressMode::AutoLz);
        assert_eq!(choose(&rgb(64, 64), &c), ImageMethod::LzRgb);
    }
}
