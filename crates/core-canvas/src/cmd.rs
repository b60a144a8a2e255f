//! The captured drawing-command model.
//!
//! Commands arrive from the adapter with guest pointers already validated
//! and pixel payloads copied into owned [`Bitmap`]s; from here on the
//! pipeline owns everything. A [`DrawCommand`] is the unit the draw-item
//! tree, the stream detector, and the client pipes all reason about.

use std::sync::Arc;

use bitflags::bitflags;
use core_region::{Point, Rect, Region};
use smallvec::SmallVec;

use crate::Bitmap;

bitflags! {
    /// Binary raster-operation descriptor: an operator bit plus operand
    /// inversion bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Ropd: u16 {
        const INVERS_SRC   = 0x0001;
        const INVERS_BRUSH = 0x0002;
        const INVERS_DEST  = 0x0004;
        const OP_PUT       = 0x0008;
        const OP_OR        = 0x0010;
        const OP_AND       = 0x0020;
        const OP_XOR       = 0x0040;
        const OP_BLACKNESS = 0x0080;
        const OP_WHITENESS = 0x0100;
        const OP_INVERS    = 0x0200;
        const INVERS_RES   = 0x0400;
    }
}

impl Ropd {
    pub const PUT: Ropd = Ropd::OP_PUT;

    /// Plain overwrite with no operand games.
    pub fn is_straight_put(self) -> bool {
        self == Ropd::OP_PUT
    }

    /// True when the result depends on the existing destination pixels.
    /// Such operations must never read lossy-decoded pixels on the client.
    pub fn combines_dest(self) -> bool {
        self.intersects(Ropd::OP_OR | Ropd::OP_AND | Ropd::OP_XOR | Ropd::INVERS_DEST)
    }
}

/// Occlusion effect tag supplied by the adapter per command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    Opaque,
    Blend,
    RevertOnDup,
    BlacknessOnDup,
    WhitenessOnDup,
    NopOnDup,
    Nop,
    OpaqueBrush,
}

impl Effect {
    /// Items that fully replace their destination region participate in
    /// occlusion (exclusion subtraction) as occluders.
    pub fn is_opaque(self) -> bool {
        matches!(self, Effect::Opaque | Effect::OpaqueBrush)
    }
}

/// Command clip: full bbox or an explicit rect list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Clip {
    None,
    Rects(Vec<Rect>),
}

impl Clip {
    /// Effective destination region: bbox intersected with the clip.
    pub fn region_for(&self, bbox: Rect) -> Region {
        match self {
            Clip::None => Region::from_rect(bbox),
            Clip::Rects(rects) => {
                let mut clip = Region::new();
                for r in rects {
                    clip.add(*r);
                }
                clip.intersect_rect(bbox);
                clip
            }
        }
    }
}

/// A reference to source pixels: an owned bitmap or another surface. The
/// id addresses the client pixmap cache; `cache_me` marks images the guest
/// wants cached client-side.
#[derive(Debug, Clone)]
pub struct ImageRef {
    pub id: u64,
    pub cache_me: bool,
    pub kind: ImageKind,
}

#[derive(Debug, Clone)]
pub enum ImageKind {
    Bitmap(Arc<Bitmap>),
    Surface(u32),
}

impl ImageRef {
    pub fn bitmap(id: u64, bmp: Bitmap) -> Self {
        ImageRef {
            id,
            cache_me: false,
            kind: ImageKind::Bitmap(Arc::new(bmp)),
        }
    }

    pub fn surface(surface_id: u32) -> Self {
        ImageRef {
            id: 0,
            cache_me: false,
            kind: ImageKind::Surface(surface_id),
        }
    }

    pub fn surface_id(&self) -> Option<u32> {
        match self.kind {
            ImageKind::Surface(id) => Some(id),
            ImageKind::Bitmap(_) => None,
        }
    }

    pub fn as_bitmap(&self) -> Option<&Arc<Bitmap>> {
        match &self.kind {
            ImageKind::Bitmap(b) => Some(b),
            ImageKind::Surface(_) => None,
        }
    }
}

/// Brush for fill-like operations.
#[derive(Debug, Clone)]
pub enum Brush {
    None,
    Solid(u32),
    Pattern { image: ImageRef, pos: Point },
}

impl PartialEq for Brush {
    /// Brushes are equal when they would paint identical pixels: same solid
    /// color, or same pattern image (by id) at the same seed position.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Brush::None, Brush::None) => true,
            (Brush::Solid(a), Brush::Solid(b)) => a == b,
            (
                Brush::Pattern { image: ia, pos: pa },
                Brush::Pattern { image: ib, pos: pb },
            ) => ia.id == ib.id && pa == pb,
            _ => false,
        }
    }
}

/// Pixel gate applied to the destination writes of an operation.
#[derive(Debug, Clone)]
pub struct Mask {
    pub invers: bool,
    pub pos: Point,
    pub image: ImageRef,
}

/// Sampling mode for size-mismatched copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScaleMode {
    #[default]
    Nearest,
    Interpolate,
}

/// Polyline path for stroke commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    pub segments: Vec<PathSeg>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSeg {
    pub points: Vec<Point>,
    pub closed: bool,
}

/// One pre-rasterized glyph: an alpha bitmap and its render origin.
#[derive(Debug, Clone)]
pub struct Glyph {
    pub render_pos: Point,
    pub bitmap: Arc<Bitmap>,
}

/// The drawing primitive payload.
#[derive(Debug, Clone)]
pub enum DrawOp {
    Fill {
        brush: Brush,
        rop: Ropd,
        mask: Option<Mask>,
    },
    Opaque {
        src: ImageRef,
        src_area: Rect,
        brush: Brush,
        rop: Ropd,
        scale_mode: ScaleMode,
        mask: Option<Mask>,
    },
    Copy {
        src: ImageRef,
        src_area: Rect,
        rop: Ropd,
        scale_mode: ScaleMode,
        mask: Option<Mask>,
    },
    Transparent {
        src: ImageRef,
        src_area: Rect,
        transparent_color: u32,
    },
    AlphaBlend {
        src: ImageRef,
        src_area: Rect,
        alpha: u8,
    },
    CopyBits {
        src_pos: Point,
    },
    Blend {
        src: ImageRef,
        src_area: Rect,
        rop: Ropd,
        mask: Option<Mask>,
    },
    Blackness {
        mask: Option<Mask>,
    },
    Whiteness {
        mask: Option<Mask>,
    },
    Invers {
        mask: Option<Mask>,
    },
    Rop3 {
        src: ImageRef,
        src_area: Rect,
        brush: Brush,
        rop3: u8,
        mask: Option<Mask>,
    },
    Stroke {
        path: Path,
        brush: Brush,
        fore_rop: Ropd,
    },
    Text {
        glyphs: Vec<Glyph>,
        fore: Brush,
        back: Brush,
        back_area: Rect,
    },
}

/// A captured drawing command: where it paints, how it occludes, and what
/// it paints.
#[derive(Debug, Clone)]
pub struct DrawCommand {
    pub surface_id: u32,
    pub bbox: Rect,
    pub clip: Clip,
    pub effect: Effect,
    pub op: DrawOp,
    /// Multimedia timestamp from the adapter, used for stream pacing.
    pub mm_time: u32,
    /// Area the command reads from its own destination; the worker snapshots
    /// it before rendering so deferred rendering stays correct.
    pub self_bitmap_area: Option<Rect>,
}

impl DrawCommand {
    /// Effective destination region (bbox ∩ clip).
    pub fn region(&self) -> Region {
        self.clip.region_for(self.bbox)
    }

    /// Surfaces this command reads from (sources, brush patterns, masks).
    /// The target surface is never listed: same-surface reads go through
    /// the self-bitmap snapshot instead.
    pub fn surface_deps(&self) -> SmallVec<[u32; 3]> {
        let target = self.surface_id;
        let mut deps: SmallVec<[u32; 3]> = SmallVec::new();
        let mut push = |img: &ImageRef| {
            if let Some(id) = img.surface_id()
                && id != target
                && !deps.contains(&id)
            {
                deps.push(id);
            }
        };
        let mut push_brush = |b: &Brush, push: &mut dyn FnMut(&ImageRef)| {
            if let Brush::Pattern { image, .. } = b {
                push(image);
            }
        };
        match &self.op {
            DrawOp::Fill { brush, mask, .. } => {
                push_brush(brush, &mut push);
                if let Some(m) = mask {
                    push(&m.image);
                }
            }
            DrawOp::Opaque {
                src, brush, mask, ..
            } => {
                push(src);
                push_brush(brush, &mut push);
                if let Some(m) = mask {
                    push(&m.image);
                }
            }
            DrawOp::Copy { src, mask, .. } | DrawOp::Blend { src, mask, .. } => {
                push(src);
                if let Some(m) = mask {
                    push(&m.image);
                }
            }
            DrawOp::Transparent { src, .. } | DrawOp::AlphaBlend { src, .. } => push(src),
            DrawOp::CopyBits { .. } => {}
            DrawOp::Blackness { mask } | DrawOp::Whiteness { mask } | DrawOp::Invers { mask } => {
                if let Some(m) = mask {
                    push(&m.image);
                }
            }
            DrawOp::Rop3 {
                src, brush, mask, ..
            } => {
                push(src);
                push_brush(brush, &mut push);
                if let Some(m) = mask {
                    push(&m.image);
                }
            }
            DrawOp::Stroke { brush, .. } => push_brush(brush, &mut push),
            DrawOp::Text { fore, back, .. } => {
                push_brush(fore, &mut push);
                push_brush(back, &mut push);
            }
        }
        deps
    }

    /// The ROP that decides whether the client may receive this command's
    /// imagery lossy-compressed.
    pub fn rop(&self) -> Ropd {
        match &self.op {
            DrawOp::Fill { rop, .. }
            | DrawOp::Opaque { rop, .. }
            | DrawOp::Copy { rop, .. }
            | DrawOp::Blend { rop, .. } => *rop,
            DrawOp::Rop3 { .. } => Ropd::OP_XOR, // ternary ops always combine dest
            DrawOp::Stroke { fore_rop, .. } => *fore_rop,
            _ => Ropd::OP_PUT,
        }
    }

    pub fn is_opaque(&self) -> bool {
        self.effect.is_opaque()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_none_is_bbox() {
        let bbox = Rect::new(0, 0, 10, 10);
        let region = Clip::None.region_for(bbox);
        assert_eq!(region.rects(), &[bbox]);
    }

    #[test]
    fn clip_rects_intersect_bbox() {
        let bbox = Rect::new(0, 0, 10, 10);
        let clip = Clip::Rects(vec![Rect::new(5, 5, 20, 20), Rect::new(-5, -5, 2, 2)]);
        let region = clip.region_for(bbox);
        assert_eq!(region.area(), 25 + 4);
    }

    #[test]
    fn brush_equality_is_semantic() {
        let a = Brush::Solid(0xFF0000);
        let b = Brush::Solid(0xFF0000);
        let c = Brush::Solid(0x00FF00);
        assert_eq!(a, b);
        assert_ne!(a, c);

        let img = ImageRef::bitmap(42, Bitmap::new_argb(4, 4));
        let img_same_id = ImageRef::bitmap(42, Bitmap::new_argb(4, 4));
        let p1 = Brush::Pattern {
            image: img,
            pos: Point::new(0, 0),
        };
        let p2 = Brush::Pattern {
            image: img_same_id,
            pos: Point::new(0, 0),
        };
        assert_eq!(p1, p2);
        assert_ne!(p1, a);
    }

    #[test]
    fn surface_deps_deduplicated() {
        let cmd = DrawCommand {
            surface_id: 0,
            bbox: Rect::new(0, 0, 8, 8),
            clip: Clip::None,
            effect: Effect::Opaque,
            op: DrawOp::Opaque {
                src: ImageRef::surface(3),
                src_area: Rect::new(0, 0, 8, 8),
                brush: Brush::Pattern {
                    image: ImageRef::surface(3),
                    pos: Point::new(0, 0),
                },
                rop: Ropd::PUT,
                scale_mode: ScaleMode::Nearest,
                mask: None,
            },
            mm_time: 0,
            self_bitmap_area: None,
        };
        assert_eq!(cmd.surface_deps().as_slice(), &[3]);
    }

    #[test]
    fn ropd_dest_combination() {
        assert!(!Ropd::PUT.combines_dest());
        assert!(Ropd::OP_XOR.combines_dest());
        assert!((Ropd::OP_PUT | Ropd::INVERS_DEST).combines_dest());
        assert!(Ropd::PUT.is_straight_put());
        assert!(!(Ropd::OP_PUT | Ropd::INVERS_SRC).is_straight_put());
    }
}
