//! Software canvas: renders every drawing primitive into a plain ARGB
//! word buffer.
//!
//! This is the deterministic renderer the worker uses for disconnected
//! clients, surface flushes, and OOM eviction. Pixels are stored top-down
//! as `0xAARGGBB` words; all binary ROPs operate on the RGB channels and
//! force the result opaque, matching what a 24-bit framebuffer would do.

use core_region::{Point, Rect, Region};

use crate::cmd::{Glyph, Path, Ropd};
use crate::{Bitmap, Canvas, PixelFormat, ResolvedBrush, ResolvedMask};

const RGB: u32 = 0x00FF_FFFF;
const OPAQUE: u32 = 0xFF00_0000;

pub struct SoftCanvas {
    width: u32,
    height: u32,
    data: Vec<u32>,
}

impl SoftCanvas {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![OPAQUE; (width * height) as usize],
        }
    }

    /// Canvas preloaded from existing surface bits (surface create with
    /// valid data).
    pub fn from_bitmap(width: u32, height: u32, bitmap: &Bitmap) -> Self {
        let mut canvas = Self::new(width, height);
        canvas.put_bits(Rect::new(0, 0, width as i32, height as i32), bitmap);
        canvas
    }

    #[inline]
    fn idx(&self, x: i32, y: i32) -> usize {
        y as usize * self.width as usize + x as usize
    }

    pub fn pixel(&self, x: i32, y: i32) -> u32 {
        self.data[self.idx(x, y)]
    }

    /// Iterate the region's rects clamped to the canvas bounds.
    fn clamped<'a>(&self, region: &'a Region) -> impl Iterator<Item = Rect> + 'a {
        let bounds = Rect::new(0, 0, self.width as i32, self.height as i32);
        region
            .rects()
            .iter()
            .map(move |r| r.intersection(&bounds))
            .filter(|r| !r.is_empty())
    }

    /// Write one destination pixel through the optional mask.
    #[inline]
    fn put(&mut self, x: i32, y: i32, value: u32, mask: Option<&ResolvedMask>) {
        if let Some(m) = mask
            && !m.admits(x, y)
        {
            return;
        }
        let i = self.idx(x, y);
        self.data[i] = value;
    }

    fn brush_pixel(brush: &ResolvedBrush, x: i32, y: i32) -> u32 {
        match brush {
            ResolvedBrush::Solid(c) => OPAQUE | (c & RGB),
            ResolvedBrush::Pattern { bitmap, pos } => {
                let w = bitmap.width as i32;
                let h = bitmap.height as i32;
                let bx = (x - pos.x).rem_euclid(w);
                let by = (y - pos.y).rem_euclid(h);
                OPAQUE | (bitmap.pixel(bx as u32, by as u32) & RGB)
            }
        }
    }

    /// Nearest sample of `src_area` in `src`, mapped from destination pixel
    /// (x, y) inside `bbox`. Identity offset when the sizes match.
    fn sample(src: &Bitmap, src_area: Rect, bbox: Rect, x: i32, y: i32) -> u32 {
        let dw = bbox.width();
        let dh = bbox.height();
        let sw = src_area.width();
        let sh = src_area.height();
        let (sx, sy) = if dw == sw && dh == sh {
            (src_area.left + (x - bbox.left), src_area.top + (y - bbox.top))
        } else {
            (
                src_area.left + ((x - bbox.left) as i64 * sw as i64 / dw as i64) as i32,
                src_area.top + ((y - bbox.top) as i64 * sh as i64 / dh as i64) as i32,
            )
        };
        let sx = sx.clamp(0, src.width as i32 - 1) as u32;
        let sy = sy.clamp(0, src.height as i32 - 1) as u32;
        src.pixel(sx, sy)
    }

    fn blend(src: u32, dst: u32, alpha: u32) -> u32 {
        let inv = 255 - alpha;
        let mut out = OPAQUE;
        for shift in [16u32, 8, 0] {
            let s = (src >> shift) & 0xFF;
            let d = (dst >> shift) & 0xFF;
            out |= (((s * alpha + d * inv) / 255) & 0xFF) << shift;
        }
        out
    }
}

/// Apply a binary ROP descriptor with `operand` as the source-side input.
/// `operand_is_brush` selects which inversion bit applies.
fn apply_ropd(rop: Ropd, operand: u32, dst: u32, operand_is_brush: bool) -> u32 {
    let invers_operand = if operand_is_brush {
        rop.contains(Ropd::INVERS_BRUSH)
    } else {
        rop.contains(Ropd::INVERS_SRC)
    };
    let mut s = operand & RGB;
    if invers_operand {
        s = !s & RGB;
    }
    let mut d = dst & RGB;
    if rop.contains(Ropd::INVERS_DEST) {
        d = !d & RGB;
    }
    let mut out = if rop.contains(Ropd::OP_PUT) {
        s
    } else if rop.contains(Ropd::OP_OR) {
        s | d
    } else if rop.contains(Ropd::OP_AND) {
        s & d
    } else if rop.contains(Ropd::OP_XOR) {
        s ^ d
    } else if rop.contains(Ropd::OP_BLACKNESS) {
        0
    } else if rop.contains(Ropd::OP_WHITENESS) {
        RGB
    } else if rop.contains(Ropd::OP_INVERS) {
        !d & RGB
    } else {
        s
    };
    if rop.contains(Ropd::INVERS_RES) {
        out = !out & RGB;
    }
    OPAQUE | out
}

/// Evaluate an 8-bit ternary raster op over (pattern, source, destination)
/// bit-parallel on 32-bit words. The code byte is the truth table indexed
/// by `(p << 2) | (s << 1) | d`.
fn rop3_eval(code: u8, p: u32, s: u32, d: u32) -> u32 {
    let mut out = 0u32;
    for i in 0..8u8 {
        if (code >> i) & 1 != 0 {
            let pm = if i & 4 != 0 { p } else { !p };
            let sm = if i & 2 != 0 { s } else { !s };
            let dm = if i & 1 != 0 { d } else { !d };
            out |= pm & sm & dm;
        }
    }
    OPAQUE | (out & RGB)
}

impl Canvas for SoftCanvas {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn draw_fill(&mut self, region: &Region, brush: &ResolvedBrush, rop: Ropd,
                 mask: Option<&ResolvedMask>) {
        let rects: Vec<Rect> = self.clamped(region).collect();
        for r in rects {
            for y in r.top..r.bottom {
                for x in r.left..r.right {
                    let b = Self::brush_pixel(brush, x, y);
                    let d = self.pixel(x, y);
                    self.put(x, y, apply_ropd(rop, b, d, true), mask);
                }
            }
        }
    }

    fn draw_opaque(&mut self, bbox: Rect, region: &Region, src: &Bitmap, src_area: Rect,
                   brush: &ResolvedBrush, rop: Ropd, mask: Option<&ResolvedMask>) {
        let rects: Vec<Rect> = self.clamped(region).collect();
        for r in rects {
            for y in r.top..r.bottom {
                for x in r.left..r.right {
                    let s = Self::sample(src, src_area, bbox, x, y);
                    let b = Self::brush_pixel(brush, x, y);
                    // The copied source acts as the destination operand of
                    // the brush ROP; the prior canvas content is replaced.
                    self.put(x, y, apply_ropd(rop, b, s, true), mask);
                }
            }
        }
    }

    fn draw_copy(&mut self, bbox: Rect, region: &Region, src: &Bitmap, src_area: Rect, rop: Ropd,
                 mask: Option<&ResolvedMask>) {
        let rects: Vec<Rect> = self.clamped(region).collect();
        for r in rects {
            for y in r.top..r.bottom {
                for x in r.left..r.right {
                    let s = Self::sample(src, src_area, bbox, x, y);
                    let d = self.pixel(x, y);
                    self.put(x, y, apply_ropd(rop, s, d, false), mask);
                }
            }
        }
    }

    fn draw_transparent(&mut self, bbox: Rect, region: &Region, src: &Bitmap, src_area: Rect,
                        transparent_color: u32) {
        let key = transparent_color & RGB;
        let rects: Vec<Rect> = self.clamped(region).collect();
        for r in rects {
            for y in r.top..r.bottom {
                for x in r.left..r.right {
                    let s = Self::sample(src, src_area, bbox, x, y);
                    if s & RGB != key {
                        self.put(x, y, OPAQUE | (s & RGB), None);
                    }
                }
            }
        }
    }

    fn draw_alpha_blend(&mut self, bbox: Rect, region: &Region, src: &Bitmap, src_area: Rect,
                        alpha: u8) {
        let rects: Vec<Rect> = self.clamped(region).collect();
        for r in rects {
            for y in r.top..r.bottom {
                for x in r.left..r.right {
                    let s = Self::sample(src, src_area, bbox, x, y);
                    let a = if src.format.has_alpha() {
                        (s >> 24) * alpha as u32 / 255
                    } else {
                        alpha as u32
                    };
                    let d = self.pixel(x, y);
                    let out = Self::blend(s, d, a);
                    self.put(x, y, out, None);
                }
            }
        }
    }

    fn draw_blend(&mut self, bbox: Rect, region: &Region, src: &Bitmap, src_area: Rect, rop: Ropd,
                  mask: Option<&ResolvedMask>) {
        self.draw_copy(bbox, region, src, src_area, rop, mask);
    }

    fn copy_bits(&mut self, bbox: Rect, region: &Region, src_pos: Point) {
        // Snapshot the source area first: source and destination may overlap.
        let w = bbox.width();
        let h = bbox.height();
        let mut snap = vec![0u32; (w * h) as usize];
        for dy in 0..h {
            for dx in 0..w {
                let sx = (src_pos.x + dx).clamp(0, self.width as i32 - 1);
                let sy = (src_pos.y + dy).clamp(0, self.height as i32 - 1);
                snap[(dy * w + dx) as usize] = self.pixel(sx, sy);
            }
        }
        let rects: Vec<Rect> = self.clamped(region).collect();
        for r in rects {
            for y in r.top..r.bottom {
                for x in r.left..r.right {
                    let dx = x - bbox.left;
                    let dy = y - bbox.top;
                    if dx >= 0 && dy >= 0 && dx < w && dy < h {
                        let v = snap[(dy * w + dx) as usize];
                        self.put(x, y, v, None);
                    }
                }
            }
        }
    }

    fn draw_blackness(&mut self, region: &Region, mask: Option<&ResolvedMask>) {
        let rects: Vec<Rect> = self.clamped(region).collect();
        for r in rects {
            for y in r.top..r.bottom {
                for x in r.left..r.right {
                    self.put(x, y, OPAQUE, mask);
                }
            }
        }
    }

    fn draw_whiteness(&mut self, region: &Region, mask: Option<&ResolvedMask>) {
        let rects: Vec<Rect> = self.clamped(region).collect();
        for r in rects {
            for y in r.top..r.bottom {
                for x in r.left..r.right {
                    self.put(x, y, OPAQUE | RGB, mask);
                }
            }
        }
    }

    fn draw_invers(&mut self, region: &Region, mask: Option<&ResolvedMask>) {
        let rects: Vec<Rect> = self.clamped(region).collect();
        for r in rects {
            for y in r.top..r.bottom {
                for x in r.left..r.right {
                    let d = self.pixel(x, y);
                    self.put(x, y, OPAQUE | (!d & RGB), mask);
                }
            }
        }
    }

    fn draw_rop3(&mut self, bbox: Rect, region: &Region, src: &Bitmap, src_area: Rect,
                 brush: &ResolvedBrush, rop3: u8, mask: Option<&ResolvedMask>) {
        let rects: Vec<Rect> = self.clamped(region).collect();
        for r in rects {
            for y in r.top..r.bottom {
                for x in r.left..r.right {
                    let p = Self::brush_pixel(brush, x, y);
                    let s = Self::sample(src, src_area, bbox, x, y);
                    let d = self.pixel(x, y);
                    self.put(x, y, rop3_eval(rop3, p, s, d), mask);
                }
            }
        }
    }

    fn draw_stroke(&mut self, region: &Region, path: &Path, brush: &ResolvedBrush, fore_rop: Ropd) {
        for seg in &path.segments {
            let mut pts: Vec<Point> = seg.points.clone();
            if seg.closed && pts.len() > 2 {
                pts.push(pts[0]);
            }
            for pair in pts.windows(2) {
                self.stroke_line(region, pair[0], pair[1], brush, fore_rop);
            }
        }
    }

    fn draw_text(&mut self, region: &Region, glyphs: &[Glyph], fore: &ResolvedBrush,
                 back: Option<(&ResolvedBrush, Rect)>) {
        if let Some((brush, area)) = back {
            let mut back_region = Region::from_rect(area);
            back_region.intersect(region);
            self.draw_fill(&back_region, brush, Ropd::PUT, None);
        }
        let rects: Vec<Rect> = self.clamped(region).collect();
        for glyph in glyphs {
            let gw = glyph.bitmap.width as i32;
            let gh = glyph.bitmap.height as i32;
            for gy in 0..gh {
                for gx in 0..gw {
                    let a = glyph.bitmap.alpha(gx as u32, gy as u32) as u32;
                    if a == 0 {
                        continue;
                    }
                    let x = glyph.render_pos.x + gx;
                    let y = glyph.render_pos.y + gy;
                    if !rects.iter().any(|r| r.contains_point(Point::new(x, y))) {
                        continue;
                    }
                    let f = Self::brush_pixel(fore, x, y);
                    let d = self.pixel(x, y);
                    let out = if a == 255 { f } else { Self::blend(f, d, a) };
                    self.put(x, y, out, None);
                }
            }
        }
    }

    fn read_bits(&self, area: Rect) -> Bitmap {
        let bounds = Rect::new(0, 0, self.width as i32, self.height as i32);
        let area = area.intersection(&bounds);
        let w = area.width() as u32;
        let h = area.height() as u32;
        let mut pixels = Vec::with_capacity((w * h) as usize);
        for y in area.top..area.bottom {
            for x in area.left..area.right {
                pixels.push(self.pixel(x, y));
            }
        }
        let mut bmp = Bitmap::from_argb(w, h, pixels);
        bmp.format = PixelFormat::Rgb32;
        bmp
    }

    fn put_bits(&mut self, area: Rect, bitmap: &Bitmap) {
        let bounds = Rect::new(0, 0, self.width as i32, self.height as i32);
        let area = area.intersection(&bounds);
        for y in area.top..area.bottom {
            for x in area.left..area.right {
                let bx = (x - area.left) as u32;
                let by = (y - area.top) as u32;
                if bx < bitmap.width && by < bitmap.height {
                    let i = self.idx(x, y);
                    self.data[i] = OPAQUE | (bitmap.pixel(bx, by) & RGB);
                }
            }
        }
    }
}

impl SoftCanvas {
    fn stroke_line(&mut self, region: &Region, a: Point, b: Point, brush: &ResolvedBrush,
                   rop: Ropd) {
        // Bresenham over the clip region.
        let (mut x, mut y) = (a.x, a.y);
        let dx = (b.x - a.x).abs();
        let dy = -(b.y - a.y).abs();
        let sx = if a.x < b.x { 1 } else { -1 };
        let sy = if a.y < b.y { 1 } else { -1 };
        let mut err = dx + dy;
        loop {
            if x >= 0
                && y >= 0
                && x < self.width as i32
                && y < self.height as i32
                && region.contains_point(Point::new(x, y))
            {
                let p = Self::brush_pixel(brush, x, y);
                let d = self.pixel(x, y);
                self.put(x, y, apply_ropd(rop, p, d, true), None);
            }
            if x == b.x && y == b.y {
                break;
            }
            let e2 = 2 * err;
            if e2 >= dy {
                err += dy;
                x += sx;
            }
            if e2 <= dx {
                err += dx;
                y += sy;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn solid(c: u32) -> ResolvedBrush {
        ResolvedBrush::Solid(c)
    }

    fn full(canvas: &SoftCanvas) -> Region {
        Region::from_rect(Rect::new(0, 0, canvas.width() as i32, canvas.height() as i32))
    }

    #[test]
    fn fill_then_overlap_pixels() {
        let mut c = SoftCanvas::new(200, 200);
        c.draw_fill(
            &Region::from_rect(Rect::new(0, 0, 100, 100)),
            &solid(0xFF0000),
            Ropd::PUT,
            None,
        );
        c.draw_fill(
            &Region::from_rect(Rect::new(50, 50, 150, 150)),
            &solid(0x00FF00),
            Ropd::PUT,
            None,
        );
        assert_eq!(c.pixel(25, 25) & RGB, 0xFF0000);
        assert_eq!(c.pixel(75, 75) & RGB, 0x00FF00);
        assert_eq!(c.pixel(125, 125) & RGB, 0x00FF00);
        // Untouched background stays black.
        assert_eq!(c.pixel(125, 25) & RGB, 0x000000);
    }

    #[test]
    fn copy_bits_overlapping_move() {
        let mut c = SoftCanvas::new(100, 10);
        c.draw_fill(
            &Region::from_rect(Rect::new(0, 0, 10, 10)),
            &solid(0xAA55AA),
            Ropd::PUT,
            None,
        );
        // Shift right by 5: overlapping source/destination.
        let bbox = Rect::new(5, 0, 15, 10);
        c.copy_bits(bbox, &Region::from_rect(bbox), Point::new(0, 0));
        assert_eq!(c.pixel(14, 5) & RGB, 0xAA55AA);
        assert_eq!(c.pixel(6, 5) & RGB, 0xAA55AA);
    }

    #[test]
    fn rop3_truth_tables() {
        let mut c = SoftCanvas::new(4, 1);
        c.draw_fill(&full(&c), &solid(0x0F0F0F), Ropd::PUT, None);
        let src = Bitmap::from_argb(4, 1, vec![0xFF33CC33; 4]);
        let area = Rect::new(0, 0, 4, 1);
        // 0xCC: result = source.
        c.draw_rop3(area, &full(&c), &src, area, &solid(0xF0F0F0), 0xCC, None);
        assert_eq!(c.pixel(0, 0) & RGB, 0x33CC33);
        // 0xF0: result = pattern.
        c.draw_rop3(area, &full(&c), &src, area, &solid(0xF0F0F0), 0xF0, None);
        assert_eq!(c.pixel(0, 0) & RGB, 0xF0F0F0);
        // 0xAA: result = destination (no-op).
        c.draw_rop3(area, &full(&c), &src, area, &solid(0x123456), 0xAA, None);
        assert_eq!(c.pixel(0, 0) & RGB, 0xF0F0F0);
    }

    #[test]
    fn transparent_skips_key_color() {
        let mut c = SoftCanvas::new(2, 1);
        c.draw_fill(&full(&c), &solid(0x101010), Ropd::PUT, None);
        let src = Bitmap::from_argb(2, 1, vec![0xFF00FF00, 0xFFABCDEF]);
        let area = Rect::new(0, 0, 2, 1);
        c.draw_transparent(area, &full(&c), &src, area, 0x00FF00);
        assert_eq!(c.pixel(0, 0) & RGB, 0x101010); // key color skipped
        assert_eq!(c.pixel(1, 0) & RGB, 0xABCDEF);
    }

    #[test]
    fn alpha_blend_halfway() {
        let mut c = SoftCanvas::new(1, 1);
        c.draw_fill(&full(&c), &solid(0x000000), Ropd::PUT, None);
        let src = Bitmap::from_argb(1, 1, vec![0xFFFFFFFF]);
        let area = Rect::new(0, 0, 1, 1);
        c.draw_alpha_blend(area, &full(&c), &src, area, 128);
        let px = c.pixel(0, 0) & RGB;
        let r = px >> 16 & 0xFF;
        assert!((127..=129).contains(&r), "r={r}");
    }

    #[test]
    fn xor_rop_round_trips() {
        let mut c = SoftCanvas::new(1, 1);
        c.draw_fill(&full(&c), &solid(0x00AA55), Ropd::PUT, None);
        let src = Bitmap::from_argb(1, 1, vec![0xFF0F0F0F]);
        let area = Rect::new(0, 0, 1, 1);
        c.draw_copy(area, &full(&c), &src, area, Ropd::OP_XOR, None);
        assert_eq!(c.pixel(0, 0) & RGB, 0x00AA55 ^ 0x0F0F0F);
        c.draw_copy(area, &full(&c), &src, area, Ropd::OP_XOR, None);
        assert_eq!(c.pixel(0, 0) & RGB, 0x00AA55);
    }

    #[test]
    fn read_and_put_bits_round_trip() {
        let mut c = SoftCanvas::new(8, 8);
        c.draw_fill(
            &Region::from_rect(Rect::new(2, 2, 6, 6)),
            &solid(0x336699),
            Ropd::PUT,
            None,
        );
        let snapshot = c.read_bits(Rect::new(0, 0, 8, 8));
        let mut other = SoftCanvas::new(8, 8);
        other.put_bits(Rect::new(0, 0, 8, 8), &snapshot);
        assert_eq!(other.pixel(3, 3) & RGB, 0x336699);
        assert_eq!(other.pixel(0, 0) & RGB, 0x000000);
    }

    #[test]
    fn stroke_diagonal_endpoints() {
        let mut c = SoftCanvas::new(10, 10);
        let path = Path {
            segments: vec![crate::cmd::PathSeg {
                points: vec![Point::new(0, 0), Point::new(9, 9)],
                closed: false,
            }],
        };
        c.draw_stroke(&full(&c), &path, &solid(0xFFFFFF), Ropd::PUT);
        assert_eq!(c.pixel(0, 0) & RGB, 0xFFFFFF);
        assert_eq!(c.pixel(9, 9) & RGB, 0xFFFFFF);
        assert_eq!(c.pixel(5, 5) & RGB, 0xFFFFFF);
        assert_eq!(c.pixel(9, 0) & RGB, 0x000000);
    }

    #[test]
    fn masked_fill_gates_writes() {
        let mut c = SoftCanvas::new(4, 1);
        let mask = ResolvedMask {
            bitmap: Arc::new(Bitmap {
                format: PixelFormat::A1,
                width: 4,
                height: 1,
                stride: 1,
                top_down: true,
                data: vec![0b1010_0000],
                palette: None,
            }),
            pos: Point::new(0, 0),
            invers: false,
        };
        c.draw_fill(&full(&c), &solid(0xFF0000), Ropd::PUT, Some(&mask));
        assert_eq!(c.pixel(0, 0) & RGB, 0xFF0000);
        assert_eq!(c.pixel(1, 0) & RGB, 0x000000);
        assert_eq!(c.pixel(2, 0) & RGB, 0xFF0000);
        assert_eq!(c.pixel(3, 0) & RGB, 0x000000);
    }
}
