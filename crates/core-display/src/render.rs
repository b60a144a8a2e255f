//! Deterministic rendering: driving pending drawables through the canvas.
//!
//! This is the path that keeps disconnected clients honest — everything a
//! client would have painted can be reproduced from the surface canvases.
//! `flush_area` renders older-to-newer and is idempotent against an
//! already-flushed area; `get_area` is flush + read-back. Rendering a
//! drawable resolves its source references first, which may recursively
//! flush the surfaces it depends on.

use std::sync::Arc;

use core_canvas::cmd::{Brush, DrawCommand, DrawOp, ImageKind, ImageRef, Mask};
use core_canvas::{Bitmap, ResolvedBrush, ResolvedMask};
use core_region::{Rect, Region};

use crate::core::DisplayCore;
use crate::drawable::DrawableKey;
use crate::tree::{self, TreeKind};

/// Render every pending drawable that can affect `rect` on the surface,
/// removing rendered items from the tree. Items older than the newest
/// rect-touching item are rendered too: a later copy may read what they
/// painted.
pub fn flush_area(core: &mut DisplayCore, surface_id: u32, rect: Rect) {
    let ordered = tree::draw_items_in_order(core, surface_id);
    let probe = Region::from_rect(rect);
    let last_touching = ordered.iter().rposition(|&ik| {
        let item = &core.items[ik];
        let TreeKind::Draw(data) = &item.kind else {
            return false;
        };
        core.pool.get(data.drawable).base_region.intersects(&probe)
    });
    let Some(last) = last_touching else {
        return;
    };
    for &ik in &ordered[..=last] {
        if !core.items.contains_key(ik) {
            continue;
        }
        let TreeKind::Draw(data) = &core.items[ik].kind else {
            continue;
        };
        let drawable = data.drawable;
        render_drawable(core, drawable);
        // Flushing runs strictly oldest-first, so by the time a copy-bits
        // owner leaves the tree nothing older remains for its released
        // hold to re-exclude; the promotion is discarded.
        let mut promoted = Region::new();
        tree::current_remove(core, ik, &mut promoted);
    }
}

/// Flush everything pending on a surface.
pub fn flush_surface(core: &mut DisplayCore, surface_id: u32) {
    let (w, h) = {
        let s = core.surfaces.get(surface_id);
        (s.width, s.height)
    };
    flush_area(core, surface_id, Rect::new(0, 0, w as i32, h as i32));
}

/// Flush + read back an area as a top-down RGB bitmap.
pub fn get_area(core: &mut DisplayCore, surface_id: u32, rect: Rect) -> Bitmap {
    flush_area(core, surface_id, rect);
    core.surfaces.get(surface_id).canvas.read_bits(rect)
}

/// Capture the pre-draw destination area for a self-referencing command.
/// Must run at ingest, before the drawable enters the tree.
pub fn capture_self_bitmap(core: &mut DisplayCore, key: DrawableKey) {
    let Some(area) = core.pool.get(key).cmd.self_bitmap_area else {
        return;
    };
    let surface_id = core.pool.get(key).cmd.surface_id;
    let bitmap = get_area(core, surface_id, area);
    core.pool.get_mut(key).self_bitmap = Some(bitmap);
}

/// Resolve an image reference into concrete pixels. Surface references
/// flush the source surface area first; the target's own surface resolves
/// through the captured self-bitmap when one exists.
fn resolve_image(
    core: &mut DisplayCore,
    img: &ImageRef,
    src_area: Rect,
    target_surface: u32,
    self_bitmap: Option<&Bitmap>,
) -> Arc<Bitmap> {
    match &img.kind {
        ImageKind::Bitmap(bmp) => bmp.clone(),
        ImageKind::Surface(id) => {
            if *id == target_surface {
                if let Some(snap) = self_bitmap {
                    return Arc::new(snap.clone());
                }
                // Same-surface read without a snapshot: the in-order flush
                // has already rendered everything older, so the canvas is
                // current. Flushing here would recurse into ourselves.
                return Arc::new(core.surfaces.get(*id).canvas.read_bits(src_area));
            }
            Arc::new(get_area(core, *id, src_area))
        }
    }
}

fn resolve_brush(
    core: &mut DisplayCore,
    brush: &Brush,
    target_surface: u32,
) -> Option<ResolvedBrush> {
    match brush {
        Brush::None => None,
        Brush::Solid(c) => Some(ResolvedBrush::Solid(*c)),
        Brush::Pattern { image, pos } => {
            let full = match image.surface_id() {
                Some(id) => {
                    let (w, h) = {
                        let s = core.surfaces.get(id);
                        (s.width as i32, s.height as i32)
                    };
                    Rect::new(0, 0, w, h)
                }
                None => Rect::EMPTY,
            };
            let bitmap = resolve_image(core, image, full, target_surface, None);
            Some(ResolvedBrush::Pattern {
                bitmap,
                pos: *pos,
            })
        }
    }
}

fn resolve_mask(
    core: &mut DisplayCore,
    mask: &Option<Mask>,
    target_surface: u32,
) -> Option<ResolvedMask> {
    mask.as_ref().map(|m| {
        let full = match m.image.surface_id() {
            Some(id) => {
                let (w, h) = {
                    let s = core.surfaces.get(id);
                    (s.width as i32, s.height as i32)
                };
                Rect::new(0, 0, w, h)
            }
            None => Rect::EMPTY,
        };
        let bitmap = resolve_image(core, &m.image, full, target_surface, None);
        ResolvedMask {
            bitmap,
            pos: m.pos,
            invers: m.invers,
        }
    })
}

/// Execute one drawable against its surface canvas. The full command
/// region is painted; occluded parts get overwritten by newer items later
/// in the flush order.
pub fn render_drawable(core: &mut DisplayCore, key: DrawableKey) {
    let cmd: DrawCommand = core.pool.get(key).cmd.clone();
    let self_bitmap = core.pool.get(key).self_bitmap.clone();
    let region = core.pool.get(key).base_region.clone();
    let surface_id = cmd.surface_id;
    let bbox = cmd.bbox;

    // Resolve everything that may touch other surfaces before borrowing
    // the target canvas.
    let default_brush = ResolvedBrush::Solid(0);
    match &cmd.op {
        DrawOp::Fill { brush, rop, mask } => {
            let rb = resolve_brush(core, brush, surface_id).unwrap_or(default_brush);
            let rm = resolve_mask(core, mask, surface_id);
            let canvas = &mut core.surfaces.get_mut(surface_id).canvas;
            canvas.draw_fill(&region, &rb, *rop, rm.as_ref());
        }
        DrawOp::Opaque {
            src,
            src_area,
            brush,
            rop,
            mask,
            ..
        } => {
            let bmp = resolve_image(core, src, *src_area, surface_id, self_bitmap.as_ref());
            let src_area = effective_src_area(src, *src_area);
            let rb = resolve_brush(core, brush, surface_id).unwrap_or(default_brush);
            let rm = resolve_mask(core, mask, surface_id);
            let canvas = &mut core.surfaces.get_mut(surface_id).canvas;
            canvas.draw_opaque(bbox, &region, &bmp, src_area, &rb, *rop, rm.as_ref());
        }
        DrawOp::Copy {
            src,
            src_area,
            rop,
            mask,
            ..
        } => {
            let bmp = resolve_image(core, src, *src_area, surface_id, self_bitmap.as_ref());
            let src_area = effective_src_area(src, *src_area);
            let rm = resolve_mask(core, mask, surface_id);
            let canvas = &mut core.surfaces.get_mut(surface_id).canvas;
            canvas.draw_copy(bbox, &region, &bmp, src_area, *rop, rm.as_ref());
        }
        DrawOp::Transparent {
            src,
            src_area,
            transparent_color,
        } => {
            let bmp = resolve_image(core, src, *src_area, surface_id, self_bitmap.as_ref());
            let src_area = effective_src_area(src, *src_area);
            let canvas = &mut core.surfaces.get_mut(surface_id).canvas;
            canvas.draw_transparent(bbox, &region, &bmp, src_area, *transparent_color);
        }
        DrawOp::AlphaBlend {
            src,
            src_area,
            alpha,
        } => {
            let bmp = resolve_image(core, src, *src_area, surface_id, self_bitmap.as_ref());
            let src_area = effective_src_area(src, *src_area);
            let canvas = &mut core.surfaces.get_mut(surface_id).canvas;
            canvas.draw_alpha_blend(bbox, &region, &bmp, src_area, *alpha);
        }
        DrawOp::CopyBits { src_pos } => {
            let canvas = &mut core.surfaces.get_mut(surface_id).canvas;
            canvas.copy_bits(bbox, &region, *src_pos);
        }
        DrawOp::Blend {
            src,
            src_area,
            rop,
            mask,
        } => {
            let bmp = resolve_image(core, src, *src_area, surface_id, self_bitmap.as_ref());
            let src_area = effective_src_area(src, *src_area);
            let rm = resolve_mask(core, mask, surface_id);
            let canvas = &mut core.surfaces.get_mut(surface_id).canvas;
            canvas.draw_blend(bbox, &region, &bmp, src_area, *rop, rm.as_ref());
        }
        DrawOp::Blackness { mask } => {
            let rm = resolve_mask(core, mask, surface_id);
            let canvas = &mut core.surfaces.get_mut(surface_id).canvas;
            canvas.draw_blackness(&region, rm.as_ref());
        }
        DrawOp::Whiteness { mask } => {
            let rm = resolve_mask(core, mask, surface_id);
            let canvas = &mut core.surfaces.get_mut(surface_id).canvas;
            canvas.draw_whiteness(&region, rm.as_ref());
        }
        DrawOp::Invers { mask } => {
            let rm = resolve_mask(core, mask, surface_id);
            let canvas = &mut core.surfaces.get_mut(surface_id).canvas;
            canvas.draw_invers(&region, rm.as_ref());
        }
        DrawOp::Rop3 {
            src,
            src_area,
            brush,
            rop3,
            mask,
        } => {
            let bmp = resolve_image(core, src, *src_area, surface_id, self_bitmap.as_ref());
            let src_area = effective_src_area(src, *src_area);
            let rb = resolve_brush(core, brush, surface_id).unwrap_or(default_brush);
            let rm = resolve_mask(core, mask, surface_id);
            let canvas = &mut core.surfaces.get_mut(surface_id).canvas;
            canvas.draw_rop3(bbox, &region, &bmp, src_area, &rb, *rop3, rm.as_ref());
        }
        DrawOp::Stroke {
            path,
            brush,
            fore_rop,
        } => {
            let rb = resolve_brush(core, brush, surface_id).unwrap_or(default_brush);
            let canvas = &mut core.surfaces.get_mut(surface_id).canvas;
            canvas.draw_stroke(&region, path, &rb, *fore_rop);
        }
        DrawOp::Text {
            glyphs,
            fore,
            back,
            back_area,
        } => {
            let rf = resolve_brush(core, fore, surface_id).unwrap_or(default_brush.clone());
            let rb = resolve_brush(core, back, surface_id);
            let canvas = &mut core.surfaces.get_mut(surface_id).canvas;
            canvas.draw_text(
                &region,
                glyphs,
                &rf,
                rb.as_ref().map(|b| (b, *back_area)),
            );
        }
    }
    core.surfaces.get_mut(surface_id).dirty.union(&region);
}

/// Surface-sourced images are read back as exactly the source area, so the
/// canvas indexes them from origin.
fn effective_src_area(src: &ImageRef, src_area: Rect) -> Rect {
    match src.kind {
        ImageKind::Bitmap(_) => src_area,
        ImageKind::Surface(_) => {
            Rect::new(0, 0, src_area.width(), src_area.height())
        }
    }
}

/// OOM relief: render and drop up to `budget` of the oldest tree items
/// across all surfaces. Returns how many were evicted.
pub fn evict_oldest(core: &mut DisplayCore, budget: usize) -> usize {
    let mut candidates: Vec<(std::time::Instant, u32, crate::drawable::ItemKey)> = Vec::new();
    for surface_id in core.surfaces.ids() {
        for ik in tree::draw_items_in_order(core, surface_id) {
            if let TreeKind::Draw(data) = &core.items[ik].kind {
                candidates.push((core.pool.get(data.drawable).creation, surface_id, ik));
            }
        }
    }
    candidates.sort_by_key(|&(t, _, _)| t);
    let mut evicted = 0;
    for (_, _surface, ik) in candidates.into_iter().take(budget) {
        if !core.items.contains_key(ik) {
            continue;
        }
        let TreeKind::Draw(data) = &core.items[ik].kind else {
            continue;
        };
        let drawable = data.drawable;
        render_drawable(core, drawable);
        // Oldest-first eviction: released shadow holds have nothing older
        // left to apply to.
        let mut promoted = Region::new();
        tree::current_remove(core, ik, &mut promoted);
        evicted += 1;
    }
    tracing::debug!(target: "display.oom", evicted, "tree_eviction");
    evicted
}
