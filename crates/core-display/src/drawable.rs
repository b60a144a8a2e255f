//! Drawable pool and the shared core state.
//!
//! A [`Drawable`] is jointly owned by the current tree and by every client
//! pipe item referencing it; ownership is an explicit reference count on
//! the arena entry (weak back-references are plain keys). The entry keeps
//! the stream-candidate counters that ride along a chain of matching
//! frames, and the guest resource tag handed back to the device when the
//! last reference drops.

use std::time::Instant;

use slotmap::{SlotMap, new_key_type};
use smallvec::SmallVec;

use core_canvas::Bitmap;
use core_canvas::cmd::{DrawCommand, DrawOp, Ropd};
use core_dispatch::ResourceTag;
use core_region::Region;

new_key_type! {
    pub struct DrawableKey;
    pub struct ItemKey;
    pub struct StreamKey;
}

/// Minimum streamable frame area under filtered stream detection (96×96).
pub const STREAM_MIN_AREA: u64 = 96 * 96;

pub struct Drawable {
    pub refs: u32,
    pub cmd: DrawCommand,
    pub tag: ResourceTag,
    pub creation: Instant,
    /// Effective destination region (bbox ∩ clip), captured at ingest.
    pub base_region: Region,
    /// Source-surface dependencies (never the target surface).
    pub deps: SmallVec<[u32; 3]>,
    /// Snapshot of the pre-draw destination for self-referencing commands.
    pub self_bitmap: Option<Bitmap>,
    /// Stream this drawable is the current frame of.
    pub stream: Option<StreamKey>,
    /// Back-reference to the tree item while in the current tree.
    pub item: Option<ItemKey>,
    /// Pipe items referencing this drawable: (client id, queued item id).
    pub pipe_items: SmallVec<[(u32, u64); 2]>,
    /// Candidate flag: opaque put-copy of a bitmap onto the primary.
    pub streamable: bool,
    /// High-graduality source content (sampled once at ingest).
    pub gradual: bool,
    // Frame-chain counters inherited from the drawable this one replaced.
    pub frames_count: u32,
    pub gradual_frames_count: u32,
    pub last_gradual_frame: u32,
}

impl Drawable {
    pub fn new(cmd: DrawCommand, tag: ResourceTag, now: Instant, gradual: bool,
               filter_streams: bool) -> Self {
        let base_region = cmd.region();
        let deps = cmd.surface_deps();
        let streamable = is_stream_candidate(&cmd, gradual, filter_streams);
        Self {
            refs: 1,
            base_region,
            deps,
            self_bitmap: None,
            stream: None,
            item: None,
            pipe_items: SmallVec::new(),
            streamable,
            gradual,
            // A candidate counts itself as the first frame of its chain.
            frames_count: u32::from(streamable),
            gradual_frames_count: u32::from(streamable && gradual),
            last_gradual_frame: u32::from(streamable && gradual),
            creation: now,
            cmd,
            tag,
        }
    }

    pub fn is_opaque(&self) -> bool {
        self.cmd.is_opaque()
    }

    pub fn mm_time(&self) -> u32 {
        self.cmd.mm_time
    }
}

/// A drawable qualifies as a stream frame candidate when it is an opaque
/// put-copy of an owned bitmap onto the primary surface. Filtered mode
/// additionally demands a big enough box and gradual content.
fn is_stream_candidate(cmd: &DrawCommand, gradual: bool, filter: bool) -> bool {
    if cmd.surface_id != 0 || !cmd.effect.is_opaque() {
        return false;
    }
    let DrawOp::Copy { src, rop, mask, .. } = &cmd.op else {
        return false;
    };
    if *rop != Ropd::PUT || mask.is_some() || src.as_bitmap().is_none() {
        return false;
    }
    if filter {
        cmd.bbox.area() >= STREAM_MIN_AREA && gradual
    } else {
        true
    }
}

/// Guest resources waiting to be handed back to the device. Drained by the
/// worker after every batch of tree/pipe mutations.
#[derive(Default)]
pub struct ReleaseQueue {
    pub tags: Vec<ResourceTag>,
}

pub struct DrawablePool {
    pub entries: SlotMap<DrawableKey, Drawable>,
}

impl DrawablePool {
    pub fn new() -> Self {
        Self {
            entries: SlotMap::with_key(),
        }
    }

    pub fn insert(&mut self, drawable: Drawable) -> DrawableKey {
        self.entries.insert(drawable)
    }

    pub fn get(&self, key: DrawableKey) -> &Drawable {
        &self.entries[key]
    }

    pub fn get_mut(&mut self, key: DrawableKey) -> &mut Drawable {
        &mut self.entries[key]
    }

    pub fn contains(&self, key: DrawableKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Take one reference.
    pub fn reference(&mut self, key: DrawableKey) {
        self.entries[key].refs += 1;
    }

    /// Drop one reference; at zero the entry dies and its guest resource
    /// goes onto the release queue.
    pub fn release(&mut self, key: DrawableKey, releases: &mut ReleaseQueue) {
        let drawable = &mut self.entries[key];
        debug_assert!(drawable.refs > 0);
        drawable.refs -= 1;
        if drawable.refs == 0 {
            debug_assert!(drawable.item.is_none(), "tree reference outlived refcount");
            let drawable = self.entries.remove(key).expect("live entry");
            releases.tags.push(drawable.tag);
        }
    }
}

/// Equality used by the on-duplicate effects: same command painting the
/// same pixels the same way.
pub fn same_content(a: &DrawCommand, b: &DrawCommand) -> bool {
    if a.surface_id != b.surface_id || a.bbox != b.bbox {
        return false;
    }
    match (&a.op, &b.op) {
        (
            DrawOp::Fill {
                brush: ba,
                rop: ra,
                ..
            },
            DrawOp::Fill {
                brush: bb,
                rop: rb,
                ..
            },
        ) => ba == bb && ra == rb,
        (
            DrawOp::Stroke {
                path: pa,
                brush: ba,
                fore_rop: ra,
            },
            DrawOp::Stroke {
                path: pb,
                brush: bb,
                fore_rop: rb,
            },
        ) => pa == pb && ba == bb && ra == rb,
        (
            DrawOp::Copy {
                src: sa, rop: ra, ..
            },
            DrawOp::Copy {
                src: sb, rop: rb, ..
            },
        ) => sa.id != 0 && sa.id == sb.id && ra == rb,
        (DrawOp::Blackness { .. }, DrawOp::Blackness { .. })
        | (DrawOp::Whiteness { .. }, DrawOp::Whiteness { .. })
        | (DrawOp::Invers { .. }, DrawOp::Invers { .. }) => true,
        _ => false,
    }
}

/// Identity check for the nop-on-dup effect: identical command including
/// the occlusion effect tag.
pub fn same_drawable(a: &DrawCommand, b: &DrawCommand) -> bool {
    a.effect == b.effect && same_content(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_canvas::cmd::{Brush, Clip, Effect, ImageRef};
    use core_region::Rect;

    fn tag() -> ResourceTag {
        ResourceTag {
            group_id: 0,
            res_id: 1,
        }
    }

    fn fill_cmd(bbox: Rect, color: u32) -> DrawCommand {
        DrawCommand {
            surface_id: 0,
            bbox,
            clip: Clip::None,
            effect: Effect::Opaque,
            op: DrawOp::Fill {
                brush: Brush::Solid(color),
                rop: Ropd::PUT,
                mask: None,
            },
            mm_time: 0,
            self_bitmap_area: None,
        }
    }

    fn copy_cmd(bbox: Rect) -> DrawCommand {
        let w = bbox.width() as u32;
        let h = bbox.height() as u32;
        DrawCommand {
            surface_id: 0,
            bbox,
            clip: Clip::None,
            effect: Effect::Opaque,
            op: DrawOp::Copy {
                src: ImageRef::bitmap(7, Bitmap::new_argb(w, h)),
                src_area: Rect::new(0, 0, w as i32, h as i32),
                rop: Ropd::PUT,
                scale_mode: Default::default(),
                mask: None,
            },
            mm_time: 0,
            self_bitmap_area: None,
        }
    }

    #[test]
    fn refcount_release_returns_tag() {
        let mut pool = DrawablePool::new();
        let mut releases = ReleaseQueue::default();
        let key = pool.insert(Drawable::new(
            fill_cmd(Rect::new(0, 0, 10, 10), 0xFF0000),
            tag(),
            Instant::now(),
            false,
            true,
        ));
        pool.reference(key);
        pool.release(key, &mut releases);
        assert!(pool.contains(key));
        assert!(releases.tags.is_empty());
        pool.release(key, &mut releases);
        assert!(!pool.contains(key));
        assert_eq!(releases.tags, vec![tag()]);
    }

    #[test]
    fn stream_candidate_filtering() {
        let now = Instant::now();
        // Big gradual copy on the primary: candidate under filter.
        let d = Drawable::new(copy_cmd(Rect::new(0, 0, 128, 128)), tag(), now, true, true);
        assert!(d.streamable);
        // Too small under filter.
        let d = Drawable::new(copy_cmd(Rect::new(0, 0, 64, 64)), tag(), now, true, true);
        assert!(!d.streamable);
        // Small but unfiltered mode takes everything copy-shaped.
        let d = Drawable::new(copy_cmd(Rect::new(0, 0, 64, 64)), tag(), now, true, false);
        assert!(d.streamable);
        // Not gradual under filter.
        let d = Drawable::new(copy_cmd(Rect::new(0, 0, 128, 128)), tag(), now, false, true);
        assert!(!d.streamable);
        // Fills are never candidates.
        let d = Drawable::new(
            fill_cmd(Rect::new(0, 0, 128, 128), 0xFF0000),
            tag(),
            now,
            true,
            false,
        );
        assert!(!d.streamable);
    }

    #[test]
    fn same_content_fill_compares_brush() {
        let a = fill_cmd(Rect::new(0, 0, 10, 10), 0xFF0000);
        let b = fill_cmd(Rect::new(0, 0, 10, 10), 0xFF0000);
        let c = fill_cmd(Rect::new(0, 0, 10, 10), 0x00FF00);
        assert!(same_content(&a, &b));
        assert!(!same_content(&a, &c));
        assert!(same_drawable(&a, &b));
    }
}
