//! The per-surface draw-item tree: a Z-ordered forest of draw items,
//! containers, and copy-bits shadows, occluded against an accumulating
//! exclusion region.
//!
//! Ordering: each surface ring (and each container's child list) stores
//! oldest first; walks run newest→oldest. A container groups items that
//! share a sub-region after one of them became opaque over part of them;
//! its children all sit at the container's Z position.
//!
//! Shadows and deferred rendering: a copy-bits command reads its source at
//! its point in the command order, so the items that produce those source
//! pixels must survive in the tree even when the screen no longer shows
//! them. The shadow parked at the source location *holds* any exclusion
//! that lands there (accumulating it in `on_hold`) instead of letting it
//! reach older items. When the copy-bits item leaves the tree — occluded
//! or rendered — the held region is promoted and finally propagates.
//!
//! Invariants kept here:
//! * Opaque sibling regions are pairwise disjoint.
//! * A region never grows after insertion; empty region ⇒ item removed.
//! * A container has at least two children (single children are lifted,
//!   empty containers die).

use std::time::Instant;

use core_canvas::cmd::{DrawOp, Effect};
use core_region::{Point, Region};

use crate::core::DisplayCore;
use crate::drawable::{DrawableKey, ItemKey, same_content, same_drawable};
use crate::stream;

pub struct TreeItem {
    pub surface_id: u32,
    pub region: Region,
    /// Parent container; `None` means the surface's top ring.
    pub container: Option<ItemKey>,
    pub kind: TreeKind,
}

pub enum TreeKind {
    Draw(DrawItemData),
    Container(Vec<ItemKey>),
    Shadow(ShadowData),
}

pub struct DrawItemData {
    pub drawable: DrawableKey,
    pub effect: Effect,
    pub shadow: Option<ItemKey>,
}

pub struct ShadowData {
    /// Owning copy-bits item.
    pub owner: ItemKey,
    /// Exclusion intercepted at the source location, released when the
    /// owner leaves the tree.
    pub on_hold: Region,
}

/// Result of [`current_add`].
#[derive(Debug, PartialEq, Eq)]
pub enum AddOutcome {
    /// Inserted as a new tree item.
    Added { item: ItemKey },
    /// On-duplicate replacement: the new drawable took over an existing
    /// item; `old` has left the tree.
    Replaced { item: ItemKey, old: DrawableKey },
    /// Revert-on-dup pair: both cancelled. Clients that already painted
    /// `old` still need the new drawable; the new one is not in the tree.
    Reverted { old: DrawableKey },
    /// Nop-on-dup: the new drawable was dropped entirely.
    Dropped,
}

fn item_is_opaque(core: &DisplayCore, key: ItemKey) -> bool {
    match &core.items[key].kind {
        TreeKind::Draw(d) => d.effect.is_opaque(),
        TreeKind::Container(_) => true,
        TreeKind::Shadow(_) => false,
    }
}

fn ring_of(core: &DisplayCore, surface_id: u32, container: Option<ItemKey>) -> Vec<ItemKey> {
    match container {
        None => core.surfaces.get(surface_id).ring.clone(),
        Some(c) => match &core.items[c].kind {
            TreeKind::Container(children) => children.clone(),
            _ => unreachable!("container key must point at a container"),
        },
    }
}

/// Insert a captured drawable into its surface's current tree, applying
/// the full occlusion protocol.
pub fn current_add(core: &mut DisplayCore, key: DrawableKey, now: Instant) -> AddOutcome {
    let surface_id = core.pool.get(key).cmd.surface_id;
    let opaque = core.pool.get(key).is_opaque();
    let region = core.pool.get(key).base_region.clone();
    let is_copy_bits = matches!(core.pool.get(key).cmd.op, DrawOp::CopyBits { .. });
    let mut exclude = Region::new();

    // Walk siblings from the most recent, descending into containers when
    // an opaque item fully contains the new drawable.
    let mut container: Option<ItemKey> = None;
    'outer: loop {
        let ring = ring_of(core, surface_id, container);
        for &sib in ring.iter().rev() {
            if !core.items.contains_key(sib) {
                continue;
            }
            let test = region.test(&core.items[sib].region);
            if !test.shared() {
                continue;
            }
            let sib_is_shadow = matches!(core.items[sib].kind, TreeKind::Shadow(_));
            if !sib_is_shadow && !is_copy_bits && test.shared_only() {
                if let Some(outcome) = try_add_equal(core, key, sib, now) {
                    return outcome;
                }
            }
            if opaque && !test.right_exclusive() {
                // The new drawable fully covers the sibling.
                let mut promoted = Region::new();
                current_remove(core, sib, &mut promoted);
                exclude.union(&promoted);
                continue;
            }
            if !test.left_exclusive() && item_is_opaque(core, sib) {
                // The sibling fully contains the new drawable.
                if matches!(core.items[sib].kind, TreeKind::Container(_)) {
                    container = Some(sib);
                    continue 'outer;
                }
                // Opaque draw item: wrap it into a container and join it.
                container = Some(promote_to_container(core, sib));
                break 'outer;
            }
        }
        break;
    }

    // Copy-bits grows a shadow at the source location, pushed to the top
    // ring just below the item itself.
    let shadow = if is_copy_bits {
        let DrawOp::CopyBits { src_pos } = core.pool.get(key).cmd.op else {
            unreachable!()
        };
        let bbox = core.pool.get(key).cmd.bbox;
        let delta = Point::new(src_pos.x - bbox.left, src_pos.y - bbox.top);
        if delta != Point::new(0, 0) {
            let mut shadow_region = region.clone();
            shadow_region.offset(delta.x, delta.y);
            let shadow_key = core.items.insert(TreeItem {
                surface_id,
                region: shadow_region,
                container: None,
                kind: TreeKind::Shadow(ShadowData {
                    owner: ItemKey::default(), // patched right below
                    on_hold: Region::new(),
                }),
            });
            core.surfaces.get_mut(surface_id).ring.push(shadow_key);
            Some(shadow_key)
        } else {
            None
        }
    } else {
        None
    };

    let effect = core.pool.get(key).cmd.effect;
    let item = core.items.insert(TreeItem {
        surface_id,
        region: region.clone(),
        container,
        kind: TreeKind::Draw(DrawItemData {
            drawable: key,
            effect,
            shadow,
        }),
    });
    if let Some(sh) = shadow
        && let TreeKind::Shadow(data) = &mut core.items[sh].kind
    {
        data.owner = item;
    }
    match container {
        None => core.surfaces.get_mut(surface_id).ring.push(item),
        Some(c) => match &mut core.items[c].kind {
            TreeKind::Container(children) => children.push(item),
            _ => unreachable!(),
        },
    }
    core.pool.reference(key);
    core.pool.get_mut(key).item = Some(item);

    // Exclusion: the new opaque region plus anything promoted during the
    // walk, applied backward across everything older than the new item.
    if opaque {
        exclude.union(&region);
    }
    if !exclude.is_empty() {
        exclude_below(core, surface_id, item, &mut exclude);
    }

    // Non-opaque content over the primary breaks any stream it touches.
    if !opaque && surface_id == 0 {
        detach_streams_behind(core, &region);
    }

    // A fresh candidate may continue a chain the tree already dropped.
    if core.pool.get(key).streamable && core.pool.get(key).frames_count <= 1 {
        stream::seed_from_trace(core, key, now);
        let d = core.pool.get(key);
        if d.stream.is_none()
            && d.frames_count >= stream::STREAM_START_FRAMES
            && (d.gradual_frames_count as f64)
                >= stream::STREAM_GRADUAL_RATIO * (d.frames_count as f64)
        {
            stream::create_stream(core, key, now);
        }
    }

    AddOutcome::Added { item }
}

/// The on-duplicate protocol for a sibling covering exactly the same
/// pixels. Returns `None` when no rule applies and insertion proceeds.
fn try_add_equal(
    core: &mut DisplayCore,
    new_key: DrawableKey,
    sib: ItemKey,
    now: Instant,
) -> Option<AddOutcome> {
    let (old_key, has_shadow) = match &core.items[sib].kind {
        TreeKind::Draw(data) => (data.drawable, data.shadow.is_some()),
        _ => return None,
    };
    if has_shadow {
        // A copy-bits destination is never replaced in place; its shadow
        // bookkeeping would dangle.
        return None;
    }
    let new_effect = core.pool.get(new_key).cmd.effect;
    let old_effect = core.pool.get(old_key).cmd.effect;

    match new_effect {
        Effect::Opaque if old_effect == Effect::Opaque => {
            if core.pool.get(new_key).cmd.bbox != core.pool.get(old_key).cmd.bbox {
                return None;
            }
            // Stream continuity: the replaced drawable may be the current
            // frame of a stream, or an unpromoted chain link.
            if let Some(stream_key) = core.pool.get(old_key).stream {
                if stream::frames_match(core, old_key, new_key, stream::STREAM_MATCH_STREAMING) {
                    stream::attach_frame(core, stream_key, old_key, new_key, now);
                } else {
                    stream::stop_stream(core, stream_key);
                }
            } else if core.pool.get(new_key).streamable
                && stream::frames_match(core, old_key, new_key, stream::STREAM_MATCH_NEW)
                && stream::advance_chain(core, old_key, new_key)
            {
                stream::create_stream(core, new_key, now);
            }
            Some(replace_in_item(core, sib, old_key, new_key))
        }
        Effect::OpaqueBrush
            if same_content(&core.pool.get(new_key).cmd, &core.pool.get(old_key).cmd) =>
        {
            Some(replace_in_item(core, sib, old_key, new_key))
        }
        Effect::RevertOnDup
            if same_content(&core.pool.get(new_key).cmd, &core.pool.get(old_key).cmd) =>
        {
            // The two applications cancel. Neither stays in the tree.
            let mut promoted = Region::new();
            current_remove(core, sib, &mut promoted);
            debug_assert!(promoted.is_empty(), "revert items carry no shadows");
            Some(AddOutcome::Reverted { old: old_key })
        }
        Effect::NopOnDup
            if same_drawable(&core.pool.get(new_key).cmd, &core.pool.get(old_key).cmd) =>
        {
            Some(AddOutcome::Dropped)
        }
        _ => None,
    }
}

/// Swap the drawable inside an existing item, releasing the old one.
fn replace_in_item(
    core: &mut DisplayCore,
    item: ItemKey,
    old_key: DrawableKey,
    new_key: DrawableKey,
) -> AddOutcome {
    match &mut core.items[item].kind {
        TreeKind::Draw(data) => {
            data.drawable = new_key;
        }
        _ => unreachable!("replace target is a draw item"),
    }
    let effect = core.pool.get(new_key).cmd.effect;
    if let TreeKind::Draw(data) = &mut core.items[item].kind {
        data.effect = effect;
    }
    core.pool.reference(new_key);
    core.pool.get_mut(new_key).item = Some(item);
    core.pool.get_mut(old_key).item = None;
    crate::core::release_drawable(core, old_key);
    AddOutcome::Replaced {
        item,
        old: old_key,
    }
}

/// Wrap an opaque draw item into a fresh container at the same ring slot,
/// so a contained newcomer can become its sibling-in-group.
fn promote_to_container(core: &mut DisplayCore, item: ItemKey) -> ItemKey {
    let (surface_id, parent, region) = {
        let it = &core.items[item];
        (it.surface_id, it.container, it.region.clone())
    };
    let container = core.items.insert(TreeItem {
        surface_id,
        region,
        container: parent,
        kind: TreeKind::Container(vec![item]),
    });
    replace_in_parent(core, surface_id, parent, item, container);
    core.items[item].container = Some(container);
    container
}

fn replace_in_parent(
    core: &mut DisplayCore,
    surface_id: u32,
    parent: Option<ItemKey>,
    old: ItemKey,
    new: ItemKey,
) {
    let list = match parent {
        None => &mut core.surfaces.get_mut(surface_id).ring,
        Some(c) => match &mut core.items[c].kind {
            TreeKind::Container(children) => children,
            _ => unreachable!(),
        },
    };
    let pos = list.iter().position(|&k| k == old).expect("item in parent");
    list[pos] = new;
}

fn unlink_from_parent(core: &mut DisplayCore, item: ItemKey) {
    let (surface_id, parent) = {
        let it = &core.items[item];
        (it.surface_id, it.container)
    };
    {
        let list = match parent {
            None => &mut core.surfaces.get_mut(surface_id).ring,
            Some(c) => match &mut core.items[c].kind {
                TreeKind::Container(children) => children,
                _ => unreachable!(),
            },
        };
        if let Some(pos) = list.iter().position(|&k| k == item) {
            list.remove(pos);
        }
    }
    // Flatten the parent container when it thins out.
    if let Some(c) = parent {
        let remaining = match &core.items[c].kind {
            TreeKind::Container(children) => children.clone(),
            _ => unreachable!(),
        };
        match remaining.len() {
            0 => {
                unlink_from_parent(core, c);
                core.items.remove(c);
            }
            1 => {
                let lone = remaining[0];
                let grand = core.items[c].container;
                replace_in_parent(core, surface_id, grand, c, lone);
                core.items[lone].container = grand;
                core.items.remove(c);
            }
            _ => {
                let mut union = Region::new();
                for &ch in &remaining {
                    union.union(&core.items[ch].region);
                }
                core.items[c].region = union;
            }
        }
    }
}

/// Remove an item (and its subtree) from the current tree, releasing
/// drawables and promoting shadow holds into `promoted`.
pub fn current_remove(core: &mut DisplayCore, item: ItemKey, promoted: &mut Region) {
    if !core.items.contains_key(item) {
        return;
    }
    enum Kind {
        Draw { drawable: DrawableKey, shadow: Option<ItemKey> },
        Container(Vec<ItemKey>),
        Shadow,
    }
    let kind = match &core.items[item].kind {
        TreeKind::Draw(d) => Kind::Draw {
            drawable: d.drawable,
            shadow: d.shadow,
        },
        TreeKind::Container(children) => Kind::Container(children.clone()),
        TreeKind::Shadow(_) => Kind::Shadow,
    };
    match kind {
        Kind::Container(children) => {
            for child in children {
                current_remove(core, child, promoted);
            }
            // Child removal flattens aggressively; the container may
            // already be gone.
            if core.items.contains_key(item) {
                unlink_from_parent(core, item);
                core.items.remove(item);
            }
        }
        Kind::Shadow => {
            detach_shadow(core, item, promoted);
        }
        Kind::Draw { drawable, shadow } => {
            if let Some(sh) = shadow {
                detach_shadow(core, sh, promoted);
            }
            unlink_from_parent(core, item);
            core.items.remove(item);
            release_tree_drawable(core, drawable);
        }
    }
}

fn detach_shadow(core: &mut DisplayCore, shadow: ItemKey, promoted: &mut Region) {
    if !core.items.contains_key(shadow) {
        return;
    }
    let on_hold = match &mut core.items[shadow].kind {
        TreeKind::Shadow(data) => std::mem::take(&mut data.on_hold),
        _ => unreachable!("detach_shadow on a non-shadow"),
    };
    promoted.union(&on_hold);
    unlink_from_parent(core, shadow);
    core.items.remove(shadow);
}

/// Drop the tree's reference on a drawable leaving the current tree:
/// stream bookkeeping, trace recording, refcount.
fn release_tree_drawable(core: &mut DisplayCore, key: DrawableKey) {
    let stream_key = {
        let d = core.pool.get_mut(key);
        d.item = None;
        d.stream
    };
    if let Some(sk) = stream_key {
        // The current frame of a stream got occluded out of the tree.
        stream::stop_stream(core, sk);
    }
    if core.pool.get(key).streamable {
        let (sw, sh) = stream::src_size(core, key);
        let d = core.pool.get(key);
        let entry = crate::stream::TraceEntry {
            time: d.creation,
            frames_count: d.frames_count,
            gradual_frames_count: d.gradual_frames_count,
            last_gradual_frame: d.last_gradual_frame,
            width: sw,
            height: sh,
            dest: d.cmd.bbox,
        };
        core.trace.push(entry);
    }
    crate::core::release_drawable(core, key);
}

/// Apply `exclude` to everything strictly older than `newest` on the
/// surface, honoring shadow holds. The exclusion can grow mid-walk when
/// emptied copy-bits items promote their shadows.
pub fn exclude_below(
    core: &mut DisplayCore,
    surface_id: u32,
    newest: ItemKey,
    exclude: &mut Region,
) {
    let ring = core.surfaces.get(surface_id).ring.clone();
    let mut started = false;
    let mut removals: Vec<ItemKey> = Vec::new();
    walk_exclude(core, &ring, newest, &mut started, exclude, &mut removals);
    for item in removals {
        let mut promoted = Region::new();
        current_remove(core, item, &mut promoted);
        // Holds from these removals were folded into `exclude` during the
        // walk already.
        debug_assert!(promoted.is_empty());
    }
}

fn walk_exclude(
    core: &mut DisplayCore,
    list: &[ItemKey],
    newest: ItemKey,
    started: &mut bool,
    exclude: &mut Region,
    removals: &mut Vec<ItemKey>,
) {
    for &ik in list.iter().rev() {
        if !core.items.contains_key(ik) {
            continue;
        }
        if ik == newest {
            *started = true;
            continue;
        }
        enum Kind {
            Draw { drawable: DrawableKey, shadow: Option<ItemKey> },
            Container(Vec<ItemKey>),
            Shadow,
        }
        let kind = match &core.items[ik].kind {
            TreeKind::Draw(d) => Kind::Draw {
                drawable: d.drawable,
                shadow: d.shadow,
            },
            TreeKind::Container(children) => Kind::Container(children.clone()),
            TreeKind::Shadow(_) => Kind::Shadow,
        };
        if !*started {
            // Still at items newer than the inserted one; only look inside
            // containers, which may enclose it.
            if let Kind::Container(children) = kind {
                walk_exclude(core, &children, newest, started, exclude, removals);
                if *started {
                    refresh_container_region(core, ik);
                }
            }
            continue;
        }
        if exclude.is_empty() {
            return;
        }
        match kind {
            Kind::Container(children) => {
                walk_exclude(core, &children, newest, started, exclude, removals);
                refresh_container_region(core, ik);
            }
            Kind::Shadow => {
                let mut shared = core.items[ik].region.clone();
                shared.intersect(exclude);
                if shared.is_empty() {
                    continue;
                }
                // The hold: source pixels under this shadow are still
                // needed by its copy-bits; the exclusion stops here.
                core.items[ik].region.subtract(&shared);
                exclude.subtract(&shared);
                if let TreeKind::Shadow(data) = &mut core.items[ik].kind {
                    data.on_hold.union(&shared);
                }
            }
            Kind::Draw { drawable: _, shadow } => {
                if !core.items[ik].region.intersects(exclude) {
                    continue;
                }
                core.items[ik].region.subtract(exclude);
                if core.items[ik].region.is_empty() {
                    // Occluded out: promote a held shadow so the exclusion
                    // reaches what it was protecting.
                    if let Some(sh) = shadow
                        && core.items.contains_key(sh)
                        && let TreeKind::Shadow(data) = &mut core.items[sh].kind
                    {
                        let held = std::mem::take(&mut data.on_hold);
                        exclude.union(&held);
                    }
                    removals.push(ik);
                }
            }
        }
    }
}

fn refresh_container_region(core: &mut DisplayCore, container: ItemKey) {
    if !core.items.contains_key(container) {
        return;
    }
    let children = match &core.items[container].kind {
        TreeKind::Container(children) => children.clone(),
        _ => return,
    };
    let mut union = Region::new();
    for ch in children {
        if core.items.contains_key(ch) {
            union.union(&core.items[ch].region);
        }
    }
    core.items[container].region = union;
}

/// Stop streams whose destination a non-opaque drawable scribbles over.
fn detach_streams_behind(core: &mut DisplayCore, region: &Region) {
    let hit: Vec<_> = core
        .streams
        .iter()
        .filter(|(_, s)| region.intersects_rect(s.dest))
        .map(|(k, _)| k)
        .collect();
    for key in hit {
        stream::stop_stream(core, key);
    }
}

/// Clear a surface's whole tree (destroy path). Shadow holds die with the
/// tree; nothing remains to re-exclude.
pub fn clear_surface_tree(core: &mut DisplayCore, surface_id: u32) {
    let ring = core.surfaces.get(surface_id).ring.clone();
    let mut promoted = Region::new();
    for item in ring {
        current_remove(core, item, &mut promoted);
    }
    debug_assert!(core.surfaces.get(surface_id).ring.is_empty());
}

/// Depth-first collection of live draw items, oldest first; used by the
/// render layer and the tests.
pub fn draw_items_in_order(core: &DisplayCore, surface_id: u32) -> Vec<ItemKey> {
    fn visit(core: &DisplayCore, list: &[ItemKey], out: &mut Vec<ItemKey>) {
        for &ik in list {
            match &core.items[ik].kind {
                TreeKind::Draw(_) => out.push(ik),
                TreeKind::Container(children) => visit(core, children, out),
                TreeKind::Shadow(_) => {}
            }
        }
    }
    let mut out = Vec::new();
    visit(core, &core.surfaces.get(surface_id).ring, &mut out);
    out
}
