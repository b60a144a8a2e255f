//! Shared single-threaded core state: every pool the tree, stream, and
//! render layers operate on. Clients live outside this struct so pipe
//! insertion can borrow a client mutably while reading core state.

use slotmap::SlotMap;

use core_dispatch::dispatcher::StreamVideoMode;

use crate::drawable::{DrawablePool, ItemKey, ReleaseQueue, StreamKey};
use crate::stream::{ItemTrace, Stream, StreamEvent};
use crate::surfaces::SurfaceRegistry;
use crate::tree::TreeItem;

pub struct DisplayCore {
    pub pool: DrawablePool,
    pub items: SlotMap<ItemKey, TreeItem>,
    pub streams: SlotMap<StreamKey, Stream>,
    pub surfaces: SurfaceRegistry,
    pub trace: ItemTrace,
    pub releases: ReleaseQueue,
    /// Stream lifecycle notifications pending worker fan-out.
    pub stream_events: Vec<StreamEvent>,
    pub next_stream_wire_id: u32,
    pub streaming: StreamVideoMode,
}

impl DisplayCore {
    pub fn new(streaming: StreamVideoMode) -> Self {
        Self {
            pool: DrawablePool::new(),
            items: SlotMap::with_key(),
            streams: SlotMap::with_key(),
            surfaces: SurfaceRegistry::new(),
            trace: ItemTrace::new(),
            releases: ReleaseQueue::default(),
            stream_events: Vec::new(),
            next_stream_wire_id: 0,
            streaming,
        }
    }

    /// Streamable detection runs in filtered mode unless streaming is
    /// forced on for everything.
    pub fn filter_streams(&self) -> bool {
        self.streaming != StreamVideoMode::All
    }

    pub fn drawable_count(&self) -> usize {
        self.pool.len()
    }
}

/// Drop one drawable reference, maintaining the surface refcounts and
/// dependency rings when the entry dies. Every release in the crate goes
/// through here so surface teardown ordering stays consistent.
pub fn release_drawable(core: &mut DisplayCore, key: crate::drawable::DrawableKey) {
    let dying = core.pool.get(key).refs == 1;
    if !dying {
        core.pool.release(key, &mut core.releases);
        return;
    }
    let surface_id = core.pool.get(key).cmd.surface_id;
    let deps = core.pool.get(key).deps.clone();
    core.pool.release(key, &mut core.releases);
    for dep in deps {
        if core.surfaces.exists(dep) {
            let ring = &mut core.surfaces.get_mut(dep).dep_ring;
            if let Some(pos) = ring.iter().position(|&k| k == key) {
                ring.remove(pos);
            }
            core.surfaces.release(dep);
        }
    }
    if core.surfaces.exists(surface_id) {
        core.surfaces.release(surface_id);
    }
}
