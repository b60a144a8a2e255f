//! Surface registry: identified off-screen pixel buffers, each owning a
//! canvas, a current tree ring, a dependency ring, and a dirty region.
//!
//! Invariants:
//! * Surface 0 is the primary; only it can source a stream.
//! * A surface is torn down only when its refcount reaches zero, and
//!   destruction requires the dependency ring be empty (dependents are
//!   flushed first by the render layer).

use core_canvas::{Canvas, PixelFormat, soft::SoftCanvas};
use core_region::Region;

use crate::drawable::{DrawableKey, ItemKey};

pub const MAX_SURFACES: usize = 1024;

pub struct Surface {
    pub id: u32,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
    pub canvas: Box<dyn Canvas + Send>,
    /// Base reference plus one per drawable targeting or sourcing this
    /// surface.
    pub refs: u32,
    /// Current tree, oldest first; the last element is the newest item.
    pub ring: Vec<ItemKey>,
    /// Drawables on *other* surfaces waiting for this one's content.
    pub dep_ring: Vec<DrawableKey>,
    /// Area drawn since the last update read-back.
    pub dirty: Region,
    /// Set when the device recreated the surface with valid data that must
    /// reach clients.
    pub reload_pending: bool,
    /// Marked for destruction: freed when refs drop to zero.
    pub destroy_pending: bool,
}

impl Surface {
    pub fn is_primary(&self) -> bool {
        self.id == 0
    }
}

#[derive(Default)]
pub struct SurfaceRegistry {
    slots: Vec<Option<Surface>>,
}

impl SurfaceRegistry {
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_SURFACES).map(|_| None).collect(),
        }
    }

    /// Create a surface with a software canvas. Panics on an out-of-range
    /// id or an already-live slot: both are device protocol violations and
    /// fail fast per the error taxonomy.
    pub fn create(
        &mut self,
        id: u32,
        width: u32,
        height: u32,
        stride: u32,
        format: PixelFormat,
        data: Option<&core_canvas::Bitmap>,
        data_valid: bool,
    ) -> &mut Surface {
        let slot = self
            .slots
            .get_mut(id as usize)
            .unwrap_or_else(|| panic!("surface id {id} out of range"));
        assert!(slot.is_none(), "surface {id} already exists");
        let canvas: Box<dyn Canvas + Send> = match data {
            Some(bmp) => Box::new(SoftCanvas::from_bitmap(width, height, bmp)),
            None => Box::new(SoftCanvas::new(width, height)),
        };
        tracing::debug!(
            target: "display.surface",
            id,
            width,
            height,
            ?format,
            data_valid,
            "surface_create"
        );
        *slot = Some(Surface {
            id,
            width,
            height,
            stride,
            format,
            canvas,
            refs: 1,
            ring: Vec::new(),
            dep_ring: Vec::new(),
            dirty: Region::new(),
            reload_pending: data_valid,
            destroy_pending: false,
        });
        slot.as_mut().expect("just created")
    }

    pub fn get(&self, id: u32) -> &Surface {
        self.slots[id as usize].as_ref().expect("live surface")
    }

    pub fn get_mut(&mut self, id: u32) -> &mut Surface {
        self.slots[id as usize].as_mut().expect("live surface")
    }

    pub fn lookup(&self, id: u32) -> Option<&Surface> {
        self.slots.get(id as usize).and_then(|s| s.as_ref())
    }

    pub fn lookup_mut(&mut self, id: u32) -> Option<&mut Surface> {
        self.slots.get_mut(id as usize).and_then(|s| s.as_mut())
    }

    pub fn exists(&self, id: u32) -> bool {
        self.lookup(id).is_some()
    }

    /// All live surface ids.
    pub fn ids(&self) -> Vec<u32> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| i as u32))
            .collect()
    }

    pub fn add_ref(&mut self, id: u32) {
        self.get_mut(id).refs += 1;
    }

    /// Drop one reference; frees the slot at zero (the caller must have
    /// emptied tree and dependency ring first). Returns true when freed.
    pub fn release(&mut self, id: u32) -> bool {
        let surface = self.get_mut(id);
        debug_assert!(surface.refs > 0);
        surface.refs -= 1;
        if surface.refs == 0 {
            debug_assert!(surface.ring.is_empty(), "tree must be cleared first");
            debug_assert!(surface.dep_ring.is_empty(), "dependency ring must drain first");
            tracing::debug!(target: "display.surface", id, "surface_free");
            self.slots[id as usize] = None;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_lookup_release() {
        let mut reg = SurfaceRegistry::new();
        reg.create(0, 800, 600, 800 * 4, PixelFormat::Rgb32, None, false);
        assert!(reg.exists(0));
        assert!(reg.get(0).is_primary());
        assert_eq!(reg.ids(), vec![0]);
        assert!(reg.release(0));
        assert!(!reg.exists(0));
    }

    #[test]
    fn refcount_delays_free() {
        let mut reg = SurfaceRegistry::new();
        reg.create(3, 64, 64, 256, PixelFormat::Rgb32, None, false);
        reg.add_ref(3);
        assert!(!reg.release(3));
        assert!(reg.exists(3));
        assert!(reg.release(3));
        assert!(!reg.exists(3));
    }

    #[test]
    #[should_panic(expected = "already exists")]
    fn double_create_panics() {
        let mut reg = SurfaceRegistry::new();
        reg.create(1, 8, 8, 32, PixelFormat::Rgb32, None, false);
        reg.create(1, 8, 8, 32, PixelFormat::Rgb32, None, false);
    }

    #[test]
    fn reload_flag_carried() {
        let mut reg = SurfaceRegistry::new();
        let bmp = core_canvas::Bitmap::new_argb(8, 8);
        let s = reg.create(2, 8, 8, 32, PixelFormat::Rgb32, Some(&bmp), true);
        assert!(s.reload_pending);
    }
}
