//! The adapter command rings, as the worker sees them.
//!
//! The device pushes drawing and cursor commands into two rings; the worker
//! pulls them through [`AdapterDevice`]. Guest pointers have already been
//! validated and copied into owned payloads; what remains of the guest
//! resource is the `(group_id, res_id)` tag the worker hands back through
//! `release_resource` once the command's last reference drops.

use core_canvas::{Bitmap, cmd::DrawCommand};
use core_region::{Point, Rect};

/// Guest resource handle released back to the device when the worker is
/// done with a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceTag {
    pub group_id: u32,
    pub res_id: u64,
}

#[derive(Debug, Clone)]
pub struct SurfaceCreateInfo {
    pub surface_id: u32,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: core_canvas::PixelFormat,
    /// Initial content; `data_valid` marks it as a reload that must reach
    /// clients.
    pub data: Option<Bitmap>,
    pub data_valid: bool,
}

/// One entry of the drawing ring.
#[derive(Debug, Clone)]
pub enum CommandPayload {
    Draw(DrawCommand),
    /// Render an area and push it back into guest memory (`get_area`).
    Update {
        surface_id: u32,
        area: Rect,
        clear_dirty: bool,
    },
    /// Guest log message routed to the host log.
    Message(String),
    SurfaceCreate(SurfaceCreateInfo),
    SurfaceDestroy { surface_id: u32 },
}

/// One entry of the cursor ring.
#[derive(Debug, Clone)]
pub enum CursorPayload {
    Set { position: Point, visible: bool, shape: CursorShape },
    Move { position: Point },
    Hide,
    Trail { length: u16, frequency: u16 },
}

#[derive(Debug, Clone)]
pub struct CursorShape {
    pub id: u64,
    pub hot: Point,
    pub bitmap: Bitmap,
}

#[derive(Debug, Clone)]
pub struct RingCommand<T> {
    pub tag: ResourceTag,
    pub payload: T,
}

/// The worker's view of the device. Implementations are the real adapter
/// glue and the synthetic device used by tests and the demo binary.
pub trait AdapterDevice: Send {
    /// Pop the next drawing command, if any.
    fn pop_command(&mut self) -> Option<RingCommand<CommandPayload>>;

    /// Pop the next cursor command, if any.
    fn pop_cursor(&mut self) -> Option<RingCommand<CursorPayload>>;

    /// Arm a wakeup notification for new ring content. Returns false when
    /// commands arrived between the last pop and this call (the worker must
    /// keep polling instead of parking).
    fn request_notification(&mut self) -> bool;

    /// Hand a finished command's guest resource back.
    fn release_resource(&mut self, tag: ResourceTag);

    /// Ask the guest to free what it can; returns the number of resources
    /// it released.
    fn flush_resources(&mut self) -> usize;
}
