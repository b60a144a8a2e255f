//! Per-client pipe items.
//!
//! The pipe is a FIFO of tagged items; marshalling into wire frames
//! happens at send time so late state (cache hits, stream attachment,
//! compression mode) is applied as close to the socket as possible. A
//! drawable item holds a pool reference jointly with the current tree;
//! the reference drops when the item is sent, replaced, or the client
//! goes away.

use core_canvas::Bitmap;
use core_region::Rect;
use core_wire::types::WireWaitForChannels;

use crate::drawable::{DrawableKey, StreamKey};

#[derive(Debug)]
pub enum PipeItem {
    /// A draw command (or the current frame of a stream, decided at send).
    Drawable(DrawableKey),
    /// Lossless read-back image, ordered ahead of whatever depends on it.
    Image {
        surface_id: u32,
        area: Rect,
        bitmap: Bitmap,
    },
    /// Still frame painted when a stream ends before its last frame was
    /// delivered.
    Upgrade {
        surface_id: u32,
        area: Rect,
        bitmap: Bitmap,
    },
    InvalPixmap(u64),
    InvalPalette(u64),
    StreamCreate(StreamKey),
    StreamClip(StreamKey),
    StreamDestroy { wire_id: u32 },
    /// Zero-payload broadcast by raw message type (mark, reset, ...).
    Verb(u16),
    Migrate,
    MigrateData(Vec<u8>),
    /// Generation catch-up: wait for the resetting channel, then drop all
    /// pixmaps.
    PixmapSync,
    /// Full reset initiated by this channel.
    PixmapReset,
    WaitForChannels(WireWaitForChannels),
    SurfaceCreate {
        surface_id: u32,
        width: u32,
        height: u32,
        format: u8,
        primary: bool,
    },
    SurfaceDestroy(u32),
    SetAck { generation: u32, window: u32 },
}

/// Pipe entry: a stable per-client id enables cross-removal from the
/// drawable's back-reference list.
#[derive(Debug)]
pub struct QueuedItem {
    pub id: u64,
    pub item: PipeItem,
}

impl QueuedItem {
    pub fn drawable(&self) -> Option<DrawableKey> {
        match self.item {
            PipeItem::Drawable(key) => Some(key),
            _ => None,
        }
    }
}
