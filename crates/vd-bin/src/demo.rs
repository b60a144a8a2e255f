//! Synthetic adapter and loopback client for the demo run: a scripted
//! device that animates a photographic region (exercising the stream
//! detector) over a desktop of fills, plus a transport that swallows
//! frames and acks like a healthy client.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use core_canvas::cmd::{
    Brush, Clip, DrawCommand, DrawOp, Effect, ImageRef, Ropd, ScaleMode,
};
use core_canvas::{Bitmap, PixelFormat};
use core_dispatch::device::{
    AdapterDevice, CommandPayload, CursorPayload, ResourceTag, RingCommand, SurfaceCreateInfo,
};
use core_dispatch::{ClientTransport, SendOutcome, WireFrame};
use core_region::Rect;
use core_wire::ClientMessage;

/// Command queue shared between the producer (main thread) and the worker.
#[derive(Clone, Default)]
pub struct DemoDevice {
    commands: Arc<Mutex<VecDeque<RingCommand<CommandPayload>>>>,
    released: Arc<AtomicUsize>,
    next_res: Arc<AtomicUsize>,
}

impl DemoDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&self, payload: CommandPayload) {
        let res_id = self.next_res.fetch_add(1, Ordering::Relaxed) as u64;
        self.commands.lock().push_back(RingCommand {
            tag: ResourceTag {
                group_id: 0,
                res_id,
            },
            payload,
        });
    }

    pub fn pending(&self) -> usize {
        self.commands.lock().len()
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::Relaxed)
    }

    pub fn queue_primary(&self, width: u32, height: u32) {
        self.queue(CommandPayload::SurfaceCreate(SurfaceCreateInfo {
            surface_id: 0,
            width,
            height,
            stride: width * 4,
            format: PixelFormat::Rgb32,
            data: None,
            data_valid: false,
        }));
    }

    pub fn queue_fill(&self, bbox: Rect, color: u32) {
        self.queue(CommandPayload::Draw(DrawCommand {
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
        }));
    }

    /// A video-like frame: an opaque put-copy of a photographic bitmap at
    /// a fixed box.
    pub fn queue_video_frame(&self, bbox: Rect, frame_no: u32) {
        let w = bbox.width() as u32;
        let h = bbox.height() as u32;
        let mut px = Vec::with_capacity((w * h) as usize);
        for y in 0..h {
            for x in 0..w {
                let r = (x + frame_no * 2) & 0xFF;
                let g = (y + frame_no) & 0xFF;
                let b = (x + y) / 2 & 0xFF;
                px.push(0xFF00_0000 | r << 16 | g << 8 | b);
            }
        }
        let bitmap = Bitmap::from_argb(w, h, px);
        let src_area = Rect::new(0, 0, w as i32, h as i32);
        self.queue(CommandPayload::Draw(DrawCommand {
            surface_id: 0,
            bbox,
            clip: Clip::None,
            effect: Effect::Opaque,
            op: DrawOp::Copy {
                src: ImageRef::bitmap(0x4000_0000 + u64::from(frame_no), bitmap),
                src_area,
                rop: Ropd::PUT,
                scale_mode: ScaleMode::Nearest,
                mask: None,
            },
            mm_time: frame_no * 33,
            self_bitmap_area: None,
        }));
    }
}

impl AdapterDevice for DemoDevice {
    fn pop_command(&mut self) -> Option<RingCommand<CommandPayload>> {
        self.commands.lock().pop_front()
    }

    fn pop_cursor(&mut self) -> Option<RingCommand<CursorPayload>> {
        None
    }

    fn request_notification(&mut self) -> bool {
        self.commands.lock().is_empty()
    }

    fn release_resource(&mut self, _tag: ResourceTag) {
        self.released.fetch_add(1, Ordering::Relaxed);
    }

    fn flush_resources(&mut self) -> usize {
        0
    }
}

/// Frame statistics shared with the main thread.
#[derive(Default)]
pub struct LinkStats {
    pub frames: AtomicUsize,
    pub bytes: AtomicUsize,
    pub stream_data: AtomicUsize,
}

/// Loopback client transport: counts frames and auto-acks.
pub struct DemoTransport {
    pub stats: Arc<LinkStats>,
    ack_window: usize,
    sent_since_ack: usize,
    recv: VecDeque<ClientMessage>,
}

impl DemoTransport {
    pub fn new() -> (Self, Arc<LinkStats>) {
        let stats = Arc::new(LinkStats::default());
        (
            Self {
                stats: stats.clone(),
                ack_window: 40,
                sent_since_ack: 0,
                recv: VecDeque::new(),
            },
            stats,
        )
    }
}

impl ClientTransport for DemoTransport {
    fn try_send(&mut self, frame: &WireFrame) -> SendOutcome {
        self.stats.frames.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes
            .fetch_add(frame.body.len() + core_wire::DataHeader::SIZE, Ordering::Relaxed);
        if frame.msg_type == core_wire::msg::mt::DISPLAY_STREAM_DATA {
            self.stats.stream_data.fetch_add(1, Ordering::Relaxed);
        }
        self.sent_since_ack += 1;
        if self.sent_since_ack >= self.ack_window {
            self.sent_since_ack = 0;
            self.recv.push_back(ClientMessage::Ack);
        }
        SendOutcome::Sent
    }

    fn poll_recv(&mut self) -> Option<ClientMessage> {
        self.recv.pop_front()
    }

    fn writable(&self) -> bool {
        true
    }

    fn low_latency(&self) -> bool {
        true
    }
}
