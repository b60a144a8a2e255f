//! Shared fixtures: an in-memory transport that records frames, a scripted
//! adapter device, and command builders.

#![allow(dead_code)]

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
use core_region::{Point, Rect};
use core_wire::ClientMessage;

/// Everything a test transport observed, shareable with the test body.
#[derive(Default)]
pub struct TransportLog {
    pub frames: Mutex<Vec<WireFrame>>,
}

impl TransportLog {
    pub fn types(&self) -> Vec<u16> {
        self.frames.lock().iter().map(|f| f.msg_type).collect()
    }

    pub fn count_of(&self, msg_type: u16) -> usize {
        self.frames
            .lock()
            .iter()
            .filter(|f| f.msg_type == msg_type)
            .count()
    }

    pub fn position_of(&self, msg_type: u16) -> Option<usize> {
        self.frames.lock().iter().position(|f| f.msg_type == msg_type)
    }
}

/// Non-blocking loopback transport: records every frame and auto-acks one
/// window's worth of messages, like a healthy client.
pub struct LoopTransport {
    pub log: Arc<TransportLog>,
    recv: VecDeque<ClientMessage>,
    low_latency: bool,
    ack_window: usize,
    sent_since_ack: usize,
    pub measured: Option<u64>,
}

impl LoopTransport {
    pub fn new(low_latency: bool) -> (Self, Arc<TransportLog>) {
        let log = Arc::new(TransportLog::default());
        let ack_window = if low_latency { 40 } else { 20 };
        (
            Self {
                log: log.clone(),
                recv: VecDeque::new(),
                low_latency,
                ack_window,
                sent_since_ack: 0,
                measured: None,
            },
            log,
        )
    }

    pub fn push_message(&mut self, msg: ClientMessage) {
        self.recv.push_back(msg);
    }
}

impl ClientTransport for LoopTransport {
    fn try_send(&mut self, frame: &WireFrame) -> SendOutcome {
        self.log.frames.lock().push(frame.clone());
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

    fn measured_bitrate(&self) -> Option<u64> {
        self.measured
    }

    fn low_latency(&self) -> bool {
        self.low_latency
    }
}

/// Scripted device: tests queue commands, the worker drains them. Released
/// resource tags are observable.
#[derive(Clone, Default)]
pub struct ScriptedDevice {
    pub commands: Arc<Mutex<VecDeque<RingCommand<CommandPayload>>>>,
    pub cursor_commands: Arc<Mutex<VecDeque<RingCommand<CursorPayload>>>>,
    pub released: Arc<Mutex<Vec<ResourceTag>>>,
    pub notifications: Arc<AtomicUsize>,
    pub flushable: Arc<AtomicUsize>,
}

impl ScriptedDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&self, payload: CommandPayload, res_id: u64) {
        self.commands.lock().push_back(RingCommand {
            tag: ResourceTag {
                group_id: 0,
                res_id,
            },
            payload,
        });
    }

    pub fn released_count(&self) -> usize {
        self.released.lock().len()
    }
}

impl AdapterDevice for ScriptedDevice {
    fn pop_command(&mut self) -> Option<RingCommand<CommandPayload>> {
        self.commands.lock().pop_front()
    }

    fn pop_cursor(&mut self) -> Option<RingCommand<CursorPayload>> {
        self.cursor_commands.lock().pop_front()
    }

    fn request_notification(&mut self) -> bool {
        self.notifications.fetch_add(1, Ordering::Relaxed);
        self.commands.lock().is_empty()
    }

    fn release_resource(&mut self, tag: ResourceTag) {
        self.released.lock().push(tag);
    }

    fn flush_resources(&mut self) -> usize {
        let n = self.flushable.load(Ordering::Relaxed);
        self.flushable.store(0, Ordering::Relaxed);
        n
    }
}

pub fn primary_create(width: u32, height: u32) -> CommandPayload {
    CommandPayload::SurfaceCreate(SurfaceCreateInfo {
        surface_id: 0,
        width,
        height,
        stride: width * 4,
        format: PixelFormat::Rgb32,
        data: None,
        data_valid: false,
    })
}

pub fn surface_create(surface_id: u32, width: u32, height: u32) -> CommandPayload {
    CommandPayload::SurfaceCreate(SurfaceCreateInfo {
        surface_id,
        width,
        height,
        stride: width * 4,
        format: PixelFormat::Rgb32,
        data: None,
        data_valid: false,
    })
}

pub fn fill(surface_id: u32, bbox: Rect, color: u32) -> DrawCommand {
    DrawCommand {
        surface_id,
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

/// Opaque put-copy of an owned bitmap; the stream detector's shape.
pub fn copy_bitmap(surface_id: u32, bbox: Rect, image_id: u64, bitmap: Bitmap) -> DrawCommand {
    let src_area = Rect::new(0, 0, bitmap.width as i32, bitmap.height as i32);
    DrawCommand {
        surface_id,
        bbox,
        clip: Clip::None,
        effect: Effect::Opaque,
        op: DrawOp::Copy {
            src: ImageRef::bitmap(image_id, bitmap),
            src_area,
            rop: Ropd::PUT,
            scale_mode: ScaleMode::Nearest,
            mask: None,
        },
        mm_time: 0,
        self_bitmap_area: None,
    }
}

pub fn copy_bits(surface_id: u32, bbox: Rect, src_pos: Point) -> DrawCommand {
    DrawCommand {
        surface_id,
        bbox,
        clip: Clip::None,
        effect: Effect::Opaque,
        op: DrawOp::CopyBits { src_pos },
        mm_time: 0,
        self_bitmap_area: None,
    }
}

/// A bitmap with smoothly varying content: scores high graduality.
pub fn gradual_bitmap(width: u32, height: u32, seed: u32) -> Bitmap {
    let mut px = Vec::with_capacity((width * height) as usize);
    for y in 0..height {
        for x in 0..width {
            let r = (x + seed) & 0xFF;
            let g = (y + seed / 3) & 0xFF;
            let b = (x + y) / 2 & 0xFF;
            px.push(0xFF00_0000 | r << 16 | g << 8 | b);
        }
    }
    Bitmap::from_argb(width, height, px)
}

use std::time::Instant;

use core_cache::PixmapCache;
use core_codec::glz::GlzDictionary;
use core_display::{DisplayWorker, WorkerConfig};

/// A worker wired to a scripted device and a live dispatcher.
pub struct Bench {
    pub worker: DisplayWorker,
    pub device: ScriptedDevice,
    pub dispatcher: core_dispatch::Dispatcher,
    pub completions: crossbeam_channel::Receiver<u64>,
}

pub fn bench() -> Bench {
    bench_with(WorkerConfig::default())
}

pub fn bench_with(config: WorkerConfig) -> Bench {
    let device = ScriptedDevice::new();
    let (dispatcher, port, completions) = core_dispatch::dispatcher::dispatcher(256);
    let pixmap = std::sync::Arc::new(PixmapCache::new(1, 32 << 20));
    let glz = GlzDictionary::new(1, 16 << 20);
    let worker = DisplayWorker::new(Box::new(device.clone()), port, pixmap, glz, config);
    Bench {
        worker,
        device,
        dispatcher,
        completions,
    }
}

impl Bench {
    /// Run ticks until the command ring drains.
    pub fn settle(&mut self) {
        for _ in 0..64 {
            self.worker.tick(Instant::now());
            if self.device.commands.lock().is_empty() {
                break;
            }
        }
        // A couple of extra ticks to flush pipes.
        self.worker.tick(Instant::now());
        self.worker.tick(Instant::now());
    }
}
