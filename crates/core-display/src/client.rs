//! One connected display client: ordered pipe, ack-window flow control,
//! cache views, compression context, stream agents, and lossy-region
//! bookkeeping.
//!
//! The client never blocks the worker: marshalled frames that cannot be
//! written stay parked on the client (holding their pipe item's drawable
//! reference) until the transport reports writable again.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use ahash::{AHashMap, AHashSet};

use core_cache::{ChannelAddOutcome, ChannelCache, PixmapAddOutcome, PixmapCache, SyncVec};
use core_canvas::cmd::{DrawOp, ImageRef, Mask};
use core_canvas::{Bitmap, PixelFormat};
use core_codec::glz::{GlzDictionary, GlzInstanceSink, GlzInstanceTag};
use core_codec::{
    ChooseCtx, ChunkPool, CodecStats, CompressMode, Graduality, ImageMethod, jpeg, lz, quic,
    zlib,
};
use core_dispatch::{ClientTransport, SendOutcome, WireFrame};
use core_region::{Rect, Region};
use core_wire::msg::{BrushWire, DisplayMsg, DrawBase, GlyphWire, MaskWire, StrokeSegWire, mt};
use core_wire::types::{
    ClipWire, ImageData, ImageDescriptor, ImageFlags, ImageWire, ImageWireKind,
    WireWaitForChannels,
};

use crate::core::DisplayCore;
use crate::drawable::{DrawableKey, StreamKey};
use crate::pipe::{PipeItem, QueuedItem};
use crate::render;
use crate::stream::StreamAgent;

/// Ack window sizes by link latency class.
pub const ACK_WINDOW_LOW_LATENCY: u32 = 40;
pub const ACK_WINDOW_HIGH_LATENCY: u32 = 20;

/// Display channel type on the wire (wait-for-channels entries).
pub const CHANNEL_TYPE_DISPLAY: u8 = 2;

/// Caches shared across the channels of one end-user.
pub struct CacheSet {
    pub pixmap: Arc<PixmapCache>,
    pub glz: Arc<GlzDictionary>,
}

pub struct DisplayClient {
    pub id: u32,
    transport: Box<dyn ClientTransport>,
    pub alive: bool,

    pipe: VecDeque<QueuedItem>,
    next_item_id: u64,
    /// Serial of the last message marshalled (legacy header serial).
    pub serial: u64,
    /// Messages sent since the last ack.
    outstanding: u32,
    pub ack_window: u32,

    pub caches: CacheSet,
    pub known_generation: u64,
    pending_pixmaps_sync: bool,
    pub palette_cache: ChannelCache,
    glz_sink: GlzInstanceSink,
    next_glz_instance: u64,

    pub pool: ChunkPool,
    pub stats: CodecStats,
    pub compress_mode: CompressMode,
    pub low_bandwidth: bool,

    /// Per-surface area known lossy on this client.
    lossy: AHashMap<u32, Region>,
    known_surfaces: AHashSet<u32>,
    pub agents: AHashMap<StreamKey, StreamAgent>,

    /// Frames marshalled but not yet accepted by the transport.
    parked_frames: VecDeque<WireFrame>,
    /// The item whose frames are parked; its references are held until the
    /// transport takes everything.
    held_item: Option<QueuedItem>,
    blocked: bool,
}

impl DisplayClient {
    pub fn new(
        id: u32,
        transport: Box<dyn ClientTransport>,
        caches: CacheSet,
        compress_mode: CompressMode,
        palette_budget: u64,
    ) -> Self {
        let low_bandwidth = !transport.low_latency();
        let ack_window = if transport.low_latency() {
            ACK_WINDOW_LOW_LATENCY
        } else {
            ACK_WINDOW_HIGH_LATENCY
        };
        let glz_sink: GlzInstanceSink = Arc::new(parking_lot::Mutex::new(Vec::new()));
        caches.glz.register_client(id, glz_sink.clone());
        let known_generation = caches.pixmap.generation();
        let mut client = Self {
            id,
            transport,
            alive: true,
            pipe: VecDeque::new(),
            next_item_id: 1,
            serial: 0,
            outstanding: 0,
            ack_window,
            caches,
            known_generation,
            pending_pixmaps_sync: false,
            palette_cache: ChannelCache::new(palette_budget),
            glz_sink,
            next_glz_instance: 1,
            pool: ChunkPool::new(),
            stats: CodecStats::default(),
            compress_mode,
            low_bandwidth,
            lossy: AHashMap::new(),
            known_surfaces: AHashSet::new(),
            agents: AHashMap::new(),
            parked_frames: VecDeque::new(),
            held_item: None,
            blocked: false,
        };
        client.enqueue(PipeItem::SetAck {
            generation: 1,
            window: ack_window,
        });
        client
    }

    pub fn pipe_len(&self) -> usize {
        self.pipe.len()
    }

    pub fn enqueue(&mut self, item: PipeItem) -> u64 {
        let id = self.next_item_id;
        self.next_item_id += 1;
        self.pipe.push_back(QueuedItem { id, item });
        id
    }

    /// Enqueue a drawable reference (caller already decided it belongs in
    /// this pipe). Takes a pool reference and records the back-link.
    fn enqueue_drawable(&mut self, core: &mut DisplayCore, key: DrawableKey) -> u64 {
        core.pool.reference(key);
        let id = self.enqueue(PipeItem::Drawable(key));
        core.pool.get_mut(key).pipe_items.push((self.id, id));
        id
    }

    /// Full insertion protocol: dependency sync, per-client stream frame
    /// admission, lossy resend ordering, then the draw item itself.
    pub fn add_drawable(&mut self, core: &mut DisplayCore, key: DrawableKey, now: Instant) {
        let target = core.pool.get(key).cmd.surface_id;
        self.ensure_surface(core, target, false);
        for dep in core.pool.get(key).deps.clone() {
            self.ensure_surface(core, dep, true);
        }

        if let Some(stream_key) = core.pool.get(key).stream
            && let Some(agent) = self.agents.get_mut(&stream_key)
            && !agent.admit_frame(now)
        {
            // Dropped for this client's fps budget; never reordered.
            return;
        }

        self.resend_lossy_dependencies(core, key);
        self.enqueue_drawable(core, key);
        self.update_lossy_output(core, key);
    }

    /// Insert `key` right after the pipe item of `after` when this pipe
    /// still has it; append otherwise.
    pub fn add_drawable_after(
        &mut self,
        core: &mut DisplayCore,
        key: DrawableKey,
        after: DrawableKey,
    ) {
        let after_id = core
            .pool
            .get(after)
            .pipe_items
            .iter()
            .find(|(cid, _)| *cid == self.id)
            .map(|&(_, id)| id);
        match after_id.and_then(|aid| self.pipe.iter().position(|q| q.id == aid)) {
            Some(pos) => {
                core.pool.reference(key);
                let id = self.next_item_id;
                self.next_item_id += 1;
                self.pipe.insert(pos + 1, QueuedItem {
                    id,
                    item: PipeItem::Drawable(key),
                });
                core.pool.get_mut(key).pipe_items.push((self.id, id));
            }
            None => {
                self.enqueue_drawable(core, key);
            }
        }
    }

    /// Drop a drawable's queued (unsent) item from this pipe, if present.
    pub fn remove_drawable(&mut self, core: &mut DisplayCore, key: DrawableKey) {
        let Some(pos) = core
            .pool
            .get(key)
            .pipe_items
            .iter()
            .position(|(cid, _)| *cid == self.id)
        else {
            return;
        };
        let (_, item_id) = core.pool.get(key).pipe_items[pos];
        if let Some(qpos) = self.pipe.iter().position(|q| q.id == item_id) {
            self.pipe.remove(qpos);
            core.pool.get_mut(key).pipe_items.remove(pos);
            crate::core::release_drawable(core, key);
        }
    }

    /// Surface presence sync. Dependencies additionally push the current
    /// surface image so the client can resolve surface-sourced reads.
    fn ensure_surface(&mut self, core: &mut DisplayCore, surface_id: u32, with_image: bool) {
        if self.known_surfaces.contains(&surface_id) {
            return;
        }
        self.known_surfaces.insert(surface_id);
        let (width, height, format, primary) = {
            let s = core.surfaces.get(surface_id);
            (s.width, s.height, s.format, s.is_primary())
        };
        self.enqueue(PipeItem::SurfaceCreate {
            surface_id,
            width,
            height,
            format: format_byte(format),
            primary,
        });
        if with_image {
            let area = Rect::new(0, 0, width as i32, height as i32);
            let bitmap = render::get_area(core, surface_id, area);
            self.enqueue(PipeItem::Image {
                surface_id,
                area,
                bitmap,
            });
        }
    }

    /// Push the surface's full current image (create + bits when the
    /// client has not seen the surface yet, bits only otherwise).
    pub fn sync_surface_image(&mut self, core: &mut DisplayCore, surface_id: u32) {
        if !self.known_surfaces.contains(&surface_id) {
            self.ensure_surface(core, surface_id, true);
            return;
        }
        let (width, height) = {
            let s = core.surfaces.get(surface_id);
            (s.width, s.height)
        };
        let area = Rect::new(0, 0, width as i32, height as i32);
        let bitmap = render::get_area(core, surface_id, area);
        self.enqueue(PipeItem::Image {
            surface_id,
            area,
            bitmap,
        });
    }

    /// Link bitrate estimate from the transport, for stream rate clamping.
    pub fn measured_bitrate(&self) -> Option<u64> {
        self.transport.measured_bitrate()
    }

    pub fn forget_surface(&mut self, surface_id: u32) {
        self.known_surfaces.remove(&surface_id);
        self.lossy.remove(&surface_id);
        self.enqueue(PipeItem::SurfaceDestroy(surface_id));
    }

    /// Any lossy area the new drawable depends on is re-sent losslessly
    /// *before* the drawable; queued drawables that also depend on the
    /// resent area are replaced by rendered images of their boxes.
    fn resend_lossy_dependencies(&mut self, core: &mut DisplayCore, key: DrawableKey) {
        for (dep_surface, dep_area) in dependency_areas(core, key) {
            let Some(lossy) = self.lossy.get_mut(&dep_surface) else {
                continue;
            };
            let mut shared = Region::from_rect(dep_area);
            shared.intersect(lossy);
            if shared.is_empty() {
                continue;
            }
            lossy.subtract(&shared);
            let area = shared.bounds();
            let bitmap = render::get_area(core, dep_surface, area);

            // Intervening queued drawables depending on the resent area
            // must not paint stale pixels after the image arrives.
            self.replace_dependents(core, dep_surface, &shared, key);

            self.enqueue(PipeItem::Image {
                surface_id: dep_surface,
                area,
                bitmap,
            });
            tracing::debug!(
                target: "display.lossy",
                client = self.id,
                surface = dep_surface,
                ?area,
                "lossless_resend"
            );
        }
    }

    fn replace_dependents(
        &mut self,
        core: &mut DisplayCore,
        dep_surface: u32,
        resent: &Region,
        incoming: DrawableKey,
    ) {
        let mut replacements: Vec<(usize, u32, Rect)> = Vec::new();
        for (pos, q) in self.pipe.iter().enumerate() {
            let Some(d) = q.drawable() else { continue };
            if d == incoming {
                continue;
            }
            let depends = dependency_areas(core, d)
                .into_iter()
                .any(|(s, a)| s == dep_surface && resent.intersects_rect(a));
            if depends {
                let target = core.pool.get(d).cmd.surface_id;
                replacements.push((pos, target, core.pool.get(d).cmd.bbox));
            }
        }
        for (pos, target, bbox) in replacements {
            let bitmap = render::get_area(core, target, bbox);
            let old = std::mem::replace(
                &mut self.pipe[pos].item,
                PipeItem::Image {
                    surface_id: target,
                    area: bbox,
                    bitmap,
                },
            );
            if let PipeItem::Drawable(d) = old {
                let id = self.pipe[pos].id;
                core.pool
                    .get_mut(d)
                    .pipe_items
                    .retain(|&mut (cid, iid)| !(cid == self.id && iid == id));
                crate::core::release_drawable(core, d);
            }
        }
    }

    /// Predict whether this drawable's imagery will leave lossy, and keep
    /// the per-surface lossy region in sync. The same predicate feeds the
    /// chooser at marshal time, so prediction and reality agree.
    fn update_lossy_output(&mut self, core: &mut DisplayCore, key: DrawableKey) {
        let target = core.pool.get(key).cmd.surface_id;
        let bbox = core.pool.get(key).cmd.bbox;
        let lossy_out = self.would_send_lossy(core, key);
        let entry = self.lossy.entry(target).or_default();
        if lossy_out {
            entry.add(bbox);
        } else {
            entry.subtract_rect(bbox);
        }
    }

    fn would_send_lossy(&self, core: &DisplayCore, key: DrawableKey) -> bool {
        if core.pool.get(key).stream.is_some() {
            return true; // mjpeg frames are lossy by construction
        }
        let d = core.pool.get(key);
        if !self.low_bandwidth || d.cmd.rop().combines_dest() || !d.gradual {
            return false;
        }
        primary_image(&d.cmd.op).is_some_and(|img| img.as_bitmap().is_some())
    }

    /// The lossy permission handed to the chooser for this drawable:
    /// never under a destination-combining ROP.
    fn lossy_allowed(&self, core: &DisplayCore, key: DrawableKey) -> bool {
        !core.pool.get(key).cmd.rop().combines_dest()
    }

    pub fn push_verb(&mut self, verb: u16) {
        self.enqueue(PipeItem::Verb(verb));
    }

    // ---------------------------------------------------------------
    // Sending
    // ---------------------------------------------------------------

    /// Drain the pipe into the transport while the ack window allows.
    pub fn push(&mut self, core: &mut DisplayCore) {
        if !self.alive {
            return;
        }
        if self.blocked {
            if !self.transport.writable() {
                return;
            }
            self.blocked = false;
        }
        // Finish a partially-sent item first.
        while let Some(frame) = self.parked_frames.front() {
            match self.transport.try_send(frame) {
                SendOutcome::Sent => {
                    self.parked_frames.pop_front();
                }
                SendOutcome::WouldBlock => {
                    self.blocked = true;
                    return;
                }
                SendOutcome::Closed => {
                    self.alive = false;
                    return;
                }
            }
        }
        if let Some(held) = self.held_item.take() {
            self.release_item(core, held);
        }

        while self.alive && !self.blocked && self.outstanding < self.ack_window {
            let Some(q) = self.pipe.pop_front() else { break };
            let frames = self.marshal_item(core, &q.item);
            for frame in frames {
                if self.blocked {
                    self.parked_frames.push_back(frame);
                    continue;
                }
                match self.transport.try_send(&frame) {
                    SendOutcome::Sent => {}
                    SendOutcome::WouldBlock => {
                        self.blocked = true;
                        self.parked_frames.push_back(frame);
                    }
                    SendOutcome::Closed => {
                        self.alive = false;
                        self.release_item(core, q);
                        return;
                    }
                }
            }
            if self.parked_frames.is_empty() {
                self.release_item(core, q);
            } else {
                // Hold the item until its frames fully leave.
                self.held_item = Some(q);
                return;
            }
        }
    }

    /// Drop an item's references after its frames are out (or on
    /// teardown).
    fn release_item(&mut self, core: &mut DisplayCore, q: QueuedItem) {
        if let PipeItem::Drawable(key) = q.item {
            core.pool
                .get_mut(key)
                .pipe_items
                .retain(|&mut (cid, iid)| !(cid == self.id && iid == q.id));
            crate::core::release_drawable(core, key);
        }
    }

    /// Read and apply everything the client sent us.
    pub fn read(&mut self) {
        use core_wire::ClientMessage;
        while let Some(msg) = self.transport.poll_recv() {
            match msg {
                ClientMessage::Ack => {
                    self.outstanding = self.outstanding.saturating_sub(self.ack_window);
                }
                ClientMessage::AckSync { .. } => {
                    self.outstanding = 0;
                }
                ClientMessage::Disconnecting => {
                    self.alive = false;
                }
                ClientMessage::DisplayInit { .. } => {
                    // Cache identity declared: start this channel from a
                    // clean shared-cache generation.
                    self.enqueue(PipeItem::PixmapReset);
                }
                ClientMessage::MigrateFlushMark | ClientMessage::MigrateData { .. } => {
                    // Handled by the worker's migration path.
                }
            }
        }
    }

    /// Collect GLZ instances freed by dictionary eviction (possibly from
    /// another channel's encoder) and forget them.
    pub fn collect_glz_frees(&mut self) -> usize {
        let freed: Vec<u64> = std::mem::take(&mut *self.glz_sink.lock());
        freed.len()
    }

    /// Tear down: release every queued reference.
    pub fn shutdown(&mut self, core: &mut DisplayCore) {
        if let Some(held) = self.held_item.take() {
            self.release_item(core, held);
        }
        while let Some(q) = self.pipe.pop_front() {
            self.release_item(core, q);
        }
        self.caches.glz.unregister_client(self.id);
        self.pool.drain();
        self.alive = false;
    }

    // ---------------------------------------------------------------
    // Marshalling
    // ---------------------------------------------------------------

    fn next_frame(&mut self, msg_type: u16, body: Vec<u8>) -> WireFrame {
        self.serial += 1;
        self.outstanding += 1;
        let mut frame = WireFrame::new(msg_type, body);
        frame.serial = self.serial;
        frame
    }

    fn marshal_item(&mut self, core: &mut DisplayCore, item: &PipeItem) -> Vec<WireFrame> {
        match item {
            PipeItem::Drawable(key) => self.marshal_drawable(core, *key),
            PipeItem::Image {
                surface_id,
                area,
                bitmap,
            }
            | PipeItem::Upgrade {
                surface_id,
                area,
                bitmap,
            } => {
                let msg = self.lossless_image_msg(*surface_id, *area, bitmap);
                let body = msg.marshal();
                vec![self.next_frame(msg.msg_type(), body)]
            }
            PipeItem::InvalPixmap(id) => {
                let msg = DisplayMsg::InvalOne { id: *id };
                vec![self.next_frame(msg.msg_type(), msg.marshal())]
            }
            PipeItem::InvalPalette(id) => {
                let msg = DisplayMsg::InvalPalette { id: *id };
                vec![self.next_frame(msg.msg_type(), msg.marshal())]
            }
            PipeItem::StreamCreate(stream_key) => {
                let Some(stream) = core.streams.get(*stream_key) else {
                    return Vec::new();
                };
                let clip = self
                    .agents
                    .get(stream_key)
                    .map(|a| region_to_clip(&a.vis_region))
                    .unwrap_or(ClipWire::None);
                let msg = DisplayMsg::StreamCreate {
                    id: stream.wire_id,
                    flags: u8::from(stream.top_down),
                    codec: 1, // mjpeg
                    dest: stream.dest,
                    src_width: stream.width,
                    src_height: stream.height,
                    clip,
                };
                vec![self.next_frame(msg.msg_type(), msg.marshal())]
            }
            PipeItem::StreamClip(stream_key) => {
                let Some(stream) = core.streams.get(*stream_key) else {
                    return Vec::new();
                };
                let wire_id = stream.wire_id;
                let Some(agent) = self.agents.get_mut(stream_key) else {
                    return Vec::new();
                };
                agent.clip_sent = agent.vis_region.clone();
                let msg = DisplayMsg::StreamClip {
                    id: wire_id,
                    clip: region_to_clip(&agent.clip_sent),
                };
                vec![self.next_frame(msg.msg_type(), msg.marshal())]
            }
            PipeItem::StreamDestroy { wire_id } => {
                let msg = DisplayMsg::StreamDestroy { id: *wire_id };
                vec![self.next_frame(msg.msg_type(), msg.marshal())]
            }
            PipeItem::Verb(msg_type) => vec![self.next_frame(*msg_type, Vec::new())],
            PipeItem::Migrate => {
                let msg = DisplayMsg::Migrate { flags: 0 };
                vec![self.next_frame(msg.msg_type(), msg.marshal())]
            }
            PipeItem::MigrateData(blob) => {
                let msg = DisplayMsg::MigrateData { data: blob.clone() };
                vec![self.next_frame(msg.msg_type(), msg.marshal())]
            }
            PipeItem::PixmapSync => {
                // Wait for the resetting channel, then drop everything.
                let (generation, initiator) = self.caches.pixmap.sync_info();
                let mut wait = WireWaitForChannels::default();
                if let Some((channel, serial)) = initiator
                    && channel != self.id
                {
                    wait.wait_list.push((CHANNEL_TYPE_DISPLAY, channel as u8, serial));
                }
                self.known_generation = generation;
                self.pending_pixmaps_sync = false;
                let msg = DisplayMsg::InvalAllPixmaps { wait };
                vec![self.next_frame(msg.msg_type(), msg.marshal())]
            }
            PipeItem::PixmapReset => {
                let (generation, wait) = self.caches.pixmap.reset(self.id, self.serial + 1);
                self.known_generation = generation;
                let mut wire_wait = WireWaitForChannels::default();
                for w in wait.wait_list {
                    wire_wait
                        .wait_list
                        .push((CHANNEL_TYPE_DISPLAY, w.channel_id as u8, w.message_serial));
                }
                let msg = DisplayMsg::InvalAllPixmaps { wait: wire_wait };
                vec![self.next_frame(msg.msg_type(), msg.marshal())]
            }
            PipeItem::WaitForChannels(wait) => {
                let msg = DisplayMsg::WaitForChannels(wait.clone());
                vec![self.next_frame(msg.msg_type(), msg.marshal())]
            }
            PipeItem::SurfaceCreate {
                surface_id,
                width,
                height,
                format,
                primary,
            } => {
                let msg = DisplayMsg::SurfaceCreate {
                    surface_id: *surface_id,
                    width: *width,
                    height: *height,
                    format: *format,
                    primary: *primary,
                };
                vec![self.next_frame(msg.msg_type(), msg.marshal())]
            }
            PipeItem::SurfaceDestroy(surface_id) => {
                let msg = DisplayMsg::SurfaceDestroy {
                    surface_id: *surface_id,
                };
                vec![self.next_frame(msg.msg_type(), msg.marshal())]
            }
            PipeItem::SetAck { generation, window } => {
                let msg = DisplayMsg::SetAck {
                    generation: *generation,
                    window: *window,
                };
                vec![self.next_frame(msg.msg_type(), msg.marshal())]
            }
        }
    }

    fn lossless_image_msg(&mut self, surface_id: u32, area: Rect, bitmap: &Bitmap) -> DisplayMsg {
        // Read-back images always travel lossless; compression still
        // applies, just never JPEG.
        let (image, _pre) = self.encode_image(bitmap, 0, false, false);
        if let Some(region) = self.lossy.get_mut(&surface_id) {
            region.subtract_rect(area);
        }
        DisplayMsg::DrawCopy {
            base: DrawBase {
                surface_id,
                bbox: area,
                clip: ClipWire::None,
            },
            image,
            src_area: Rect::new(0, 0, area.width(), area.height()),
            rop: core_canvas::cmd::Ropd::PUT.bits(),
            mask: None,
        }
    }

    fn marshal_drawable(&mut self, core: &mut DisplayCore, key: DrawableKey) -> Vec<WireFrame> {
        if !core.pool.contains(key) {
            return Vec::new();
        }
        // Stream frames go out as stream data, not draw messages.
        if let Some(stream_key) = core.pool.get(key).stream
            && self.agents.contains_key(&stream_key)
            && core.streams.contains_key(stream_key)
        {
            return self.marshal_stream_frame(core, key, stream_key);
        }
        let cmd = core.pool.get(key).cmd.clone();
        let lossy_ok = self.lossy_allowed(core, key) && self.would_send_lossy(core, key);
        let base = DrawBase {
            surface_id: cmd.surface_id,
            bbox: cmd.bbox,
            clip: clip_to_wire(&cmd.clip),
        };
        let mut pre: Vec<WireFrame> = Vec::new();
        let msg = match &cmd.op {
            DrawOp::Fill { brush, rop, mask } => DisplayMsg::DrawFill {
                base,
                brush: self.brush_to_wire(brush, &mut pre),
                rop: rop.bits(),
                mask: self.mask_to_wire(mask, &mut pre),
            },
            DrawOp::Opaque {
                src,
                src_area,
                brush,
                rop,
                mask,
                ..
            } => {
                let image = self.image_ref_to_wire(src, lossy_ok, &mut pre);
                DisplayMsg::DrawOpaque {
                    base,
                    image,
                    src_area: *src_area,
                    brush: self.brush_to_wire(brush, &mut pre),
                    rop: rop.bits(),
                    mask: self.mask_to_wire(mask, &mut pre),
                }
            }
            DrawOp::Copy {
                src,
                src_area,
                rop,
                mask,
                ..
            } => DisplayMsg::DrawCopy {
                base,
                image: self.image_ref_to_wire(src, lossy_ok, &mut pre),
                src_area: *src_area,
                rop: rop.bits(),
                mask: self.mask_to_wire(mask, &mut pre),
            },
            DrawOp::Blend {
                src,
                src_area,
                rop,
                mask,
            } => DisplayMsg::DrawBlend {
                base,
                image: self.image_ref_to_wire(src, false, &mut pre),
                src_area: *src_area,
                rop: rop.bits(),
                mask: self.mask_to_wire(mask, &mut pre),
            },
            DrawOp::Transparent {
                src,
                src_area,
                transparent_color,
            } => DisplayMsg::DrawTransparent {
                base,
                image: self.image_ref_to_wire(src, false, &mut pre),
                src_area: *src_area,
                transparent_color: *transparent_color,
            },
            DrawOp::AlphaBlend {
                src,
                src_area,
                alpha,
            } => DisplayMsg::DrawAlphaBlend {
                base,
                image: self.image_ref_to_wire(src, false, &mut pre),
                src_area: *src_area,
                alpha: *alpha,
            },
            DrawOp::CopyBits { src_pos } => DisplayMsg::CopyBits {
                base,
                src_pos: *src_pos,
            },
            DrawOp::Blackness { mask } => DisplayMsg::DrawBlackness {
                base,
                mask: self.mask_to_wire(mask, &mut pre),
            },
            DrawOp::Whiteness { mask } => DisplayMsg::DrawWhiteness {
                base,
                mask: self.mask_to_wire(mask, &mut pre),
            },
            DrawOp::Invers { mask } => DisplayMsg::DrawInvers {
                base,
                mask: self.mask_to_wire(mask, &mut pre),
            },
            DrawOp::Rop3 {
                src,
                src_area,
                brush,
                rop3,
                mask,
            } => DisplayMsg::DrawRop3 {
                base,
                image: self.image_ref_to_wire(src, false, &mut pre),
                src_area: *src_area,
                brush: self.brush_to_wire(brush, &mut pre),
                rop3: *rop3,
                mask: self.mask_to_wire(mask, &mut pre),
            },
            DrawOp::Stroke {
                path,
                brush,
                fore_rop,
            } => DisplayMsg::DrawStroke {
                base,
                segments: path
                    .segments
                    .iter()
                    .map(|s| StrokeSegWire {
                        closed: s.closed,
                        points: s.points.clone(),
                    })
                    .collect(),
                brush: self.brush_to_wire(brush, &mut pre),
                fore_rop: fore_rop.bits(),
            },
            DrawOp::Text {
                glyphs,
                fore,
                back,
                back_area,
            } => DisplayMsg::DrawText {
                base,
                glyphs: glyphs
                    .iter()
                    .map(|g| GlyphWire {
                        render_pos: g.render_pos,
                        width: g.bitmap.width as u16,
                        height: g.bitmap.height as u16,
                        data: lz::bitmap_stream(&g.bitmap),
                    })
                    .collect(),
                fore: self.brush_to_wire(fore, &mut pre),
                back: self.brush_to_wire(back, &mut pre),
                back_area: *back_area,
            },
        };
        let body = msg.marshal();
        let mut frames = pre;
        frames.push(self.next_frame(msg.msg_type(), body));
        frames
    }

    fn marshal_stream_frame(
        &mut self,
        core: &mut DisplayCore,
        key: DrawableKey,
        stream_key: StreamKey,
    ) -> Vec<WireFrame> {
        let DrawOp::Copy { src, .. } = &core.pool.get(key).cmd.op else {
            return Vec::new();
        };
        let Some(bitmap) = src.as_bitmap().cloned() else {
            return Vec::new();
        };
        let mm_time = core.pool.get(key).mm_time();
        let fps = self
            .agents
            .get(&stream_key)
            .map(|a| a.fps)
            .unwrap_or(crate::stream::FPS_MAX);
        let stream = &mut core.streams[stream_key];
        let wire_id = stream.wire_id;
        let started = Instant::now();
        match stream.encoder.encode_frame(&mut self.pool, &bitmap, fps) {
            Ok(data) => {
                let bytes = data.to_vec();
                self.stats.for_method(ImageMethod::Jpeg).record(
                    bitmap.data.len(),
                    bytes.len(),
                    started.elapsed(),
                );
                self.pool.recycle(data);
                let msg = DisplayMsg::StreamData {
                    id: wire_id,
                    mm_time,
                    data: bytes,
                };
                vec![self.next_frame(msg.msg_type(), msg.marshal())]
            }
            Err(err) => {
                // Encoder failure degrades to an ordinary draw message.
                tracing::warn!(target: "display.stream", %err, "stream_encode_failed");
                core.pool.get_mut(key).stream = None;
                self.marshal_drawable(core, key)
            }
        }
    }

    fn brush_to_wire(&mut self, brush: &core_canvas::cmd::Brush, pre: &mut Vec<WireFrame>)
                     -> BrushWire {
        match brush {
            core_canvas::cmd::Brush::None => BrushWire::None,
            core_canvas::cmd::Brush::Solid(c) => BrushWire::Solid(*c),
            core_canvas::cmd::Brush::Pattern { image, pos } => BrushWire::Pattern {
                image: self.image_ref_to_wire(image, false, pre),
                pos: *pos,
            },
        }
    }

    fn mask_to_wire(&mut self, mask: &Option<Mask>, pre: &mut Vec<WireFrame>) -> Option<MaskWire> {
        mask.as_ref().map(|m| MaskWire {
            invers: m.invers,
            pos: m.pos,
            image: self.image_ref_to_wire(&m.image, false, pre),
        })
    }

    /// Turn an image reference into its wire form: surface reference,
    /// cache hit, or a freshly compressed payload (optionally entering the
    /// shared pixmap cache). Cache bookkeeping may prepend invalidation
    /// and wait frames to `pre`.
    fn image_ref_to_wire(&mut self, img: &ImageRef, lossy_ok: bool, pre: &mut Vec<WireFrame>)
                         -> ImageWire {
        if let Some(surface_id) = img.surface_id() {
            return ImageWire {
                descriptor: ImageDescriptor {
                    id: img.id,
                    kind: ImageWireKind::Surface,
                    flags: ImageFlags::empty(),
                    width: 0,
                    height: 0,
                },
                data: ImageData::Surface { surface_id },
            };
        }
        let bitmap = img.as_bitmap().expect("bitmap or surface").clone();

        // Pixmap cache short path.
        let next_serial = self.serial + 1;
        if img.id != 0
            && let Some(entry_lossy) = self.caches.pixmap.hit(img.id, self.id, next_serial)
        {
            if !entry_lossy || lossy_ok {
                return ImageWire {
                    descriptor: ImageDescriptor {
                        id: img.id,
                        kind: ImageWireKind::FromCache,
                        flags: ImageFlags::empty(),
                        width: bitmap.width,
                        height: bitmap.height,
                    },
                    data: ImageData::None,
                };
            }
            // Cached lossy but exactness required: replace the entry.
            let (image, lossy_sent) = self.encode_image(&bitmap, img.id, false, true);
            if !lossy_sent {
                self.caches.pixmap.set_lossy(img.id, false);
            }
            return image;
        }

        let cache_me = img.cache_me && img.id != 0;
        if cache_me {
            let size = bitmap.data.len().max(1) as u64;
            let lossy_add = lossy_ok && self.would_pick_lossy(&bitmap);
            match self.caches.pixmap.add(
                img.id,
                size,
                lossy_add,
                self.id,
                next_serial,
                self.known_generation,
            ) {
                PixmapAddOutcome::Added { evicted } => {
                    self.emit_evictions(evicted, pre);
                    let (mut image, _) = self.encode_image(&bitmap, img.id, lossy_ok, false);
                    image.descriptor.flags |= ImageFlags::CACHE_ME;
                    return image;
                }
                PixmapAddOutcome::GenerationMismatch => {
                    if !self.pending_pixmaps_sync {
                        self.pending_pixmaps_sync = true;
                        self.enqueue(PipeItem::PixmapSync);
                    }
                }
                PixmapAddOutcome::Denied { evicted } => {
                    self.emit_evictions(evicted, pre);
                }
            }
        }
        let (image, _) = self.encode_image(&bitmap, img.id, lossy_ok, false);
        image
    }

    /// The free-list contract: an eviction caused by this message emits a
    /// wait naming every other channel that referenced the entry, then the
    /// invalidation, both ahead of the draw message itself.
    fn emit_evictions(&mut self, evicted: Vec<core_cache::EvictedPixmap>, pre: &mut Vec<WireFrame>) {
        for ev in evicted {
            let wait = wait_from_sync(&ev.sync, self.id);
            if !wait.wait_list.is_empty() {
                let msg = DisplayMsg::WaitForChannels(wait);
                let frame = self.next_frame(msg.msg_type(), msg.marshal());
                pre.push(frame);
            }
            let msg = DisplayMsg::InvalOne { id: ev.id };
            let frame = self.next_frame(msg.msg_type(), msg.marshal());
            pre.push(frame);
        }
    }

    fn would_pick_lossy(&self, bitmap: &Bitmap) -> bool {
        self.low_bandwidth
            && !bitmap.format.is_palette()
            && core_codec::graduality(bitmap) == Graduality::High
    }

    /// Run the chooser and the selected encoder; fall back to a raw
    /// bitmap when compression fails or loses. Returns the wire image and
    /// whether the payload is lossy.
    fn encode_image(&mut self, bitmap: &Bitmap, id: u64, lossy_ok: bool, replace: bool)
                    -> (ImageWire, bool) {
        let started = Instant::now();
        let grad = core_codec::graduality(bitmap);
        let glz_fits = self.caches.glz.fits(bitmap.data.len());
        let ctx = ChooseCtx {
            mode: self.compress_mode,
            lossy_allowed: lossy_ok,
            low_bandwidth: self.low_bandwidth,
            glz_fits,
            graduality: grad,
        };
        let method = core_codec::choose(bitmap, &ctx);
        let orig_len = bitmap.data.len();
        let raw_len = (bitmap.format.min_stride(bitmap.width) * bitmap.height) as usize;

        let mut flags = ImageFlags::empty();
        if replace {
            flags |= ImageFlags::CACHE_REPLACE_ME;
        }
        let descriptor = |kind: ImageWireKind, flags: ImageFlags| ImageDescriptor {
            id,
            kind,
            flags,
            width: bitmap.width,
            height: bitmap.height,
        };

        let encoded: Option<(ImageWireKind, ImageData, bool)> = match method {
            ImageMethod::Raw => None,
            ImageMethod::Quic => {
                let data = quic::quic_encode(&mut self.pool, bitmap);
                let out = if data.len() < raw_len {
                    let bytes = data.to_vec();
                    Some((
                        ImageWireKind::Quic,
                        ImageData::Compressed { data: bytes },
                        false,
                    ))
                } else {
                    None
                };
                self.stats
                    .for_method(method)
                    .record(orig_len, data.len(), started.elapsed());
                self.pool.recycle(data);
                out
            }
            ImageMethod::LzRgb => {
                let data = lz::lz_encode_bitmap(&mut self.pool, bitmap);
                let out = if data.len() < raw_len {
                    Some((
                        ImageWireKind::LzRgb,
                        ImageData::Compressed { data: data.to_vec() },
                        false,
                    ))
                } else {
                    None
                };
                self.stats
                    .for_method(method)
                    .record(orig_len, data.len(), started.elapsed());
                self.pool.recycle(data);
                out
            }
            ImageMethod::LzPalette => {
                let data = lz::lz_encode_bitmap(&mut self.pool, bitmap);
                let (palette_id, palette) = match &bitmap.palette {
                    Some(p) if self.palette_cache.find(p.id) => (p.id, None),
                    Some(p) => {
                        // Inline the palette and remember the client holds
                        // it now.
                        match self.palette_cache.add(p.id, 1) {
                            ChannelAddOutcome::Added { evicted } => {
                                for old in evicted {
                                    self.enqueue(PipeItem::InvalPalette(old));
                                }
                            }
                            ChannelAddOutcome::Denied => {}
                        }
                        (p.id, Some(p.entries.clone()))
                    }
                    None => (0, None),
                };
                let out = Some((
                    ImageWireKind::LzPalette,
                    ImageData::LzPalette {
                        palette_id,
                        palette,
                        data: data.to_vec(),
                    },
                    false,
                ));
                self.stats
                    .for_method(method)
                    .record(orig_len, data.len(), started.elapsed());
                self.pool.recycle(data);
                out
            }
            ImageMethod::Glz => {
                let tag = GlzInstanceTag {
                    client_id: self.id,
                    instance: self.next_glz_instance,
                };
                self.next_glz_instance += 1;
                let input = lz::bitmap_stream(bitmap);
                let out = self.caches.glz.encode(tag, &input, &mut self.pool);
                let glz_len = out.data.len();
                let result = if zlib::should_zlib_wrap(self.low_bandwidth, glz_len) {
                    match zlib::zlib_wrap(&mut self.pool, &out.data) {
                        Ok(wrapped) => {
                            let bytes = wrapped.to_vec();
                            self.stats
                                .zlib_glz
                                .record(orig_len, bytes.len(), started.elapsed());
                            self.pool.recycle(wrapped);
                            Some((
                                ImageWireKind::ZlibGlzRgb,
                                ImageData::Compressed { data: bytes },
                                false,
                            ))
                        }
                        Err(_) => Some((
                            ImageWireKind::GlzRgb,
                            ImageData::Compressed { data: out.data.to_vec() },
                            false,
                        )),
                    }
                } else if glz_len < raw_len {
                    self.stats
                        .for_method(method)
                        .record(orig_len, glz_len, started.elapsed());
                    Some((
                        ImageWireKind::GlzRgb,
                        ImageData::Compressed { data: out.data.to_vec() },
                        false,
                    ))
                } else {
                    None
                };
                self.pool.recycle(out.data);
                result
            }
            ImageMethod::Jpeg => match jpeg::jpeg_encode(&mut self.pool, bitmap, 85) {
                Ok(data) => {
                    let bytes = data.to_vec();
                    self.stats
                        .for_method(method)
                        .record(orig_len, bytes.len(), started.elapsed());
                    self.pool.recycle(data);
                    Some((ImageWireKind::Jpeg, ImageData::Compressed { data: bytes }, true))
                }
                Err(_) => None,
            },
            ImageMethod::JpegAlpha => match jpeg::jpeg_alpha_encode(&mut self.pool, bitmap, 85) {
                Ok(out) => {
                    let bytes = out.data.to_vec();
                    self.stats
                        .for_method(method)
                        .record(orig_len, bytes.len(), started.elapsed());
                    self.pool.recycle(out.data);
                    Some((
                        ImageWireKind::JpegAlpha,
                        ImageData::JpegAlpha {
                            jpeg_size: out.jpeg_size as u32,
                            data: bytes,
                        },
                        true,
                    ))
                }
                Err(_) => None,
            },
        };

        match encoded {
            Some((kind, data, lossy)) => (
                ImageWire {
                    descriptor: descriptor(kind, flags),
                    data,
                },
                lossy,
            ),
            None => {
                // Raw fallback: compression lost or failed.
                self.stats
                    .for_method(ImageMethod::Raw)
                    .record(orig_len, raw_len, started.elapsed());
                (
                    ImageWire {
                        descriptor: descriptor(ImageWireKind::Bitmap, flags),
                        data: ImageData::Bitmap {
                            format: format_byte(bitmap.format),
                            stride: bitmap.stride,
                            top_down: bitmap.top_down,
                            palette: bitmap.palette.as_ref().map(|p| p.entries.clone()),
                            data: lz::bitmap_stream(bitmap),
                        },
                    },
                    false,
                )
            }
        }
    }
}

/// Areas of other surfaces (or the destination itself) this drawable
/// reads: surface-sourced images, surface-sourced masks, self-reads, and
/// destination-combining ROPs.
pub fn dependency_areas(core: &DisplayCore, key: DrawableKey) -> Vec<(u32, Rect)> {
    let d = core.pool.get(key);
    let mut out = Vec::new();
    let mut push_img = |img: &ImageRef, area: Rect| {
        if let Some(surface) = img.surface_id() {
            out.push((surface, area));
        }
    };
    match &d.cmd.op {
        DrawOp::Opaque { src, src_area, .. }
        | DrawOp::Copy { src, src_area, .. }
        | DrawOp::Blend { src, src_area, .. }
        | DrawOp::Transparent { src, src_area, .. }
        | DrawOp::AlphaBlend { src, src_area, .. }
        | DrawOp::Rop3 { src, src_area, .. } => push_img(src, *src_area),
        _ => {}
    }
    if let Some(mask) = mask_of(&d.cmd.op) {
        let area = Rect::from_size(
            mask.pos.x,
            mask.pos.y,
            d.cmd.bbox.width(),
            d.cmd.bbox.height(),
        );
        push_img(&mask.image, area);
    }
    if let Some(area) = d.cmd.self_bitmap_area {
        out.push((d.cmd.surface_id, area));
    }
    if d.cmd.rop().combines_dest() {
        out.push((d.cmd.surface_id, d.cmd.bbox));
    }
    out
}

fn mask_of(op: &DrawOp) -> Option<&Mask> {
    match op {
        DrawOp::Fill { mask, .. }
        | DrawOp::Opaque { mask, .. }
        | DrawOp::Copy { mask, .. }
        | DrawOp::Blend { mask, .. }
        | DrawOp::Blackness { mask }
        | DrawOp::Whiteness { mask }
        | DrawOp::Invers { mask }
        | DrawOp::Rop3 { mask, .. } => mask.as_ref(),
        _ => None,
    }
}

fn primary_image(op: &DrawOp) -> Option<&ImageRef> {
    match op {
        DrawOp::Opaque { src, .. }
        | DrawOp::Copy { src, .. }
        | DrawOp::Blend { src, .. }
        | DrawOp::Transparent { src, .. }
        | DrawOp::AlphaBlend { src, .. }
        | DrawOp::Rop3 { src, .. } => Some(src),
        _ => None,
    }
}

pub fn clip_to_wire(clip: &core_canvas::cmd::Clip) -> ClipWire {
    match clip {
        core_canvas::cmd::Clip::None => ClipWire::None,
        core_canvas::cmd::Clip::Rects(rects) => ClipWire::Rects(rects.clone()),
    }
}

pub fn region_to_clip(region: &Region) -> ClipWire {
    ClipWire::Rects(region.rects().to_vec())
}

fn wait_from_sync(sync: &SyncVec, own_id: u32) -> WireWaitForChannels {
    let mut wait = WireWaitForChannels::default();
    for (channel, &serial) in sync.iter().enumerate() {
        if serial != 0 && channel as u32 != own_id {
            wait.wait_list
                .push((CHANNEL_TYPE_DISPLAY, channel as u8, serial));
        }
    }
    wait
}

fn format_byte(format: PixelFormat) -> u8 {
    match format {
        PixelFormat::A1 => 1,
        PixelFormat::A8 => 8,
        PixelFormat::Pal8 => 16,
        PixelFormat::Rgb16 => 32,
        PixelFormat::Rgb24 => 64,
        PixelFormat::Rgb32 => 96,
        PixelFormat::Argb32 => 128,
    }
}

/// Verb message types broadcast with no payload.
pub mod verbs {
    use super::mt;
    pub const MARK: u16 = mt::DISPLAY_MARK;
    pub const RESET: u16 = mt::DISPLAY_RESET;
    pub const INVAL_ALL_PALETTES: u16 = mt::DISPLAY_INVAL_ALL_PALETTES;
    pub const STREAM_DESTROY_ALL: u16 = mt::DISPLAY_STREAM_DESTROY_ALL;
}
