//! The display worker: one long-lived loop per graphics adapter.
//!
//! Multiplexes the adapter command rings, the dispatcher control channel,
//! and every client's transport. Client I/O never blocks the loop; ring
//! underflow back-pressures with timed retries before parking on the
//! dispatcher channel.

use std::sync::Arc;
use std::time::{Duration, Instant};

use core_cache::PixmapCache;
use core_canvas::cmd::{DrawCommand, DrawOp};
use core_codec::glz::GlzDictionary;
use core_codec::{CompressMode, Graduality};
use core_dispatch::device::{AdapterDevice, CommandPayload, RingCommand, SurfaceCreateInfo};
use core_dispatch::dispatcher::{
    Envelope, PendingBits, StreamVideoMode, WorkerMessage, WorkerPort,
};
use core_dispatch::{ClientTransport, ResourceTag};
use core_region::Region;
use core_wire::{DisplayMigrateData, GlzDictRestore};

use crate::client::{CacheSet, DisplayClient, verbs};
use crate::core::DisplayCore;
use crate::cursor::CursorChannel;
use crate::drawable::{Drawable, DrawableKey};
use crate::pipe::PipeItem;
use crate::render;
use crate::stream::{self, StreamEvent};
use crate::tree::{self, AddOutcome, TreeKind};

/// Per-client pipe bound during command processing.
pub const MAX_PIPE_SIZE: usize = 50;
/// Wall-time slice of one `process_commands` call.
pub const PROCESS_SLICE: Duration = Duration::from_millis(10);
/// Ring underflow: retries at 10 ms before asking for a notification.
pub const RING_POLL_RETRIES: u32 = 200;
pub const RING_POLL_INTERVAL: Duration = Duration::from_millis(10);
/// OOM tree eviction batch.
pub const OOM_EVICT_BATCH: usize = 64;
/// flush-resources calls per OOM event.
pub const OOM_FLUSH_LIMIT: u32 = 2;
/// Client-migration completion deadline.
pub const MIG_TIMEOUT: Duration = Duration::from_secs(10);
/// Graceful-shutdown flush budget before a client is dropped hard.
pub const DETACH_TIMEOUT: Duration = Duration::from_secs(15);
/// Drain retry interval during a graceful detach.
pub const DETACH_POLL: Duration = Duration::from_millis(10);

#[derive(Clone)]
pub struct WorkerConfig {
    pub compress_mode: CompressMode,
    pub streaming: StreamVideoMode,
    pub palette_cache_budget: u64,
    pub cursor_cache_budget: u64,
    pub max_pipe_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            compress_mode: CompressMode::AutoGlz,
            streaming: StreamVideoMode::Filter,
            palette_cache_budget: 128,
            cursor_cache_budget: 1 << 20,
            max_pipe_size: MAX_PIPE_SIZE,
        }
    }
}

/// Per-codec counter nodes in the stats shm block.
struct StatsExport {
    tree: Arc<core_stats::StatsTree>,
    /// (method name, count node, orig-bytes node, comp-bytes node,
    /// cpu-ns node) per codec.
    nodes: Vec<(
        &'static str,
        core_stats::StatNode,
        core_stats::StatNode,
        core_stats::StatNode,
        core_stats::StatNode,
    )>,
}

const STAT_METHODS: [&str; 7] = ["raw", "quic", "lz", "glz", "zlib_glz", "jpeg", "jpeg_alpha"];

pub struct DisplayWorker {
    pub core: DisplayCore,
    clients: Vec<Option<DisplayClient>>,
    pub cursor: CursorChannel,
    device: Box<dyn AdapterDevice>,
    port: WorkerPort,
    pixmap_cache: Arc<PixmapCache>,
    glz_dict: Arc<GlzDictionary>,
    config: WorkerConfig,
    running: bool,
    ring_retries: u32,
    mig_deadline: Option<(u32, Instant)>,
    stats: Option<StatsExport>,
}

impl DisplayWorker {
    pub fn new(
        device: Box<dyn AdapterDevice>,
        port: WorkerPort,
        pixmap_cache: Arc<PixmapCache>,
        glz_dict: Arc<GlzDictionary>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            core: DisplayCore::new(config.streaming),
            clients: (0..core_cache::MAX_CACHE_CLIENTS).map(|_| None).collect(),
            cursor: CursorChannel::new(core_cache::MAX_CACHE_CLIENTS, config.cursor_cache_budget),
            device,
            port,
            pixmap_cache,
            glz_dict,
            config,
            running: true,
            ring_retries: 0,
            mig_deadline: None,
            stats: None,
        }
    }

    /// Wire the per-codec counters into a stats block under a `display`
    /// group node. Failures (block full) just disable the export.
    pub fn attach_stats(&mut self, tree: Arc<core_stats::StatsTree>) {
        let Ok(group) = tree.add_node(None, "display", false) else {
            return;
        };
        let mut nodes = Vec::with_capacity(STAT_METHODS.len());
        for name in STAT_METHODS {
            let Ok(parent) = tree.add_node(Some(group), name, false) else {
                return;
            };
            let make = |leaf: &str| tree.add_node(Some(parent), leaf, true);
            match (make("count"), make("orig_bytes"), make("comp_bytes"), make("cpu_ns")) {
                (Ok(c), Ok(o), Ok(p), Ok(t)) => nodes.push((name, c, o, p, t)),
                _ => return,
            }
        }
        self.stats = Some(StatsExport { tree, nodes });
    }

    /// Publish summed per-codec counters across all connected clients.
    fn export_stats(&self) {
        let Some(export) = &self.stats else { return };
        for &(name, count, orig, comp, cpu) in &export.nodes {
            let mut totals = core_codec::MethodStatSnapshot::default();
            for client in self.clients.iter().flatten() {
                let snap = method_stat(&client.stats, name).snapshot();
                totals.count += snap.count;
                totals.orig_bytes += snap.orig_bytes;
                totals.comp_bytes += snap.comp_bytes;
                totals.cpu_ns += snap.cpu_ns;
            }
            export.tree.set(count, totals.count);
            export.tree.set(orig, totals.orig_bytes);
            export.tree.set(comp, totals.comp_bytes);
            export.tree.set(cpu, totals.cpu_ns);
        }
    }

    pub fn client(&self, id: u32) -> Option<&DisplayClient> {
        self.clients.get(id as usize).and_then(|c| c.as_ref())
    }

    pub fn client_mut(&mut self, id: u32) -> Option<&mut DisplayClient> {
        self.clients.get_mut(id as usize).and_then(|c| c.as_mut())
    }

    pub fn connected_clients(&self) -> usize {
        self.clients.iter().flatten().count()
    }

    /// The blocking loop. Parks on the dispatcher channel between bursts
    /// of work; the device wakes it through the dispatcher's wakeup kick.
    /// Exits when every dispatcher handle is gone.
    pub fn run(&mut self) {
        use core_dispatch::dispatcher::PortPoll;
        tracing::info!(target: "display.worker", "worker_started");
        loop {
            match self.port.park(RING_POLL_INTERVAL) {
                PortPoll::Msg(envelope) => {
                    self.handle_message(envelope);
                }
                PortPoll::Idle => {}
                PortPoll::Disconnected => break,
            }
            self.tick(Instant::now());
        }
        tracing::info!(target: "display.worker", "worker_exited");
    }

    /// One iteration of the multiplexed loop, test-drivable.
    pub fn tick(&mut self, now: Instant) {
        // Drain control messages without blocking.
        while let Some(envelope) = self.port.try_recv() {
            if !self.handle_message(envelope) {
                return;
            }
        }
        if self.running {
            self.process_commands(now);
            self.process_cursor_commands();
        }
        stream::expire_streams(&mut self.core, now);
        self.drain_stream_events();
        self.sync_stream_clips();
        self.check_migration(now);
        self.read_clients();
        self.push_clients();
        self.cursor.read_all();
        self.cursor.push_all();
        self.drain_releases();
        self.export_stats();
    }

    // ------------------------------------------------------------------
    // Command ingestion
    // ------------------------------------------------------------------

    /// Pull from the drawing ring, bounded by pipe pressure and the
    /// 10 ms wall-time slice. Underflow counts toward the notification
    /// threshold; the device is asked for a wakeup once patience runs out.
    fn process_commands(&mut self, start: Instant) {
        loop {
            if start.elapsed() > PROCESS_SLICE {
                return;
            }
            let pressured = self
                .clients
                .iter()
                .flatten()
                .any(|c| c.pipe_len() >= self.config.max_pipe_size);
            if pressured {
                return;
            }
            match self.device.pop_command() {
                Some(cmd) => {
                    self.ring_retries = 0;
                    self.ingest(cmd, Instant::now());
                }
                None => {
                    self.ring_retries += 1;
                    if self.ring_retries >= RING_POLL_RETRIES {
                        self.ring_retries = 0;
                        self.device.request_notification();
                    }
                    return;
                }
            }
        }
    }

    fn process_cursor_commands(&mut self) {
        while let Some(cmd) = self.device.pop_cursor() {
            self.cursor.process(cmd.payload);
            self.device.release_resource(cmd.tag);
        }
    }

    fn ingest(&mut self, cmd: RingCommand<CommandPayload>, now: Instant) {
        match cmd.payload {
            CommandPayload::Draw(draw) => self.ingest_draw(draw, cmd.tag, now),
            CommandPayload::Update {
                surface_id,
                area,
                clear_dirty,
            } => {
                render::flush_area(&mut self.core, surface_id, area);
                if clear_dirty {
                    self.core.surfaces.get_mut(surface_id).dirty.clear();
                }
                self.device.release_resource(cmd.tag);
            }
            CommandPayload::Message(text) => {
                tracing::info!(target: "adapter", "{text}");
                self.device.release_resource(cmd.tag);
            }
            CommandPayload::SurfaceCreate(info) => {
                self.create_surface(info);
                self.device.release_resource(cmd.tag);
            }
            CommandPayload::SurfaceDestroy { surface_id } => {
                self.destroy_surface(surface_id);
                self.device.release_resource(cmd.tag);
            }
        }
    }

    fn ingest_draw(&mut self, cmd: DrawCommand, tag: ResourceTag, now: Instant) {
        assert!(
            self.core.surfaces.exists(cmd.surface_id),
            "draw command for dead surface {}",
            cmd.surface_id
        );
        let gradual = match &cmd.op {
            DrawOp::Copy { src, .. } => src
                .as_bitmap()
                .map(|b| core_codec::graduality(b) == Graduality::High)
                .unwrap_or(false),
            _ => false,
        };
        let filter = self.core.filter_streams();
        let drawable = Drawable::new(cmd, tag, now, gradual, filter);
        let deps = drawable.deps.clone();
        let surface_id = drawable.cmd.surface_id;
        let key = self.core.pool.insert(drawable);

        // Surface bookkeeping: the drawable pins its target and sources.
        self.core.surfaces.add_ref(surface_id);
        for dep in &deps {
            self.core.surfaces.add_ref(*dep);
            self.core.surfaces.get_mut(*dep).dep_ring.push(key);
        }

        // Self-referencing commands snapshot their destination before the
        // tree defers anything.
        render::capture_self_bitmap(&mut self.core, key);

        let outcome = tree::current_add(&mut self.core, key, now);
        // Stream creations must reach the pipes before the frame itself.
        self.drain_stream_events();
        match outcome {
            AddOutcome::Added { .. } | AddOutcome::Replaced { .. } => {
                self.pipe_drawable(key, now);
            }
            AddOutcome::Reverted { old } => {
                // Clients still holding the first application get the
                // revert; pipes that never sent it drop it instead.
                let mut need_new: Vec<u32> = Vec::new();
                for slot in self.clients.iter_mut().flatten() {
                    // `old` may already be fully released when nothing was
                    // queued anywhere.
                    let queued = self.core.pool.contains(old)
                        && self
                            .core
                            .pool
                            .get(old)
                            .pipe_items
                            .iter()
                            .any(|&(cid, _)| cid == slot.id);
                    if queued {
                        slot.remove_drawable(&mut self.core, old);
                    } else {
                        need_new.push(slot.id);
                    }
                }
                for id in need_new {
                    if let Some(client) = self.clients[id as usize].as_mut() {
                        client.add_drawable(&mut self.core, key, now);
                    }
                }
            }
            AddOutcome::Dropped => {}
        }
        self.sync_stream_clips();
        // Drop the ingest reference; tree and pipes hold their own.
        crate::core::release_drawable(&mut self.core, key);
    }

    fn pipe_drawable(&mut self, key: DrawableKey, now: Instant) {
        let mut clients = std::mem::take(&mut self.clients);
        for client in clients.iter_mut().flatten() {
            client.add_drawable(&mut self.core, key, now);
        }
        self.clients = clients;
    }

    // ------------------------------------------------------------------
    // Surfaces
    // ------------------------------------------------------------------

    fn create_surface(&mut self, info: SurfaceCreateInfo) {
        self.core.surfaces.create(
            info.surface_id,
            info.width,
            info.height,
            info.stride,
            info.format,
            info.data.as_ref(),
            info.data_valid,
        );
        if info.surface_id == 0 {
            // Fresh primary: clients must know subsequent frames belong to
            // the new mode.
            for client in self.clients.iter_mut().flatten() {
                client.push_verb(verbs::MARK);
            }
        }
        if info.data_valid {
            // The device reloaded the surface; push the bits to everyone
            // in sync.
            let mut clients = std::mem::take(&mut self.clients);
            for client in clients.iter_mut().flatten() {
                client.sync_surface_image(&mut self.core, info.surface_id);
            }
            self.clients = clients;
        }
    }

    fn destroy_surface(&mut self, surface_id: u32) {
        // Dependents first: everything waiting on this surface renders now.
        loop {
            let Some(&dep) = self
                .core
                .surfaces
                .get(surface_id)
                .dep_ring
                .iter()
                .find(|&&d| self.core.pool.contains(d))
            else {
                break;
            };
            let (target, bbox) = {
                let d = self.core.pool.get(dep);
                (d.cmd.surface_id, d.cmd.bbox)
            };
            render::flush_area(&mut self.core, target, bbox);
        }
        self.core.surfaces.get_mut(surface_id).dep_ring.clear();
        tree::clear_surface_tree(&mut self.core, surface_id);
        for client in self.clients.iter_mut().flatten() {
            client.forget_surface(surface_id);
        }
        self.core.surfaces.get_mut(surface_id).destroy_pending = true;
        self.core.surfaces.release(surface_id);
    }

    // ------------------------------------------------------------------
    // Streams
    // ------------------------------------------------------------------

    fn drain_stream_events(&mut self) {
        let events = std::mem::take(&mut self.core.stream_events);
        for event in events {
            match event {
                StreamEvent::Created(stream_key) => {
                    if !self.core.streams.contains_key(stream_key) {
                        continue;
                    }
                    self.tune_stream_bitrate(stream_key);
                    let vis = self.stream_visible_region(stream_key);
                    for client in self.clients.iter_mut().flatten() {
                        client
                            .agents
                            .insert(stream_key, crate::stream::StreamAgent::new(vis.clone()));
                        client.enqueue(PipeItem::StreamCreate(stream_key));
                    }
                }
                StreamEvent::Stopped { key, wire_id, dest } => {
                    let has_agents = self
                        .clients
                        .iter()
                        .flatten()
                        .any(|c| c.agents.contains_key(&key));
                    if has_agents {
                        let bitmap = render::get_area(&mut self.core, 0, dest);
                        for client in self.clients.iter_mut().flatten() {
                            if client.agents.remove(&key).is_some() {
                                // The still frame, in case the last stream
                                // frame never arrived.
                                client.enqueue(PipeItem::Upgrade {
                                    surface_id: 0,
                                    area: dest,
                                    bitmap: bitmap.clone(),
                                });
                                client.enqueue(PipeItem::StreamDestroy { wire_id });
                            }
                        }
                    }
                    self.core.streams.remove(key);
                }
            }
        }
    }

    /// Initial stream bit rate: source-area pixels times the per-pixel
    /// factor, narrowed for thin links, clamped to a share of the worst
    /// measured client rate.
    fn tune_stream_bitrate(&mut self, stream_key: crate::drawable::StreamKey) {
        let narrow = self.clients.iter().flatten().any(|c| c.low_bandwidth);
        let measured: Option<u64> = self
            .clients
            .iter()
            .flatten()
            .filter_map(|c| c.measured_bitrate())
            .min();
        let stream = &mut self.core.streams[stream_key];
        let pixels = u64::from(stream.width) * u64::from(stream.height);
        let mut rate = pixels
            * if narrow {
                stream::BITRATE_BPP_NARROW
            } else {
                stream::BITRATE_BPP
            };
        if let Some(m) = measured {
            rate = rate.min((m as f64 * stream::BITRATE_CLIENT_SHARE) as u64);
        }
        stream.encoder.set_bit_rate(rate.max(1));
    }

    fn stream_visible_region(&self, stream_key: crate::drawable::StreamKey) -> Region {
        let stream = &self.core.streams[stream_key];
        match stream.current {
            Some(current) => match self.core.pool.get(current).item {
                Some(item) => self.core.items[item].region.clone(),
                None => Region::from_rect(stream.dest),
            },
            None => Region::from_rect(stream.dest),
        }
    }

    /// Re-derive each agent's visible region from the tree; shrunk clips
    /// go out as stream-clip items.
    fn sync_stream_clips(&mut self) {
        let keys: Vec<_> = self.core.streams.keys().collect();
        for stream_key in keys {
            let vis = self.stream_visible_region(stream_key);
            for client in self.clients.iter_mut().flatten() {
                let Some(agent) = client.agents.get_mut(&stream_key) else {
                    continue;
                };
                if agent.vis_region != vis {
                    agent.vis_region = vis.clone();
                    client.enqueue(PipeItem::StreamClip(stream_key));
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Client I/O
    // ------------------------------------------------------------------

    fn push_clients(&mut self) {
        let mut clients = std::mem::take(&mut self.clients);
        for slot in clients.iter_mut() {
            if let Some(client) = slot {
                client.push(&mut self.core);
                if !client.alive {
                    tracing::info!(target: "display.client", id = client.id, "client_gone");
                    client.shutdown(&mut self.core);
                    *slot = None;
                }
            }
        }
        self.clients = clients;
    }

    fn read_clients(&mut self) {
        for client in self.clients.iter_mut().flatten() {
            client.read();
            client.collect_glz_frees();
        }
    }

    fn drain_releases(&mut self) {
        for tag in std::mem::take(&mut self.core.releases.tags) {
            self.device.release_resource(tag);
        }
    }

    // ------------------------------------------------------------------
    // Control channel
    // ------------------------------------------------------------------

    /// Handle one dispatcher message. Returns false when the worker should
    /// exit (its channel is gone).
    fn handle_message(&mut self, envelope: Envelope) -> bool {
        let Envelope { msg, completion } = envelope;
        tracing::trace!(target: "display.worker", msg = msg.name(), "control");
        match msg {
            WorkerMessage::Wakeup => {
                self.port.pending().clear(PendingBits::WAKEUP);
            }
            WorkerMessage::Oom => {
                self.port.pending().clear(PendingBits::OOM);
                self.handle_oom();
            }
            WorkerMessage::Start => self.running = true,
            WorkerMessage::Stop => {
                // Render everything pending so the device can scan out.
                for id in self.core.surfaces.ids() {
                    render::flush_surface(&mut self.core, id);
                }
                self.running = false;
            }
            WorkerMessage::Update { surface_id, area } => {
                if self.core.surfaces.exists(surface_id) {
                    render::flush_area(&mut self.core, surface_id, area);
                }
            }
            WorkerMessage::CreatePrimarySurface {
                width,
                height,
                stride,
                format,
            } => {
                self.create_surface(SurfaceCreateInfo {
                    surface_id: 0,
                    width,
                    height,
                    stride,
                    format,
                    data: None,
                    data_valid: false,
                });
            }
            WorkerMessage::DestroyPrimarySurface => {
                if self.core.surfaces.exists(0) {
                    self.destroy_surface(0);
                }
            }
            WorkerMessage::DestroySurfaces => {
                for id in self.core.surfaces.ids() {
                    if self.core.surfaces.exists(id) {
                        self.destroy_surface(id);
                    }
                }
                for client in self.clients.iter_mut().flatten() {
                    client.push_verb(verbs::STREAM_DESTROY_ALL);
                }
            }
            WorkerMessage::FlushSurfaces => {
                for id in self.core.surfaces.ids() {
                    render::flush_surface(&mut self.core, id);
                }
            }
            WorkerMessage::ResetImageCache => {
                self.pixmap_cache.clear();
            }
            WorkerMessage::ResetCursor => self.cursor.reset(),
            WorkerMessage::SetCompression(mode) => {
                for client in self.clients.iter_mut().flatten() {
                    client.compress_mode = mode;
                }
                self.config.compress_mode = mode;
            }
            WorkerMessage::SetStreamingVideo(mode) => {
                self.core.streaming = mode;
                self.config.streaming = mode;
            }
            WorkerMessage::SetMouseMode(mode) => self.cursor.set_mouse_mode(mode),
            WorkerMessage::AddMemSlot(_)
            | WorkerMessage::DelMemSlot { .. }
            | WorkerMessage::ResetMemSlots => {
                // Slot juggling happens in the device glue; the worker only
                // acknowledges so the device can proceed.
            }
            WorkerMessage::LoadvmCommands(commands) => {
                let now = Instant::now();
                for cmd in commands {
                    self.ingest(cmd, now);
                }
            }
            WorkerMessage::DisplayConnect {
                channel_id,
                transport,
                migration,
            } => self.display_connect(channel_id, transport, migration),
            WorkerMessage::DisplayDisconnect { channel_id } => {
                self.detach_client(channel_id);
            }
            WorkerMessage::DisplayMigrate { channel_id } => self.display_migrate(channel_id),
            WorkerMessage::CursorConnect {
                channel_id,
                transport,
                ..
            } => self.cursor.connect(channel_id, transport),
            WorkerMessage::CursorDisconnect { channel_id } => self.cursor.disconnect(channel_id),
            WorkerMessage::CursorMigrate { channel_id } => {
                self.cursor.disconnect(channel_id);
            }
        }
        self.port.complete(completion);
        true
    }

    /// Graceful detach: try to drain outstanding pipe content for up to
    /// the detach budget, then drop the client hard.
    fn detach_client(&mut self, channel_id: u32) {
        let deadline = Instant::now() + DETACH_TIMEOUT;
        loop {
            let Some(client) = self.clients[channel_id as usize].as_mut() else {
                return;
            };
            client.read();
            client.push(&mut self.core);
            if !client.alive || client.pipe_len() == 0 || Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(DETACH_POLL);
        }
        if let Some(client) = self.clients[channel_id as usize].as_mut() {
            if client.pipe_len() > 0 {
                tracing::warn!(
                    target: "display.client",
                    id = channel_id,
                    pending = client.pipe_len(),
                    "detach_flush_timeout"
                );
            }
            client.shutdown(&mut self.core);
        }
        self.clients[channel_id as usize] = None;
    }

    fn display_connect(
        &mut self,
        channel_id: u32,
        transport: Box<dyn ClientTransport>,
        migration: bool,
    ) {
        tracing::info!(target: "display.client", id = channel_id, migration, "client_connect");
        if let Some(old) = self.clients[channel_id as usize].as_mut() {
            old.shutdown(&mut self.core);
        }
        let caches = CacheSet {
            pixmap: self.pixmap_cache.clone(),
            glz: self.glz_dict.clone(),
        };
        let mut client = DisplayClient::new(
            channel_id,
            transport,
            caches,
            self.config.compress_mode,
            self.config.palette_cache_budget,
        );
        if self.core.surfaces.exists(0) {
            client.push_verb(verbs::MARK);
            client.sync_surface_image(&mut self.core, 0);
        }
        self.clients[channel_id as usize] = Some(client);
    }

    fn display_migrate(&mut self, channel_id: u32) {
        let serial = match self.client(channel_id) {
            Some(c) => c.serial,
            None => return,
        };
        let frozen = self.pixmap_cache.freeze();
        let restore = self.glz_dict.freeze();
        let data = DisplayMigrateData {
            message_serial: serial,
            pixmap_cache_frozen: frozen.is_some(),
            pixmap_cache_id: self.pixmap_cache.id,
            pixmap_cache_size: frozen.as_ref().map(|f| f.size).unwrap_or(0),
            pixmap_cache_sync: frozen.map(|f| f.sync).unwrap_or_default(),
            glz_dict_id: self.glz_dict.id,
            glz_dict_restore: GlzDictRestore {
                head: restore.head,
                window: restore.window,
            },
        };
        if let Some(client) = self.client_mut(channel_id) {
            client.enqueue(PipeItem::Migrate);
            client.enqueue(PipeItem::MigrateData(data.marshal()));
        }
        self.mig_deadline = Some((channel_id, Instant::now() + MIG_TIMEOUT));
    }

    fn check_migration(&mut self, now: Instant) {
        if let Some((channel_id, deadline)) = self.mig_deadline
            && now >= deadline
        {
            tracing::warn!(target: "display.client", id = channel_id, "migration_timeout");
            if let Some(client) = self.clients[channel_id as usize].as_mut() {
                client.shutdown(&mut self.core);
            }
            self.clients[channel_id as usize] = None;
            self.mig_deadline = None;
        }
    }

    // ------------------------------------------------------------------
    // Memory pressure
    // ------------------------------------------------------------------

    fn handle_oom(&mut self) {
        tracing::debug!(
            target: "display.oom",
            drawables = self.core.drawable_count(),
            "oom_enter"
        );
        // Freed GLZ instances whose drawables already left the tree.
        for client in self.clients.iter_mut().flatten() {
            client.collect_glz_frees();
        }
        let before = self.core.drawable_count();
        render::evict_oldest(&mut self.core, OOM_EVICT_BATCH);
        self.drain_stream_events();
        self.drain_releases();
        let mut flushes = 0;
        while flushes < OOM_FLUSH_LIMIT && self.device.flush_resources() > 0 {
            flushes += 1;
        }
        tracing::debug!(
            target: "display.oom",
            before,
            after = self.core.drawable_count(),
            flushes,
            "oom_exit"
        );
    }
}

fn method_stat<'a>(
    stats: &'a core_codec::CodecStats,
    name: &str,
) -> &'a core_codec::MethodStat {
    match name {
        "raw" => &stats.raw,
        "quic" => &stats.quic,
        "lz" => &stats.lz,
        "glz" => &stats.glz,
        "zlib_glz" => &stats.zlib_glz,
        "jpeg" => &stats.jpeg,
        "jpeg_alpha" => &stats.jpeg_alpha,
        _ => unreachable!("unknown stat method {name}"),
    }
}

/// Tree statistics used by tests and the stats exporter.
pub fn tree_item_count(core: &DisplayCore, surface_id: u32) -> usize {
    fn count(core: &DisplayCore, list: &[crate::drawable::ItemKey]) -> usize {
        let mut n = 0;
        for &ik in list {
            n += 1;
            if let TreeKind::Container(children) = &core.items[ik].kind {
                n += count(core, children);
            }
        }
        n
    }
    count(core, &core.surfaces.get(surface_id).ring)
}
