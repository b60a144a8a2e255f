//! Video-region inference: stream state, the frame detector, and the trace
//! ring that survives occlusion.
//!
//! A stream starts life as a chain of matching opaque put-copies at the
//! same box. Counters ride the drawables themselves; promotion happens
//! when the chain is long enough and gradual enough. Client-facing
//! notifications never happen here — stream lifecycle transitions are
//! queued as [`StreamEvent`]s on the core and fanned out by the worker,
//! keeping the tree algorithms free of client state.

use std::time::{Duration, Instant};

use core_codec::jpeg::MjpegEncoder;
use core_region::{Rect, Region};

use crate::core::DisplayCore;
use crate::drawable::{DrawableKey, StreamKey};

/// Hard cap on simultaneously active streams.
pub const NUM_STREAMS: usize = 50;
/// Frames needed before promotion.
pub const STREAM_START_FRAMES: u32 = 20;
/// Gradual share of the chain needed before promotion.
pub const STREAM_GRADUAL_RATIO: f64 = 0.2;
/// A chain this many frames past its last gradual frame starts over.
pub const STREAM_RESET_FRAMES: u32 = 100;
/// Match window for chains not yet streaming.
pub const STREAM_MATCH_NEW: Duration = Duration::from_millis(200);
/// Match window once a stream exists.
pub const STREAM_MATCH_STREAMING: Duration = Duration::from_millis(500);
/// A stream dies after this long without a frame.
pub const STREAM_TIMEOUT: Duration = Duration::from_millis(1000);
/// Recently-occluded candidate memory.
pub const TRACE_SLOTS: usize = 8;
/// Match window against the trace ring.
pub const TRACE_MATCH: Duration = Duration::from_millis(200);

pub const FPS_MIN: u32 = 1;
pub const FPS_MAX: u32 = 30;
/// Drop share (percent) above which a client's fps target decrements.
pub const DROP_RATIO_PERCENT: u32 = 10;

/// Initial bit-rate factors (bits per pixel of source area).
pub const BITRATE_BPP: u64 = 38;
pub const BITRATE_BPP_NARROW: u64 = 4;
/// Share of the measured client bitrate a stream may claim.
pub const BITRATE_CLIENT_SHARE: f64 = 0.7;

pub struct Stream {
    /// Wire id, stable for the stream's lifetime.
    pub wire_id: u32,
    pub current: Option<DrawableKey>,
    pub last_time: Instant,
    pub width: u32,
    pub height: u32,
    pub dest: Rect,
    pub top_down: bool,
    pub encoder: MjpegEncoder,
    /// Owned by agents plus the current drawable.
    pub refs: u32,
}

/// Per-client transmission state for one stream. Lives in the client, but
/// defined here with the rest of the stream machinery.
#[derive(Debug)]
pub struct StreamAgent {
    pub vis_region: Region,
    /// Clip last communicated to the client.
    pub clip_sent: Region,
    pub fps: u32,
    pub frames: u32,
    pub drops: u32,
    pub last_send: Option<Instant>,
}

impl StreamAgent {
    pub fn new(vis: Region) -> Self {
        Self {
            clip_sent: vis.clone(),
            vis_region: vis,
            fps: FPS_MAX,
            frames: 0,
            drops: 0,
            last_send: None,
        }
    }

    /// Frame-budget decision: may this client get a frame now? Updates the
    /// drop/send accounting and adapts the fps target every 20 outcomes:
    /// too many drops lowers it, a clean run raises it. The interval gets
    /// 10% slack so sources running at exactly the target cadence are not
    /// starved by scheduling jitter.
    pub fn admit_frame(&mut self, now: Instant) -> bool {
        let interval = Duration::from_millis(900 / u64::from(self.fps.max(1)));
        let admit = match self.last_send {
            Some(last) => now.duration_since(last) >= interval,
            None => true,
        };
        if admit {
            self.frames += 1;
            self.last_send = Some(now);
        } else {
            self.drops += 1;
        }
        let total = self.frames + self.drops;
        if total >= 20 {
            if self.drops * 100 > total * DROP_RATIO_PERCENT {
                self.fps = (self.fps - 1).max(FPS_MIN);
            } else if self.drops == 0 {
                self.fps = (self.fps + 1).min(FPS_MAX);
            }
            self.frames = 0;
            self.drops = 0;
        }
        admit
    }
}

/// Lifecycle notifications drained by the worker after tree updates.
/// Clip updates need no event: the worker re-derives agent clips from the
/// tree after every insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    Created(StreamKey),
    /// Stream ended; clients that saw it get a destroy (and an upgrade of
    /// the dest area when they may not have painted the last frame).
    Stopped { key: StreamKey, wire_id: u32, dest: Rect },
}

/// Fixed-size ring of recently occluded stream candidates, so a stream
/// whose first frames were displaced by one overlay is still recognized.
pub struct ItemTrace {
    slots: Vec<TraceEntry>,
    next: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct TraceEntry {
    pub time: Instant,
    pub frames_count: u32,
    pub gradual_frames_count: u32,
    pub last_gradual_frame: u32,
    pub width: i32,
    pub height: i32,
    pub dest: Rect,
}

impl ItemTrace {
    pub fn new() -> Self {
        Self {
            slots: Vec::with_capacity(TRACE_SLOTS),
            next: 0,
        }
    }

    pub fn push(&mut self, entry: TraceEntry) {
        if self.slots.len() < TRACE_SLOTS {
            self.slots.push(entry);
        } else {
            self.slots[self.next] = entry;
        }
        self.next = (self.next + 1) % TRACE_SLOTS;
    }

    /// Find a trace matching a new candidate's geometry within the window.
    pub fn matching(&self, dest: Rect, src_w: i32, src_h: i32, now: Instant) -> Option<&TraceEntry> {
        self.slots.iter().find(|t| {
            t.dest == dest
                && t.width == src_w
                && t.height == src_h
                && now.duration_since(t.time) <= TRACE_MATCH
        })
    }
}

impl Default for ItemTrace {
    fn default() -> Self {
        Self::new()
    }
}

/// Source-area dimensions of a streamable copy drawable.
pub fn src_size(core: &DisplayCore, key: DrawableKey) -> (i32, i32) {
    use core_canvas::cmd::DrawOp;
    match &core.pool.get(key).cmd.op {
        DrawOp::Copy { src_area, .. } => (src_area.width(), src_area.height()),
        _ => (0, 0),
    }
}

fn top_down_of(core: &DisplayCore, key: DrawableKey) -> bool {
    use core_canvas::cmd::DrawOp;
    match &core.pool.get(key).cmd.op {
        DrawOp::Copy { src, .. } => src.as_bitmap().map(|b| b.top_down).unwrap_or(true),
        _ => true,
    }
}

/// Do two drawables continue the same frame chain? Same box, same source
/// size, same orientation, close enough in time.
pub fn frames_match(core: &DisplayCore, prev: DrawableKey, new: DrawableKey,
                    window: Duration) -> bool {
    let p = core.pool.get(prev);
    let n = core.pool.get(new);
    if p.cmd.bbox != n.cmd.bbox {
        return false;
    }
    if src_size(core, prev) != src_size(core, new) {
        return false;
    }
    if top_down_of(core, prev) != top_down_of(core, new) {
        return false;
    }
    n.creation.duration_since(p.creation) <= window
}

/// Advance the chain counters on `new` from its predecessor's, then decide
/// promotion. Counter meaning: `frames_count` is the chain length,
/// `gradual_frames_count` how many scored high graduality,
/// `last_gradual_frame` the chain index of the latest gradual one.
pub fn advance_chain(core: &mut DisplayCore, prev: DrawableKey, new: DrawableKey) -> bool {
    let (pf, pg, plg) = {
        let p = core.pool.get(prev);
        (p.frames_count, p.gradual_frames_count, p.last_gradual_frame)
    };
    let n = core.pool.get_mut(new);
    n.frames_count = pf + 1;
    n.gradual_frames_count = pg + u32::from(n.gradual);
    n.last_gradual_frame = if n.gradual { n.frames_count } else { plg };
    if n.frames_count.saturating_sub(n.last_gradual_frame) > STREAM_RESET_FRAMES {
        // Long run with nothing gradual: not video, start over.
        n.frames_count = 0;
        n.gradual_frames_count = 0;
        n.last_gradual_frame = 0;
        return false;
    }
    n.frames_count >= STREAM_START_FRAMES
        && (n.gradual_frames_count as f64) >= STREAM_GRADUAL_RATIO * (n.frames_count as f64)
}

/// Seed a new candidate's counters from the trace ring, if a displaced
/// predecessor matches.
pub fn seed_from_trace(core: &mut DisplayCore, key: DrawableKey, now: Instant) {
    let (dest, (sw, sh)) = {
        let d = core.pool.get(key);
        (d.cmd.bbox, src_size(core, key))
    };
    if let Some(entry) = core.trace.matching(dest, sw, sh, now) {
        let (f, g, l) = (
            entry.frames_count,
            entry.gradual_frames_count,
            entry.last_gradual_frame,
        );
        let d = core.pool.get_mut(key);
        d.frames_count = f + 1;
        d.gradual_frames_count = g + u32::from(d.gradual);
        d.last_gradual_frame = if d.gradual { d.frames_count } else { l };
    }
}

/// Promote `key` into a new stream. Returns the new key, or `None` when
/// the stream table is full.
pub fn create_stream(core: &mut DisplayCore, key: DrawableKey, now: Instant) -> Option<StreamKey> {
    if core.streams.len() >= NUM_STREAMS {
        return None;
    }
    let (dest, (sw, sh), top_down) = {
        let d = core.pool.get(key);
        (d.cmd.bbox, src_size(core, key), top_down_of(core, key))
    };
    let bit_rate = u64::from(sw.max(0) as u32) * u64::from(sh.max(0) as u32) * BITRATE_BPP;
    let wire_id = core.next_stream_wire_id;
    core.next_stream_wire_id += 1;
    let stream_key = core.streams.insert(Stream {
        wire_id,
        current: Some(key),
        last_time: now,
        width: sw.max(0) as u32,
        height: sh.max(0) as u32,
        dest,
        top_down,
        encoder: MjpegEncoder::new(sw.max(0) as u32, sh.max(0) as u32, bit_rate),
        refs: 1, // the current drawable
    });
    core.pool.get_mut(key).stream = Some(stream_key);
    core.stream_events.push(StreamEvent::Created(stream_key));
    tracing::debug!(
        target: "display.stream",
        wire_id,
        ?dest,
        width = sw,
        height = sh,
        "stream_promoted"
    );
    Some(stream_key)
}

/// Move the stream's current-frame ownership from `prev` to `new`.
pub fn attach_frame(core: &mut DisplayCore, stream_key: StreamKey, prev: DrawableKey,
                    new: DrawableKey, now: Instant) {
    core.pool.get_mut(prev).stream = None;
    core.pool.get_mut(new).stream = Some(stream_key);
    let stream = &mut core.streams[stream_key];
    stream.current = Some(new);
    stream.last_time = now;
}

/// End a stream: queue the stop event and drop the current-frame back
/// reference. Agents are torn down by the worker when it drains events.
pub fn stop_stream(core: &mut DisplayCore, stream_key: StreamKey) {
    let stream = &mut core.streams[stream_key];
    let wire_id = stream.wire_id;
    let dest = stream.dest;
    if let Some(current) = stream.current.take() {
        core.pool.get_mut(current).stream = None;
    }
    core.stream_events.push(StreamEvent::Stopped {
        key: stream_key,
        wire_id,
        dest,
    });
    tracing::debug!(target: "display.stream", wire_id, "stream_stopped");
}

/// Time out idle streams.
pub fn expire_streams(core: &mut DisplayCore, now: Instant) {
    let expired: Vec<StreamKey> = core
        .streams
        .iter()
        .filter(|(_, s)| now.duration_since(s.last_time) > STREAM_TIMEOUT)
        .map(|(k, _)| k)
        .collect();
    for key in expired {
        stop_stream(core, key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_ring_wraps_and_matches() {
        let now = Instant::now();
        let mut trace = ItemTrace::new();
        for i in 0..(TRACE_SLOTS + 3) {
            trace.push(TraceEntry {
                time: now,
                frames_count: i as u32,
                gradual_frames_count: 0,
                last_gradual_frame: 0,
                width: 320,
                height: 240,
                dest: Rect::new(i as i32, 0, i as i32 + 320, 240),
            });
        }
        // The oldest three were overwritten.
        assert!(trace.matching(Rect::new(2, 0, 322, 240), 320, 240, now).is_none());
        assert!(trace.matching(Rect::new(5, 0, 325, 240), 320, 240, now).is_some());
        // Size mismatch never matches.
        assert!(trace.matching(Rect::new(5, 0, 325, 240), 100, 240, now).is_none());
    }

    #[test]
    fn agent_fps_adapts_down_under_drops() {
        let mut agent = StreamAgent::new(Region::new());
        let start = Instant::now();
        // Deliver frames far faster than 30 fps: most get dropped.
        let mut t = start;
        for _ in 0..100 {
            t += Duration::from_millis(3);
            agent.admit_frame(t);
        }
        assert!(agent.fps < FPS_MAX, "fps={}", agent.fps);
        assert!(agent.fps >= FPS_MIN);
    }

    #[test]
    fn agent_fps_recovers_without_drops() {
        let mut agent = StreamAgent::new(Region::new());
        agent.fps = 5;
        let mut t = Instant::now();
        // Frames arriving exactly at the target cadence: zero drops.
        for _ in 0..40 {
            t += Duration::from_millis(250);
            agent.admit_frame(t);
        }
        assert!(agent.fps > 5, "fps={}", agent.fps);
    }
}
