//! Global-dictionary LZ ("glz" wire method).
//!
//! One sliding history window is shared by every display channel of the
//! same end-user, so a bitmap the guest keeps redrawing encodes as a
//! back-reference into an image some earlier message already carried.
//! Encoded images become addressable window entries; when the window slides
//! past an entry, the instance that referenced it must eventually be freed
//! on its owning client — eviction can happen from any encoder thread, so
//! freed instances are queued on the owner's sink under a short mutex and
//! collected by that client's channel loop.
//!
//! Locking: encoders hold the dictionary's epoch read lock for the duration
//! of an encode; freeze / reset / restore (migration) take the epoch write
//! lock. The window itself sits behind a short mutex inside the epoch.
//! Callers must never enter an encode while holding a client send lock.
//!
//! Token format: flag byte per 8 items, LSB first. Clear = literal byte;
//! set = match of `len-4` (one byte, 4..=259) followed by the 32-bit LE
//! back distance (≥ 1) into the absolute history stream.

use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};

use crate::CodecError;
use crate::buf::{ChunkPool, ChunkWriter, EncodedData};

const MIN_MATCH: usize = 4;
const MAX_MATCH: usize = 259;

/// Default shared window: 16 MiB of recent image bytes.
pub const DEFAULT_WINDOW_SIZE: usize = 16 * 1024 * 1024;

/// Identifies one encoded-instance owner so eviction can route the free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlzInstanceTag {
    pub client_id: u32,
    pub instance: u64,
}

/// Per-client queue of instances whose window entries were evicted.
/// Shared with the dictionary; drained by the owning channel loop.
pub type GlzInstanceSink = Arc<Mutex<Vec<u64>>>;

struct GlzImageEntry {
    start: u64,
    len: usize,
    owner: GlzInstanceTag,
}

struct GlzWindow {
    capacity: usize,
    /// Contiguous tail of the absolute history stream.
    data: Vec<u8>,
    /// Absolute offset of `data[0]`.
    start: u64,
    /// 4-gram hash → latest absolute position.
    hash: AHashMap<u32, u64>,
    images: std::collections::VecDeque<GlzImageEntry>,
    sinks: AHashMap<u32, GlzInstanceSink>,
}

impl GlzWindow {
    fn head(&self) -> u64 {
        self.start + self.data.len() as u64
    }

    fn byte_at(&self, abs: u64) -> u8 {
        self.data[(abs - self.start) as usize]
    }

    /// Drop whole images from the front until the window fits its budget,
    /// routing evicted instances to their owners' sinks.
    fn evict_to_fit(&mut self) {
        while self.data.len() > self.capacity {
            let Some(entry) = self.images.pop_front() else {
                break;
            };
            let cut = (entry.start + entry.len as u64 - self.start) as usize;
            self.data.drain(..cut);
            self.start = entry.start + entry.len as u64;
            if let Some(sink) = self.sinks.get(&entry.owner.client_id) {
                sink.lock().push(entry.owner.instance);
            }
        }
        // Stale hash heads pointing below start are filtered at lookup.
    }
}

/// Restore payload carried in migration data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlzRestoreData {
    pub head: u64,
    pub window: Vec<u8>,
}

/// The shared dictionary. Cheap to clone via `Arc`.
pub struct GlzDictionary {
    pub id: u64,
    epoch: RwLock<()>,
    window: Mutex<GlzWindow>,
}

pub struct GlzEncodeOut {
    pub data: EncodedData,
}

impl GlzDictionary {
    pub fn new(id: u64, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            id,
            epoch: RwLock::new(()),
            window: Mutex::new(GlzWindow {
                capacity,
                data: Vec::new(),
                start: 0,
                hash: AHashMap::new(),
                images: std::collections::VecDeque::new(),
                sinks: AHashMap::new(),
            }),
        })
    }

    /// Register a client's freed-instance sink. Must happen before the
    /// client's first encode.
    pub fn register_client(&self, client_id: u32, sink: GlzInstanceSink) {
        self.window.lock().sinks.insert(client_id, sink);
    }

    pub fn unregister_client(&self, client_id: u32) {
        self.window.lock().sinks.remove(&client_id);
    }

    /// Whether an image of `len` bytes can become a window entry at all.
    pub fn fits(&self, len: usize) -> bool {
        len <= self.window.lock().capacity
    }

    /// Encode `input` against the shared history and append it as a new
    /// addressable entry owned by `owner`.
    pub fn encode(
        &self,
        owner: GlzInstanceTag,
        input: &[u8],
        pool: &mut ChunkPool,
    ) -> GlzEncodeOut {
        let _epoch = self.epoch.read();
        let mut win = self.window.lock();

        let entry_start = win.head();
        let mut w = ChunkWriter::new(pool);

        let mut flags = 0u8;
        let mut group: Vec<(Option<(u64, usize)>, u8)> = Vec::with_capacity(8);
        let flush =
            |w: &mut ChunkWriter<'_>, flags: u8, group: &[(Option<(u64, usize)>, u8)]| {
                if group.is_empty() {
                    return;
                }
                w.push(flags);
                for (m, lit) in group {
                    match m {
                        Some((dist, len)) => {
                            w.push((len - MIN_MATCH) as u8);
                            w.push_slice(&(*dist as u32).to_le_bytes());
                        }
                        None => w.push(*lit),
                    }
                }
            };

        // Appended input becomes part of the window as we go, so matches can
        // reference both shared history and the image's own earlier bytes.
        let mut pos = 0usize;
        while pos < input.len() {
            let abs_pos = entry_start + pos as u64;
            let mut best: Option<(u64, usize)> = None;
            if pos + MIN_MATCH <= input.len() {
                let h = gram4(&input[pos..]);
                // Single-head table: the newest occurrence of the gram wins.
                if let Some(&cand) = win.hash.get(&h)
                    && cand >= win.start
                    && cand < abs_pos
                    && abs_pos - cand <= u32::MAX as u64
                {
                    let dist = abs_pos - cand;
                    let limit = (input.len() - pos).min(MAX_MATCH);
                    let mut l = 0usize;
                    while l < limit {
                        let hist = cand + l as u64;
                        let b = if hist >= entry_start {
                            input[(hist - entry_start) as usize]
                        } else {
                            win.byte_at(hist)
                        };
                        if b != input[pos + l] {
                            break;
                        }
                        l += 1;
                    }
                    if l >= MIN_MATCH {
                        best = Some((dist, l));
                    }
                }
            }

            let advance = match best {
                Some((dist, len)) => {
                    flags |= 1 << group.len();
                    group.push((Some((dist, len)), 0));
                    len
                }
                None => {
                    group.push((None, input[pos]));
                    1
                }
            };
            if group.len() == 8 {
                flush(&mut w, flags, &group);
                flags = 0;
                group.clear();
            }
            // Register the covered grams so later data can match into them.
            let end = (pos + advance).min(input.len().saturating_sub(MIN_MATCH - 1));
            for p in pos..end {
                let h = gram4(&input[p..]);
                win.hash.insert(h, entry_start + p as u64);
            }
            pos += advance;
        }
        flush(&mut w, flags, &group);

        win.data.extend_from_slice(input);
        win.images.push_back(GlzImageEntry {
            start: entry_start,
            len: input.len(),
            owner,
        });
        win.evict_to_fit();

        GlzEncodeOut { data: w.finish() }
    }

    /// Freeze for migration: hand out the window tail and stop nothing —
    /// the write lock excludes concurrent encodes for the duration.
    pub fn freeze(&self) -> GlzRestoreData {
        let _epoch = self.epoch.write();
        let win = self.window.lock();
        GlzRestoreData {
            head: win.head(),
            window: win.data.clone(),
        }
    }

    /// Reset to empty (all clients gone or migration target mismatch).
    pub fn reset(&self) {
        let _epoch = self.epoch.write();
        let mut win = self.window.lock();
        let head = win.head();
        win.data.clear();
        win.start = head;
        win.hash.clear();
        win.images.clear();
    }

    /// Restore window state received in migration data.
    pub fn restore(&self, data: GlzRestoreData) {
        let _epoch = self.epoch.write();
        let mut win = self.window.lock();
        win.start = data.head - data.window.len() as u64;
        win.data = data.window;
        win.hash.clear();
        win.images.clear();
    }
}

#[inline]
fn gram4(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Reference decoder: replays the absolute history stream. The real client
/// keeps the same rolling history; tests use this to prove the encoder's
/// references stay inside the transmitted past.
#[derive(Default)]
pub struct GlzRefDecoder {
    history: Vec<u8>,
}

impl GlzRefDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, data: &[u8], expected_len: usize) -> Result<Vec<u8>, CodecError> {
        let base = self.history.len();
        let mut i = 0usize;
        while i < data.len() && self.history.len() - base < expected_len {
            let flags = data[i];
            i += 1;
            for bit in 0..8 {
                if self.history.len() - base >= expected_len || i >= data.len() {
                    break;
                }
                if flags & (1 << bit) != 0 {
                    if i + 4 >= data.len() {
                        return Err(CodecError::Truncated);
                    }
                    let len = data[i] as usize + MIN_MATCH;
                    let dist = u32::from_le_bytes([
                        data[i + 1],
                        data[i + 2],
                        data[i + 3],
                        data[i + 4],
                    ]) as usize;
                    i += 5;
                    if dist == 0 || dist > self.history.len() {
                        return Err(CodecError::BadReference);
                    }
                    for _ in 0..len {
                        let b = self.history[self.history.len() - dist];
                        self.history.push(b);
                    }
                } else {
                    self.history.push(data[i]);
                    i += 1;
                }
            }
        }
        if self.history.len() - base != expected_len {
            return Err(CodecError::Truncated);
        }
        Ok(self.history[base..].to_vec())
    }
}
