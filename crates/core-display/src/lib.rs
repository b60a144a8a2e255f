//! Display rendering and streaming core.
//!
//! One [`worker::DisplayWorker`] per graphics adapter ingests drawing
//! commands from the adapter rings, maintains the per-surface draw-item
//! tree, infers motion-JPEG streams, and feeds per-client ordered pipes
//! with draw commands, compressed images, or stream frames.
//!
//! Layering, leaves first:
//!
//! * [`drawable`] — the reference-counted drawable pool and arena keys.
//! * [`surfaces`] — surface registry (canvas, tree ring, dependency ring).
//! * [`tree`] — Z-ordered occlusion forest with copy-bits shadows.
//! * [`stream`] — video-region detection and per-client agents.
//! * [`render`] — deterministic canvas rendering (flush / read-back / OOM
//!   eviction).
//! * [`pipe`] / [`client`] — per-client pipes, marshalling, caches,
//!   lossy-region tracking, flow control.
//! * [`cursor`] — the parallel cursor pipeline.
//! * [`worker`] — the command loop and dispatcher handling.

pub mod client;
pub mod core;
pub mod cursor;
pub mod drawable;
pub mod pipe;
pub mod render;
pub mod stream;
pub mod surfaces;
pub mod tree;
pub mod worker;

pub use client::{CacheSet, DisplayClient};
pub use drawable::{Drawable, DrawableKey, ItemKey, StreamKey};
pub use self::core::DisplayCore;
pub use worker::{DisplayWorker, WorkerConfig};
