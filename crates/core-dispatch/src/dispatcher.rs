//! Control channel between the device thread and the worker.
//!
//! Two delivery flavors, matching the device contract: *sync* messages
//! block the sender until the worker writes a READY reply back; *async*
//! messages return immediately and complete later through a cookie on the
//! completion channel, in worker retire order. A pair of shared pending
//! bits dedupes the high-rate wakeup/oom kicks so the channel never fills
//! with them.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use crossbeam_channel::{Receiver, Sender, bounded};
use thiserror::Error;

use core_canvas::PixelFormat;
use core_codec::CompressMode;
use core_region::Rect;

use crate::device::RingCommand;
use crate::slots::MemSlot;
use crate::transport::ClientTransport;

#[derive(Debug, Error)]
pub enum DispatcherError {
    #[error("worker is gone")]
    WorkerGone,
}

/// Streaming-video detection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamVideoMode {
    Off,
    All,
    #[default]
    Filter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MouseMode {
    #[default]
    Server,
    Client,
}

/// Control messages the worker consumes. Client connects carry the
/// transport object the front-end built.
pub enum WorkerMessage {
    Update { surface_id: u32, area: Rect },
    AddMemSlot(MemSlot),
    DelMemSlot { group_id: u32, slot_id: u32 },
    ResetMemSlots,
    DestroySurfaces,
    CreatePrimarySurface {
        width: u32,
        height: u32,
        stride: u32,
        format: PixelFormat,
    },
    DestroyPrimarySurface,
    ResetImageCache,
    ResetCursor,
    Wakeup,
    Oom,
    Start,
    Stop,
    FlushSurfaces,
    LoadvmCommands(Vec<RingCommand<crate::device::CommandPayload>>),
    SetCompression(CompressMode),
    SetStreamingVideo(StreamVideoMode),
    SetMouseMode(MouseMode),
    DisplayConnect {
        channel_id: u32,
        transport: Box<dyn ClientTransport>,
        migration: bool,
    },
    DisplayDisconnect { channel_id: u32 },
    DisplayMigrate { channel_id: u32 },
    CursorConnect {
        channel_id: u32,
        transport: Box<dyn ClientTransport>,
        migration: bool,
    },
    CursorDisconnect { channel_id: u32 },
    CursorMigrate { channel_id: u32 },
}

impl WorkerMessage {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            WorkerMessage::Update { .. } => "update",
            WorkerMessage::AddMemSlot(_) => "add_memslot",
            WorkerMessage::DelMemSlot { .. } => "del_memslot",
            WorkerMessage::ResetMemSlots => "reset_memslots",
            WorkerMessage::DestroySurfaces => "destroy_surfaces",
            WorkerMessage::CreatePrimarySurface { .. } => "create_primary",
            WorkerMessage::DestroyPrimarySurface => "destroy_primary",
            WorkerMessage::ResetImageCache => "reset_image_cache",
            WorkerMessage::ResetCursor => "reset_cursor",
            WorkerMessage::Wakeup => "wakeup",
            WorkerMessage::Oom => "oom",
            WorkerMessage::Start => "start",
            WorkerMessage::Stop => "stop",
            WorkerMessage::FlushSurfaces => "flush_surfaces",
            WorkerMessage::LoadvmCommands(_) => "loadvm_commands",
            WorkerMessage::SetCompression(_) => "set_compression",
            WorkerMessage::SetStreamingVideo(_) => "set_streaming_video",
            WorkerMessage::SetMouseMode(_) => "set_mouse_mode",
            WorkerMessage::DisplayConnect { .. } => "display_connect",
            WorkerMessage::DisplayDisconnect { .. } => "display_disconnect",
            WorkerMessage::DisplayMigrate { .. } => "display_migrate",
            WorkerMessage::CursorConnect { .. } => "cursor_connect",
            WorkerMessage::CursorDisconnect { .. } => "cursor_disconnect",
            WorkerMessage::CursorMigrate { .. } => "cursor_migrate",
        }
    }
}

/// How the sender wants to hear back.
pub enum Completion {
    None,
    /// Block the sender until READY.
    Sync(Sender<()>),
    /// Complete later with this cookie.
    Async(u64),
}

pub struct Envelope {
    pub msg: WorkerMessage,
    pub completion: Completion,
}

/// Shared wakeup/oom dedupe bits (set by the device side before pushing the
/// corresponding message, cleared by the worker when it handles it).
#[derive(Clone, Default)]
pub struct PendingBits(Arc<AtomicU32>);

impl PendingBits {
    pub const WAKEUP: u32 = 1 << 0;
    pub const OOM: u32 = 1 << 1;

    pub fn new() -> Self {
        Self::default()
    }

    /// Set a bit; true when it was clear (the caller should push the kick).
    pub fn set(&self, bit: u32) -> bool {
        self.0.fetch_or(bit, Ordering::AcqRel) & bit == 0
    }

    pub fn clear(&self, bit: u32) {
        self.0.fetch_and(!bit, Ordering::AcqRel);
    }

    pub fn is_set(&self, bit: u32) -> bool {
        self.0.load(Ordering::Acquire) & bit != 0
    }
}

/// Device-thread handle.
pub struct Dispatcher {
    tx: Sender<Envelope>,
    pending: PendingBits,
}

/// Worker-thread handle.
pub struct WorkerPort {
    rx: Receiver<Envelope>,
    completions: Sender<u64>,
    pending: PendingBits,
}

/// Build the channel pair. `completion_rx` delivers async cookies back to
/// the device thread in worker retire order.
pub fn dispatcher(cap: usize) -> (Dispatcher, WorkerPort, Receiver<u64>) {
    let (tx, rx) = bounded(cap);
    let (ctx, crx) = bounded(cap);
    let pending = PendingBits::new();
    (
        Dispatcher {
            tx,
            pending: pending.clone(),
        },
        WorkerPort {
            rx,
            completions: ctx,
            pending,
        },
        crx,
    )
}

impl Dispatcher {
    /// Send and block until the worker replies READY.
    pub fn send_sync(&self, msg: WorkerMessage) -> Result<(), DispatcherError> {
        let (reply_tx, reply_rx) = bounded(1);
        tracing::trace!(target: "dispatch", msg = msg.name(), "send_sync");
        self.tx
            .send(Envelope {
                msg,
                completion: Completion::Sync(reply_tx),
            })
            .map_err(|_| DispatcherError::WorkerGone)?;
        reply_rx.recv().map_err(|_| DispatcherError::WorkerGone)
    }

    /// Send with an async completion cookie.
    pub fn send_async(&self, msg: WorkerMessage, cookie: u64) -> Result<(), DispatcherError> {
        tracing::trace!(target: "dispatch", msg = msg.name(), cookie, "send_async");
        self.tx
            .send(Envelope {
                msg,
                completion: Completion::Async(cookie),
            })
            .map_err(|_| DispatcherError::WorkerGone)
    }

    /// Fire-and-forget (wakeup-class messages).
    pub fn send(&self, msg: WorkerMessage) -> Result<(), DispatcherError> {
        self.tx
            .send(Envelope {
                msg,
                completion: Completion::None,
            })
            .map_err(|_| DispatcherError::WorkerGone)
    }

    /// Deduped wakeup kick: only the first call until the worker clears the
    /// bit actually enqueues a message.
    pub fn wakeup(&self) -> Result<(), DispatcherError> {
        if self.pending.set(PendingBits::WAKEUP) {
            self.send(WorkerMessage::Wakeup)?;
        }
        Ok(())
    }

    /// Deduped OOM kick.
    pub fn oom(&self) -> Result<(), DispatcherError> {
        if self.pending.set(PendingBits::OOM) {
            self.send(WorkerMessage::Oom)?;
        }
        Ok(())
    }
}

/// Result of a park attempt on the worker port.
pub enum PortPoll {
    Msg(Envelope),
    Idle,
    /// Every dispatcher handle is gone; the worker should exit.
    Disconnected,
}

impl WorkerPort {
    /// Non-blocking poll.
    pub fn try_recv(&self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }

    /// Blocking receive with timeout; the worker parks here when idle.
    pub fn recv_timeout(&self, timeout: std::time::Duration) -> Option<Envelope> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Like [`recv_timeout`](Self::recv_timeout) but distinguishes a quiet
    /// channel from a dead one.
    pub fn park(&self, timeout: std::time::Duration) -> PortPoll {
        use crossbeam_channel::RecvTimeoutError;
        match self.rx.recv_timeout(timeout) {
            Ok(envelope) => PortPoll::Msg(envelope),
            Err(RecvTimeoutError::Timeout) => PortPoll::Idle,
            Err(RecvTimeoutError::Disconnected) => PortPoll::Disconnected,
        }
    }

    pub fn pending(&self) -> &PendingBits {
        &self.pending
    }

    /// Retire an envelope: READY for sync senders, cookie for async ones.
    pub fn complete(&self, completion: Completion) {
        match completion {
            Completion::None => {}
            Completion::Sync(reply) => {
                // The sender may have given up (shutdown); that is fine.
                let _ = reply.send(());
            }
            Completion::Async(cookie) => {
                let _ = self.completions.send(cookie);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn sync_send_blocks_until_ready() {
        let (disp, port, _completions) = dispatcher(16);
        let worker = std::thread::spawn(move || {
            let env = port.recv_timeout(Duration::from_secs(1)).expect("msg");
            assert_eq!(env.msg.name(), "stop");
            port.complete(env.completion);
        });
        disp.send_sync(WorkerMessage::Stop).unwrap();
        worker.join().unwrap();
    }

    #[test]
    fn async_completion_carries_cookie() {
        let (disp, port, completions) = dispatcher(16);
        disp.send_async(WorkerMessage::DestroySurfaces, 42).unwrap();
        let env = port.try_recv().expect("msg");
        port.complete(env.completion);
        assert_eq!(completions.recv_timeout(Duration::from_secs(1)), Ok(42));
    }

    #[test]
    fn wakeup_is_deduped_until_cleared() {
        let (disp, port, _completions) = dispatcher(16);
        disp.wakeup().unwrap();
        disp.wakeup().unwrap();
        disp.wakeup().unwrap();
        // Only one message made it into the channel.
        assert!(port.try_recv().is_some());
        assert!(port.try_recv().is_none());
        // After the worker clears the bit the next kick goes through.
        port.pending().clear(PendingBits::WAKEUP);
        disp.wakeup().unwrap();
        assert!(port.try_recv().is_some());
    }

    #[test]
    fn worker_gone_is_an_error() {
        let (disp, port, _completions) = dispatcher(4);
        drop(port);
        assert!(disp.send(WorkerMessage::Start).is_err());
        assert!(disp.send_sync(WorkerMessage::Stop).is_err());
    }
}
