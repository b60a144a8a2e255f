//! Abstract per-client framed message channel.
//!
//! The TCP/TLS front-end terminates links, negotiates capabilities, and
//! hands the worker an object implementing [`ClientTransport`]. The worker
//! never blocks on it: a send either completes, or reports would-block and
//! the worker retries when the front-end signals writability.

use core_wire::{ClientMessage, DataHeader, MiniHeader};

/// One outbound frame: a marshalled message body plus its type code. The
/// transport prepends whichever header flavor the link negotiated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFrame {
    pub msg_type: u16,
    pub serial: u64,
    /// Offset of a sub-message list inside `body` (legacy header only);
    /// zero when absent.
    pub sub_list: u32,
    pub body: Vec<u8>,
}

impl WireFrame {
    pub fn new(msg_type: u16, body: Vec<u8>) -> Self {
        Self {
            msg_type,
            serial: 0,
            sub_list: 0,
            body,
        }
    }

    pub fn mini_header(&self) -> MiniHeader {
        MiniHeader {
            msg_type: self.msg_type,
            size: self.body.len() as u32,
        }
    }

    pub fn data_header(&self) -> DataHeader {
        DataHeader {
            serial: self.serial,
            msg_type: self.msg_type,
            size: self.body.len() as u32,
            sub_list: self.sub_list,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Socket buffer full: the frame was not consumed; retry the same frame
    /// when the transport reports writable again.
    WouldBlock,
    /// Peer is gone; the caller must tear the client down.
    Closed,
}

pub trait ClientTransport: Send {
    /// Try to send one frame without blocking.
    fn try_send(&mut self, frame: &WireFrame) -> SendOutcome;

    /// Non-blocking read of the next parsed client message.
    fn poll_recv(&mut self) -> Option<ClientMessage>;

    /// True when a previously blocked send may be retried.
    fn writable(&self) -> bool;

    /// Round-trip estimate in bits/s measured by the front-end during link
    /// setup; drives stream bit-rate clamping. `None` when unmeasured.
    fn measured_bitrate(&self) -> Option<u64> {
        None
    }

    /// Whether the link was classified low-latency at setup (LAN vs WAN);
    /// picks the ack-window size.
    fn low_latency(&self) -> bool {
        true
    }
}
