//! Client wire protocol: framing, message types, and marshalling.
//!
//! The transport below this crate moves opaque frames; everything about
//! their shape lives here. Frames start with either the 6-byte mini header
//! (`{type: u16, size: u32}`) or the legacy data header that additionally
//! carries the channel serial and a sub-message list offset. All integers
//! are little-endian.
//!
//! This crate has no opinion about *when* messages are sent — ordering,
//! ack windows, and cache coherence live in the display pipeline. It only
//! guarantees that what is marshalled here unmarshals identically on the
//! other side, which the round-trip tests pin down.

pub mod migrate;
pub mod msg;
pub mod types;

use thiserror::Error;

pub use migrate::{DisplayMigrateData, GlzDictRestore, MIGRATE_DATA_MAGIC, MIGRATE_DATA_VERSION};
pub use msg::{ClientMessage, DisplayMsg, CursorMsg};
pub use types::{
    ClipWire, ImageData, ImageDescriptor, ImageFlags, ImageWire, ImageWireKind, WireWaitForChannels,
};

#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame truncated")]
    Truncated,
    #[error("bad magic")]
    BadMagic,
    #[error("unsupported migration data version {0}")]
    UnsupportedVersion(u32),
    #[error("unknown message type {0}")]
    UnknownMessage(u16),
    #[error("unknown image kind {0}")]
    UnknownImageKind(u8),
    #[error("unknown enum value {0}")]
    BadEnum(u32),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// 6-byte header used by current clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MiniHeader {
    pub msg_type: u16,
    pub size: u32,
}

impl MiniHeader {
    pub const SIZE: usize = 6;

    pub fn marshal(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.msg_type.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < Self::SIZE {
            return Err(WireError::Truncated);
        }
        Ok(Self {
            msg_type: u16::from_le_bytes([data[0], data[1]]),
            size: u32::from_le_bytes([data[2], data[3], data[4], data[5]]),
        })
    }
}

/// Legacy header: serial plus a sub-message list offset. The free-list
/// mechanism uses the sub list to prepend cache waits to a draw message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    pub serial: u64,
    pub msg_type: u16,
    pub size: u32,
    pub sub_list: u32,
}

impl DataHeader {
    pub const SIZE: usize = 18;

    pub fn marshal(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.serial.to_le_bytes());
        out.extend_from_slice(&self.msg_type.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&self.sub_list.to_le_bytes());
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < Self::SIZE {
            return Err(WireError::Truncated);
        }
        Ok(Self {
            serial: u64::from_le_bytes(data[0..8].try_into().expect("sized")),
            msg_type: u16::from_le_bytes([data[8], data[9]]),
            size: u32::from_le_bytes(data[10..14].try_into().expect("sized")),
            sub_list: u32::from_le_bytes(data[14..18].try_into().expect("sized")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mini_header_round_trip() {
        let h = MiniHeader {
            msg_type: 302,
            size: 12345,
        };
        let mut buf = Vec::new();
        h.marshal(&mut buf);
        assert_eq!(buf.len(), MiniHeader::SIZE);
        assert_eq!(MiniHeader::unmarshal(&buf).unwrap(), h);
    }

    #[test]
    fn data_header_round_trip() {
        let h = DataHeader {
            serial: 0xDEAD_BEEF_0042,
            msg_type: 104,
            size: 9,
            sub_list: 6,
        };
        let mut buf = Vec::new();
        h.marshal(&mut buf);
        assert_eq!(buf.len(), DataHeader::SIZE);
        assert_eq!(DataHeader::unmarshal(&buf).unwrap(), h);
    }

    #[test]
    fn short_header_is_truncated() {
        assert!(matches!(
            MiniHeader::unmarshal(&[1, 2, 3]),
            Err(WireError::Truncated)
        ));
        assert!(matches!(
            DataHeader::unmarshal(&[0; 17]),
            Err(WireError::Truncated)
        ));
    }
}
