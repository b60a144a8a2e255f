//! Versioned migration-data blob for a display subclient.
//!
//! Carries everything a target server needs to adopt a mid-session client:
//! the channel serial, the pixmap cache identity with its per-subclient
//! serial vector, and the GLZ dictionary id plus window restore state.
//! Readers refuse versions older than their own rather than guessing at
//! missing fields.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Read;

use crate::WireError;

pub const MIGRATE_DATA_MAGIC: u32 = u32::from_le_bytes(*b"VDMD");
pub const MIGRATE_DATA_VERSION: u32 = 2;

/// Serial-vector width mirrored from the cache layer; the wire format is
/// fixed independent of the in-memory constant.
pub const MIGRATE_CACHE_CLIENTS: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlzDictRestore {
    pub head: u64,
    pub window: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayMigrateData {
    pub message_serial: u64,
    pub pixmap_cache_frozen: bool,
    pub pixmap_cache_id: u64,
    pub pixmap_cache_size: u64,
    pub pixmap_cache_sync: [u64; MIGRATE_CACHE_CLIENTS],
    pub glz_dict_id: u64,
    pub glz_dict_restore: GlzDictRestore,
}

impl DisplayMigrateData {
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.write_u32::<LittleEndian>(MIGRATE_DATA_MAGIC).unwrap();
        out.write_u32::<LittleEndian>(MIGRATE_DATA_VERSION).unwrap();
        out.write_u64::<LittleEndian>(self.message_serial).unwrap();
        out.write_u8(self.pixmap_cache_frozen as u8).unwrap();
        out.write_u64::<LittleEndian>(self.pixmap_cache_id).unwrap();
        out.write_u64::<LittleEndian>(self.pixmap_cache_size).unwrap();
        for s in &self.pixmap_cache_sync {
            out.write_u64::<LittleEndian>(*s).unwrap();
        }
        out.write_u64::<LittleEndian>(self.glz_dict_id).unwrap();
        out.write_u64::<LittleEndian>(self.glz_dict_restore.head).unwrap();
        out.write_u64::<LittleEndian>(self.glz_dict_restore.window.len() as u64)
            .unwrap();
        out.extend_from_slice(&self.glz_dict_restore.window);
        out
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self, WireError> {
        let mut r = data;
        if r.read_u32::<LittleEndian>()? != MIGRATE_DATA_MAGIC {
            return Err(WireError::BadMagic);
        }
        let version = r.read_u32::<LittleEndian>()?;
        if version != MIGRATE_DATA_VERSION {
            return Err(WireError::UnsupportedVersion(version));
        }
        let message_serial = r.read_u64::<LittleEndian>()?;
        let pixmap_cache_frozen = r.read_u8()? != 0;
        let pixmap_cache_id = r.read_u64::<LittleEndian>()?;
        let pixmap_cache_size = r.read_u64::<LittleEndian>()?;
        let mut pixmap_cache_sync = [0u64; MIGRATE_CACHE_CLIENTS];
        for s in &mut pixmap_cache_sync {
            *s = r.read_u64::<LittleEndian>()?;
        }
        let glz_dict_id = r.read_u64::<LittleEndian>()?;
        let head = r.read_u64::<LittleEndian>()?;
        let window_len = r.read_u64::<LittleEndian>()? as usize;
        if r.len() < window_len {
            return Err(WireError::Truncated);
        }
        let mut window = vec![0; window_len];
        r.read_exact(&mut window)?;
        Ok(Self {
            message_serial,
            pixmap_cache_frozen,
            pixmap_cache_id,
            pixmap_cache_size,
            pixmap_cache_sync,
            glz_dict_id,
            glz_dict_restore: GlzDictRestore { head, window },
        })
    }
}
