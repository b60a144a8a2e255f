//! Guest memory-slot translator interface.
//!
//! Guest addresses embed `(generation, slot_id, offset)` in configurable
//! bit splits. The device validates and copies pixel payloads before they
//! reach the worker, so the core never dereferences these — the translator
//! lives here for the device glue and for validating loadvm command
//! streams. A stale generation means the guest reused a slot id after a
//! reset; such addresses must be refused, never truncated into range.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SlotError {
    #[error("slot group {0} out of range")]
    BadGroup(u32),
    #[error("slot id {0} out of range")]
    BadSlot(u32),
    #[error("slot generation mismatch: address has {addr}, slot has {slot}")]
    StaleGeneration { addr: u8, slot: u8 },
    #[error("address offset {offset:#x} outside slot of {len:#x} bytes")]
    OutOfRange { offset: u64, len: u64 },
    #[error("slot not present")]
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemSlotConfig {
    pub num_groups: u32,
    pub num_slots: u32,
    pub generation_bits: u8,
    pub id_bits: u8,
}

impl MemSlotConfig {
    fn addr_bits(&self) -> u8 {
        64 - self.generation_bits - self.id_bits
    }
}

/// One registered slot: a validated span of guest memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemSlot {
    pub group_id: u32,
    pub slot_id: u32,
    pub generation: u8,
    pub start: u64,
    pub len: u64,
}

pub struct SlotMap {
    config: MemSlotConfig,
    slots: Vec<Vec<Option<MemSlot>>>,
}

impl SlotMap {
    pub fn new(config: MemSlotConfig) -> Self {
        let slots = (0..config.num_groups)
            .map(|_| vec![None; config.num_slots as usize])
            .collect();
        Self { config, slots }
    }

    pub fn config(&self) -> MemSlotConfig {
        self.config
    }

    pub fn add(&mut self, slot: MemSlot) -> Result<(), SlotError> {
        let group = self
            .slots
            .get_mut(slot.group_id as usize)
            .ok_or(SlotError::BadGroup(slot.group_id))?;
        let entry = group
            .get_mut(slot.slot_id as usize)
            .ok_or(SlotError::BadSlot(slot.slot_id))?;
        *entry = Some(slot);
        Ok(())
    }

    pub fn del(&mut self, group_id: u32, slot_id: u32) -> Result<(), SlotError> {
        let group = self
            .slots
            .get_mut(group_id as usize)
            .ok_or(SlotError::BadGroup(group_id))?;
        let entry = group
            .get_mut(slot_id as usize)
            .ok_or(SlotError::BadSlot(slot_id))?;
        *entry = None;
        Ok(())
    }

    pub fn reset(&mut self) {
        for group in &mut self.slots {
            group.fill(None);
        }
    }

    /// Split a guest address into (generation, slot_id, offset) per the
    /// configured bit layout and validate it, returning the offset into the
    /// slot's span.
    pub fn translate(&self, group_id: u32, addr: u64) -> Result<u64, SlotError> {
        let cfg = &self.config;
        let addr_bits = cfg.addr_bits();
        let generation = (addr >> (64 - cfg.generation_bits)) as u8;
        let slot_id = ((addr >> addr_bits) & ((1u64 << cfg.id_bits) - 1)) as u32;
        let offset = addr & ((1u64 << addr_bits) - 1);

        let group = self
            .slots
            .get(group_id as usize)
            .ok_or(SlotError::BadGroup(group_id))?;
        let slot = group
            .get(slot_id as usize)
            .ok_or(SlotError::BadSlot(slot_id))?
            .as_ref()
            .ok_or(SlotError::Missing)?;
        if slot.generation != generation {
            return Err(SlotError::StaleGeneration {
                addr: generation,
                slot: slot.generation,
            });
        }
        if offset >= slot.len {
            return Err(SlotError::OutOfRange {
                offset,
                len: slot.len,
            });
        }
        Ok(slot.start + offset)
    }

    /// Compose an address the way the guest would; the inverse of
    /// [`translate`](Self::translate), used by tests and loadvm replay.
    pub fn compose(&self, slot: &MemSlot, offset: u64) -> u64 {
        let cfg = &self.config;
        ((slot.generation as u64) << (64 - cfg.generation_bits))
            | ((slot.slot_id as u64) << cfg.addr_bits())
            | offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> MemSlotConfig {
        MemSlotConfig {
            num_groups: 2,
            num_slots: 4,
            generation_bits: 8,
            id_bits: 8,
        }
    }

    fn slot() -> MemSlot {
        MemSlot {
            group_id: 1,
            slot_id: 2,
            generation: 5,
            start: 0x10_0000,
            len: 0x1000,
        }
    }

    #[test]
    fn translate_round_trip() {
        let mut map = SlotMap::new(config());
        map.add(slot()).unwrap();
        let addr = map.compose(&slot(), 0x42);
        assert_eq!(map.translate(1, addr).unwrap(), 0x10_0042);
    }

    #[test]
    fn stale_generation_refused() {
        let mut map = SlotMap::new(config());
        map.add(slot()).unwrap();
        let mut old = slot();
        old.generation = 4;
        let addr = map.compose(&old, 0x42);
        assert_eq!(
            map.translate(1, addr),
            Err(SlotError::StaleGeneration { addr: 4, slot: 5 })
        );
    }

    #[test]
    fn out_of_range_offset_refused() {
        let mut map = SlotMap::new(config());
        map.add(slot()).unwrap();
        let addr = map.compose(&slot(), 0x1000);
        assert!(matches!(
            map.translate(1, addr),
            Err(SlotError::OutOfRange { .. })
        ));
    }

    #[test]
    fn del_and_reset() {
        let mut map = SlotMap::new(config());
        map.add(slot()).unwrap();
        map.del(1, 2).unwrap();
        let addr = map.compose(&slot(), 0);
        assert_eq!(map.translate(1, addr), Err(SlotError::Missing));

        map.add(slot()).unwrap();
        map.reset();
        assert_eq!(map.translate(1, addr), Err(SlotError::Missing));
    }

    #[test]
    fn bad_group_and_slot() {
        let map = SlotMap::new(config());
        assert_eq!(map.translate(9, 0), Err(SlotError::BadGroup(9)));
        let mut bad_slot = slot();
        bad_slot.slot_id = 200;
        let mut map = SlotMap::new(config());
        assert_eq!(map.add(bad_slot), Err(SlotError::BadSlot(200)));
    }
}
