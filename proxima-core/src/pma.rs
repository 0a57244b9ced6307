//! Physical memory attributes: a small ordered table describing what kinds of
//! access a guest physical range supports.

use crate::AddressRange;
use bitflags::bitflags;
use thiserror::Error;

bitflags! {
    /// Attributes of a physical memory range.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PmaFlags: u32 {
        /// Loads are permitted.
        const READ = 1 << 0;
        /// Stores are permitted.
        const WRITE = 1 << 1;
        /// Instruction fetches are permitted.
        const EXEC = 1 << 2;
        /// The range behaves as idempotent main memory.
        const CACHEABLE = 1 << 3;
        /// The range is an I/O region; accesses may have side effects.
        const IO = 1 << 4;
    }
}

/// Number of entries a [`PmaTable`] can hold.
pub const PMA_ENTRIES: usize = 8;

#[derive(Debug, Clone, Copy)]
struct PmaEntry {
    range: AddressRange,
    flags: PmaFlags,
}

/// Ordered table of physical memory attributes, consulted after translation.
///
/// Lookup probes entries in insertion order and the first range containing the
/// address wins. The table is populated at setup time (one entry per mapped
/// segment, typically) and read-only during interpretation.
#[derive(Debug, Default)]
pub struct PmaTable {
    entries: Vec<PmaEntry>,
}

impl PmaTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry. The table has a fixed capacity of [`PMA_ENTRIES`].
    pub fn insert(&mut self, range: AddressRange, flags: PmaFlags) -> Result<(), PmaTableFullError> {
        if self.entries.len() == PMA_ENTRIES {
            return Err(PmaTableFullError);
        }
        self.entries.push(PmaEntry { range, flags });
        Ok(())
    }

    /// Return the attributes of the first entry containing `pa`, or `None` if
    /// no entry matches.
    pub fn lookup(&self, pa: u64) -> Option<PmaFlags> {
        self.entries
            .iter()
            .find(|entry| entry.range.contains(pa))
            .map(|entry| entry.flags)
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Attempt to insert into a table that already holds [`PMA_ENTRIES`] entries.
#[derive(Error, Debug, Clone)]
#[error("physical memory attributes table is full")]
pub struct PmaTableFullError;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_range;

    #[test]
    fn test_lookup_first_match_wins() {
        let mut pma = PmaTable::new();
        pma.insert(address_range![0x1000, 0x1FFF], PmaFlags::READ)
            .unwrap();
        pma.insert(
            address_range![0x1800, 0x2FFF],
            PmaFlags::READ | PmaFlags::WRITE,
        )
        .unwrap();
        assert_eq!(Some(PmaFlags::READ), pma.lookup(0x1800));
        assert_eq!(Some(PmaFlags::READ | PmaFlags::WRITE), pma.lookup(0x2000));
        assert_eq!(None, pma.lookup(0x3000));
    }

    #[test]
    fn test_capacity() {
        let mut pma = PmaTable::new();
        for i in 0..PMA_ENTRIES as u64 {
            pma.insert(
                address_range![i * 0x1000, i * 0x1000 + 0xFFF],
                PmaFlags::READ,
            )
            .unwrap();
        }
        assert!(pma
            .insert(address_range![0x9000_0000, 0x9000_0FFF], PmaFlags::READ)
            .is_err());
        pma.clear();
        assert!(pma
            .insert(address_range![0x9000_0000, 0x9000_0FFF], PmaFlags::READ)
            .is_ok());
    }
}
