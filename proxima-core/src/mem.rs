//! Guest physical memory: a map of non-overlapping machine-physical address
//! ranges onto host-owned byte buffers.

use crate::address_range::InvalidBoundsError;
use crate::AddressRange;
use bitflags::bitflags;
use log::debug;
use rangemap::RangeInclusiveMap;
use thiserror::Error;

bitflags! {
    /// Access kinds a mapped segment was created with.
    ///
    /// These mirror the ELF `p_flags` bits of the segment the loader mapped.
    /// The memory map itself never enforces them; permission checking is the
    /// PMA table's job.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Prot: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

/// A contiguous run of guest physical memory backed by a host buffer.
#[derive(Debug)]
struct Segment {
    base: u64,
    data: Vec<u8>,
    prot: Prot,
}

/// Bounded view into a mapped segment, produced by [`GuestMemory::mpa_to_host`].
///
/// A `HostRef` is only meaningful against the map state it was produced from.
/// The map is mutated only outside interpretation (by the loader and at
/// teardown), so within a single access this cannot be violated; using a stale
/// reference after an `unmap` is a programming error and panics.
#[derive(Debug, Clone, Copy)]
pub struct HostRef {
    segment: usize,
    offset: usize,
    len: usize,
}

/// Map of guest machine-physical address ranges to host-accessible memory.
///
/// Ranges never overlap. Lookups resolve in `O(log n)` through an ordered
/// range map; an address outside every mapped range resolves to nothing (the
/// caller reports that as an access fault — the map itself has no failure
/// channel).
#[derive(Debug, Default)]
pub struct GuestMemory {
    /// Map of guest physical range to index in `segments` of the backing
    /// segment. Indices stay stable across `unmap` so that the values stored
    /// here never dangle; freed slots are tombstoned instead of removed.
    regions: RangeInclusiveMap<u64, usize>,
    segments: Vec<Option<Segment>>,
}

impl GuestMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a zero-filled segment of `length` bytes at `mpa_base`.
    ///
    /// Fails if the range is empty, wraps the address space, or overlaps a
    /// previously mapped segment.
    pub fn map(&mut self, mpa_base: u64, length: u64, prot: Prot) -> Result<(), MemoryMapError> {
        const_assert!(usize::BITS >= 64);
        let range = AddressRange::from_base_and_length(mpa_base, length)?;
        if self.regions.overlaps(&range.into()) {
            return Err(MemoryMapError::Overlapping(range));
        }
        debug!("map segment {} prot={:?}", range, prot);
        let index = self.segments.len();
        self.segments.push(Some(Segment {
            base: mpa_base,
            data: vec![0u8; length as usize],
            prot,
        }));
        self.regions.insert(range.into(), index);
        Ok(())
    }

    /// Remove all mappings intersecting `[mpa_base, mpa_base + length)`.
    ///
    /// Partially covered segments stay mapped outside the removed range.
    pub fn unmap(&mut self, mpa_base: u64, length: u64) {
        let Ok(range) = AddressRange::from_base_and_length(mpa_base, length) else {
            return;
        };
        debug!("unmap {}", range);
        self.regions.remove(range.into());
        // Release backing buffers that no remaining region refers to.
        for index in 0..self.segments.len() {
            if self.segments[index].is_some()
                && !self.regions.iter().any(|(_, &value)| value == index)
            {
                self.segments[index] = None;
            }
        }
    }

    /// Remove every mapping. Called at interpreter teardown.
    pub fn unmap_all(&mut self) {
        self.regions.clear();
        self.segments.clear();
    }

    /// Resolve a guest machine-physical address to a host reference covering
    /// `len` bytes, or `None` if any byte of the window falls outside the
    /// mapped region containing `mpa`.
    pub fn mpa_to_host(&self, mpa: u64, len: usize) -> Option<HostRef> {
        let (range, &index) = self.regions.get_key_value(&mpa)?;
        let available = range.end() - mpa + 1;
        if len as u64 > available {
            return None;
        }
        let segment = self.segment(index);
        Some(HostRef {
            segment: index,
            offset: (mpa - segment.base) as usize,
            len,
        })
    }

    /// Borrow the bytes a [`HostRef`] designates.
    pub fn bytes(&self, host_ref: &HostRef) -> &[u8] {
        let segment = self.segment(host_ref.segment);
        &segment.data[host_ref.offset..host_ref.offset + host_ref.len]
    }

    /// Mutably borrow the bytes a [`HostRef`] designates.
    pub fn bytes_mut(&mut self, host_ref: &HostRef) -> &mut [u8] {
        let segment = match &mut self.segments[host_ref.segment] {
            Some(segment) => segment,
            None => unreachable!("host reference outlived its segment"),
        };
        &mut segment.data[host_ref.offset..host_ref.offset + host_ref.len]
    }

    /// Iterate over the mapped ranges and their protections, in address order.
    pub fn regions(&self) -> impl Iterator<Item = (AddressRange, Prot)> + '_ {
        self.regions.iter().map(|(range, &index)| {
            (
                AddressRange::new(*range.start(), *range.end()).unwrap(),
                self.segment(index).prot,
            )
        })
    }

    fn segment(&self, index: usize) -> &Segment {
        match &self.segments[index] {
            Some(segment) => segment,
            None => unreachable!("region map referenced a freed segment"),
        }
    }
}

#[derive(Error, Debug)]
pub enum MemoryMapError {
    /// Attempt to map a range that overlaps a previously mapped range.
    #[error("segment {0} overlaps a previously mapped segment")]
    Overlapping(AddressRange),
    #[error(transparent)]
    InvalidBounds(#[from] InvalidBoundsError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapped() -> GuestMemory {
        let mut mem = GuestMemory::new();
        mem.map(0x1000, 0x1000, Prot::READ | Prot::WRITE).unwrap();
        mem.map(0x4000, 0x2000, Prot::READ | Prot::EXEC).unwrap();
        mem
    }

    #[test]
    fn test_map_rejects_overlap() {
        let mut mem = mapped();
        assert!(matches!(
            mem.map(0x1800, 0x1000, Prot::READ),
            Err(MemoryMapError::Overlapping(_))
        ));
        assert!(matches!(
            mem.map(0x0, 0x1001, Prot::READ),
            Err(MemoryMapError::Overlapping(_))
        ));
        // Adjacent is fine.
        mem.map(0x2000, 0x1000, Prot::READ).unwrap();
    }

    #[test]
    fn test_map_rejects_empty_and_wrapping() {
        let mut mem = GuestMemory::new();
        assert!(mem.map(0x1000, 0, Prot::READ).is_err());
        assert!(mem.map(u64::MAX, 2, Prot::READ).is_err());
    }

    #[test]
    fn test_mpa_to_host_bounds() {
        let mem = mapped();
        assert!(mem.mpa_to_host(0xFFF, 1).is_none());
        assert!(mem.mpa_to_host(0x1000, 1).is_some());
        assert!(mem.mpa_to_host(0x1FFF, 1).is_some());
        assert!(mem.mpa_to_host(0x2000, 1).is_none());
        // A window may not cross the end of its region, even into another.
        assert!(mem.mpa_to_host(0x1FFF, 2).is_none());
        assert!(mem.mpa_to_host(0x5FFF, 2).is_none());
    }

    #[test]
    fn test_read_write_roundtrip() {
        let mut mem = mapped();
        let host_ref = mem.mpa_to_host(0x1004, 4).unwrap();
        mem.bytes_mut(&host_ref).copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(&[1, 2, 3, 4], mem.bytes(&host_ref));
        // Freshly mapped memory is zero-filled.
        let zeroes = mem.mpa_to_host(0x1008, 4).unwrap();
        assert_eq!(&[0, 0, 0, 0], mem.bytes(&zeroes));
    }

    #[test]
    fn test_unmap() {
        let mut mem = mapped();
        mem.unmap(0x1000, 0x1000);
        assert!(mem.mpa_to_host(0x1000, 1).is_none());
        assert!(mem.mpa_to_host(0x4000, 1).is_some());
        mem.unmap_all();
        assert!(mem.mpa_to_host(0x4000, 1).is_none());
    }

    #[test]
    fn test_partial_unmap_keeps_remainder() {
        let mut mem = mapped();
        mem.unmap(0x4000, 0x1000);
        assert!(mem.mpa_to_host(0x4000, 1).is_none());
        let host_ref = mem.mpa_to_host(0x5000, 0x1000).unwrap();
        assert_eq!(0x1000, mem.bytes(&host_ref).len());
    }

    #[test]
    fn test_regions_iterator() {
        let mem = mapped();
        let regions: Vec<_> = mem.regions().collect();
        assert_eq!(2, regions.len());
        assert_eq!(0x1000, regions[0].0.start());
        assert_eq!(Prot::READ | Prot::EXEC, regions[1].1);
    }
}
