//! Paged address-translation modes and page-table entries.

use bitflags::bitflags;
use std::fmt;

/// Number of page-offset bits; pages are 4 KiB in every supported mode.
pub const PAGE_SHIFT: u32 = 12;

/// Size of a page in bytes.
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Mask selecting the page-offset bits of an address.
pub const PAGE_MASK: u64 = PAGE_SIZE - 1;

/// Address-translation mode configured in `mstatus.VM`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum VmMode {
    /// Translation disabled; virtual addresses are physical addresses.
    Mbare,
    /// Two-level paging over a 32-bit virtual address space.
    Sv32,
    /// Three-level paging over a 39-bit virtual address space.
    Sv39,
    /// Four-level paging over a 48-bit virtual address space.
    Sv48,
}

impl VmMode {
    /// Decode the 5-bit `mstatus.VM` field. Returns `None` for encodings this
    /// implementation does not support.
    pub fn from_field(field: u8) -> Option<Self> {
        match field {
            0 => Some(Self::Mbare),
            8 => Some(Self::Sv32),
            9 => Some(Self::Sv39),
            10 => Some(Self::Sv48),
            _ => None,
        }
    }

    /// Encode back to the `mstatus.VM` field value.
    pub fn to_field(self) -> u8 {
        match self {
            Self::Mbare => 0,
            Self::Sv32 => 8,
            Self::Sv39 => 9,
            Self::Sv48 => 10,
        }
    }

    /// The walk parameters of this mode, or `None` for bare.
    pub fn ptm(self) -> Option<Ptm> {
        match self {
            Self::Mbare => None,
            Self::Sv32 => Some(SV32),
            Self::Sv39 => Some(SV39),
            Self::Sv48 => Some(SV48),
        }
    }
}

impl fmt::Display for VmMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match *self {
            VmMode::Mbare => "mbare",
            VmMode::Sv32 => "sv32",
            VmMode::Sv39 => "sv39",
            VmMode::Sv48 => "sv48",
        })
    }
}

/// Shape of one paged translation mode: how many radix levels the table tree
/// has, how many virtual-address bits each level translates, and how wide its
/// page-table entries are.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Ptm {
    /// Number of page-table levels.
    pub levels: u32,
    /// Virtual-address bits translated per level.
    pub bits: u32,
    /// Size of a page-table entry in bytes.
    pub pte_size: u64,
    /// Width of the physical page number field in a page-table entry.
    pub pte_ppn_bits: u32,
}

pub const SV32: Ptm = Ptm {
    levels: 2,
    bits: 10,
    pte_size: 4,
    pte_ppn_bits: 22,
};

pub const SV39: Ptm = Ptm {
    levels: 3,
    bits: 9,
    pte_size: 8,
    pte_ppn_bits: 44,
};

pub const SV48: Ptm = Ptm {
    levels: 4,
    bits: 9,
    pte_size: 8,
    pte_ppn_bits: 44,
};

bitflags! {
    /// Flag bits of a page-table entry (the low byte of the entry).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u8 {
        /// Entry is valid.
        const V = 1 << 0;
        /// Page is readable.
        const R = 1 << 1;
        /// Page is writable.
        const W = 1 << 2;
        /// Page is executable.
        const X = 1 << 3;
        /// Page is accessible in user mode.
        const U = 1 << 4;
        /// Mapping is global across address spaces.
        const G = 1 << 5;
        /// Page has been accessed.
        const A = 1 << 6;
        /// Page has been written.
        const D = 1 << 7;
    }
}

/// A decoded page-table entry.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Pte {
    flags: PteFlags,
    ppn: u64,
}

impl Pte {
    /// Decode a raw entry as read from guest memory, under mode `ptm`.
    pub fn from_raw(raw: u64, ptm: Ptm) -> Self {
        Self {
            flags: PteFlags::from_bits_truncate((raw & 0xFF) as u8),
            ppn: (raw >> 10) & ((1u64 << ptm.pte_ppn_bits) - 1),
        }
    }

    /// Encode an entry for writing into a page table. For a non-leaf entry
    /// `ppn` is the byte address of the next-level table; for a leaf it is a
    /// page-frame number.
    pub fn encode(ppn: u64, flags: PteFlags) -> u64 {
        (ppn << 10) | flags.bits() as u64
    }

    pub fn flags(self) -> PteFlags {
        self.flags
    }

    pub fn ppn(self) -> u64 {
        self.ppn
    }

    /// An entry with `V = 0`, or with the reserved combination `R = 0, W = 1`,
    /// terminates the walk with a translation fault.
    pub fn is_invalid(self) -> bool {
        !self.flags.contains(PteFlags::V)
            || (!self.flags.contains(PteFlags::R) && self.flags.contains(PteFlags::W))
    }

    /// An entry with `R = 1` or `X = 1` is a leaf; anything else points at the
    /// next table level.
    pub fn is_leaf(self) -> bool {
        self.flags.intersects(PteFlags::R | PteFlags::X)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_mode_field_roundtrip() {
        for mode in [VmMode::Mbare, VmMode::Sv32, VmMode::Sv39, VmMode::Sv48] {
            assert_eq!(Some(mode), VmMode::from_field(mode.to_field()));
        }
        assert_eq!(None, VmMode::from_field(1));
        assert_eq!(None, VmMode::from_field(11));
    }

    #[test]
    fn test_pte_decode() {
        let raw = Pte::encode(0x80000, PteFlags::V | PteFlags::R | PteFlags::X);
        let pte = Pte::from_raw(raw, SV39);
        assert_eq!(0x80000, pte.ppn());
        assert!(pte.is_leaf());
        assert!(!pte.is_invalid());
    }

    #[test]
    fn test_pte_invalid_encodings() {
        // V = 0.
        let pte = Pte::from_raw(Pte::encode(0x1, PteFlags::R), SV32);
        assert!(pte.is_invalid());
        // Reserved: writable but not readable.
        let pte = Pte::from_raw(Pte::encode(0x1, PteFlags::V | PteFlags::W), SV32);
        assert!(pte.is_invalid());
        // Writable and readable is fine.
        let pte = Pte::from_raw(
            Pte::encode(0x1, PteFlags::V | PteFlags::R | PteFlags::W),
            SV32,
        );
        assert!(!pte.is_invalid());
    }

    #[test]
    fn test_pte_leaf_detection() {
        let non_leaf = Pte::from_raw(Pte::encode(0x2000, PteFlags::V), SV39);
        assert!(!non_leaf.is_leaf());
        assert!(!non_leaf.is_invalid());
        let exec_only = Pte::from_raw(Pte::encode(0x2000, PteFlags::V | PteFlags::X), SV39);
        assert!(exec_only.is_leaf());
    }

    #[test]
    fn test_pte_ppn_width() {
        // Bits above the mode's PPN width are ignored.
        let raw = Pte::encode(1u64 << 50, PteFlags::V | PteFlags::R);
        assert_eq!(0, Pte::from_raw(raw, SV39).ppn());
        let raw = Pte::encode(1u64 << 21, PteFlags::V | PteFlags::R);
        assert_eq!(1 << 21, Pte::from_raw(raw, SV32).ppn());
    }
}
