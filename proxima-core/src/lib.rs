//! User-mode RISC-V emulation core.
//!
//! The crate is organized around a [`hart::Hart`]: the architectural state of a
//! single hardware thread plus the software MMU through which every one of its
//! memory accesses is routed. The MMU pieces (guest memory map, PMA table,
//! split TLB, page-table walker) live in their own modules and are usable on
//! their own; the hart ties them to an interpreter for the base integer ISA.
//!
//! Addresses are handled as `u64` internally regardless of the guest's XLEN;
//! the [`Xlen`] axis only controls how register values and virtual addresses
//! are narrowed at the architectural boundary.

#[macro_use]
extern crate static_assertions;

use std::fmt;

pub mod address_range;
pub mod hart;
pub mod instruction;
pub mod mem;
pub mod paging;
pub mod pma;
pub mod registers;
pub mod tlb;

/// Re-export of [`AddressRange`](address_range::AddressRange) for convenience.
pub use address_range::AddressRange;

/// Base integer register width of a hart, as a type-level parameter.
///
/// Implemented by the uninhabited markers [`Rv32`] and [`Rv64`]. All values are
/// carried as `u64` in *canonical form* (sign-extended from XLEN bits); the
/// trait provides the two narrowing rules that differ per width.
pub trait Xlen: 'static + Copy + Clone + Eq + PartialEq + fmt::Debug {
    /// Width of an integer register / virtual address in bits.
    const BITS: u32;

    /// Mask selecting the low `BITS` bits of a `u64`.
    const MASK: u64;

    /// Number of low bits of `sptbr` that hold the root page-table pointer.
    /// The remaining high bits are reserved for the address-space identifier.
    const PPN_BITS: u32;

    /// Exclusive top of the guest's user address space. The proxy stack is
    /// mapped directly below this address.
    const MEMORY_TOP: u64;

    /// Truncate `value` to XLEN bits and sign-extend back to 64 bits.
    ///
    /// This is the canonical form in which register values are stored.
    fn sext(value: u64) -> u64;

    /// Truncate `value` to XLEN bits, zero-extending. This is the form in
    /// which virtual addresses enter the MMU.
    fn zext(value: u64) -> u64 {
        value & Self::MASK
    }
}

/// Marker for a 32-bit base ISA (RV32).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Rv32 {}

/// Marker for a 64-bit base ISA (RV64).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Rv64 {}

impl Xlen for Rv32 {
    const BITS: u32 = 32;
    const MASK: u64 = 0xFFFF_FFFF;
    const PPN_BITS: u32 = 22;
    const MEMORY_TOP: u64 = 0x8000_0000;

    fn sext(value: u64) -> u64 {
        value as u32 as i32 as i64 as u64
    }
}

impl Xlen for Rv64 {
    const BITS: u32 = 64;
    const MASK: u64 = u64::MAX;
    const PPN_BITS: u32 = 38;
    const MEMORY_TOP: u64 = 0x7FFF_FFFF_F000;

    fn sext(value: u64) -> u64 {
        value
    }
}

/// List of defined privilege levels for RISC-V.
///
/// A privilege level is always referenced by two bits; only levels `0`, `1`,
/// and `3` are defined, level `2` is reserved.
///
/// > The machine level has the highest privileges and is the only mandatory
/// > privilege level for a RISC-V hardware platform. User-mode (U-mode) and
/// > supervisor-mode (S-mode) are intended for conventional application and
/// > operating system usage respectively.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum PrivilegeLevel {
    /// User/application (abbreviated `U`) is the lowest privilege level.
    User = 0,
    /// Supervisor (abbreviated `S`) is an intermediate privilege level.
    Supervisor = 1,
    // Level 2 is reserved
    /// Machine (abbreviated `M`) is the highest privilege level.
    Machine = 3,
}

impl fmt::Display for PrivilegeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match *self {
            PrivilegeLevel::User => "U",
            PrivilegeLevel::Supervisor => "S",
            PrivilegeLevel::Machine => "M",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sext_rv32() {
        assert_eq!(0, Rv32::sext(0));
        assert_eq!(0x7FFF_FFFF, Rv32::sext(0x7FFF_FFFF));
        assert_eq!(0xFFFF_FFFF_8000_0000, Rv32::sext(0x8000_0000));
        assert_eq!(0xFFFF_FFFF_FFFF_FFFF, Rv32::sext(0x1_FFFF_FFFF));
    }

    #[test]
    fn test_zext_rv32() {
        assert_eq!(0x8000_0000, Rv32::zext(0xFFFF_FFFF_8000_0000));
        assert_eq!(0x1234, Rv32::zext(0x1234));
    }

    #[test]
    fn test_rv64_is_identity() {
        assert_eq!(u64::MAX, Rv64::sext(u64::MAX));
        assert_eq!(u64::MAX, Rv64::zext(u64::MAX));
        assert_eq!(0x8000_0000, Rv64::sext(0x8000_0000));
    }
}
