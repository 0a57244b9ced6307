//! The software MMU: address translation, access checking, and the typed
//! fetch/load/store entry points the interpreter uses.

use super::HartState;
use crate::mem::{GuestMemory, HostRef, MemoryMapError, Prot};
use crate::paging::{Pte, PteFlags, Ptm, PAGE_MASK, PAGE_SHIFT};
use crate::pma::{PmaFlags, PmaTable, PmaTableFullError};
use crate::tlb::Tlb;
use crate::{AddressRange, PrivilegeLevel, Xlen};
use log::debug;
use thiserror::Error;

/// Kind of memory access being translated and checked.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AccessType {
    Read,
    Write,
    Execute,
}

impl AccessType {
    fn access_fault(self) -> Fault {
        match self {
            AccessType::Read => Fault::LoadFault,
            AccessType::Write => Fault::StoreFault,
            AccessType::Execute => Fault::FetchFault,
        }
    }
}

/// Guest-visible failure of a memory access.
///
/// These six causes are the only way an access can fail architecturally; the
/// offending virtual address is stored in the hart's `badaddr` before the
/// fault is returned, and the error is folded up the call chain with `?`
/// until it reaches the interpreter's trap dispatch. Host-side inconsistency
/// (a corrupt region map, a stale host reference) is a programming error and
/// panics instead.
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
pub enum Fault {
    #[error("misaligned instruction fetch")]
    MisalignedFetch,
    #[error("instruction fetch access fault")]
    FetchFault,
    #[error("misaligned load")]
    MisalignedLoad,
    #[error("load access fault")]
    LoadFault,
    #[error("misaligned store")]
    MisalignedStore,
    #[error("store access fault")]
    StoreFault,
}

impl Fault {
    /// The architectural exception cause code.
    pub fn code(self) -> u32 {
        match self {
            Fault::MisalignedFetch => 0,
            Fault::FetchFault => 1,
            Fault::MisalignedLoad => 4,
            Fault::LoadFault => 5,
            Fault::MisalignedStore => 6,
            Fault::StoreFault => 7,
        }
    }
}

/// Record the faulting address and produce the fault for the caller to return.
fn fault<X: Xlen>(state: &mut HartState<X>, cause: Fault, va: u64) -> Fault {
    state.set_badaddr(va);
    cause
}

macro_rules! access_fns {
    ( $( $load_fn:ident, $store_fn:ident => $u:ident ),* $(,)? ) => {
        $(
            /// Load a naturally aligned value from virtual address `va`.
            pub fn $load_fn<X: Xlen>(
                &mut self,
                state: &mut HartState<X>,
                va: u64,
            ) -> Result<$u, Fault> {
                const SIZE: usize = std::mem::size_of::<$u>();
                let va = X::zext(va);
                if va & (SIZE as u64 - 1) != 0 {
                    return Err(fault(state, Fault::MisalignedLoad, va));
                }
                let host_ref = self.checked_access(state, va, SIZE, AccessType::Read)?;
                let mut buf = [0u8; SIZE];
                buf.copy_from_slice(self.mem.bytes(&host_ref));
                Ok($u::from_le_bytes(buf))
            }

            /// Store a naturally aligned value to virtual address `va`.
            ///
            /// A faulting store leaves guest memory untouched: every check
            /// runs before the first byte moves.
            pub fn $store_fn<X: Xlen>(
                &mut self,
                state: &mut HartState<X>,
                va: u64,
                value: $u,
            ) -> Result<(), Fault> {
                const SIZE: usize = std::mem::size_of::<$u>();
                let va = X::zext(va);
                if va & (SIZE as u64 - 1) != 0 {
                    return Err(fault(state, Fault::MisalignedStore, va));
                }
                let host_ref = self.checked_access(state, va, SIZE, AccessType::Write)?;
                self.mem
                    .bytes_mut(&host_ref)
                    .copy_from_slice(&value.to_le_bytes());
                Ok(())
            }
        )*
    };
}

/// The software MMU of one hart.
///
/// Owns the split instruction/data TLBs, the physical-memory attributes
/// table, and the guest physical memory image. Per-access processor state
/// (privilege mode, `mstatus`, `sptbr`, `badaddr`) is borrowed from the hart
/// for the duration of a single access; the MMU mutates only `badaddr`, and
/// only when faulting.
#[derive(Debug, Default)]
pub struct Mmu {
    /// L1 instruction TLB.
    l1_itlb: Tlb,
    /// L1 data TLB.
    l1_dtlb: Tlb,
    /// Physical memory attributes table.
    pma: PmaTable,
    /// Guest physical memory image.
    mem: GuestMemory,
}

impl Mmu {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read-only view of the guest physical memory map.
    pub fn memory(&self) -> &GuestMemory {
        &self.mem
    }

    /// Map a guest segment of `length` bytes at `mpa_base`, copying `image`
    /// into its start, and record its attributes in the PMA table.
    ///
    /// This is the loader's entry point for ELF segments; `prot` carries the
    /// segment's `p_flags`.
    pub fn map_segment(
        &mut self,
        mpa_base: u64,
        length: u64,
        image: &[u8],
        prot: Prot,
    ) -> Result<(), MapError> {
        if image.len() as u64 > length {
            return Err(MapError::ImageTooLarge);
        }
        let range =
            AddressRange::from_base_and_length(mpa_base, length).map_err(MemoryMapError::from)?;
        self.mem.map(mpa_base, length, prot)?;
        if !image.is_empty() {
            let host_ref = match self.mem.mpa_to_host(mpa_base, image.len()) {
                Some(host_ref) => host_ref,
                None => unreachable!("freshly mapped segment must resolve"),
            };
            self.mem.bytes_mut(&host_ref).copy_from_slice(image);
        }
        self.pma.insert(range, pma_flags(prot))?;
        Ok(())
    }

    /// Map a zero-filled read-write stack of `size` bytes ending at `top`.
    pub fn map_stack(&mut self, top: u64, size: u64) -> Result<(), MapError> {
        // A size exceeding `top` wraps and is rejected by the range check.
        let base = top.wrapping_sub(size);
        let range =
            AddressRange::from_base_and_length(base, size).map_err(MemoryMapError::from)?;
        self.mem.map(base, size, Prot::READ | Prot::WRITE)?;
        self.pma.insert(
            range,
            PmaFlags::READ | PmaFlags::WRITE | PmaFlags::CACHEABLE,
        )?;
        Ok(())
    }

    /// Map additional anonymous read-write memory (heap growth). No PMA entry
    /// is recorded; an address with no PMA entry carries no extra
    /// restrictions.
    pub fn map_heap(&mut self, mpa_base: u64, length: u64) -> Result<(), MemoryMapError> {
        self.mem.map(mpa_base, length, Prot::READ | Prot::WRITE)
    }

    /// Remove every mapping and cached translation. Called at teardown.
    pub fn unmap_all(&mut self) {
        self.mem.unmap_all();
        self.pma.clear();
        self.flush_tlb();
    }

    /// Empty both TLBs.
    pub fn flush_tlb(&mut self) {
        self.l1_itlb.flush();
        self.l1_dtlb.flush();
    }

    /// Fetch the instruction at `pc`.
    ///
    /// Returns the instruction word and its length in bytes. Instructions are
    /// stored as a sequence of 16-bit little-endian parcels; the low two bits
    /// of the first parcel distinguish a 16-bit instruction from a 32-bit
    /// one, so the alignment requirement is only 16 bits and the second
    /// parcel of a 32-bit instruction may live on the next page.
    pub fn fetch<X: Xlen>(
        &mut self,
        state: &mut HartState<X>,
        pc: u64,
    ) -> Result<(u32, u64), Fault> {
        let pc = X::zext(pc);
        if pc & 1 != 0 {
            return Err(fault(state, Fault::MisalignedFetch, pc));
        }
        let low = self.fetch_parcel(state, pc)?;
        if low & 0b11 != 0b11 {
            return Ok((low as u32, 2));
        }
        let high = self.fetch_parcel(state, X::zext(pc.wrapping_add(2)))?;
        Ok((((high as u32) << 16) | low as u32, 4))
    }

    fn fetch_parcel<X: Xlen>(&mut self, state: &mut HartState<X>, va: u64) -> Result<u16, Fault> {
        let host_ref = self.checked_access(state, va, 2, AccessType::Execute)?;
        let mut buf = [0u8; 2];
        buf.copy_from_slice(self.mem.bytes(&host_ref));
        Ok(u16::from_le_bytes(buf))
    }

    access_fns! {
        load_byte, store_byte => u8,
        load_halfword, store_halfword => u16,
        load_word, store_word => u32,
        load_doubleword, store_doubleword => u64,
    }

    /// Translate `va` and run the post-translation checks, in order:
    /// translation must yield a physical address, the physical address must
    /// resolve to host memory, and PMA attributes plus PTE flags must permit
    /// the access in the current mode. The first failing check selects the
    /// fault; alignment has already been checked by the caller.
    fn checked_access<X: Xlen>(
        &mut self,
        state: &mut HartState<X>,
        va: u64,
        size: usize,
        access_type: AccessType,
    ) -> Result<HostRef, Fault> {
        let (pa, pte_flags) = match self.translate(state, va, access_type) {
            Some(translation) => translation,
            None => return Err(fault(state, access_type.access_fault(), va)),
        };
        let host_ref = match self.mem.mpa_to_host(pa, size) {
            Some(host_ref) => host_ref,
            None => return Err(fault(state, access_type.access_fault(), va)),
        };
        if !self.check_pma(pa, access_type)
            || !check_pte(pte_flags, access_type, state.privilege_mode())
        {
            return Err(fault(state, access_type.access_fault(), va));
        }
        Ok(host_ref)
    }

    /// Pick the translation regime for this access.
    ///
    /// Machine mode with `MPRV` clear bypasses translation regardless of the
    /// configured mode; otherwise the `mstatus.VM` field decides. Returns the
    /// physical address and, for paged translation, the leaf PTE flags the
    /// permission check needs.
    fn translate<X: Xlen>(
        &mut self,
        state: &HartState<X>,
        va: u64,
        access_type: AccessType,
    ) -> Option<(u64, Option<PteFlags>)> {
        if state.privilege_mode() == PrivilegeLevel::Machine && !state.status().mprv() {
            return Some((va, None));
        }
        match state.status().vm().ptm() {
            None => Some((va, None)),
            Some(ptm) => self
                .page_translate(state, va, ptm, access_type)
                .map(|(pa, flags)| (pa, Some(flags))),
        }
    }

    /// Translate through the TLB, walking the page table on a miss.
    fn page_translate<X: Xlen>(
        &mut self,
        state: &HartState<X>,
        va: u64,
        ptm: Ptm,
        access_type: AccessType,
    ) -> Option<(u64, PteFlags)> {
        let asid = state.pdid();
        let root = state.sptbr() & ppn_mask::<X>();

        let tlb = match access_type {
            AccessType::Execute => &self.l1_itlb,
            _ => &self.l1_dtlb,
        };
        if let Some(entry) = tlb.lookup(asid, root, va) {
            return Some(((entry.ppn << PAGE_SHIFT) | (va & PAGE_MASK), entry.flags));
        }

        let (pa, pte) = self.walk_page_table(state, va, ptm)?;

        // Cache the 4 KiB frame of the translated address rather than the
        // leaf's raw ppn, so that a hit inside a superpage reproduces the
        // walk result exactly.
        let tlb = match access_type {
            AccessType::Execute => &mut self.l1_itlb,
            _ => &mut self.l1_dtlb,
        };
        tlb.insert(asid, root, va, pte.flags(), pa >> PAGE_SHIFT);
        Some((pa, pte.flags()))
    }

    /// Walk the page-table radix tree for `va`.
    ///
    /// Page tables live in guest physical space: each entry load is an
    /// ordinary host-memory read and never recurses through translation. The
    /// root pointer and non-leaf `ppn` fields are byte addresses of tables; a
    /// leaf `ppn` is a page-frame number.
    fn walk_page_table<X: Xlen>(
        &self,
        state: &HartState<X>,
        va: u64,
        ptm: Ptm,
    ) -> Option<(u64, Pte)> {
        let mut ppn = state.sptbr() & ppn_mask::<X>();

        for level in (0..ptm.levels).rev() {
            let shift = ptm.bits * level + PAGE_SHIFT;
            let vpn = (va >> shift) & ((1u64 << ptm.bits) - 1);
            let pte_mpa = ppn + vpn * ptm.pte_size;

            let raw = match self.load_pte(pte_mpa, ptm) {
                Some(raw) => raw,
                None => {
                    debug!(
                        "page walk fault: va={va:#x} sptbr={:#x} level={level} \
                         pte_mpa={pte_mpa:#x} unmapped",
                        state.sptbr()
                    );
                    return None;
                }
            };
            let pte = Pte::from_raw(raw, ptm);

            // If pte.v = 0, or if pte.r = 0 and pte.w = 1, stop the walk.
            if pte.is_invalid() {
                debug!(
                    "page walk fault: va={va:#x} sptbr={:#x} level={level} \
                     vpn={vpn:#x} pte={raw:#x}: translation fault",
                    state.sptbr()
                );
                return None;
            }

            if pte.is_leaf() {
                // A leaf above level 0 maps a superpage; the untranslated
                // virtual-address bits below `shift` splice into the frame.
                let pa = (pte.ppn() << PAGE_SHIFT) + (va & ((1u64 << shift) - 1));
                return Some((pa, pte));
            }

            // Step to the next level.
            ppn = pte.ppn();
        }

        debug!(
            "page walk fault: va={va:#x} sptbr={:#x}: no leaf entry",
            state.sptbr()
        );
        None
    }

    fn load_pte(&self, pte_mpa: u64, ptm: Ptm) -> Option<u64> {
        let host_ref = self.mem.mpa_to_host(pte_mpa, ptm.pte_size as usize)?;
        let bytes = self.mem.bytes(&host_ref);
        Some(match ptm.pte_size {
            4 => u32::from_le_bytes(bytes.try_into().unwrap()) as u64,
            _ => u64::from_le_bytes(bytes.try_into().unwrap()),
        })
    }

    /// Check the PMA table's verdict on `pa`. An address with no entry
    /// carries no restrictions of its own; the memory map has already
    /// vouched for it.
    fn check_pma(&self, pa: u64, access_type: AccessType) -> bool {
        match self.pma.lookup(pa) {
            Some(attrs) => attrs.contains(match access_type {
                AccessType::Read => PmaFlags::READ,
                AccessType::Write => PmaFlags::WRITE,
                AccessType::Execute => PmaFlags::EXEC,
            }),
            None => true,
        }
    }
}

/// Check the leaf PTE's verdict for this access and privilege mode. Bare
/// translation produces no PTE and passes vacuously.
fn check_pte(flags: Option<PteFlags>, access_type: AccessType, mode: PrivilegeLevel) -> bool {
    let Some(flags) = flags else {
        return true;
    };
    if mode == PrivilegeLevel::User && !flags.contains(PteFlags::U) {
        return false;
    }
    match access_type {
        AccessType::Read => flags.contains(PteFlags::R),
        AccessType::Write => flags.contains(PteFlags::W),
        AccessType::Execute => flags.contains(PteFlags::X),
    }
}

fn ppn_mask<X: Xlen>() -> u64 {
    (1u64 << X::PPN_BITS) - 1
}

fn pma_flags(prot: Prot) -> PmaFlags {
    let mut flags = PmaFlags::CACHEABLE;
    if prot.contains(Prot::READ) {
        flags |= PmaFlags::READ;
    }
    if prot.contains(Prot::WRITE) {
        flags |= PmaFlags::WRITE;
    }
    if prot.contains(Prot::EXEC) {
        flags |= PmaFlags::EXEC;
    }
    flags
}

#[derive(Error, Debug)]
pub enum MapError {
    #[error(transparent)]
    Map(#[from] MemoryMapError),
    #[error(transparent)]
    Pma(#[from] PmaTableFullError),
    #[error("segment image does not fit the segment")]
    ImageTooLarge,
}
