//! A single simulated hart: architectural state, the software MMU it routes
//! its memory accesses through, and the interpreter loop driving both.

mod execute;
pub mod mmu;
mod proxy;
mod status;

pub use mmu::{AccessType, Fault, MapError, Mmu};
pub use status::Status;

use crate::instruction::Instruction;
use crate::registers::Registers;
use crate::{PrivilegeLevel, Xlen};
use execute::Executor;
use log::trace;
use thiserror::Error;

/// Architectural state the MMU borrows for the duration of one access.
///
/// Ownership rule: the interpreter owns this state; the MMU reads privilege
/// mode, `mstatus`, `sptbr` and `pdid`, and writes only `badaddr` (and only
/// when faulting).
#[derive(Debug, Clone)]
pub struct HartState<X: Xlen> {
    registers: Registers<X>,
    privilege_mode: PrivilegeLevel,
    status: Status,
    sptbr: u64,
    pdid: u64,
    badaddr: u64,
}

impl<X: Xlen> HartState<X> {
    /// Fresh state with `pc` at `entry`: machine mode, bare translation.
    pub fn new(entry: u64) -> Self {
        Self {
            registers: Registers::new(entry),
            privilege_mode: PrivilegeLevel::Machine,
            status: Status::new(),
            sptbr: 0,
            pdid: 0,
            badaddr: 0,
        }
    }

    pub fn registers(&self) -> &Registers<X> {
        &self.registers
    }

    pub fn registers_mut(&mut self) -> &mut Registers<X> {
        &mut self.registers
    }

    pub fn privilege_mode(&self) -> PrivilegeLevel {
        self.privilege_mode
    }

    pub fn set_privilege_mode(&mut self, mode: PrivilegeLevel) {
        self.privilege_mode = mode;
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    pub fn status_mut(&mut self) -> &mut Status {
        &mut self.status
    }

    /// Root page-table pointer plus address-space identifier.
    pub fn sptbr(&self) -> u64 {
        self.sptbr
    }

    /// Change the root pointer. Cached translations tagged with the old root
    /// become unreachable by tag mismatch; no explicit flush is needed.
    pub fn set_sptbr(&mut self, value: u64) {
        self.sptbr = value;
    }

    /// Address-space identifier tagging TLB entries.
    pub fn pdid(&self) -> u64 {
        self.pdid
    }

    pub fn set_pdid(&mut self, value: u64) {
        self.pdid = value;
    }

    /// Virtual address of the most recent fault.
    pub fn badaddr(&self) -> u64 {
        self.badaddr
    }

    pub fn set_badaddr(&mut self, value: u64) {
        self.badaddr = value;
    }
}

/// Why the interpreter loop stopped.
///
/// The proxy environment has no supervisor-mode trap handler, so every
/// variant terminates the simulation; the `Display` form is the message shown
/// to the user.
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
pub enum StopReason {
    /// The guest called `exit`.
    #[error("guest exited with status {0}")]
    Exited(i32),
    /// A memory access faulted with no handler to deliver it to.
    #[error("{cause} at address {badaddr:#x}")]
    Fault { cause: Fault, badaddr: u64 },
    /// The fetched word does not decode to a supported instruction.
    #[error("illegal instruction {raw:#010x} at pc {pc:#x}")]
    IllegalInstruction { pc: u64, raw: u32 },
    /// The guest executed `ebreak`.
    #[error("breakpoint at pc {pc:#x}")]
    Breakpoint { pc: u64 },
}

/// A hart plus its MMU, driven synchronously: no MMU operation suspends, and
/// a fault returns to [`Hart::step`] within the same call.
#[derive(Debug)]
pub struct Hart<X: Xlen> {
    state: HartState<X>,
    mmu: Mmu,
    /// Current program break, maintained by the `brk` proxy syscall.
    brk: u64,
}

impl<X: Xlen> Hart<X> {
    pub fn new(entry: u64) -> Self {
        Self {
            state: HartState::new(entry),
            mmu: Mmu::new(),
            brk: 0,
        }
    }

    pub fn state(&self) -> &HartState<X> {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut HartState<X> {
        &mut self.state
    }

    pub fn mmu(&self) -> &Mmu {
        &self.mmu
    }

    pub fn mmu_mut(&mut self) -> &mut Mmu {
        &mut self.mmu
    }

    /// Set the initial program break (end of the loaded image).
    pub fn set_brk(&mut self, brk: u64) {
        self.brk = brk;
    }

    /// Fetch, decode, and execute a single instruction.
    pub fn step(&mut self) -> Result<(), StopReason> {
        let pc = self.state.registers().pc();
        let (raw, length) = self.mmu.fetch(&mut self.state, pc).map_err(|cause| {
            StopReason::Fault {
                cause,
                badaddr: self.state.badaddr(),
            }
        })?;
        trace!(target: "proxima::inst", "{pc:#010x}: {raw:#010x}");
        let instruction =
            Instruction::decode(raw).map_err(|_| StopReason::IllegalInstruction { pc, raw })?;
        Executor {
            state: &mut self.state,
            mmu: &mut self.mmu,
            brk: &mut self.brk,
        }
        .execute(instruction, raw, length)
    }

    /// Run until the guest stops.
    pub fn run(&mut self) -> StopReason {
        loop {
            if let Err(stop) = self.step() {
                return stop;
            }
        }
    }
}
