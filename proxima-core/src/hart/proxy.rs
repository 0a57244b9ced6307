//! Proxy system calls: the small set of operating-system requests that are
//! forwarded to the host instead of being emulated architecturally.
//!
//! Guest buffers are moved byte by byte through the MMU so that permission
//! and translation checks apply; a fault during the copy surfaces to the
//! guest as `EFAULT` rather than as a trap.

use super::mmu::Mmu;
use super::{HartState, StopReason};
use crate::paging::PAGE_MASK;
use crate::registers::Specifier;
use crate::Xlen;
use log::debug;
use std::io::{self, Read, Write};

const SYS_CLOSE: u64 = 57;
const SYS_READ: u64 = 63;
const SYS_WRITE: u64 = 64;
const SYS_FSTAT: u64 = 80;
const SYS_EXIT: u64 = 93;
const SYS_EXIT_GROUP: u64 = 94;
const SYS_BRK: u64 = 214;

const EIO: i64 = 5;
const EBADF: i64 = 9;
const EFAULT: i64 = 14;
const ENOSYS: i64 = 38;

/// Size of the zero-filled `struct stat` the `fstat` stub produces.
const STAT_SIZE: u64 = 128;

/// Dispatch the system call selected by `a7`, leaving the result in `a0`.
pub(super) fn syscall<X: Xlen>(
    state: &mut HartState<X>,
    mmu: &mut Mmu,
    brk: &mut u64,
) -> Result<(), StopReason> {
    let number = X::zext(state.registers().x(Specifier::A7));
    let a0 = X::zext(state.registers().x(Specifier::A0));
    let a1 = X::zext(state.registers().x(Specifier::A1));
    let a2 = X::zext(state.registers().x(Specifier::A2));

    let result = match number {
        SYS_CLOSE => 0,
        SYS_READ => sys_read(state, mmu, a0, a1, a2),
        SYS_WRITE => sys_write(state, mmu, a0, a1, a2),
        SYS_FSTAT => sys_fstat(state, mmu, a0, a1),
        SYS_EXIT | SYS_EXIT_GROUP => return Err(StopReason::Exited(a0 as i32)),
        SYS_BRK => sys_brk(mmu, brk, a0),
        _ => {
            debug!("unimplemented syscall {number}");
            -ENOSYS
        }
    };
    state.registers_mut().set_x(Specifier::A0, result as u64);
    Ok(())
}

fn sys_read<X: Xlen>(
    state: &mut HartState<X>,
    mmu: &mut Mmu,
    fd: u64,
    buf: u64,
    count: u64,
) -> i64 {
    if fd != 0 {
        return -EBADF;
    }
    // A short read is always legal, so the host buffer can be bounded.
    let mut bytes = vec![0u8; count.min(1 << 20) as usize];
    let n = match io::stdin().read(&mut bytes) {
        Ok(n) => n,
        Err(_) => return -EIO,
    };
    for (i, &byte) in bytes[..n].iter().enumerate() {
        if mmu
            .store_byte(state, buf.wrapping_add(i as u64), byte)
            .is_err()
        {
            return -EFAULT;
        }
    }
    n as i64
}

fn sys_write<X: Xlen>(
    state: &mut HartState<X>,
    mmu: &mut Mmu,
    fd: u64,
    buf: u64,
    count: u64,
) -> i64 {
    let mut bytes = Vec::new();
    for i in 0..count {
        match mmu.load_byte(state, buf.wrapping_add(i)) {
            Ok(byte) => bytes.push(byte),
            Err(_) => return -EFAULT,
        }
    }
    let result = match fd {
        1 => io::stdout().write_all(&bytes).and_then(|()| io::stdout().flush()),
        2 => io::stderr().write_all(&bytes).and_then(|()| io::stderr().flush()),
        _ => return -EBADF,
    };
    match result {
        Ok(()) => bytes.len() as i64,
        Err(_) => -EIO,
    }
}

/// Stub: reports a zeroed `struct stat` for the standard descriptors, which
/// is enough for C-library startup to classify them.
fn sys_fstat<X: Xlen>(state: &mut HartState<X>, mmu: &mut Mmu, fd: u64, stat: u64) -> i64 {
    if fd > 2 {
        return -EBADF;
    }
    for i in 0..STAT_SIZE {
        if mmu.store_byte(state, stat.wrapping_add(i), 0).is_err() {
            return -EFAULT;
        }
    }
    0
}

/// Adjust the program break, growing the heap mapping as needed.
///
/// Follows the Linux convention: returns the new break on success and the
/// current break when the request cannot be satisfied.
fn sys_brk(mmu: &mut Mmu, brk: &mut u64, addr: u64) -> i64 {
    if addr == 0 {
        return *brk as i64;
    }
    if addr <= *brk {
        // Shrinking only moves the break; the pages stay mapped.
        *brk = addr;
        return addr as i64;
    }
    let mapped_end = page_round_up(*brk);
    let needed_end = page_round_up(addr);
    if needed_end > mapped_end {
        if let Err(error) = mmu.map_heap(mapped_end, needed_end - mapped_end) {
            debug!("brk({addr:#x}) denied: {error}");
            return *brk as i64;
        }
    }
    *brk = addr;
    addr as i64
}

fn page_round_up(value: u64) -> u64 {
    (value + PAGE_MASK) & !PAGE_MASK
}
