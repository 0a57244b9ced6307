//! ELF loading and guest process setup.

use anyhow::{Context, Result};
use goblin::elf::program_header::{PF_R, PF_W, PF_X, PT_LOAD};
use goblin::elf::Elf;
use log::debug;
use proxima_core::hart::{Hart, HartState, Mmu};
use proxima_core::mem::Prot;
use proxima_core::registers::Specifier;
use proxima_core::Xlen;

/// Size of the guest stack, mapped directly below the top of the guest
/// address space.
pub const STACK_SIZE: u64 = 0x0010_0000; // 1 MiB

const AT_NULL: u64 = 0;
const AT_PAGESZ: u64 = 6;

/// Build a ready-to-run hart from a parsed ELF executable: map its `PT_LOAD`
/// segments and a stack, set the entry point, the initial program break, and
/// the System V argument frame.
pub fn load<X: Xlen>(elf: &Elf, image: &[u8], args: &[String], env: &[String]) -> Result<Hart<X>> {
    let mut hart = Hart::<X>::new(elf.header.e_entry);
    let mut brk = 0u64;

    for header in elf.program_headers.iter().filter(|h| h.p_type == PT_LOAD) {
        if header.p_memsz == 0 {
            continue;
        }
        debug!(
            "loading segment: file range [{:#010x}..{:#010x}] to guest range [{:#010x}..{:#010x}]",
            header.p_offset,
            header.p_offset + header.p_filesz,
            header.p_vaddr,
            header.p_vaddr + header.p_memsz,
        );
        let bytes = image
            .get(header.file_range())
            .context("segment file range exceeds the executable")?;
        hart.mmu_mut()
            .map_segment(
                header.p_vaddr,
                header.p_memsz,
                bytes,
                segment_prot(header.p_flags),
            )
            .with_context(|| format!("mapping segment at {:#x}", header.p_vaddr))?;
        brk = brk.max(header.p_vaddr + header.p_memsz);
    }

    hart.set_brk(brk);
    hart.mmu_mut()
        .map_stack(X::MEMORY_TOP, STACK_SIZE)
        .context("mapping guest stack")?;

    let sp = setup_stack(&mut hart, args, env)?;
    hart.state_mut().registers_mut().set_x(Specifier::SP, sp);
    Ok(hart)
}

fn segment_prot(p_flags: u32) -> Prot {
    let mut prot = Prot::empty();
    if p_flags & PF_R != 0 {
        prot |= Prot::READ;
    }
    if p_flags & PF_W != 0 {
        prot |= Prot::WRITE;
    }
    if p_flags & PF_X != 0 {
        prot |= Prot::EXEC;
    }
    prot
}

/// Write the initial process frame onto the stack and return the resulting
/// stack pointer, which points at `argc`.
///
/// Layout, from the returned pointer upward: `argc`, the `argv` pointers and
/// their NULL terminator, the `envp` pointers and theirs, and an auxiliary
/// vector carrying `AT_PAGESZ` and `AT_NULL`. The strings themselves live
/// above the frame, at the very top of the stack.
fn setup_stack<X: Xlen>(hart: &mut Hart<X>, args: &[String], env: &[String]) -> Result<u64> {
    // The loader writes through the MMU with a scratch machine-mode state, so
    // the stores are bare and the stack segment's permissions still apply.
    let mut state = HartState::<X>::new(0);
    let mut sp = X::MEMORY_TOP;

    let mut arg_ptrs = Vec::with_capacity(args.len());
    for arg in args {
        arg_ptrs.push(push_string(hart.mmu_mut(), &mut state, &mut sp, arg)?);
    }
    let mut env_ptrs = Vec::with_capacity(env.len());
    for var in env {
        env_ptrs.push(push_string(hart.mmu_mut(), &mut state, &mut sp, var)?);
    }

    let mut frame = Vec::new();
    frame.push(args.len() as u64);
    frame.extend(&arg_ptrs);
    frame.push(0);
    frame.extend(&env_ptrs);
    frame.push(0);
    frame.extend([AT_PAGESZ, 4096, AT_NULL, 0]);

    let ptr_size = (X::BITS / 8) as u64;
    sp -= frame.len() as u64 * ptr_size;
    sp &= !0xF;

    for (i, &word) in frame.iter().enumerate() {
        let address = sp + i as u64 * ptr_size;
        let result = match X::BITS {
            32 => hart.mmu_mut().store_word(&mut state, address, word as u32),
            _ => hart.mmu_mut().store_doubleword(&mut state, address, word),
        };
        result.map_err(|fault| anyhow::anyhow!("writing argument frame: {fault}"))?;
    }

    debug!(
        "stack frame at {:#x}: {} args, {} environment variables",
        sp,
        args.len(),
        env.len()
    );
    Ok(sp)
}

/// Copy `string` and its NUL terminator below `sp`, returning its guest
/// address.
fn push_string<X: Xlen>(
    mmu: &mut Mmu,
    state: &mut HartState<X>,
    sp: &mut u64,
    string: &str,
) -> Result<u64> {
    let bytes = string.as_bytes();
    *sp -= bytes.len() as u64 + 1;
    let base = *sp;
    for (i, &byte) in bytes.iter().enumerate() {
        mmu.store_byte(state, base + i as u64, byte)
            .map_err(|fault| anyhow::anyhow!("writing argument strings: {fault}"))?;
    }
    mmu.store_byte(state, base + bytes.len() as u64, 0)
        .map_err(|fault| anyhow::anyhow!("writing argument strings: {fault}"))?;
    Ok(base)
}
