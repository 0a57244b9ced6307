mod loader;

use anyhow::{bail, Context, Result};
use clap::Parser;
use goblin::elf::header::EM_RISCV;
use goblin::elf::Elf;
use log::debug;
use proxima_core::hart::StopReason;
use proxima_core::{Rv32, Rv64, Xlen};
use std::process::ExitCode;

/// Environment variables passed through to the guest.
const ALLOWED_ENV_VARS: &[&str] = &["TERM"];

#[derive(Parser, Debug)]
#[command(version, about = "Run statically linked RISC-V executables in user mode", long_about = None)]
struct Args {
    /// Log each executed instruction.
    #[arg(short = 'l', long)]
    log_instructions: bool,
    /// Statically linked RISC-V executable to run.
    binary: String,
    /// Arguments passed through to the guest program.
    #[arg(trailing_var_arg = true)]
    guest_args: Vec<String>,
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let mut builder = env_logger::Builder::from_default_env();
    if args.log_instructions {
        builder.filter_module("proxima::inst", log::LevelFilter::Trace);
    }
    builder.init();

    let image = std::fs::read(&args.binary).with_context(|| format!("reading {}", args.binary))?;
    let elf = Elf::parse(&image).context("parsing ELF header")?;
    if elf.header.e_machine != EM_RISCV {
        bail!("{} is not a RISC-V executable", args.binary);
    }

    // argv[0] is the guest binary itself, as execve would pass it.
    let mut guest_args = vec![args.binary.clone()];
    guest_args.extend(args.guest_args.iter().cloned());
    let guest_env: Vec<String> = ALLOWED_ENV_VARS
        .iter()
        .filter_map(|name| std::env::var(name).ok().map(|value| format!("{name}={value}")))
        .collect();

    let stop = match elf.is_64 {
        true => run::<Rv64>(&elf, &image, &guest_args, &guest_env)?,
        false => run::<Rv32>(&elf, &image, &guest_args, &guest_env)?,
    };

    match stop {
        StopReason::Exited(status) => Ok(ExitCode::from(status as u8)),
        other => bail!("{other}"),
    }
}

fn run<X: Xlen>(elf: &Elf, image: &[u8], args: &[String], env: &[String]) -> Result<StopReason> {
    let mut hart = loader::load::<X>(elf, image, args, env)?;
    debug!("entering guest at {:#x}", hart.state().registers().pc());
    let stop = hart.run();
    hart.mmu_mut().unmap_all();
    Ok(stop)
}
