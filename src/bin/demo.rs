//! A small, self-contained driver for [`sctrack`]: wires a scripted
//! [`sctrack::fake::FakeEmulator`] to a [`sctrack::TrackingCore`] and runs
//! one of a handful of built-in scenarios, printing the resulting trace log
//! to stdout. There is no real VM backend in this crate; this binary exists
//! to exercise the core end-to-end without one.

use std::fs;

use anyhow::{Context, Result};
use clap::{App, Arg};

use sctrack::config::{Config, StopCondition};
use sctrack::core::TrackingCore;
use sctrack::emulator::{CpuState, Segment, TaintOrigin};
use sctrack::fake::FakeEmulator;
use sctrack::pe::Module;
use std::collections::HashMap;

const TEB_ADDR: u64 = 0x7FFD_E000;

fn app<'a, 'b>() -> App<'a, 'b> {
    App::new(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::with_name("scenario")
                .help("Which built-in scenario to run")
                .short("s")
                .long("scenario")
                .takes_value(true)
                .possible_values(&["trivial", "syscall", "context-switch", "non-imported", "imported"])
                .default_value("trivial"),
        )
}

/// Builds a fresh emulator with the thread-execution-block wired up at
/// [`TEB_ADDR`], so `in_tracked_context` has something readable to compare.
fn new_emulator() -> FakeEmulator {
    let mut fake = FakeEmulator::new();
    fake.set_segment_base(Segment::Fs, TEB_ADDR);
    fake.write_bytes(TEB_ADDR + 0x24, &1234u32.to_le_bytes());
    fake
}

fn step(core: &mut TrackingCore, fake: &mut FakeEmulator, pc: u64) {
    fake.set_eip(pc);
    core.store_context(fake);
    core.log_instruction(fake);
}

fn run_trivial(core: &mut TrackingCore, fake: &mut FakeEmulator) {
    for (i, pc) in [0x1000u64, 0x1001, 0x1002].iter().enumerate() {
        fake.write_bytes(*pc, &[0x90]);
        fake.taint(*pc, 1, TaintOrigin { index: i as u32, stage: 0 });
    }
    core.enable(fake);
    step(core, fake, 0x1000);
    step(core, fake, 0x1001);
    step(core, fake, 0x1002);
}

fn run_syscall(core: &mut TrackingCore, fake: &mut FakeEmulator) {
    fake.write_bytes(0x1000, &[0x90]);
    fake.taint(0x1000, 1, TaintOrigin::default());
    core.enable(fake);
    step(core, fake, 0x1000);

    // A tainted `int 0x2e` (Windows syscall gate) with EAX set to the
    // requested service number.
    fake.write_bytes(0x1001, &[0xCD, 0x2E]);
    fake.taint(0x1001, 2, TaintOrigin::default());
    fake.set_eip(0x1001);
    core.store_context(fake);
    fake.set_eax(0x25);
    core.is_valid_system_call(fake);
    core.check_for_invalid_system_call(fake);
}

fn run_context_switch(core: &mut TrackingCore, fake: &mut FakeEmulator) {
    fake.write_bytes(0x1000, &[0x90]);
    fake.write_bytes(0x1001, &[0x90]);
    fake.taint(0x1000, 1, TaintOrigin::default());
    core.enable(fake);
    fake.taint(0x1001, 1, TaintOrigin::default());

    step(core, fake, 0x1000);

    let other_cr3 = fake.cr3() + 1;
    fake.set_cr3(other_cr3);
    step(core, fake, 0x1001);
}

fn module_with_export(base: u64, size: u64, name: &str, export_addr: u64, export_name: &str) -> Module {
    let mut resolved_exports = HashMap::new();
    resolved_exports.insert(export_addr, sctrack::pe::ResolvedExport::Named(export_name.to_string()));
    Module {
        base,
        end: base + size,
        name: name.to_string(),
        number_of_functions: 1,
        number_of_named_functions: 1,
        function_address_table_rva: 0,
        function_name_table_rva: 0,
        function_ordinal_table_rva: 0,
        ordinal_base: 0,
        resolved_exports,
    }
}

fn run_non_imported(core: &mut TrackingCore, fake: &mut FakeEmulator) {
    fake.write_bytes(0x1000, &[0x90]);
    fake.taint(0x1000, 1, TaintOrigin::default());
    core.enable(fake);
    core.set_modules(vec![module_with_export(
        0x4000_0000,
        0x1_0000,
        "kernel32.dll",
        0x4000_0050,
        "Sleep",
    )]);

    core.check_function_call(fake, 0x4002_0000);
}

fn run_imported(core: &mut TrackingCore, fake: &mut FakeEmulator) {
    fake.write_bytes(0x1000, &[0x90]);
    fake.taint(0x1000, 1, TaintOrigin::default());
    core.enable(fake);
    core.set_modules(vec![module_with_export(
        0x4000_0000,
        0x1_0000,
        "kernel32.dll",
        0x4000_0050,
        "Sleep",
    )]);

    core.check_function_call(fake, 0x4000_0050);
}

fn run() -> Result<()> {
    let matches = app().get_matches();

    let log_dir = std::env::temp_dir();
    let instance_id = std::process::id();
    let config =
        Config { stop_condition: StopCondition::MaxInstructions, instance_id, log_dir: log_dir.clone(), ..Config::default() };
    let log_path = config.log_path();
    let _ = fs::remove_file(&log_path);

    let mut core = TrackingCore::init(config).context("opening trace log")?;
    let mut fake = new_emulator();

    match matches.value_of("scenario").unwrap() {
        "trivial" => run_trivial(&mut core, &mut fake),
        "syscall" => run_syscall(&mut core, &mut fake),
        "context-switch" => run_context_switch(&mut core, &mut fake),
        "non-imported" => run_non_imported(&mut core, &mut fake),
        "imported" => run_imported(&mut core, &mut fake),
        _ => unreachable!(),
    }

    core.stop();

    let trace = fs::read_to_string(&log_path).context("reading trace log")?;
    print!("{}", trace);
    let _ = fs::remove_file(&log_path);

    Ok(())
}

fn main() {
    env_logger::init();

    std::process::exit(match run() {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Fatal: {:#}", e);
            1
        }
    });
}
