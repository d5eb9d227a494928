//! The facade (§10.2): one `TrackingCore` per emulator instance, exposing
//! the eleven entry points of §6. Everything upstream of this file is a
//! leaf component; this is where they're wired into the state machine.

use crate::config::{Config, StopCondition};
use crate::context::{Phase, ShellcodeContext};
use crate::emulator::{CpuState, Emulator, EmulatorControl, TaintOracle};
use crate::error::TrackingError;
use crate::events::{take_if_matching, LoadEvent, StoreEvent};
use crate::modules::{enumerate_modules, ModuleList};
use crate::recorder::RecordedInstruction;
use crate::resolver::{check_function_call as resolve_call_site, CallSite};
use crate::trace_log::TraceLog;

/// x86 bitness fixed by the design's 32-bit TEB/PEB/LDR layouts (§4.5).
const BITNESS: u32 = 32;

pub struct TrackingCore {
    config: Config,
    context: ShellcodeContext,
    modules: ModuleList,
    instruction_count: u32,
    pending_syscall: bool,
    reported_stage: u32,
    recorded: RecordedInstruction,
    pending_load: Option<LoadEvent>,
    pending_store: Option<StoreEvent>,
    /// `None` once `stop` has torn the core down; every entry point becomes
    /// a silent no-op after that point.
    trace_log: Option<TraceLog>,
}

impl TrackingCore {
    /// Opens the trace log and starts in `Idle`. The one fatal failure mode
    /// of §7a; callers should let it abort the emulator.
    pub fn init(config: Config) -> Result<Self, TrackingError> {
        let trace_log = TraceLog::open(&config.log_path())?;
        Ok(TrackingCore {
            config,
            context: ShellcodeContext::default(),
            modules: ModuleList::new(),
            instruction_count: 0,
            pending_syscall: false,
            reported_stage: 0,
            recorded: RecordedInstruction::default(),
            pending_load: None,
            pending_store: None,
            trace_log: Some(trace_log),
        })
    }

    /// Tears the core down: closes the trace log and releases the module
    /// list. Safe to call more than once.
    pub fn stop(&mut self) {
        self.context.phase = Phase::Idle;
        self.modules.clear();
        self.trace_log = None;
    }

    pub fn is_active(&self) -> bool {
        self.context.phase == Phase::Tracking
    }

    /// Overrides the module list directly, bypassing the loader walk.
    /// Exists for driving the core against hand-built modules (the demo
    /// binary, integration tests) without a full guest loader to walk.
    pub fn set_modules(&mut self, modules: ModuleList) {
        self.modules = modules;
    }

    /// Idle -> Analyzing -> Tracking: the emulator calls this when it first
    /// attempts to execute a tainted instruction.
    pub fn enable(&mut self, emu: &mut impl Emulator) {
        if self.context.phase != Phase::Idle {
            return;
        }

        self.context.phase = Phase::Analyzing;
        self.context.capture(emu);
        self.modules = enumerate_modules(emu, self.config.max_module_walk_entries);

        self.context.phase = Phase::Tracking;
        emu.set_single_step(true);
    }

    /// Pre-execute (§4.7): captures the upcoming instruction iff tracking,
    /// in-context, the destination is tainted, and we haven't already
    /// captured this exact PC this step.
    pub fn store_context(&mut self, emu: &impl Emulator) {
        if self.context.phase != Phase::Tracking || !self.context.in_tracked_context(emu) {
            return;
        }

        let pc = emu.eip();
        if !emu.is_pc_tainted(pc) {
            return;
        }
        if self.recorded.logged && self.recorded.executed_pc == pc {
            return;
        }

        self.recorded.capture(emu, pc, BITNESS);
    }

    /// Post-execute (§4.7): emits the trace line for the instruction
    /// `store_context` captured, binds any matching load/store event,
    /// advances the reported stage, and enforces the instruction ceiling.
    pub fn log_instruction(&mut self, emu: &mut impl Emulator) {
        if !self.recorded.logged {
            return;
        }

        let executed_pc = self.recorded.executed_pc;
        let load = take_if_matching(&mut self.pending_load, executed_pc, |e| e.pc);
        let store = take_if_matching(&mut self.pending_store, executed_pc, |e| e.pc);

        if self.recorded.max_stage > self.reported_stage {
            let old = self.reported_stage;
            self.reported_stage = self.recorded.max_stage;
            if let Some(log) = self.trace_log.as_mut() {
                log.write_stage_transition(old, self.reported_stage);
            }
        }

        let disassembly = self.recorded.disassemble(BITNESS);
        if let Some(log) = self.trace_log.as_mut() {
            log.write_instruction(&self.recorded, &disassembly, load.as_ref(), store.as_ref());
        }

        self.recorded.clear();
        self.instruction_count += 1;

        if self.config.stop_condition == StopCondition::MaxInstructions
            && self.instruction_count >= self.config.max_instructions
        {
            self.context.phase = Phase::Idle;
            emu.pause();
        }
    }

    /// On-control-transfer (§4.9): resolves `pc` against the module list
    /// and writes a one-line description of the call site to the trace log.
    pub fn check_function_call(&mut self, emu: &impl Emulator, pc: u64) {
        if self.context.phase != Phase::Tracking || !self.context.in_tracked_context(emu) {
            return;
        }

        let site = resolve_call_site(emu, &self.modules, &self.config, pc);
        let text = match &site {
            CallSite::InjectedFunction { pc } => format!("called injected function at {:#010x}", pc),
            CallSite::Resolved { module_name, export } => match export {
                crate::pe::ResolvedExport::Named(name) => format!("Called {} from {}", name, module_name),
                crate::pe::ResolvedExport::Ordinal(ord) => {
                    format!("Called ordinal #{} from {}", ord, module_name)
                }
            },
            CallSite::NonExported { module_name, pc } => {
                format!("called non-exported address {:#010x} in {}", pc, module_name)
            }
            CallSite::NonImported { pc } => format!("called non-imported function at {:#010x}", pc),
            CallSite::KernelAddress { pc } => {
                log::debug!("call-site resolution skipped kernel-mode destination {:#010x}", pc);
                return;
            }
        };

        if let Some(log) = self.trace_log.as_mut() {
            log.write_call_site(&text);
        }
    }

    /// Pre-system-call (§4.10): suppresses the call while tracking is
    /// active in the tracked context, recording that a stop may be due.
    pub fn is_valid_system_call(&mut self, emu: &impl Emulator) -> bool {
        if self.context.phase != Phase::Tracking || !self.context.in_tracked_context(emu) {
            return true;
        }
        self.pending_syscall = true;
        false
    }

    /// Post-system-call (§4.10): fires the stop if the pending flag is set
    /// and the configured condition is `FirstSystemCall`.
    pub fn check_for_invalid_system_call(&mut self, emu: &mut impl Emulator) {
        if !self.pending_syscall || self.config.stop_condition != StopCondition::FirstSystemCall {
            return;
        }
        self.pending_syscall = false;

        let eax = emu.eax();
        if let Some(log) = self.trace_log.as_mut() {
            log.write_prevented_syscall(eax);
        }
        self.context.phase = Phase::Idle;
        emu.pause();
    }

    pub fn logged_invalid_system_call(&self) -> bool {
        self.pending_syscall
    }

    pub fn record_load(&mut self, event: LoadEvent) {
        self.pending_load = Some(event);
    }

    pub fn record_store(&mut self, event: StoreEvent) {
        self.pending_store = Some(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulator::{Segment, TaintOrigin};
    use crate::events::AddressKind;
    use crate::fake::FakeEmulator;

    fn test_config(dir: &std::path::Path, stop_condition: StopCondition) -> Config {
        Config {
            stop_condition,
            max_instructions: 3,
            instance_id: std::process::id(),
            log_dir: dir.to_path_buf(),
            ..Config::default()
        }
    }

    fn step(core: &mut TrackingCore, fake: &mut FakeEmulator, pc: u64) {
        fake.set_eip(pc);
        core.store_context(fake);
        core.log_instruction(fake);
    }

    #[test]
    fn test_trivial_trace_stops_at_instruction_ceiling() {
        let dir = std::env::temp_dir();
        let config = test_config(&dir, StopCondition::MaxInstructions);
        let log_path = config.log_path();
        let _ = std::fs::remove_file(&log_path);

        let mut core = TrackingCore::init(config).unwrap();
        let mut fake = FakeEmulator::new();
        fake.set_segment_base(Segment::Fs, 0x7000);
        fake.write_bytes(0x7024, &0u32.to_le_bytes());
        fake.write_bytes(0x1000, &[0x90]);
        fake.write_bytes(0x1001, &[0x90]);
        fake.write_bytes(0x1002, &[0x90]);
        fake.taint(0x1000, 1, TaintOrigin::default());
        core.enable(&mut fake);
        fake.taint(0x1001, 1, TaintOrigin::default());
        fake.taint(0x1002, 1, TaintOrigin::default());

        step(&mut core, &mut fake, 0x1000);
        step(&mut core, &mut fake, 0x1001);
        step(&mut core, &mut fake, 0x1002);

        assert_eq!(core.instruction_count, 3);
        assert!(!core.is_active());
        assert!(fake.paused);

        let _ = std::fs::remove_file(&log_path);
    }

    #[test]
    fn test_system_call_stop() {
        let dir = std::env::temp_dir();
        let config = test_config(&dir, StopCondition::FirstSystemCall);
        let log_path = config.log_path();
        let _ = std::fs::remove_file(&log_path);

        let mut core = TrackingCore::init(config).unwrap();
        let mut fake = FakeEmulator::new();
        fake.set_segment_base(Segment::Fs, 0x7000);
        fake.write_bytes(0x7024, &0u32.to_le_bytes());
        fake.write_bytes(0x1000, &[0x90]);
        fake.write_bytes(0x1001, &[0x90]);
        fake.taint(0x1000, 1, TaintOrigin::default());
        fake.taint(0x1001, 1, TaintOrigin::default());
        core.enable(&mut fake);

        step(&mut core, &mut fake, 0x1000);
        step(&mut core, &mut fake, 0x1001);
        assert_eq!(core.instruction_count, 2);

        fake.set_eax(0x25);
        let valid = core.is_valid_system_call(&fake);
        assert!(!valid);
        assert!(core.logged_invalid_system_call());

        core.check_for_invalid_system_call(&mut fake);
        assert!(!core.is_active());
        assert!(fake.paused);
        assert!(!core.logged_invalid_system_call());

        let contents = std::fs::read_to_string(&log_path).unwrap();
        assert!(contents.contains("Prevented shellcode from calling system call 0x25."));

        let _ = std::fs::remove_file(&log_path);
    }

    #[test]
    fn test_context_switch_stops_recording_for_other_context() {
        let dir = std::env::temp_dir();
        let config = test_config(&dir, StopCondition::MaxInstructions);
        let log_path = config.log_path();
        let _ = std::fs::remove_file(&log_path);

        let mut core = TrackingCore::init(config).unwrap();
        let mut fake = FakeEmulator::new();
        fake.set_segment_base(Segment::Fs, 0x7000);
        fake.write_bytes(0x7024, &0u32.to_le_bytes());
        fake.write_bytes(0x1000, &[0x90]);
        fake.write_bytes(0x1001, &[0x90]);
        fake.taint(0x1000, 1, TaintOrigin::default());
        core.enable(&mut fake);
        fake.taint(0x1001, 1, TaintOrigin::default());

        step(&mut core, &mut fake, 0x1000);
        assert_eq!(core.instruction_count, 1);

        use crate::emulator::CpuState;
        fake.set_cr3(fake.cr3() + 1);
        step(&mut core, &mut fake, 0x1001);

        assert_eq!(core.instruction_count, 1);

        let _ = std::fs::remove_file(&log_path);
    }

    #[test]
    fn test_non_imported_call_is_logged() {
        use crate::pe::fixtures::PeFixture;

        let dir = std::env::temp_dir();
        let config = test_config(&dir, StopCondition::MaxInstructions);
        let log_path = config.log_path();
        let _ = std::fs::remove_file(&log_path);

        let mut core = TrackingCore::init(config).unwrap();
        let mut fake = FakeEmulator::new();
        fake.set_segment_base(Segment::Fs, 0x7000);
        fake.write_bytes(0x7024, &0u32.to_le_bytes());
        fake.write_bytes(0x1000, &[0x90]);
        fake.taint(0x1000, 1, TaintOrigin::default());
        core.enable(&mut fake);

        let fx = PeFixture::single_export(0x4000_0000, 0x1_0000, "Sleep", 0x50);
        for (addr, byte) in fx.bytes {
            fake.write_bytes(addr, &[byte]);
        }
        core.modules = enumerate_modules(&fake, 256);
        core.modules.push(crate::pe::parse_module(&fake, 0x4000_0000).unwrap());

        core.check_function_call(&fake, 0x5000_0000);

        let contents = std::fs::read_to_string(&log_path).unwrap();
        assert!(contents.contains("non-imported function at 0x50000000"));

        let _ = std::fs::remove_file(&log_path);
    }

    #[test]
    fn test_record_load_binds_to_matching_pc() {
        let dir = std::env::temp_dir();
        let config = test_config(&dir, StopCondition::MaxInstructions);
        let log_path = config.log_path();
        let _ = std::fs::remove_file(&log_path);

        let mut core = TrackingCore::init(config).unwrap();
        let mut fake = FakeEmulator::new();
        fake.set_segment_base(Segment::Fs, 0x7000);
        fake.write_bytes(0x7024, &0u32.to_le_bytes());
        fake.write_bytes(0x1000, &[0x90]);
        fake.taint(0x1000, 1, TaintOrigin::default());
        core.enable(&mut fake);

        core.record_load(LoadEvent {
            pc: 0x1000,
            addr: 0x9000,
            addr_kind: AddressKind::HostVirtual,
            value: 7,
            size: 4,
            origins: vec![],
        });

        step(&mut core, &mut fake, 0x1000);

        let contents = std::fs::read_to_string(&log_path).unwrap();
        assert!(contents.contains("@0x00009000"));

        let _ = std::fs::remove_file(&log_path);
    }
}
