//! The call-site resolver (§4.9): maps a tracked control-transfer's
//! destination PC to a human-readable site, consulting the precomputed
//! per-module export maps built by [`crate::pe::parse_module`].

use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow, Signal};

use crate::config::Config;
use crate::emulator::{Emulator, TaintOracle};
use crate::modules::ModuleList;

/// Where a resolved call landed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CallSite {
    /// The destination PC is itself tainted: the payload is calling into
    /// code it injected, not a legitimate function.
    InjectedFunction { pc: u64 },
    /// Destination resolved to a named or ordinal export of a known module.
    Resolved { module_name: String, export: crate::pe::ResolvedExport },
    /// Destination falls inside a known module's range but has no export
    /// table entry for that exact address (a non-exported / internal entry
    /// point, or a forwarder this crate does not chase).
    NonExported { module_name: String, pc: u64 },
    /// Destination is a user-mode address outside every known module.
    NonImported { pc: u64 },
    /// Destination lies above the user/kernel split; not resolved.
    KernelAddress { pc: u64 },
}

/// Resolves one control-transfer destination against the tracked module
/// list and taint oracle, per §4.9. Brackets the whole lookup with
/// [`SignalGuard`] so a concurrently-delivered interval-timer signal can't
/// interleave its own log write with this resolution's.
pub fn check_function_call(
    emu: &impl Emulator,
    modules: &ModuleList,
    config: &Config,
    pc: u64,
) -> CallSite {
    let _guard = SignalGuard::block_timer();

    if emu.is_pc_tainted(pc) {
        return CallSite::InjectedFunction { pc };
    }

    if pc >= config.user_kernel_split {
        return CallSite::KernelAddress { pc };
    }

    match modules.iter().find(|m| m.contains(pc)) {
        // A module with no export directory at all (§4.4 step 5-6) can
        // never resolve; skip straight past the hash lookup rather than
        // consulting a map we already know is empty.
        Some(module) if !module.has_exports() => CallSite::NonExported { module_name: module.name.clone(), pc },
        Some(module) => match module.resolved_exports.get(&pc) {
            Some(export) => CallSite::Resolved { module_name: module.name.clone(), export: export.clone() },
            None => CallSite::NonExported { module_name: module.name.clone(), pc },
        },
        None => CallSite::NonImported { pc },
    }
}

/// Blocks `SIGALRM` for the lifetime of the guard, restoring whatever mask
/// was in effect beforehand on drop — including on an early return, since
/// the restore lives in `Drop` rather than at each exit point.
pub struct SignalGuard {
    previous: SigSet,
}

impl SignalGuard {
    pub fn block_timer() -> Self {
        let mut to_block = SigSet::empty();
        to_block.add(Signal::SIGALRM);

        let mut previous = SigSet::empty();
        if let Err(e) = pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&to_block), Some(&mut previous)) {
            log::warn!("failed to block SIGALRM during call-site resolution: {}", e);
        }

        SignalGuard { previous }
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        if let Err(e) = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.previous), None) {
            log::warn!("failed to restore signal mask after call-site resolution: {}", e);
        }
    }
}
