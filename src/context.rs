//! The tracking state machine (§4.1) and the context identifier (§4.2).

use crate::emulator::{CpuState, GuestMemoryExt, Segment};

const OFF_TEB_THREAD_ID: u64 = 0x24;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Analyzing,
    Tracking,
}

impl Default for Phase {
    fn default() -> Self {
        Phase::Idle
    }
}

/// The identity of the guest execution context a payload was first seen
/// running in: an address space (CR3) paired with a thread ID, so that a
/// second thread of the same traced process never gets conflated with the
/// one actually running the payload.
#[derive(Clone, Copy, Debug, Default)]
pub struct ShellcodeContext {
    pub phase: Phase,
    pub tracked_cr3: u64,
    pub tracked_thread_id: u32,
}

impl ShellcodeContext {
    /// Snapshots the current CR3 and thread ID as the tracked context. The
    /// state machine's sole Idle -> Analyzing entry action.
    pub fn capture(&mut self, emu: &(impl CpuState + GuestMemoryExt)) {
        self.tracked_cr3 = emu.cr3();
        self.tracked_thread_id = read_current_thread_id(emu).unwrap_or(0);
    }

    /// True iff the current CR3 and thread ID match the snapshot captured
    /// at `capture` time (§4.2). A translation failure resolves to `false`,
    /// not an error: the core simply disengages for this instruction.
    pub fn in_tracked_context(&self, emu: &(impl CpuState + GuestMemoryExt)) -> bool {
        if emu.cr3() != self.tracked_cr3 {
            return false;
        }
        match read_current_thread_id(emu) {
            Some(tid) => tid == self.tracked_thread_id,
            None => false,
        }
    }
}

/// Reads the current thread's ID from the thread-execution-block at offset
/// 0x24, reached via the FS segment base (fs:[0] *is* the TEB address).
fn read_current_thread_id(emu: &(impl CpuState + GuestMemoryExt)) -> Option<u32> {
    let teb = emu.segment_base(Segment::Fs);
    emu.read_u32_le(teb + OFF_TEB_THREAD_ID)
}
