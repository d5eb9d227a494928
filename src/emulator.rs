//! The seam between the core and the host emulator.
//!
//! The core never reaches into a concrete VM type. Instead it is written
//! against the four services the design calls out in its scope section:
//! register/segment reads, a debug-only guest-memory translator, a taint
//! oracle, and single-step/pause control. A real integration implements
//! `Emulator` once against its VCPU and memory subsystem; tests and the demo
//! binary implement it against a flat in-memory fake (see [`crate::fake`]).

use std::convert::TryInto;

/// The two segment registers the core ever needs a base address for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Segment {
    Cs,
    Fs,
}

/// The taint-origin metadata attached to a single tainted guest byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, serde::Serialize)]
pub struct TaintOrigin {
    /// Opaque index into the taint-propagation engine's origin table.
    pub index: u32,
    /// How many copy/compute steps removed this byte is from its network
    /// origin. Monotone non-decreasing as taint flows through computation.
    pub stage: u32,
}

/// Architectural register and segment-base reads for the current VCPU.
pub trait CpuState {
    fn cr3(&self) -> u64;
    /// Guest-virtual instruction pointer of the instruction about to run
    /// (pre-execute) or that just retired (post-execute), depending on call
    /// site.
    fn eip(&self) -> u64;
    fn eax(&self) -> u64;
    fn segment_base(&self, seg: Segment) -> u64;
}

/// Debug-only guest-virtual -> host-readable memory access.
///
/// Implementations must not fault, perform I/O, or otherwise observably
/// alter guest state. A `None` return is the sentinel for "not mapped /
/// paged out" from the design's guest-memory reader contract; callers treat
/// it as a silent skip, never as an error.
pub trait GuestMemory {
    fn read_bytes(&self, addr: u64, len: usize) -> Option<Vec<u8>>;
}

/// Convenience typed reads layered over [`GuestMemory::read_bytes`].
pub trait GuestMemoryExt: GuestMemory {
    fn read_u8(&self, addr: u64) -> Option<u8> {
        self.read_bytes(addr, 1).map(|b| b[0])
    }

    fn read_u16_le(&self, addr: u64) -> Option<u16> {
        let bytes = self.read_bytes(addr, 2)?;
        Some(u16::from_le_bytes(bytes.as_slice().try_into().ok()?))
    }

    fn read_u32_le(&self, addr: u64) -> Option<u32> {
        let bytes = self.read_bytes(addr, 4)?;
        Some(u32::from_le_bytes(bytes.as_slice().try_into().ok()?))
    }

    fn read_u64_le(&self, addr: u64) -> Option<u64> {
        let bytes = self.read_bytes(addr, 8)?;
        Some(u64::from_le_bytes(bytes.as_slice().try_into().ok()?))
    }

    /// Reads a null-terminated ASCII string, truncated to `max_len` bytes
    /// (not counting the terminator). Returns `None` only if the first byte
    /// is unreadable; an unreadable byte mid-string truncates the result
    /// there instead of failing the whole read, since a partially-mapped
    /// string is still useful for diagnostics.
    fn read_cstring(&self, addr: u64, max_len: usize) -> Option<Vec<u8>> {
        self.read_u8(addr)?;
        let mut out = Vec::with_capacity(max_len.min(64));
        for i in 0..max_len {
            match self.read_u8(addr + i as u64) {
                Some(0) | None => break,
                Some(b) => out.push(b),
            }
        }
        Some(out)
    }
}

impl<T: GuestMemory + ?Sized> GuestMemoryExt for T {}

/// The per-byte taint shadow: "is this byte tainted?" plus an origin index
/// for bytes that are.
pub trait TaintOracle {
    fn is_pc_tainted(&self, addr: u64) -> bool;
    fn origin(&self, addr: u64) -> Option<TaintOrigin>;
}

/// The two mutations the core is allowed to request of the emulator.
pub trait EmulatorControl {
    fn set_single_step(&mut self, enabled: bool);
    fn pause(&mut self);
}

/// Everything the core needs from the host emulator, bundled into one seam.
pub trait Emulator: CpuState + GuestMemory + TaintOracle + EmulatorControl {}

impl<T: CpuState + GuestMemory + TaintOracle + EmulatorControl + ?Sized> Emulator for T {}
