//! In-memory fakes for [`crate::emulator::Emulator`].
//!
//! There is no real VM backend in this crate (the whole-system emulator is
//! an external collaborator per the design's scope section). These fakes
//! stand in for one in tests and in the demo binary: a sparse byte map for
//! guest memory, a handful of scalar registers, and a software taint map.

use std::collections::{HashMap, HashSet};

use crate::emulator::{CpuState, EmulatorControl, GuestMemory, Segment, TaintOracle, TaintOrigin};

/// A sparse guest-memory image: addresses not present are "unmapped".
#[derive(Clone, Debug, Default)]
pub struct FakeGuestMemory {
    bytes: HashMap<u64, u8>,
}

impl FakeGuestMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_sparse(bytes: HashMap<u64, u8>) -> Self {
        Self { bytes }
    }

    pub fn write_bytes(&mut self, addr: u64, data: &[u8]) {
        for (i, b) in data.iter().enumerate() {
            self.bytes.insert(addr + i as u64, *b);
        }
    }
}

impl GuestMemory for FakeGuestMemory {
    fn read_bytes(&self, addr: u64, len: usize) -> Option<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        for i in 0..len as u64 {
            out.push(*self.bytes.get(&(addr + i))?);
        }
        Some(out)
    }
}

/// A scripted, fully in-memory stand-in for the whole-system emulator.
#[derive(Debug, Default)]
pub struct FakeEmulator {
    pub memory: FakeGuestMemory,
    cr3: u64,
    eip: u64,
    eax: u64,
    segment_bases: HashMap<Segment, u64>,
    tainted: HashSet<u64>,
    origins: HashMap<u64, TaintOrigin>,
    pub single_step: bool,
    pub paused: bool,
}

impl FakeEmulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_cr3(&mut self, cr3: u64) {
        self.cr3 = cr3;
    }

    pub fn set_eip(&mut self, eip: u64) {
        self.eip = eip;
    }

    pub fn set_eax(&mut self, eax: u64) {
        self.eax = eax;
    }

    pub fn set_segment_base(&mut self, seg: Segment, base: u64) {
        self.segment_bases.insert(seg, base);
    }

    pub fn write_bytes(&mut self, addr: u64, data: &[u8]) {
        self.memory.write_bytes(addr, data);
    }

    /// Marks `[addr, addr+len)` tainted, all with the same origin.
    pub fn taint(&mut self, addr: u64, len: usize, origin: TaintOrigin) {
        for i in 0..len as u64 {
            self.tainted.insert(addr + i);
            self.origins.insert(addr + i, origin);
        }
    }

    pub fn untaint_all(&mut self) {
        self.tainted.clear();
        self.origins.clear();
    }
}

impl CpuState for FakeEmulator {
    fn cr3(&self) -> u64 {
        self.cr3
    }

    fn eip(&self) -> u64 {
        self.eip
    }

    fn eax(&self) -> u64 {
        self.eax
    }

    fn segment_base(&self, seg: Segment) -> u64 {
        *self.segment_bases.get(&seg).unwrap_or(&0)
    }
}

impl GuestMemory for FakeEmulator {
    fn read_bytes(&self, addr: u64, len: usize) -> Option<Vec<u8>> {
        self.memory.read_bytes(addr, len)
    }
}

impl TaintOracle for FakeEmulator {
    fn is_pc_tainted(&self, addr: u64) -> bool {
        self.tainted.contains(&addr)
    }

    fn origin(&self, addr: u64) -> Option<TaintOrigin> {
        self.origins.get(&addr).copied()
    }
}

impl EmulatorControl for FakeEmulator {
    fn set_single_step(&mut self, enabled: bool) {
        self.single_step = enabled;
    }

    fn pause(&mut self) {
        self.paused = true;
    }
}
