//! The load/store side-channel (§4.8): single-slot buffers the emulator
//! fills via `record_load`/`record_store`, consumed by the next matching
//! `log_instruction` call and discarded otherwise.

use crate::emulator::TaintOrigin;

/// Whether an effective address is a host-virtual pointer (already
/// translated) or a guest-physical address (taint lookup goes through a
/// separate origin buffer instead of `ARGOS_NETIDXPTR`-style address
/// arithmetic).
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub enum AddressKind {
    HostVirtual,
    GuestPhysical,
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct LoadEvent {
    pub pc: u64,
    pub addr: u64,
    pub addr_kind: AddressKind,
    pub value: u64,
    pub size: u8,
    pub origins: Vec<Option<TaintOrigin>>,
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct StoreEvent {
    pub pc: u64,
    pub addr: u64,
    pub addr_kind: AddressKind,
    pub value: u64,
    pub size: u8,
    pub origins: Vec<Option<TaintOrigin>>,
}

/// Takes `slot` iff its `pc` matches `executed_pc`; otherwise the event
/// belonged to some other, non-tracked instruction and is dropped. Either
/// way the slot ends up empty, matching the single-writer/single-reader
/// buffer semantics of §5.
pub fn take_if_matching<T>(slot: &mut Option<T>, executed_pc: u64, pc_of: impl Fn(&T) -> u64) -> Option<T> {
    let matches = slot.as_ref().map(|e| pc_of(e) == executed_pc).unwrap_or(false);
    if matches {
        slot.take()
    } else {
        slot.take();
        None
    }
}
