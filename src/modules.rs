//! The loaded-module enumerator: FS base -> TEB -> PEB -> `_PEB_LDR_DATA` ->
//! `InLoadOrderModuleList` -> one [`Module`] per entry.
//!
//! Everything here is a guest-memory walk; nothing executes guest code and
//! nothing mutates guest state. A failure at any hop degrades to "no
//! modules found" rather than panicking, matching §4.5 and §7's policy that
//! a corrupted guest view must never bring down the emulator.

use std::collections::HashSet;

use crate::emulator::{CpuState, GuestMemoryExt, Segment};
use crate::pe::{parse_module, Module};
use crate::utf16::utf16_to_ascii;

const OFF_TEB_PEB: u64 = 0x30;
const OFF_PEB_LDR: u64 = 0x0C;
const OFF_LDR_INITIALIZED: u64 = 0x04;
const OFF_LDR_IN_LOAD_ORDER_LIST: u64 = 0x0C;
const OFF_ENTRY_MODULE_BASE: u64 = 0x18;
const OFF_ENTRY_BASENAME_LENGTH: u64 = 0x2C;
const OFF_ENTRY_BASENAME_BUFFER: u64 = 0x30;

const MAX_BASENAME_UNITS: u16 = 255;

/// An ordered collection of the modules loaded in the tracked process.
/// Insertion order follows the loader's `InLoadOrderModuleList`, and ranges
/// never overlap (an OS loader invariant we don't re-validate).
pub type ModuleList = Vec<Module>;

/// Walks the loaded-module list of the process addressed by the current
/// FS segment base. An empty return means either the loader hasn't built
/// the list yet (`Initialized == 0`) or any hop in TEB/PEB/Ldr failed to
/// translate — both are non-fatal per §4.5/§7b, degrading call-site
/// resolution to "non-imported" rather than aborting analysis.
pub fn enumerate_modules(
    emu: &(impl CpuState + GuestMemoryExt),
    max_entries: usize,
) -> ModuleList {
    let teb = emu.segment_base(Segment::Fs);

    let peb = match emu.read_u32_le(teb + OFF_TEB_PEB) {
        Some(p) => p as u64,
        None => {
            log::warn!("failed to read PEB pointer from TEB at {:#x}", teb);
            return Vec::new();
        }
    };

    let ldr = match emu.read_u32_le(peb + OFF_PEB_LDR) {
        Some(p) => p as u64,
        None => {
            log::warn!("failed to read Ldr pointer from PEB at {:#x}", peb);
            return Vec::new();
        }
    };

    let initialized = match emu.read_u8(ldr + OFF_LDR_INITIALIZED) {
        Some(b) => b,
        None => {
            log::warn!("failed to read Initialized flag from Ldr at {:#x}", ldr);
            return Vec::new();
        }
    };
    if initialized == 0 {
        log::debug!("loader data at {:#x} not yet initialized", ldr);
        return Vec::new();
    }

    let list_head = ldr + OFF_LDR_IN_LOAD_ORDER_LIST;
    let mut entry = match emu.read_u32_le(list_head) {
        Some(p) => p as u64,
        None => return Vec::new(),
    };

    let mut modules = Vec::new();
    let mut visited = HashSet::new();

    for _ in 0..max_entries {
        if entry == 0 || entry == list_head || !visited.insert(entry) {
            break;
        }

        if let Some(module) = parse_list_entry(emu, entry) {
            modules.push(module);
        }

        entry = match emu.read_u32_le(entry) {
            Some(p) => p as u64,
            None => break,
        };
    }

    modules
}

/// Parses one `_LDR_DATA_TABLE_ENTRY` and the module it points to.
fn parse_list_entry(emu: &impl GuestMemoryExt, entry: u64) -> Option<Module> {
    let module_base = emu.read_u32_le(entry + OFF_ENTRY_MODULE_BASE)? as u64;

    let basename = read_basename(emu, entry);

    let mut module = parse_module(emu, module_base)?;
    if module.name.is_empty() {
        if let Some(basename) = basename {
            module.name = basename;
        }
    }
    Some(module)
}

/// Decodes the `BaseDllName` `UNICODE_STRING` of a loader entry into ASCII,
/// using the §4.6 lossy converter. Returns `None` if the length is out of
/// the sane range the reference implementation enforces, or any hop fails.
fn read_basename(emu: &impl GuestMemoryExt, entry: u64) -> Option<String> {
    let length_bytes = emu.read_u16_le(entry + OFF_ENTRY_BASENAME_LENGTH)?;
    let length_units = length_bytes / 2;
    if length_units == 0 || length_units >= MAX_BASENAME_UNITS + 1 {
        return None;
    }

    let buffer = emu.read_u32_le(entry + OFF_ENTRY_BASENAME_BUFFER)? as u64;

    let mut units = Vec::with_capacity(length_units as usize);
    for i in 0..length_units {
        units.push(emu.read_u16_le(buffer + 2 * i as u64)?);
    }

    let ascii = utf16_to_ascii(&units, 256);
    let nul = ascii.iter().position(|&b| b == 0).unwrap_or(ascii.len());
    Some(String::from_utf8_lossy(&ascii[..nul]).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeEmulator;
    use crate::pe::fixtures::PeFixture;

    fn write_u32(fake: &mut FakeEmulator, addr: u64, v: u32) {
        fake.write_bytes(addr, &v.to_le_bytes());
    }

    fn write_u16(fake: &mut FakeEmulator, addr: u64, v: u16) {
        fake.write_bytes(addr, &v.to_le_bytes());
    }

    fn write_u8(fake: &mut FakeEmulator, addr: u64, v: u8) {
        fake.write_bytes(addr, &[v]);
    }

    /// Builds a TEB/PEB/Ldr chain with a single loaded module entry.
    fn scaffold_one_module(teb: u64, entry: u64, module_base: u64) -> FakeEmulator {
        let mut fake = FakeEmulator::new();
        fake.set_segment_base(Segment::Fs, teb);

        let peb = teb + 0x1000;
        let ldr = peb + 0x1000;
        let list_head = ldr + OFF_LDR_IN_LOAD_ORDER_LIST;

        write_u32(&mut fake, teb + OFF_TEB_PEB, peb as u32);
        write_u32(&mut fake, peb + OFF_PEB_LDR, ldr as u32);
        write_u8(&mut fake, ldr + OFF_LDR_INITIALIZED, 1);

        // Single-entry cycle: list head points at `entry`, `entry`'s Flink
        // points back at the head.
        write_u32(&mut fake, list_head, entry as u32);
        write_u32(&mut fake, entry, list_head as u32);
        write_u32(&mut fake, entry + OFF_ENTRY_MODULE_BASE, module_base as u32);
        write_u16(&mut fake, entry + OFF_ENTRY_BASENAME_LENGTH, 0);

        let fx = PeFixture::single_export(module_base, 0x1000, "DllMain", 0x10);
        for (addr, byte) in fx.bytes {
            fake.write_bytes(addr, &[byte]);
        }

        fake
    }

    #[test]
    fn test_enumerate_finds_single_module() {
        let fake = scaffold_one_module(0x7FFD_E000, 0x0020_0000, 0x1000_0000);

        let modules = enumerate_modules(&fake, 256);

        assert_eq!(modules.len(), 1);
        assert_eq!(modules[0].base, 0x1000_0000);
    }

    #[test]
    fn test_uninitialized_loader_yields_no_modules() {
        let mut fake = scaffold_one_module(0x7FFD_E000, 0x0020_0000, 0x1000_0000);
        let peb = 0x7FFD_E000 + 0x1000;
        let ldr = peb + 0x1000;
        write_u8(&mut fake, ldr + OFF_LDR_INITIALIZED, 0);

        let modules = enumerate_modules(&fake, 256);

        assert!(modules.is_empty());
    }

    #[test]
    fn test_malformed_module_is_not_enlisted() {
        let mut fake = FakeEmulator::new();
        let teb = 0x7FFD_E000;
        fake.set_segment_base(Segment::Fs, teb);

        let peb = teb + 0x1000;
        let ldr = peb + 0x1000;
        let list_head = ldr + OFF_LDR_IN_LOAD_ORDER_LIST;
        let entry = 0x0020_0000u64;
        let module_base = 0x2000_0000u64;

        write_u32(&mut fake, teb + OFF_TEB_PEB, peb as u32);
        write_u32(&mut fake, peb + OFF_PEB_LDR, ldr as u32);
        write_u8(&mut fake, ldr + OFF_LDR_INITIALIZED, 1);
        write_u32(&mut fake, list_head, entry as u32);
        write_u32(&mut fake, entry, list_head as u32);
        write_u32(&mut fake, entry + OFF_ENTRY_MODULE_BASE, module_base as u32);
        write_u16(&mut fake, entry + OFF_ENTRY_BASENAME_LENGTH, 0);

        let fx = PeFixture::malformed(module_base);
        for (addr, byte) in fx.bytes {
            fake.write_bytes(addr, &[byte]);
        }

        let modules = enumerate_modules(&fake, 256);

        assert!(modules.is_empty());
    }

    #[test]
    fn test_cyclic_list_terminates() {
        // Two entries pointing at each other without ever reaching the
        // recorded head; the bounded walk + visited-set must still halt.
        let mut fake = FakeEmulator::new();
        let teb = 0x7FFD_E000;
        fake.set_segment_base(Segment::Fs, teb);

        let peb = teb + 0x1000;
        let ldr = peb + 0x1000;
        let list_head = ldr + OFF_LDR_IN_LOAD_ORDER_LIST;
        let a = 0x0020_0000u64;
        let b = 0x0030_0000u64;

        write_u32(&mut fake, teb + OFF_TEB_PEB, peb as u32);
        write_u32(&mut fake, peb + OFF_PEB_LDR, ldr as u32);
        write_u8(&mut fake, ldr + OFF_LDR_INITIALIZED, 1);
        write_u32(&mut fake, list_head, a as u32);
        write_u32(&mut fake, a, b as u32);
        write_u32(&mut fake, b, a as u32); // cycle, never revisits list_head
        write_u16(&mut fake, a + OFF_ENTRY_BASENAME_LENGTH, 0);
        write_u16(&mut fake, b + OFF_ENTRY_BASENAME_LENGTH, 0);

        let modules = enumerate_modules(&fake, 16);

        assert!(modules.is_empty());
    }
}
