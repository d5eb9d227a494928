//! PE/export-table parsing against guest memory.
//!
//! Only the handful of fields needed to (a) bound a module's address range
//! and (b) resolve an address to an exported name or ordinal are read. This
//! is not a general PE parser: section tables, relocations, imports, TLS
//! directories and the rest of the format are untouched.

use std::collections::HashMap;

use crate::emulator::GuestMemoryExt;

const IMAGE_DOS_SIGNATURE: u16 = 0x5A4D; // "MZ"
const IMAGE_PE_SIGNATURE: u32 = 0x0000_4550; // "PE\0\0"

const OFF_E_LFANEW: u64 = 0x3C;
const OFF_NT_SIZE_OF_IMAGE: u64 = 0x50;
const OFF_NT_NUMBER_OF_RVA_AND_SIZES: u64 = 0x74;
const OFF_NT_EXPORT_DIRECTORY_RVA: u64 = 0x78;

const OFF_EXPORT_NAME_RVA: u64 = 0x0C;
const OFF_EXPORT_ORDINAL_BASE: u64 = 0x10;
const OFF_EXPORT_NUMBER_OF_FUNCTIONS: u64 = 0x14;
const OFF_EXPORT_NUMBER_OF_NAMES: u64 = 0x18;
const OFF_EXPORT_ADDRESS_TABLE_RVA: u64 = 0x1C;
const OFF_EXPORT_NAME_TABLE_RVA: u64 = 0x20;
const OFF_EXPORT_ORDINAL_TABLE_RVA: u64 = 0x24;

const MAX_MODULE_NAME_LEN: usize = 255;

/// What `check_function_call` prints for a resolved address: either the
/// exported name, or a bare ordinal when the export has none.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub enum ResolvedExport {
    Named(String),
    Ordinal(u32),
}

/// A single loaded module, as enlisted by the loader walk and parsed by
/// [`parse_module`].
#[derive(Clone, Debug, serde::Serialize)]
pub struct Module {
    pub base: u64,
    pub end: u64,
    pub name: String,
    pub number_of_functions: u32,
    pub number_of_named_functions: u32,
    pub function_address_table_rva: u32,
    pub function_name_table_rva: u32,
    pub function_ordinal_table_rva: u32,
    pub ordinal_base: u32,
    /// Precomputed `absolute address -> export` map, built once here so
    /// that steady-state call-site resolution (Design Note 9c) is a single
    /// hash lookup instead of the nested O(n^2) scan used to build it.
    #[serde(skip)]
    pub resolved_exports: HashMap<u64, ResolvedExport>,
}

impl Module {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.end
    }

    pub fn has_exports(&self) -> bool {
        self.number_of_functions > 0
    }
}

/// Parses a module image at `base` in guest memory. Returns `None` only for
/// the two fatal validation failures (bad DOS or PE signature); a module
/// with no (or unreadable) export directory is still returned, with empty
/// export fields, so range-containment checks keep working (§4.4, §7c).
pub fn parse_module(mem: &impl GuestMemoryExt, base: u64) -> Option<Module> {
    let dos_magic = mem.read_u16_le(base)?;
    if dos_magic != IMAGE_DOS_SIGNATURE {
        log::debug!("module at {:#x}: invalid DOS signature", base);
        return None;
    }

    let e_lfanew = mem.read_u32_le(base + OFF_E_LFANEW)? as u64;
    let nt = base + e_lfanew;

    let pe_signature = mem.read_u32_le(nt)?;
    if pe_signature != IMAGE_PE_SIGNATURE {
        log::debug!("module at {:#x}: invalid PE signature", base);
        return None;
    }

    let size_of_image = mem.read_u32_le(nt + OFF_NT_SIZE_OF_IMAGE)? as u64;
    let end = base + size_of_image;

    let mut module = Module {
        base,
        end,
        name: String::new(),
        number_of_functions: 0,
        number_of_named_functions: 0,
        function_address_table_rva: 0,
        function_name_table_rva: 0,
        function_ordinal_table_rva: 0,
        ordinal_base: 0,
        resolved_exports: HashMap::new(),
    };

    let number_of_rva_and_sizes = match mem.read_u32_le(nt + OFF_NT_NUMBER_OF_RVA_AND_SIZES) {
        Some(n) => n,
        None => {
            log::debug!("module at {:#x}: could not read NumberOfRvaAndSizes", base);
            return Some(module);
        }
    };
    if number_of_rva_and_sizes == 0 {
        return Some(module);
    }

    let export_directory_rva = match mem.read_u32_le(nt + OFF_NT_EXPORT_DIRECTORY_RVA) {
        Some(rva) => rva as u64,
        None => return Some(module),
    };
    if export_directory_rva == 0 {
        return Some(module);
    }

    let export_dir = base + export_directory_rva;

    let fields = (|| -> Option<(u32, u32, u32, u32, u32, u32, u32)> {
        Some((
            mem.read_u32_le(export_dir + OFF_EXPORT_NAME_RVA)?,
            mem.read_u32_le(export_dir + OFF_EXPORT_ORDINAL_BASE)?,
            mem.read_u32_le(export_dir + OFF_EXPORT_NUMBER_OF_FUNCTIONS)?,
            mem.read_u32_le(export_dir + OFF_EXPORT_NUMBER_OF_NAMES)?,
            mem.read_u32_le(export_dir + OFF_EXPORT_ADDRESS_TABLE_RVA)?,
            mem.read_u32_le(export_dir + OFF_EXPORT_NAME_TABLE_RVA)?,
            mem.read_u32_le(export_dir + OFF_EXPORT_ORDINAL_TABLE_RVA)?,
        ))
    })();

    let (
        name_rva,
        ordinal_base,
        number_of_functions,
        number_of_named_functions,
        function_address_table_rva,
        function_name_table_rva,
        function_ordinal_table_rva,
    ) = match fields {
        Some(fields) => fields,
        None => {
            log::debug!("module at {:#x}: export directory partially unreadable", base);
            return Some(module);
        }
    };

    module.name = mem
        .read_cstring(base + name_rva as u64, MAX_MODULE_NAME_LEN)
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default();
    module.number_of_functions = number_of_functions;
    module.number_of_named_functions = number_of_named_functions;
    module.function_address_table_rva = function_address_table_rva;
    module.function_name_table_rva = function_name_table_rva;
    module.function_ordinal_table_rva = function_ordinal_table_rva;
    module.ordinal_base = ordinal_base;

    module.resolved_exports = build_export_map(mem, &module);

    Some(module)
}

/// Builds the `address -> export` map for a module, by the same nested
/// scan `check_function_call` would otherwise run per call (§4.9, step 1-2).
/// Kept as a distinct, directly-testable routine because it encodes the
/// reference tie-breaking semantics: the first ordinal-table slot matching
/// a given export index wins, and named-vs-ordinal is decided by comparing
/// that slot's index against `number_of_named_functions`.
fn build_export_map(mem: &impl GuestMemoryExt, module: &Module) -> HashMap<u64, ResolvedExport> {
    let mut map = HashMap::with_capacity(module.number_of_functions as usize);

    let address_table = module.base + module.function_address_table_rva as u64;
    let ordinal_table = module.base + module.function_ordinal_table_rva as u64;
    let name_table = module.base + module.function_name_table_rva as u64;

    for i in 0..module.number_of_functions {
        let entry = match mem.read_u32_le(address_table + 4 * i as u64) {
            Some(e) => e,
            None => {
                log::debug!("module {:?}: invalid function address pointer", module.name);
                break;
            }
        };
        let addr = module.base + entry as u64;

        let mut resolved = None;
        for j in 0..module.number_of_functions {
            let ordinal = match mem.read_u16_le(ordinal_table + 2 * j as u64) {
                Some(o) => o,
                None => {
                    log::debug!("module {:?}: invalid function ordinal pointer", module.name);
                    break;
                }
            };
            if ordinal as u32 == i {
                resolved = Some(if j < module.number_of_named_functions {
                    match mem.read_u32_le(name_table + 4 * j as u64) {
                        Some(name_rva) => match mem.read_cstring(module.base + name_rva as u64, MAX_MODULE_NAME_LEN)
                        {
                            Some(bytes) => ResolvedExport::Named(String::from_utf8_lossy(&bytes).into_owned()),
                            None => {
                                log::debug!("module {:?}: invalid function name pointer", module.name);
                                ResolvedExport::Ordinal(j + module.ordinal_base)
                            }
                        },
                        None => {
                            log::debug!("module {:?}: invalid function name rva pointer", module.name);
                            ResolvedExport::Ordinal(j + module.ordinal_base)
                        }
                    }
                } else {
                    ResolvedExport::Ordinal(j + module.ordinal_base)
                });
                break;
            }
        }

        if let Some(resolved) = resolved {
            map.insert(addr, resolved);
        }
    }

    map
}


#[cfg(test)]
mod tests {
    use super::fixtures::PeFixture;
    use super::*;
    use crate::fake::FakeGuestMemory;

    #[test]
    fn test_parse_module_with_single_export() {
        let fx = PeFixture::single_export(0x1000_0000, 0x1_0000, "Sleep", 0x50);
        let mem = FakeGuestMemory::from_sparse(fx.bytes);

        let module = parse_module(&mem, 0x1000_0000).expect("valid module");

        assert_eq!(module.base, 0x1000_0000);
        assert_eq!(module.end, 0x1001_0000);
        assert_eq!(module.number_of_functions, 1);
        assert_eq!(module.number_of_named_functions, 1);
        assert_eq!(module.ordinal_base, 0);
        assert_eq!(
            module.resolved_exports.get(&(0x1000_0000 + 0x50)),
            Some(&ResolvedExport::Named("Sleep".to_string()))
        );
    }

    #[test]
    fn test_malformed_pe_signature_fails_parse() {
        let fx = PeFixture::malformed(0x2000_0000);
        let mem = FakeGuestMemory::from_sparse(fx.bytes);

        assert!(parse_module(&mem, 0x2000_0000).is_none());
    }

    #[test]
    fn test_bad_dos_magic_fails_parse() {
        let mem = FakeGuestMemory::from_sparse(
            [(0x3000_0000u64, 0x00u8), (0x3000_0001, 0x00)].iter().copied().collect(),
        );

        assert!(parse_module(&mem, 0x3000_0000).is_none());
    }

    #[test]
    fn test_zero_rva_and_sizes_yields_empty_exports() {
        let mut bytes = std::collections::HashMap::new();
        let base = 0x4000_0000u64;
        let put_u16 = |bytes: &mut std::collections::HashMap<u64, u8>, addr: u64, v: u16| {
            for (i, b) in v.to_le_bytes().iter().enumerate() {
                bytes.insert(addr + i as u64, *b);
            }
        };
        let put_u32 = |bytes: &mut std::collections::HashMap<u64, u8>, addr: u64, v: u32| {
            for (i, b) in v.to_le_bytes().iter().enumerate() {
                bytes.insert(addr + i as u64, *b);
            }
        };
        put_u16(&mut bytes, base, 0x5A4D);
        put_u32(&mut bytes, base + 0x3C, 0x80);
        put_u32(&mut bytes, base + 0x80, 0x0000_4550);
        put_u32(&mut bytes, base + 0x80 + 0x50, 0x5000);
        put_u32(&mut bytes, base + 0x80 + 0x74, 0); // NumberOfRvaAndSizes == 0

        let mem = FakeGuestMemory::from_sparse(bytes);
        let module = parse_module(&mem, base).expect("module retained");

        assert!(!module.has_exports());
        assert_eq!(module.end, base + 0x5000);
    }
}
