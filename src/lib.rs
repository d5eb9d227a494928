//! Shellcode tracking core for a dynamic-taint-tracking whole-system
//! emulator: given four small services from the host emulator (register
//! reads, debug-only guest-memory reads, a taint oracle, and single-step
//! control), records the execution trace of a tainted payload, resolves
//! its call sites against loaded modules, and stops the guest on its first
//! system call attempt.

pub mod config;
pub mod context;
pub mod core;
pub mod emulator;
pub mod error;
pub mod events;
pub mod fake;
pub mod modules;
pub mod pe;
pub mod recorder;
pub mod resolver;
pub mod trace_log;
pub mod utf16;

pub use config::{Config, StopCondition};
pub use core::TrackingCore;
pub use emulator::{CpuState, Emulator, EmulatorControl, GuestMemory, GuestMemoryExt, Segment, TaintOracle, TaintOrigin};
pub use error::TrackingError;
pub use events::{AddressKind, LoadEvent, StoreEvent};
pub use modules::ModuleList;
pub use pe::{Module, ResolvedExport};
