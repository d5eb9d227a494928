use std::path::PathBuf;

/// Why the tracker should stop single-stepping the tracked payload.
///
/// `FirstSystemCall` is the default: a shellcode that never reaches a system
/// call is, in practice, still setting itself up (decoding itself, walking
/// the PEB, resolving imports) and hasn't done anything worth stopping for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum StopCondition {
    FirstSystemCall,
    MaxInstructions,
}

impl Default for StopCondition {
    fn default() -> Self {
        StopCondition::FirstSystemCall
    }
}

/// Tunables for a `TrackingCore` instance. None of these affect the state
/// machine's structure, only its thresholds and where it writes.
#[derive(Clone, Debug)]
pub struct Config {
    pub stop_condition: StopCondition,
    /// Ceiling used when `stop_condition == MaxInstructions`.
    pub max_instructions: u32,
    /// User/kernel address split used by the call-site resolver to filter
    /// out kernel-mode destinations. See Open Question (a): exposed here
    /// instead of hard-coded so large-address-aware images can override it.
    pub user_kernel_split: u64,
    /// Identifies this emulator instance in the trace log filename.
    pub instance_id: u32,
    /// Directory the trace log is created in.
    pub log_dir: PathBuf,
    /// Upper bound on the number of entries walked in the loaded-module
    /// list, defending against a malformed or cyclic loader list.
    pub max_module_walk_entries: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stop_condition: StopCondition::default(),
            max_instructions: 10_000,
            user_kernel_split: 0x8000_0000,
            instance_id: 0,
            log_dir: PathBuf::from("."),
            max_module_walk_entries: 256,
        }
    }
}

impl Config {
    pub fn log_path(&self) -> PathBuf {
        self.log_dir.join(format!("sc.{}.log", self.instance_id))
    }
}
