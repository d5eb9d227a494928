//! The machine-parseable trace file (§4.7, §6): one line per logged
//! instruction, plus stage-transition and stop-reason lines. Kept entirely
//! separate from `log`-crate diagnostics, which go to the emulator's own
//! log per §7's "diagnostics go to the emulator's log, not the trace log".

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::emulator::TaintOrigin;
use crate::error::TrackingError;
use crate::events::{LoadEvent, StoreEvent};
use crate::recorder::RecordedInstruction;

/// An append-only, line-buffered sink for the trace grammar of §4.7. Each
/// public method writes and flushes exactly one line, matching the
/// reference implementation's `fprintf`+`fflush` pairing.
pub struct TraceLog {
    writer: BufWriter<File>,
}

impl TraceLog {
    /// Opens (creating if needed) the trace file at `path`. Failure here is
    /// the one fatal error kind from §7a; callers should propagate it and
    /// let the emulator abort.
    pub fn open(path: &Path) -> Result<Self, TrackingError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| TrackingError::LogOpenFailed { path: path.to_path_buf(), source })?;
        Ok(TraceLog { writer: BufWriter::new(file) })
    }

    /// Emits one instruction line, with optional bracketed load/store
    /// clauses appended when a matching event was bound by `log_instruction`.
    pub fn write_instruction(
        &mut self,
        recorded: &RecordedInstruction,
        disassembly: &str,
        load: Option<&LoadEvent>,
        store: Option<&StoreEvent>,
    ) {
        let bytes_col = format_bytes(&recorded.bytes);
        let origins_col = format_origins(&recorded.origins);

        let mut line = format!("{:#010x}\t{}\t {} \t{}\t", recorded.executed_pc, disassembly, bytes_col, origins_col);

        if let Some(load) = load {
            line.push_str(&format!(
                " <- @{:#010x} ({:#x})\t{}",
                load.addr,
                load.value,
                format_origins(&load.origins)
            ));
        }
        if let Some(store) = store {
            line.push_str(&format!(
                " -> @{:#010x} ({:#x})\t{}",
                store.addr,
                store.value,
                format_origins(&store.origins)
            ));
        }
        line.push('\n');

        self.write_line(&line);
    }

    /// Emits a free-form call-site description line (§4.9: "called
    /// injected function at ...", "Called Sleep from ...", and similar).
    pub fn write_call_site(&mut self, text: &str) {
        self.write_line(&format!("{}\n", text));
    }

    pub fn write_stage_transition(&mut self, old_stage: u32, new_stage: u32) {
        self.write_line(&format!("Stage {} -> {}\n", old_stage, new_stage));
    }

    pub fn write_prevented_syscall(&mut self, eax: u64) {
        self.write_line(&format!("Prevented shellcode from calling system call {:#x}.\n", eax));
    }

    fn write_line(&mut self, line: &str) {
        if let Err(e) = self.writer.write_all(line.as_bytes()) {
            log::error!("failed to write trace log line: {}", e);
            return;
        }
        if let Err(e) = self.writer.flush() {
            log::error!("failed to flush trace log: {}", e);
        }
    }
}

fn format_bytes(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect::<Vec<_>>().join(" ")
}

fn format_origins(origins: &[Option<TaintOrigin>]) -> String {
    origins
        .iter()
        .map(|o| match o {
            Some(o) => o.index.to_string(),
            None => "-".to_string(),
        })
        .collect::<Vec<_>>()
        .join(",")
}
