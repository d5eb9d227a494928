//! The per-instruction recorder: capture, disassemble, and taint-annotate
//! one instruction (§4.7). The recorder owns its own instruction buffer and
//! invokes the disassembler functionally per call, per Design Note
//! "Global mutable disassembler state" — there is no static scratch record
//! shared across steps the way the reference implementation has one.

use iced_x86::{Code, Decoder, DecoderOptions, Formatter, IntelFormatter};

use crate::emulator::{Emulator, GuestMemory, TaintOracle, TaintOrigin};

pub const MAX_INSTRUCTION_LEN: usize = 15;

/// The single-slot record of "the instruction currently being logged".
/// Created in pre-execute (`capture`), consumed in post-execute.
#[derive(Clone, Debug, Default)]
pub struct RecordedInstruction {
    pub executed_pc: u64,
    pub bytes: Vec<u8>,
    pub origins: Vec<Option<TaintOrigin>>,
    pub max_stage: u32,
    pub logged: bool,
}

impl RecordedInstruction {
    /// Attempts to capture the instruction at `pc`: reads up to
    /// [`MAX_INSTRUCTION_LEN`] bytes through the guest-memory reader,
    /// disassembles once to learn the true length, then annotates each
    /// consumed byte with its taint origin. Returns `false` (leaving the
    /// slot untouched) if the bytes can't be read or don't decode, which
    /// the caller treats as "nothing to log this step", not an error.
    pub fn capture(&mut self, emu: &impl Emulator, pc: u64, bitness: u32) -> bool {
        let raw = match emu.read_bytes(pc, MAX_INSTRUCTION_LEN) {
            Some(bytes) => bytes,
            None => {
                log::debug!("could not read instruction bytes at {:#x}", pc);
                return false;
            }
        };

        let mut decoder = Decoder::new(bitness, &raw, DecoderOptions::NONE);
        decoder.set_ip(pc);
        let instr = decoder.decode();
        if instr.code() == Code::INVALID {
            log::debug!("invalid instruction at {:#x}", pc);
            return false;
        }

        let len = instr.len();
        self.bytes = raw[..len].to_vec();
        self.origins = (0..len).map(|i| emu.origin(pc + i as u64)).collect();
        self.max_stage = self.origins.iter().filter_map(|o| o.map(|o| o.stage)).max().unwrap_or(0);
        self.executed_pc = pc;
        self.logged = true;
        true
    }

    /// Re-decodes the captured bytes into an Intel-syntax mnemonic string.
    /// Decoding twice (once in `capture` to learn the length, once here to
    /// format) keeps the recorder free of any persistent decoder state.
    pub fn disassemble(&self, bitness: u32) -> String {
        let mut decoder = Decoder::new(bitness, &self.bytes, DecoderOptions::NONE);
        decoder.set_ip(self.executed_pc);
        let instr = decoder.decode();

        let mut output = String::new();
        let mut formatter = IntelFormatter::new();
        formatter.format(&instr, &mut output);
        output
    }

    pub fn clear(&mut self) {
        self.logged = false;
    }
}
