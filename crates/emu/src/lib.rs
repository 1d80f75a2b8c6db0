//! Instruction-level emulator for the ESP32 ULP FSM coprocessor.
//!
//! [`EmulatedCoprocessor`] plugs into the core [`Supervisor`] as a real
//! concurrent party; [`UlpSystem`] runs an image single-threaded and
//! services the mailbox itself.
//!
//! [`Supervisor`]: labwired_ulp_core::Supervisor

pub mod coprocessor;
pub mod cpu;
pub mod decoder;
pub mod encode;
pub mod system;

use labwired_ulp_core::CoprocessorError;

pub use coprocessor::{CoreExit, EmulatedCoprocessor, ExitReason};
pub use cpu::UlpCore;
pub use system::UlpSystem;

/// Default cycle budget: roughly one second of ULP time at 8 MHz.
pub const DEFAULT_MAX_CYCLES: u64 = 8_000_000;

#[derive(Debug, thiserror::Error)]
pub enum EmuError {
    #[error("Unknown instruction {word:#010x} at {ip:#x}")]
    UnknownInstruction { ip: u16, word: u32 },
    #[error("Memory access violation at {address:#x} (ip {ip:#x})")]
    MemoryViolation { ip: u16, address: usize },
    #[error("Exceeded max cycles ({limit}), output so far: {output:?}")]
    CycleBudget { limit: u64, output: String },
    #[error("ULP halted before reporting done, output so far: {output:?}")]
    Halted { output: String },
    #[error("Unknown ULP system function {0}")]
    Protocol(u16),
    #[error("Image does not fit the mailbox window")]
    NoMailbox,
    #[error("Emulator thread panicked")]
    Panicked,
    #[error(transparent)]
    Load(#[from] CoprocessorError),
}

pub type EmuResult<T> = Result<T, EmuError>;
