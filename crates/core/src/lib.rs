pub mod client;
pub mod clock;
pub mod image;
pub mod loader;
pub mod mailbox;
pub mod memory;
pub mod session;
pub mod supervisor;

use std::sync::Arc;

pub use clock::{Clock, ManualClock, SystemClock};
pub use image::{ImageHeader, MemoryWindow};
pub use mailbox::{FunctionCode, Mailbox, Party};
pub use memory::RtcSlowMemory;
pub use supervisor::{
    SupervisionOutcome, SupervisionReport, Supervisor, SupervisorConfig, SupervisorState,
};


/// Sub-codes reported on the line protocol, see [`HarnessError::code`].
pub const CODE_PROTOCOL: i32 = -1;
pub const CODE_TIMEOUT: i32 = -2;
pub const CODE_LOAD: i32 = -10;
pub const CODE_START: i32 = -12;

/// Failure reported by a coprocessor's loader or start vector.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoprocessorError {
    #[error("Invalid image size: {0}")]
    InvalidSize(String),
    #[error("Unsupported image magic {0:#010x}")]
    NotSupported(u32),
    #[error("Coprocessor is already running")]
    Busy,
    #[error("No image loaded")]
    NotLoaded,
    #[error("Coprocessor fault: {0}")]
    Fault(String),
}

#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("Command exceeds capacity of {capacity} bytes")]
    InputTooLarge { capacity: usize },
    #[error("Failed to decode binary ({code}): {reason}")]
    Decode { code: i32, reason: String },
    #[error("Failed to load binary: {0}")]
    Load(CoprocessorError),
    #[error("Failed to start coprocessor: {0}")]
    Start(CoprocessorError),
    #[error("Unknown mailbox function code {0:#06x}")]
    Protocol(u16),
    #[error("No terminal mailbox code within {0} ms")]
    Timeout(u64),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl HarnessError {
    /// Numeric sub-code printed after `decoding` / `ulp` on the line protocol.
    pub fn code(&self) -> Option<i32> {
        match self {
            HarnessError::InputTooLarge { .. } | HarnessError::Io(_) => None,
            HarnessError::Decode { code, .. } => Some(*code),
            HarnessError::Load(_) => Some(CODE_LOAD),
            HarnessError::Start(_) => Some(CODE_START),
            HarnessError::Protocol(_) => Some(CODE_PROTOCOL),
            HarnessError::Timeout(_) => Some(CODE_TIMEOUT),
        }
    }
}

pub type HarnessResult<T> = Result<T, HarnessError>;

/// Word-addressed memory shared by the main core and the coprocessor.
///
/// Every read and write must be observed by the other party in program
/// order. The mailbox protocol only ever issues plain loads and stores, so
/// implementations never need read-modify-write primitives.
pub trait SharedMemory: Send + Sync {
    fn read_word(&self, index: usize) -> u32;
    fn write_word(&self, index: usize, value: u32);
    fn len_words(&self) -> usize;

    fn erase(&self) {
        for index in 0..self.len_words() {
            self.write_word(index, 0);
        }
    }
}

impl<M: SharedMemory + ?Sized> SharedMemory for Arc<M> {
    fn read_word(&self, index: usize) -> u32 {
        (**self).read_word(index)
    }

    fn write_word(&self, index: usize, value: u32) {
        (**self).write_word(index, value)
    }

    fn len_words(&self) -> usize {
        (**self).len_words()
    }
}

/// The coprocessor as seen from the main core: an image loader plus a
/// fire-and-forget start vector.
pub trait Coprocessor {
    fn load_binary(&mut self, load_addr: usize, image: &[u8]) -> Result<(), CoprocessorError>;
    fn run(&mut self, entry_point: u32) -> Result<(), CoprocessorError>;

    /// Called once the supervisor has stopped listening.
    fn halt(&mut self) {}
}

/// Trait for observing supervision sessions.
pub trait SupervisionObserver: std::fmt::Debug + Send + Sync {
    fn on_state(&self, _state: SupervisorState) {}
    fn on_message(&self, _code: u16, _param: u16) {}
}
