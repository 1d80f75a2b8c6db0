use crate::SharedMemory;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Size of the ESP32 RTC slow memory reserved for the ULP.
pub const RTC_SLOW_MEM_BYTES: usize = 8176;
pub const WORD_SIZE: usize = 4;

/// RTC slow memory shared between the main core and the ULP.
///
/// Clones share the same storage, so one handle can live on the
/// supervisor thread and another on the coprocessor thread. Accesses are
/// sequentially consistent loads and stores, the host equivalent of
/// volatile word access on a bus that never reorders.
#[derive(Debug, Clone)]
pub struct RtcSlowMemory {
    words: Arc<[AtomicU32]>,
}

impl RtcSlowMemory {
    pub fn new(size_bytes: usize) -> Self {
        let words = (0..size_bytes / WORD_SIZE)
            .map(|_| AtomicU32::new(0))
            .collect();
        Self { words }
    }

    pub fn size_bytes(&self) -> usize {
        self.words.len() * WORD_SIZE
    }

    pub fn snapshot(&self) -> Vec<u32> {
        self.words
            .iter()
            .map(|w| w.load(Ordering::SeqCst))
            .collect()
    }
}

impl Default for RtcSlowMemory {
    fn default() -> Self {
        Self::new(RTC_SLOW_MEM_BYTES)
    }
}

impl SharedMemory for RtcSlowMemory {
    fn read_word(&self, index: usize) -> u32 {
        self.words[index].load(Ordering::SeqCst)
    }

    fn write_word(&self, index: usize, value: u32) {
        self.words[index].store(value, Ordering::SeqCst);
    }

    fn len_words(&self) -> usize {
        self.words.len()
    }
}
