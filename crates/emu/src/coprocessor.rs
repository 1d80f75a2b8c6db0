use crate::cpu::UlpCore;
use crate::{EmuError, EmuResult, DEFAULT_MAX_CYCLES};
use labwired_ulp_core::memory::RTC_SLOW_MEM_BYTES;
use labwired_ulp_core::{loader, Coprocessor, CoprocessorError, ImageHeader, SharedMemory};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Instructions executed between checks of the stop request.
const STEPS_PER_SLICE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The program executed `HALT`.
    Halted,
    /// The main core called [`Coprocessor::halt`].
    Stopped,
}

#[derive(Debug, Clone)]
pub struct CoreExit {
    pub reason: ExitReason,
    pub core: UlpCore,
}

/// ULP emulator running on its own thread against shared memory, so the
/// supervisor sees it as a genuinely concurrent party.
pub struct EmulatedCoprocessor<M: SharedMemory + Clone + 'static> {
    memory: M,
    reserved_bytes: usize,
    max_cycles: u64,
    loaded: Option<ImageHeader>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<EmuResult<CoreExit>>>,
    last_exit: Option<EmuResult<CoreExit>>,
}

impl<M: SharedMemory + Clone + 'static> EmulatedCoprocessor<M> {
    pub fn new(memory: M) -> Self {
        Self {
            memory,
            reserved_bytes: RTC_SLOW_MEM_BYTES,
            max_cycles: DEFAULT_MAX_CYCLES,
            loaded: None,
            stop: Arc::new(AtomicBool::new(false)),
            worker: None,
            last_exit: None,
        }
    }

    pub fn with_reserved_bytes(mut self, bytes: usize) -> Self {
        self.reserved_bytes = bytes;
        self
    }

    pub fn with_max_cycles(mut self, cycles: u64) -> Self {
        self.max_cycles = cycles;
        self
    }

    pub fn loaded(&self) -> Option<&ImageHeader> {
        self.loaded.as_ref()
    }

    /// How the most recent run ended, once it has been halted.
    pub fn last_exit(&self) -> Option<&EmuResult<CoreExit>> {
        self.last_exit.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    fn join(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        let exit = match worker.join() {
            Ok(exit) => exit,
            Err(_) => Err(EmuError::Panicked),
        };
        match &exit {
            Ok(exit) => info!(
                "ULP stopped ({:?}) after {} cycles at ip {:#x}",
                exit.reason, exit.core.cycles, exit.core.ip
            ),
            Err(e) => warn!("ULP faulted: {}", e),
        }
        self.last_exit = Some(exit);
    }
}

fn run_core<M: SharedMemory>(
    mut core: UlpCore,
    memory: M,
    max_cycles: u64,
    stop: Arc<AtomicBool>,
) -> EmuResult<CoreExit> {
    loop {
        if stop.load(Ordering::Relaxed) {
            return Ok(CoreExit {
                reason: ExitReason::Stopped,
                core,
            });
        }
        for _ in 0..STEPS_PER_SLICE {
            if core.halted {
                return Ok(CoreExit {
                    reason: ExitReason::Halted,
                    core,
                });
            }
            if core.cycles >= max_cycles {
                return Err(EmuError::CycleBudget {
                    limit: max_cycles,
                    output: String::new(),
                });
            }
            core.step(&memory)?;
        }
        thread::yield_now();
    }
}

impl<M: SharedMemory + Clone + 'static> Coprocessor for EmulatedCoprocessor<M> {
    fn load_binary(&mut self, load_addr: usize, image: &[u8]) -> Result<(), CoprocessorError> {
        if self.is_running() {
            return Err(CoprocessorError::Busy);
        }
        self.join();
        let header = loader::load_binary(&self.memory, load_addr, image, self.reserved_bytes)?;
        self.loaded = Some(header);
        Ok(())
    }

    fn run(&mut self, entry_point: u32) -> Result<(), CoprocessorError> {
        if self.is_running() {
            return Err(CoprocessorError::Busy);
        }
        self.join();
        if self.loaded.is_none() {
            return Err(CoprocessorError::NotLoaded);
        }
        let entry = u16::try_from(entry_point)
            .ok()
            .filter(|&ip| (ip as usize) < self.memory.len_words())
            .ok_or_else(|| {
                CoprocessorError::Fault(format!("entry point {:#x} outside memory", entry_point))
            })?;

        self.stop.store(false, Ordering::Relaxed);
        let memory = self.memory.clone();
        let stop = self.stop.clone();
        let max_cycles = self.max_cycles;
        let worker = thread::Builder::new()
            .name("ulp".to_string())
            .spawn(move || run_core(UlpCore::new(entry), memory, max_cycles, stop))
            .map_err(|e| CoprocessorError::Fault(e.to_string()))?;
        debug!("ULP started at {:#x}", entry);
        self.worker = Some(worker);
        Ok(())
    }

    fn halt(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        self.join();
    }
}

impl<M: SharedMemory + Clone + 'static> Drop for EmulatedCoprocessor<M> {
    fn drop(&mut self) {
        self.halt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::JumpCondition;
    use crate::encode::{self, mailbox_image};
    use labwired_ulp_core::mailbox::FunctionCode;
    use labwired_ulp_core::{
        HarnessError, RtcSlowMemory, SupervisionOutcome, Supervisor, SupervisorConfig,
        SystemClock,
    };
    use std::time::Duration;

    fn supervisor(memory: &RtcSlowMemory) -> Supervisor<RtcSlowMemory, SystemClock> {
        let config = SupervisorConfig {
            timeout: Duration::from_secs(5),
            ..SupervisorConfig::default()
        };
        Supervisor::new(memory.clone(), SystemClock::default(), config)
    }

    fn spin_image() -> Vec<u8> {
        encode::program_image(&[encode::jump(0, JumpCondition::Always)], 0).unwrap()
    }

    #[test]
    fn test_emulated_program_talks_to_supervisor() {
        let memory = RtcSlowMemory::default();
        let mut ulp = EmulatedCoprocessor::new(memory.clone());
        let mut supervisor = supervisor(&memory);
        let image = mailbox_image(&[
            (FunctionCode::PrintU16.into(), 42),
            (FunctionCode::PrintChar.into(), b'A' as u16),
            (FunctionCode::Done.into(), 0),
        ])
        .unwrap();

        let mut output = Vec::new();
        let report = supervisor.supervise(&mut ulp, &image, &mut output).unwrap();
        assert_eq!(report.outcome, SupervisionOutcome::Done);
        assert_eq!(report.messages, 3);
        assert_eq!(String::from_utf8(output).unwrap(), "42 A");
        assert!(matches!(ulp.last_exit(), Some(Ok(_))));
        assert!(!ulp.is_running());
    }

    #[test]
    fn test_unknown_code_from_program_is_protocol_error() {
        let memory = RtcSlowMemory::default();
        let mut ulp = EmulatedCoprocessor::new(memory.clone());
        let mut supervisor = supervisor(&memory);
        let image = mailbox_image(&[(0x77, 1)]).unwrap();

        let mut output = Vec::new();
        let report = supervisor.supervise(&mut ulp, &image, &mut output).unwrap();
        assert_eq!(report.outcome, SupervisionOutcome::ProtocolError { code: 0x77 });
    }

    #[test]
    fn test_halt_stops_spinning_program() {
        let memory = RtcSlowMemory::default();
        let mut ulp = EmulatedCoprocessor::new(memory.clone()).with_max_cycles(u64::MAX);
        let image = spin_image();
        ulp.load_binary(0, &image).unwrap();
        ulp.run(0).unwrap();
        assert_eq!(ulp.run(0), Err(CoprocessorError::Busy));
        ulp.halt();
        match ulp.last_exit() {
            Some(Ok(exit)) => assert_eq!(exit.reason, ExitReason::Stopped),
            other => panic!("unexpected exit: {:?}", other),
        }
    }

    #[test]
    fn test_cycle_budget_ends_run() {
        let memory = RtcSlowMemory::default();
        let mut ulp = EmulatedCoprocessor::new(memory.clone()).with_max_cycles(100);
        let image = spin_image();
        ulp.load_binary(0, &image).unwrap();
        ulp.run(0).unwrap();
        while ulp.is_running() {
            thread::yield_now();
        }
        ulp.halt();
        assert!(matches!(
            ulp.last_exit(),
            Some(Err(EmuError::CycleBudget { limit: 100, .. }))
        ));
    }

    #[test]
    fn test_run_requires_image() {
        let mut ulp = EmulatedCoprocessor::new(RtcSlowMemory::default());
        assert_eq!(ulp.run(0), Err(CoprocessorError::NotLoaded));
    }

    #[test]
    fn test_oversized_image_fails_load() {
        let memory = RtcSlowMemory::default();
        let mut ulp = EmulatedCoprocessor::new(memory.clone()).with_reserved_bytes(64);
        let mut supervisor = supervisor(&memory);
        let image = mailbox_image(&[(FunctionCode::Done.into(), 0)]).unwrap();
        let result = supervisor.supervise(&mut ulp, &image, &mut Vec::new());
        assert!(matches!(result, Err(HarnessError::Load(CoprocessorError::InvalidSize(_)))));
    }
}
