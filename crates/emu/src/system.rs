use crate::cpu::UlpCore;
use crate::{EmuError, EmuResult};
use labwired_ulp_core::mailbox::{FunctionCode, SLOT_COPROCESSOR_FLAG, SLOT_FUNCTION, SLOT_PARAM};
use labwired_ulp_core::memory::RTC_SLOW_MEM_BYTES;
use labwired_ulp_core::{loader, MemoryWindow, RtcSlowMemory, SharedMemory};

/// A ULP with its own RTC slow memory, run to completion on the calling
/// thread. The main core side of the mailbox is emulated between
/// instructions instead of by a real supervisor.
pub struct UlpSystem {
    core: UlpCore,
    memory: RtcSlowMemory,
    window: MemoryWindow,
}

impl UlpSystem {
    /// Loads `image` at word 0 and resets the core to it.
    pub fn from_image(image: &[u8]) -> EmuResult<Self> {
        let memory = RtcSlowMemory::default();
        let header = loader::load_binary(&memory, 0, image, RTC_SLOW_MEM_BYTES)?;
        let window = MemoryWindow::map(&header, 0);
        if window.data + SLOT_PARAM >= memory.len_words() {
            return Err(EmuError::NoMailbox);
        }
        Ok(Self {
            core: UlpCore::new(0),
            memory,
            window,
        })
    }

    pub fn core(&self) -> &UlpCore {
        &self.core
    }

    pub fn memory(&self) -> &RtcSlowMemory {
        &self.memory
    }

    fn slot(&self, slot: usize) -> u16 {
        self.memory.read_word(self.window.data + slot) as u16
    }

    /// Runs until the program reports done and returns everything it
    /// printed.
    ///
    /// A message is taken each time the coprocessor drops its lock flag.
    /// Since the emulated main core never competes for the lock, every
    /// release hands over the posted message.
    pub fn run_with_system(&mut self, max_cycles: u64) -> EmuResult<String> {
        let mut output = String::new();
        let mut previous = 0;

        loop {
            if self.core.cycles >= max_cycles {
                return Err(EmuError::CycleBudget {
                    limit: max_cycles,
                    output,
                });
            }
            if self.core.halted {
                return Err(EmuError::Halted { output });
            }
            self.core.step(&self.memory)?;

            let flag = self.slot(SLOT_COPROCESSOR_FLAG);
            if previous == 1 && flag == 0 {
                let code = self.slot(SLOT_FUNCTION);
                let param = self.slot(SLOT_PARAM);
                self.memory
                    .write_word(self.window.data + SLOT_FUNCTION, FunctionCode::Ack as u32);
                match FunctionCode::try_from(code) {
                    Ok(FunctionCode::Ack) => {}
                    Ok(FunctionCode::Done) => return Ok(output),
                    Ok(FunctionCode::PrintU16) => output.push_str(&format!("{} ", param)),
                    Ok(FunctionCode::PrintChar) => output.push(char::from((param & 0xFF) as u8)),
                    Err(code) => return Err(EmuError::Protocol(code)),
                }
            }
            previous = flag;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::{self, mailbox_image};

    #[test]
    fn test_run_with_system_collects_output() {
        let image = mailbox_image(&[
            (FunctionCode::PrintU16 as u16, 42),
            (FunctionCode::PrintChar as u16, b'A' as u16),
            (FunctionCode::Done as u16, 0),
        ])
        .unwrap();
        let mut system = UlpSystem::from_image(&image).unwrap();
        assert_eq!(system.run_with_system(100_000).unwrap(), "42 A");
        assert!(system.core().cycles > 0);
    }

    #[test]
    fn test_run_with_system_reports_unknown_function() {
        let image = mailbox_image(&[(FunctionCode::PrintU16 as u16, 7), (9, 0)]).unwrap();
        let mut system = UlpSystem::from_image(&image).unwrap();
        assert!(matches!(
            system.run_with_system(100_000),
            Err(EmuError::Protocol(9))
        ));
    }

    #[test]
    fn test_run_with_system_stops_at_cycle_budget() {
        let image = encode::program_image(
            &[encode::jump(0, crate::decoder::JumpCondition::Always)],
            labwired_ulp_core::mailbox::MAILBOX_WORDS,
        )
        .unwrap();
        let mut system = UlpSystem::from_image(&image).unwrap();
        match system.run_with_system(1000) {
            Err(EmuError::CycleBudget { limit, output }) => {
                assert_eq!(limit, 1000);
                assert!(output.is_empty());
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_run_with_system_reports_early_halt() {
        let image = mailbox_image(&[(FunctionCode::PrintU16 as u16, 3)]).unwrap();
        let mut system = UlpSystem::from_image(&image).unwrap();
        match system.run_with_system(100_000) {
            Err(EmuError::Halted { output }) => assert_eq!(output, "3 "),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_image_without_mailbox_room_is_rejected() {
        let text = vec![encode::halt(); 2040];
        let image = encode::program_image(&text, 0).unwrap();
        assert!(matches!(
            UlpSystem::from_image(&image),
            Err(EmuError::NoMailbox)
        ));
    }
}
