// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::decoder::{
    decode, AluOp, Instruction, JumpCondition, JumpTarget, StageCondition,
};
use crate::{EmuError, EmuResult};
use labwired_ulp_core::SharedMemory;

/// The ULP addresses memory in words through an 11-bit bus.
pub const ADDRESS_MASK: usize = 0x7FF;

const CYCLES_ALU: u64 = 6;
const CYCLES_MEMORY: u64 = 8;
const CYCLES_JUMP: u64 = 4;
const CYCLES_WAKE: u64 = 6;
const CYCLES_HALT: u64 = 2;

#[derive(Debug, Default, Clone)]
pub struct UlpCore {
    pub r: [u16; 4],
    pub zero: bool,
    pub overflow: bool,
    /// Stage count register.
    pub stage: u8,
    /// Word index of the next instruction.
    pub ip: u16,
    /// Set by `WAKE`.
    pub wake: bool,
    pub halted: bool,
    pub cycles: u64,
}

impl UlpCore {
    pub fn new(entry_point: u16) -> Self {
        Self {
            ip: entry_point,
            ..Self::default()
        }
    }

    fn address(&self, base: u16, offset: u16, len_words: usize) -> EmuResult<usize> {
        let address = (base.wrapping_add(offset) as usize) & ADDRESS_MASK;
        if address >= len_words {
            return Err(EmuError::MemoryViolation {
                ip: self.ip,
                address,
            });
        }
        Ok(address)
    }

    fn alu(&mut self, op: AluOp, rdst: u8, a: u16, b: u16) {
        let (a, b) = (a as u32, b as u32);
        let out = match op {
            AluOp::Add => a + b,
            AluOp::Sub => a.wrapping_sub(b),
            AluOp::And => a & b,
            AluOp::Or => a | b,
            AluOp::Move => b,
            AluOp::Lsh => a.checked_shl(b).unwrap_or(0),
            AluOp::Rsh => a.checked_shr(b).unwrap_or(0),
        };
        let out16 = out as u16;
        self.r[rdst as usize] = out16;
        self.zero = out16 == 0;
        if matches!(op, AluOp::Add | AluOp::Sub) {
            self.overflow = out > 0xFFFF;
        }
    }

    fn branch(&mut self, taken: bool, step: i16) {
        self.ip = if taken {
            self.ip.wrapping_add_signed(step)
        } else {
            self.ip.wrapping_add(1)
        };
    }

    /// Fetches and executes one instruction. A halted core does nothing.
    pub fn step<M: SharedMemory + ?Sized>(&mut self, memory: &M) -> EmuResult<()> {
        if self.halted {
            return Ok(());
        }
        let ip = self.ip as usize;
        if ip >= memory.len_words() {
            return Err(EmuError::MemoryViolation {
                ip: self.ip,
                address: ip,
            });
        }
        let word = memory.read_word(ip);
        let instruction = decode(word);
        tracing::trace!("IP={:#x}, Op={:#010x}, Instr={:?}", self.ip, word, instruction);

        match instruction {
            Instruction::AluReg {
                op,
                rdst,
                rsrc1,
                rsrc2,
            } => {
                // register move copies rsrc1
                let (a, b) = match op {
                    AluOp::Move => (0, self.r[rsrc1 as usize]),
                    _ => (self.r[rsrc1 as usize], self.r[rsrc2 as usize]),
                };
                self.alu(op, rdst, a, b);
                self.ip = self.ip.wrapping_add(1);
                self.cycles += CYCLES_ALU;
            }
            Instruction::AluImm {
                op,
                rdst,
                rsrc1,
                imm,
            } => {
                self.alu(op, rdst, self.r[rsrc1 as usize], imm);
                self.ip = self.ip.wrapping_add(1);
                self.cycles += CYCLES_ALU;
            }
            Instruction::StageInc(n) => {
                self.stage = self.stage.wrapping_add(n);
                self.ip = self.ip.wrapping_add(1);
                self.cycles += CYCLES_ALU;
            }
            Instruction::StageDec(n) => {
                self.stage = self.stage.wrapping_sub(n);
                self.ip = self.ip.wrapping_add(1);
                self.cycles += CYCLES_ALU;
            }
            Instruction::StageRst => {
                self.stage = 0;
                self.ip = self.ip.wrapping_add(1);
                self.cycles += CYCLES_ALU;
            }
            Instruction::Store { rsrc, rdst, offset } => {
                let address = self.address(self.r[rdst as usize], offset, memory.len_words())?;
                let upper = (((self.ip as u32) & ADDRESS_MASK as u32) << 5) | rdst as u32;
                memory.write_word(address, (upper << 16) | self.r[rsrc as usize] as u32);
                self.ip = self.ip.wrapping_add(1);
                self.cycles += CYCLES_MEMORY;
            }
            Instruction::Load { rdst, rsrc, offset } => {
                let address = self.address(self.r[rsrc as usize], offset, memory.len_words())?;
                self.r[rdst as usize] = memory.read_word(address) as u16;
                self.ip = self.ip.wrapping_add(1);
                self.cycles += CYCLES_MEMORY;
            }
            Instruction::Jump { target, condition } => {
                let target = match target {
                    JumpTarget::Imm(addr) => addr,
                    JumpTarget::Reg(r) => self.r[r as usize],
                };
                let taken = match condition {
                    JumpCondition::Always => true,
                    JumpCondition::Zero => self.zero,
                    JumpCondition::Overflow => self.overflow,
                };
                self.ip = if taken { target } else { self.ip.wrapping_add(1) };
                self.cycles += CYCLES_JUMP;
            }
            Instruction::JumpRel {
                step,
                threshold,
                ge,
            } => {
                let below = self.r[0] < threshold;
                self.branch(below != ge, step);
                self.cycles += CYCLES_JUMP;
            }
            Instruction::JumpStage {
                step,
                threshold,
                condition,
            } => {
                let taken = match condition {
                    StageCondition::Lt => self.stage < threshold,
                    StageCondition::Ge => self.stage >= threshold,
                    StageCondition::Le => self.stage <= threshold,
                };
                self.branch(taken, step);
                self.cycles += CYCLES_JUMP;
            }
            Instruction::Wake => {
                self.wake = true;
                self.ip = self.ip.wrapping_add(1);
                self.cycles += CYCLES_WAKE;
            }
            Instruction::Wait(n) => {
                self.ip = self.ip.wrapping_add(1);
                self.cycles += CYCLES_ALU + n as u64;
            }
            Instruction::Halt => {
                self.halted = true;
                self.cycles += CYCLES_HALT;
            }
            Instruction::Unknown(word) => {
                return Err(EmuError::UnknownInstruction { ip: self.ip, word });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode;
    use labwired_ulp_core::RtcSlowMemory;

    fn run(program: &[u32]) -> (UlpCore, RtcSlowMemory) {
        let memory = RtcSlowMemory::default();
        for (i, word) in program.iter().enumerate() {
            memory.write_word(i, *word);
        }
        let mut core = UlpCore::new(0);
        while !core.halted {
            core.step(&memory).unwrap();
        }
        (core, memory)
    }

    #[test]
    fn test_alu_add_sets_overflow() {
        let (core, _) = run(&[
            encode::move_imm(0, 0xFFFF),
            encode::alu_imm(AluOp::Add, 1, 0, 2),
            encode::halt(),
        ]);
        assert_eq!(core.r[1], 1);
        assert!(core.overflow);
        assert!(!core.zero);
        assert_eq!(core.cycles, 6 + 6 + 2);
    }

    #[test]
    fn test_alu_sub_to_zero() {
        let (core, _) = run(&[
            encode::move_imm(0, 5),
            encode::move_imm(1, 5),
            encode::alu_reg(AluOp::Sub, 2, 0, 1),
            encode::halt(),
        ]);
        assert_eq!(core.r[2], 0);
        assert!(core.zero);
        assert!(!core.overflow);
    }

    #[test]
    fn test_alu_or_immediate() {
        let (core, _) = run(&[
            encode::move_imm(0, 0x0F00),
            encode::alu_imm(AluOp::Or, 0, 0, 0x00F0),
            encode::halt(),
        ]);
        assert_eq!(core.r[0], 0x0FF0);
    }

    #[test]
    fn test_oversized_shift_clears_register() {
        let (core, _) = run(&[
            encode::move_imm(0, 1),
            encode::alu_imm(AluOp::Lsh, 0, 0, 40),
            encode::halt(),
        ]);
        assert_eq!(core.r[0], 0);
        assert!(core.zero);
    }

    #[test]
    fn test_store_tags_upper_half_with_pc() {
        let (_, memory) = run(&[
            encode::move_imm(1, 100),
            encode::move_imm(0, 0xBEEF),
            encode::st(0, 1, 3),
            encode::halt(),
        ]);
        let word = memory.read_word(103);
        assert_eq!(word & 0xFFFF, 0xBEEF);
        assert_eq!(word >> 16, (2 << 5) | 1);
    }

    #[test]
    fn test_load_takes_low_half() {
        let memory = RtcSlowMemory::default();
        memory.write_word(50, 0xABCD_1234);
        let program = [encode::move_imm(2, 50), encode::ld(3, 2, 0), encode::halt()];
        for (i, word) in program.iter().enumerate() {
            memory.write_word(i, *word);
        }
        let mut core = UlpCore::new(0);
        while !core.halted {
            core.step(&memory).unwrap();
        }
        assert_eq!(core.r[3], 0x1234);
    }

    #[test]
    fn test_stage_loop_counts() {
        // r0 += 1 three times using the stage counter
        let (core, _) = run(&[
            encode::stage_rst(),
            encode::alu_imm(AluOp::Add, 0, 0, 1),
            encode::stage_inc(1),
            encode::jumps(-2, 3, StageCondition::Lt),
            encode::halt(),
        ]);
        assert_eq!(core.r[0], 3);
        assert_eq!(core.stage, 3);
    }

    #[test]
    fn test_conditional_jump_on_zero() {
        let (core, _) = run(&[
            encode::move_imm(0, 0),
            encode::jump(3, JumpCondition::Zero),
            encode::move_imm(1, 0xDEAD),
            encode::move_imm(2, 7),
            encode::halt(),
        ]);
        assert_eq!(core.r[1], 0);
        assert_eq!(core.r[2], 7);
    }

    #[test]
    fn test_wake_sets_flag() {
        let (core, _) = run(&[encode::wake(), encode::halt()]);
        assert!(core.wake);
    }

    #[test]
    fn test_out_of_range_store_faults() {
        let memory = RtcSlowMemory::new(64);
        memory.write_word(0, encode::move_imm(1, 40));
        memory.write_word(1, encode::st(0, 1, 0));
        let mut core = UlpCore::new(0);
        core.step(&memory).unwrap();
        match core.step(&memory) {
            Err(EmuError::MemoryViolation { ip, address }) => {
                assert_eq!(ip, 1);
                assert_eq!(address, 40);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_instruction_faults() {
        let memory = RtcSlowMemory::new(64);
        let mut core = UlpCore::new(0);
        assert!(matches!(
            core.step(&memory),
            Err(EmuError::UnknownInstruction { ip: 0, word: 0 })
        ));
    }
}
