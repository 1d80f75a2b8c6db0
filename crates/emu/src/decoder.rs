// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! ESP32 ULP FSM instruction decoder.

pub const OP_WAIT: u32 = 4;
pub const OP_STORE: u32 = 6;
pub const OP_ALU: u32 = 7;
pub const OP_BRANCH: u32 = 8;
pub const OP_WAKE: u32 = 9;
pub const OP_HALT: u32 = 11;
pub const OP_LOAD: u32 = 13;

pub const SUB_ALU_REG: u32 = 0;
pub const SUB_ALU_IMM: u32 = 1;
pub const SUB_ALU_STAGE: u32 = 2;
pub const SUB_JUMP: u32 = 0;
pub const SUB_JUMPR: u32 = 1;
pub const SUB_JUMPS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Sub,
    And,
    Or,
    Move,
    Lsh,
    Rsh,
}

impl AluOp {
    fn from_sel(sel: u32) -> Option<Self> {
        Some(match sel {
            0 => AluOp::Add,
            1 => AluOp::Sub,
            2 => AluOp::And,
            3 => AluOp::Or,
            4 => AluOp::Move,
            5 => AluOp::Lsh,
            6 => AluOp::Rsh,
            _ => return None,
        })
    }

    pub fn sel(self) -> u32 {
        self as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpTarget {
    Imm(u16),
    Reg(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpCondition {
    Always,
    Zero,
    Overflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageCondition {
    Lt,
    Ge,
    Le,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    AluReg { op: AluOp, rdst: u8, rsrc1: u8, rsrc2: u8 },
    AluImm { op: AluOp, rdst: u8, rsrc1: u8, imm: u16 },
    StageInc(u8),
    StageDec(u8),
    StageRst,
    Store { rsrc: u8, rdst: u8, offset: u16 },
    Load { rdst: u8, rsrc: u8, offset: u16 },
    Jump { target: JumpTarget, condition: JumpCondition },
    /// Relative jump on R0 compared with `threshold`: taken when
    /// `R0 < threshold`, or `R0 >= threshold` if `ge` is set.
    JumpRel { step: i16, threshold: u16, ge: bool },
    JumpStage { step: i16, threshold: u8, condition: StageCondition },
    Wake,
    Wait(u16),
    Halt,
    Unknown(u32),
}

pub(crate) fn bits(word: u32, offset: u32, size: u32) -> u32 {
    (word >> offset) & ((1 << size) - 1)
}

// 8-bit step: bit 7 is the sign, the rest the magnitude
fn relative_step(raw: u32) -> i16 {
    let magnitude = (raw & 0x7F) as i16;
    if raw & 0x80 != 0 {
        -magnitude
    } else {
        magnitude
    }
}

pub fn decode(word: u32) -> Instruction {
    let op = bits(word, 28, 4);
    let sub_op = bits(word, 25, 3);

    match op {
        OP_ALU => {
            let rdst = bits(word, 0, 2) as u8;
            let rsrc1 = bits(word, 2, 2) as u8;
            let sel = bits(word, 21, 4);
            match sub_op {
                SUB_ALU_REG => match AluOp::from_sel(sel) {
                    Some(op) => Instruction::AluReg {
                        op,
                        rdst,
                        rsrc1,
                        rsrc2: bits(word, 4, 2) as u8,
                    },
                    None => Instruction::Unknown(word),
                },
                SUB_ALU_IMM => match AluOp::from_sel(sel) {
                    Some(op) => Instruction::AluImm {
                        op,
                        rdst,
                        rsrc1,
                        imm: bits(word, 4, 16) as u16,
                    },
                    None => Instruction::Unknown(word),
                },
                SUB_ALU_STAGE => {
                    let imm = bits(word, 4, 8) as u8;
                    match sel {
                        0 => Instruction::StageInc(imm),
                        1 => Instruction::StageDec(imm),
                        2 => Instruction::StageRst,
                        _ => Instruction::Unknown(word),
                    }
                }
                _ => Instruction::Unknown(word),
            }
        }
        OP_STORE => Instruction::Store {
            rsrc: bits(word, 0, 2) as u8,
            rdst: bits(word, 2, 2) as u8,
            offset: bits(word, 10, 11) as u16,
        },
        OP_LOAD => Instruction::Load {
            rdst: bits(word, 0, 2) as u8,
            rsrc: bits(word, 2, 2) as u8,
            offset: bits(word, 10, 11) as u16,
        },
        OP_BRANCH => match sub_op {
            SUB_JUMP => {
                let target = if bits(word, 21, 1) == 1 {
                    JumpTarget::Reg(bits(word, 0, 2) as u8)
                } else {
                    JumpTarget::Imm(bits(word, 2, 11) as u16)
                };
                let condition = match bits(word, 22, 3) {
                    0 => JumpCondition::Always,
                    1 => JumpCondition::Zero,
                    2 => JumpCondition::Overflow,
                    _ => return Instruction::Unknown(word),
                };
                Instruction::Jump { target, condition }
            }
            SUB_JUMPR => Instruction::JumpRel {
                step: relative_step(bits(word, 17, 8)),
                threshold: bits(word, 0, 16) as u16,
                ge: bits(word, 16, 1) == 1,
            },
            SUB_JUMPS => Instruction::JumpStage {
                step: relative_step(bits(word, 17, 8)),
                threshold: bits(word, 0, 8) as u8,
                condition: match bits(word, 15, 2) {
                    0 => StageCondition::Lt,
                    1 => StageCondition::Ge,
                    _ => StageCondition::Le,
                },
            },
            _ => Instruction::Unknown(word),
        },
        OP_WAKE => Instruction::Wake,
        OP_WAIT => Instruction::Wait(bits(word, 0, 16) as u16),
        OP_HALT => Instruction::Halt,
        _ => Instruction::Unknown(word),
    }
}
