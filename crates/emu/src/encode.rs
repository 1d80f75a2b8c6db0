//! Instruction encoders, the inverse of [`crate::decoder::decode`].
//!
//! Enough of an assembler to write small ULP programs by hand, plus the
//! coprocessor half of the mailbox protocol as reusable machine code.

use crate::decoder::{
    AluOp, JumpCondition, StageCondition, OP_ALU, OP_BRANCH, OP_HALT, OP_LOAD, OP_STORE,
    OP_WAIT, OP_WAKE, SUB_ALU_IMM, SUB_ALU_REG, SUB_ALU_STAGE, SUB_JUMP, SUB_JUMPR, SUB_JUMPS,
};
use labwired_ulp_core::image::{build_image, words_to_bytes};
use labwired_ulp_core::mailbox::{
    MAILBOX_WORDS, SLOT_COPROCESSOR_FLAG, SLOT_FUNCTION, SLOT_MAIN_FLAG, SLOT_PARAM, SLOT_TURN,
};
use labwired_ulp_core::CoprocessorError;

const SUB_ST: u32 = 4;

fn reg(r: u8) -> u32 {
    (r & 0x3) as u32
}

fn step_field(step: i16) -> u32 {
    let magnitude = (step.unsigned_abs() & 0x7F) as u32;
    if step < 0 {
        0x80 | magnitude
    } else {
        magnitude
    }
}

pub fn alu_reg(op: AluOp, rdst: u8, rsrc1: u8, rsrc2: u8) -> u32 {
    (OP_ALU << 28)
        | (SUB_ALU_REG << 25)
        | (op.sel() << 21)
        | (reg(rsrc2) << 4)
        | (reg(rsrc1) << 2)
        | reg(rdst)
}

pub fn alu_imm(op: AluOp, rdst: u8, rsrc1: u8, imm: u16) -> u32 {
    (OP_ALU << 28)
        | (SUB_ALU_IMM << 25)
        | (op.sel() << 21)
        | ((imm as u32) << 4)
        | (reg(rsrc1) << 2)
        | reg(rdst)
}

pub fn move_imm(rdst: u8, imm: u16) -> u32 {
    alu_imm(AluOp::Move, rdst, 0, imm)
}

pub fn stage_inc(n: u8) -> u32 {
    (OP_ALU << 28) | (SUB_ALU_STAGE << 25) | ((n as u32) << 4)
}

pub fn stage_dec(n: u8) -> u32 {
    (OP_ALU << 28) | (SUB_ALU_STAGE << 25) | (1 << 21) | ((n as u32) << 4)
}

pub fn stage_rst() -> u32 {
    (OP_ALU << 28) | (SUB_ALU_STAGE << 25) | (2 << 21)
}

/// `ST rsrc, rdst, offset`: stores `rsrc` at word `rdst + offset`.
pub fn st(rsrc: u8, rdst: u8, offset: u16) -> u32 {
    (OP_STORE << 28)
        | (SUB_ST << 25)
        | (((offset as u32) & 0x7FF) << 10)
        | (reg(rdst) << 2)
        | reg(rsrc)
}

/// `LD rdst, rsrc, offset`: loads word `rsrc + offset` into `rdst`.
pub fn ld(rdst: u8, rsrc: u8, offset: u16) -> u32 {
    (OP_LOAD << 28) | (((offset as u32) & 0x7FF) << 10) | (reg(rsrc) << 2) | reg(rdst)
}

fn condition_field(condition: JumpCondition) -> u32 {
    match condition {
        JumpCondition::Always => 0,
        JumpCondition::Zero => 1,
        JumpCondition::Overflow => 2,
    }
}

pub fn jump(addr: u16, condition: JumpCondition) -> u32 {
    (OP_BRANCH << 28)
        | (SUB_JUMP << 25)
        | (condition_field(condition) << 22)
        | (((addr as u32) & 0x7FF) << 2)
}

pub fn jump_reg(r: u8, condition: JumpCondition) -> u32 {
    (OP_BRANCH << 28) | (SUB_JUMP << 25) | (condition_field(condition) << 22) | (1 << 21) | reg(r)
}

/// `JUMPR step, threshold, LT|GE` on R0.
pub fn jumpr(step: i16, threshold: u16, ge: bool) -> u32 {
    (OP_BRANCH << 28)
        | (SUB_JUMPR << 25)
        | (step_field(step) << 17)
        | ((ge as u32) << 16)
        | threshold as u32
}

pub fn jumps(step: i16, threshold: u8, condition: StageCondition) -> u32 {
    let cond = match condition {
        StageCondition::Lt => 0,
        StageCondition::Ge => 1,
        StageCondition::Le => 2,
    };
    (OP_BRANCH << 28)
        | (SUB_JUMPS << 25)
        | (step_field(step) << 17)
        | (cond << 15)
        | threshold as u32
}

pub fn wake() -> u32 {
    (OP_WAKE << 28) | 1
}

pub fn wait(cycles: u16) -> u32 {
    (OP_WAIT << 28) | cycles as u32
}

pub fn halt() -> u32 {
    OP_HALT << 28
}

/// Length of [`mailbox_post`] in words.
pub const POST_WORDS: usize = 19;

/// Coprocessor side of posting one message: takes the lock as party 0,
/// posts `code`/`param` once the previous message has been acknowledged,
/// and releases. While the slot is still busy the lock is released and
/// the whole sequence retried from `at`.
///
/// `at` is the word index the block is placed at and `data` the word index
/// of the mailbox. Clobbers R0..R2.
pub fn mailbox_post(at: u16, data: u16, code: u16, param: u16) -> Vec<u32> {
    let flag = SLOT_COPROCESSOR_FLAG as u16;
    vec![
        move_imm(2, data),
        move_imm(1, 1),
        st(1, 2, flag),
        // turn = main core
        st(1, 2, SLOT_TURN as u16),
        ld(0, 2, SLOT_MAIN_FLAG as u16),
        jumpr(3, 1, false),
        ld(0, 2, SLOT_TURN as u16),
        jumpr(-3, 1, true),
        // critical section
        ld(0, 2, SLOT_FUNCTION as u16),
        jumpr(4, 1, false),
        move_imm(0, 0),
        st(0, 2, flag),
        jump(at, JumpCondition::Always),
        move_imm(0, param),
        st(0, 2, SLOT_PARAM as u16),
        move_imm(0, code),
        st(0, 2, SLOT_FUNCTION as u16),
        move_imm(0, 0),
        st(0, 2, flag),
    ]
}

/// A complete program posting `messages` in order, then halting. The
/// mailbox directly follows the code.
pub fn mailbox_program(messages: &[(u16, u16)]) -> Vec<u32> {
    let data = (messages.len() * POST_WORDS + 1) as u16;
    let mut text = Vec::with_capacity(data as usize);
    for &(code, param) in messages {
        let at = text.len() as u16;
        text.extend(mailbox_post(at, data, code, param));
    }
    text.push(halt());
    text
}

/// Packs `text` and `data_words` zeroed data words as a loadable binary.
pub fn program_image(text: &[u32], data_words: usize) -> Result<Vec<u8>, CoprocessorError> {
    build_image(&words_to_bytes(text), &vec![0u8; data_words * 4], 0)
}

/// [`mailbox_program`] packed as a loadable ULP binary.
pub fn mailbox_image(messages: &[(u16, u16)]) -> Result<Vec<u8>, CoprocessorError> {
    program_image(&mailbox_program(messages), MAILBOX_WORDS)
}
