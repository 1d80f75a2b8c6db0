//! Mailbox shared between the main core and the ULP, guarded by Peterson's
//! two-party mutual exclusion.
//!
//! The mailbox occupies the first five words of the image's `.data`
//! section. Neither side has atomic read-modify-write access to RTC slow
//! memory, so the lock is built from plain word loads and stores:
//!
//! | slot | meaning                       | written by   |
//! |------|-------------------------------|--------------|
//! | 0    | coprocessor wants the lock    | coprocessor  |
//! | 1    | main core wants the lock      | main core    |
//! | 2    | turn (index of yielding side) | both         |
//! | 3    | function code / acknowledge   | both         |
//! | 4    | parameter                     | coprocessor  |
//!
//! Only the low 16 bits of a slot are meaningful: the ULP `ST` instruction
//! fills the upper half with its program counter.

use crate::image::MemoryWindow;
use crate::{CoprocessorError, SharedMemory};
use std::hint::spin_loop;

pub const SLOT_COPROCESSOR_FLAG: usize = 0;
pub const SLOT_MAIN_FLAG: usize = 1;
pub const SLOT_TURN: usize = 2;
pub const SLOT_FUNCTION: usize = 3;
pub const SLOT_PARAM: usize = 4;
pub const MAILBOX_WORDS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum FunctionCode {
    /// Slot is free; the previous message was consumed.
    Ack = 0x0000,
    Done = 0x0001,
    PrintU16 = 0x0002,
    PrintChar = 0x0003,
}

impl TryFrom<u16> for FunctionCode {
    type Error = u16;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        match code {
            0x0000 => Ok(FunctionCode::Ack),
            0x0001 => Ok(FunctionCode::Done),
            0x0002 => Ok(FunctionCode::PrintU16),
            0x0003 => Ok(FunctionCode::PrintChar),
            other => Err(other),
        }
    }
}

impl From<FunctionCode> for u16 {
    fn from(code: FunctionCode) -> Self {
        code as u16
    }
}

/// One side of the lock. The discriminant is the party's flag slot and the
/// value written to the turn slot when the other side yields to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Party {
    Coprocessor = 0,
    Main = 1,
}

impl Party {
    pub fn other(self) -> Party {
        match self {
            Party::Coprocessor => Party::Main,
            Party::Main => Party::Coprocessor,
        }
    }

    pub fn flag_slot(self) -> usize {
        self as usize
    }

    fn index(self) -> u16 {
        self as u16
    }
}

pub struct Mailbox<'m, M: SharedMemory + ?Sized> {
    memory: &'m M,
    base: usize,
}

impl<M: SharedMemory + ?Sized> Clone for Mailbox<'_, M> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<M: SharedMemory + ?Sized> Copy for Mailbox<'_, M> {}

impl<M: SharedMemory + ?Sized> std::fmt::Debug for Mailbox<'_, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox").field("base", &self.base).finish()
    }
}

impl<'m, M: SharedMemory + ?Sized> Mailbox<'m, M> {
    /// Binds the mailbox to the start of the image's `.data` section.
    pub fn new(memory: &'m M, window: &MemoryWindow) -> Result<Self, CoprocessorError> {
        if window.data + MAILBOX_WORDS > memory.len_words() {
            return Err(CoprocessorError::InvalidSize(format!(
                "mailbox at word {} does not fit in {} words of shared memory",
                window.data,
                memory.len_words()
            )));
        }
        Ok(Self {
            memory,
            base: window.data,
        })
    }

    pub fn base(&self) -> usize {
        self.base
    }

    /// Unlocked read. Only the lock slots may be inspected this way while the
    /// other side is running.
    pub fn read(&self, slot: usize) -> u16 {
        (self.memory.read_word(self.base + slot) & 0xFFFF) as u16
    }

    fn write(&self, slot: usize, value: u16) {
        self.memory.write_word(self.base + slot, value as u32);
    }

    /// Acquires the lock for `party`, spinning for as long as it takes.
    pub fn lock(&self, party: Party) -> MailboxGuard<'m, M> {
        self.enter(party);
        while self.contended(party) {
            spin_loop();
        }
        MailboxGuard {
            mailbox: *self,
            party,
        }
    }

    /// Acquires the lock for `party` unless `expired` reports true while
    /// waiting. On expiry the party withdraws its request before returning.
    pub fn lock_until<F>(&self, party: Party, mut expired: F) -> Option<MailboxGuard<'m, M>>
    where
        F: FnMut() -> bool,
    {
        self.enter(party);
        while self.contended(party) {
            if expired() {
                self.release(party);
                return None;
            }
            spin_loop();
        }
        Some(MailboxGuard {
            mailbox: *self,
            party,
        })
    }

    // flag[me] = true; turn = other
    fn enter(&self, party: Party) {
        self.write(party.flag_slot(), 1);
        self.write(SLOT_TURN, party.other().index());
    }

    // flag[other] && turn == other
    fn contended(&self, party: Party) -> bool {
        let other = party.other();
        self.read(other.flag_slot()) != 0 && self.read(SLOT_TURN) == other.index()
    }

    fn release(&self, party: Party) {
        self.write(party.flag_slot(), 0);
    }
}

/// Proof of holding the mailbox lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct MailboxGuard<'m, M: SharedMemory + ?Sized> {
    mailbox: Mailbox<'m, M>,
    party: Party,
}

impl<M: SharedMemory + ?Sized> MailboxGuard<'_, M> {
    pub fn party(&self) -> Party {
        self.party
    }

    pub fn read(&self, slot: usize) -> u16 {
        self.mailbox.read(slot)
    }

    pub fn write(&self, slot: usize, value: u16) {
        self.mailbox.write(slot, value);
    }

    /// Reads the pending function code and parameter and marks the slot as
    /// acknowledged, all before the lock is given back.
    pub fn take_message(&self) -> (u16, u16) {
        let code = self.read(SLOT_FUNCTION);
        let param = self.read(SLOT_PARAM);
        self.write(SLOT_FUNCTION, FunctionCode::Ack.into());
        (code, param)
    }

    /// Posts a message if the previous one has been acknowledged.
    pub fn try_post(&self, code: u16, param: u16) -> bool {
        if self.read(SLOT_FUNCTION) != u16::from(FunctionCode::Ack) {
            return false;
        }
        self.write(SLOT_PARAM, param);
        self.write(SLOT_FUNCTION, code);
        true
    }
}

impl<M: SharedMemory + ?Sized> Drop for MailboxGuard<'_, M> {
    fn drop(&mut self) {
        self.mailbox.release(self.party);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::RtcSlowMemory;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    fn window_at(data: usize) -> MemoryWindow {
        MemoryWindow {
            text: 0,
            data,
            bss: data + MAILBOX_WORDS,
        }
    }

    #[test]
    fn test_function_code_conversion() {
        assert_eq!(FunctionCode::try_from(2), Ok(FunctionCode::PrintU16));
        assert_eq!(FunctionCode::try_from(0xFFFF), Err(0xFFFF));
        assert_eq!(u16::from(FunctionCode::Done), 1);
    }

    #[test]
    fn test_mailbox_must_fit_in_memory() {
        let mem = RtcSlowMemory::new(64);
        assert!(Mailbox::new(&mem, &window_at(11)).is_ok());
        assert!(Mailbox::new(&mem, &window_at(12)).is_err());
    }

    #[test]
    fn test_main_lock_writes_flag_and_turn() {
        let mem = RtcSlowMemory::default();
        let mailbox = Mailbox::new(&mem, &window_at(8)).unwrap();

        let guard = mailbox.lock(Party::Main);
        assert_eq!(mem.read_word(8 + SLOT_MAIN_FLAG), 1);
        assert_eq!(mem.read_word(8 + SLOT_TURN), 0);
        drop(guard);
        assert_eq!(mem.read_word(8 + SLOT_MAIN_FLAG), 0);
    }

    #[test]
    fn test_coprocessor_lock_mirrors_main() {
        let mem = RtcSlowMemory::default();
        let mailbox = Mailbox::new(&mem, &window_at(8)).unwrap();

        let guard = mailbox.lock(Party::Coprocessor);
        assert_eq!(mem.read_word(8 + SLOT_COPROCESSOR_FLAG), 1);
        assert_eq!(mem.read_word(8 + SLOT_TURN), 1);
        drop(guard);
        assert_eq!(mem.read_word(8 + SLOT_COPROCESSOR_FLAG), 0);
    }

    #[test]
    fn test_reads_ignore_upper_half() {
        let mem = RtcSlowMemory::default();
        let mailbox = Mailbox::new(&mem, &window_at(4)).unwrap();
        // what a ULP `st` leaves behind: pc and register in the upper half
        mem.write_word(4 + SLOT_FUNCTION, (0x0123 << 16) | 0x0002);
        assert_eq!(mailbox.read(SLOT_FUNCTION), 2);
    }

    #[test]
    fn test_lock_until_gives_up_and_withdraws() {
        let mem = RtcSlowMemory::default();
        let mailbox = Mailbox::new(&mem, &window_at(0)).unwrap();
        // coprocessor holds the lock and is waiting its turn
        mem.write_word(SLOT_COPROCESSOR_FLAG, 1);

        let mut polls = 0;
        let guard = mailbox.lock_until(Party::Main, || {
            polls += 1;
            polls > 10
        });
        assert!(guard.is_none());
        assert_eq!(polls, 11);
        assert_eq!(mem.read_word(SLOT_MAIN_FLAG), 0);
    }

    #[test]
    fn test_take_message_acknowledges() {
        let mem = RtcSlowMemory::default();
        let mailbox = Mailbox::new(&mem, &window_at(0)).unwrap();
        {
            let guard = mailbox.lock(Party::Coprocessor);
            assert!(guard.try_post(FunctionCode::PrintU16.into(), 7));
            assert!(!guard.try_post(FunctionCode::Done.into(), 0));
        }
        let guard = mailbox.lock(Party::Main);
        assert_eq!(guard.take_message(), (2, 7));
        assert_eq!(guard.read(SLOT_FUNCTION), 0);
        assert!(guard.try_post(FunctionCode::Done.into(), 0));
    }

    #[test]
    fn test_mutual_exclusion_between_threads() {
        const ROUNDS: usize = 5_000;
        let mem = RtcSlowMemory::default();
        let inside = Arc::new(AtomicBool::new(false));
        let violations = Arc::new(AtomicUsize::new(0));
        // counter lives in shared memory and is bumped with a plain
        // load/store pair, so any overlap loses an increment
        let counter_slot = 64;

        let workers: Vec<_> = [Party::Main, Party::Coprocessor]
            .into_iter()
            .map(|party| {
                let mem = mem.clone();
                let inside = inside.clone();
                let violations = violations.clone();
                thread::spawn(move || {
                    let mailbox = Mailbox::new(&mem, &window_at(0)).unwrap();
                    for _ in 0..ROUNDS {
                        let _guard = mailbox.lock(party);
                        if inside.swap(true, Ordering::SeqCst) {
                            violations.fetch_add(1, Ordering::SeqCst);
                        }
                        let v = mem.read_word(counter_slot);
                        mem.write_word(counter_slot, v + 1);
                        inside.store(false, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(violations.load(Ordering::SeqCst), 0);
        assert_eq!(mem.read_word(counter_slot), (2 * ROUNDS) as u32);
    }

    #[test]
    fn test_main_acquires_once_coprocessor_releases() {
        let mem = RtcSlowMemory::default();
        let holder = mem.clone();
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();

        let coprocessor = thread::spawn(move || {
            let mailbox = Mailbox::new(&holder, &window_at(0)).unwrap();
            let guard = mailbox.lock(Party::Coprocessor);
            locked_tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(20));
            drop(guard);
        });

        locked_rx.recv().unwrap();
        let mailbox = Mailbox::new(&mem, &window_at(0)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        let guard = mailbox.lock_until(Party::Main, || Instant::now() > deadline);
        assert!(guard.is_some());
        coprocessor.join().unwrap();
    }

    #[test]
    fn test_turn_token_lets_waiting_party_in() {
        let mem = RtcSlowMemory::default();
        let mailbox = Mailbox::new(&mem, &window_at(0)).unwrap();
        // both want the lock; the coprocessor wrote turn last, yielding to main
        mem.write_word(SLOT_COPROCESSOR_FLAG, 1);
        mem.write_word(SLOT_TURN, 1);

        let mut polls = 0;
        // main's own entry sets turn = 0, so it waits until the coprocessor
        // hands the turn back
        let guard = mailbox.lock_until(Party::Main, || {
            polls += 1;
            if polls == 3 {
                mem.write_word(SLOT_TURN, 1);
            }
            polls > 100
        });
        assert!(guard.is_some());
        assert_eq!(polls, 3);
    }
}
