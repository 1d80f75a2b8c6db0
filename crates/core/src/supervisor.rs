use crate::image::{ImageHeader, MemoryWindow};
use crate::mailbox::{FunctionCode, Mailbox, Party};
use crate::{Clock, Coprocessor, HarnessError, HarnessResult, SharedMemory, SupervisionObserver};
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Budget for the `Running` state.
    pub timeout: Duration,
    /// Word index the image is loaded at.
    pub load_addr: usize,
    /// Start vector handed to the coprocessor.
    pub entry_point: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(1000),
            load_addr: 0,
            entry_point: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Idle,
    Loading,
    Running,
    Done,
    ProtocolError,
    Timeout,
    LoadFailed,
    StartFailed,
}

impl SupervisorState {
    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            SupervisorState::Idle | SupervisorState::Loading | SupervisorState::Running
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum SupervisionOutcome {
    Done,
    ProtocolError { code: u16 },
    Timeout { elapsed_ms: u64 },
}

impl SupervisionOutcome {
    pub fn into_result(self) -> HarnessResult<()> {
        match self {
            SupervisionOutcome::Done => Ok(()),
            SupervisionOutcome::ProtocolError { code } => Err(HarnessError::Protocol(code)),
            SupervisionOutcome::Timeout { elapsed_ms } => Err(HarnessError::Timeout(elapsed_ms)),
        }
    }

    fn state(self) -> SupervisorState {
        match self {
            SupervisionOutcome::Done => SupervisorState::Done,
            SupervisionOutcome::ProtocolError { .. } => SupervisorState::ProtocolError,
            SupervisionOutcome::Timeout { .. } => SupervisorState::Timeout,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisionReport {
    pub outcome: SupervisionOutcome,
    pub header: ImageHeader,
    pub window: MemoryWindow,
    /// Non-acknowledge messages taken from the mailbox.
    pub messages: usize,
    pub elapsed_ms: u64,
}

/// Loads an image onto a coprocessor, starts it and services its mailbox
/// until it reports done, misbehaves, or runs out of time.
pub struct Supervisor<M: SharedMemory, K: Clock> {
    memory: M,
    clock: K,
    config: SupervisorConfig,
    state: Cell<SupervisorState>,
    observers: Vec<Arc<dyn SupervisionObserver>>,
}

impl<M: SharedMemory, K: Clock> Supervisor<M, K> {
    pub fn new(memory: M, clock: K, config: SupervisorConfig) -> Self {
        Self {
            memory,
            clock,
            config,
            state: Cell::new(SupervisorState::Idle),
            observers: Vec::new(),
        }
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    pub fn clock(&self) -> &K {
        &self.clock
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn state(&self) -> SupervisorState {
        self.state.get()
    }

    pub fn add_observer(&mut self, observer: Arc<dyn SupervisionObserver>) {
        self.observers.push(observer);
    }

    fn transition(&self, state: SupervisorState) {
        debug!("Supervisor {:?} -> {:?}", self.state.get(), state);
        self.state.set(state);
        for observer in &self.observers {
            observer.on_state(state);
        }
    }

    /// Runs one supervision session. Coprocessor output is written to
    /// `output` as it arrives.
    ///
    /// Load and start failures are returned as errors; every outcome of the
    /// running coprocessor, good or bad, is reported in the returned report.
    pub fn supervise<C, W>(
        &mut self,
        coprocessor: &mut C,
        binary: &[u8],
        output: &mut W,
    ) -> HarnessResult<SupervisionReport>
    where
        C: Coprocessor + ?Sized,
        W: Write + ?Sized,
    {
        self.transition(SupervisorState::Loading);

        let header = match ImageHeader::parse(binary) {
            Ok(header) => header,
            Err(e) => {
                self.transition(SupervisorState::LoadFailed);
                return Err(HarnessError::Load(e));
            }
        };
        if let Err(e) = coprocessor.load_binary(self.config.load_addr, binary) {
            warn!("Coprocessor rejected image: {}", e);
            self.transition(SupervisorState::LoadFailed);
            return Err(HarnessError::Load(e));
        }
        let window = MemoryWindow::map(&header, self.config.load_addr);
        let mailbox = match Mailbox::new(&self.memory, &window) {
            Ok(mailbox) => mailbox,
            Err(e) => {
                self.transition(SupervisorState::LoadFailed);
                return Err(HarnessError::Load(e));
            }
        };
        debug!(
            "Memory window: text={} data={} bss={}",
            window.text, window.data, window.bss
        );

        if let Err(e) = coprocessor.run(self.config.entry_point) {
            warn!("Coprocessor failed to start: {}", e);
            coprocessor.halt();
            self.transition(SupervisorState::StartFailed);
            return Err(HarnessError::Start(e));
        }
        self.transition(SupervisorState::Running);

        let start = self.clock.now_ms();
        let polled = self.poll(mailbox, start, output);
        coprocessor.halt();
        let elapsed_ms = self.clock.now_ms().saturating_sub(start);
        let (outcome, messages) = polled?;

        self.transition(outcome.state());
        match outcome {
            SupervisionOutcome::Done => {
                info!("Coprocessor done after {} messages in {} ms", messages, elapsed_ms)
            }
            SupervisionOutcome::ProtocolError { code } => {
                warn!("Unknown mailbox function code {:#06x}", code)
            }
            SupervisionOutcome::Timeout { elapsed_ms } => {
                warn!("No terminal mailbox code after {} ms", elapsed_ms)
            }
        }

        Ok(SupervisionReport {
            outcome,
            header,
            window,
            messages,
            elapsed_ms,
        })
    }

    fn poll<W: Write + ?Sized>(
        &self,
        mailbox: Mailbox<'_, M>,
        start: u64,
        output: &mut W,
    ) -> HarnessResult<(SupervisionOutcome, usize)> {
        let timeout_ms = u64::try_from(self.config.timeout.as_millis()).unwrap_or(u64::MAX);
        let elapsed = || self.clock.now_ms().saturating_sub(start);
        let mut messages = 0;

        loop {
            let elapsed_ms = elapsed();
            if elapsed_ms >= timeout_ms {
                return Ok((SupervisionOutcome::Timeout { elapsed_ms }, messages));
            }

            let Some(guard) = mailbox.lock_until(Party::Main, || elapsed() >= timeout_ms) else {
                continue;
            };
            let (code, param) = guard.take_message();
            drop(guard);

            for observer in &self.observers {
                observer.on_message(code, param);
            }

            match FunctionCode::try_from(code) {
                Ok(FunctionCode::Ack) => {
                    self.clock.pause();
                    continue;
                }
                Ok(FunctionCode::Done) => {
                    messages += 1;
                    return Ok((SupervisionOutcome::Done, messages));
                }
                Ok(FunctionCode::PrintU16) => {
                    debug!("print u16 {}", param);
                    write!(output, "{} ", param)?;
                    output.flush()?;
                }
                Ok(FunctionCode::PrintChar) => {
                    debug!("print char {:#04x}", param & 0xFF);
                    output.write_all(&[(param & 0xFF) as u8])?;
                    output.flush()?;
                }
                Err(code) => {
                    return Ok((SupervisionOutcome::ProtocolError { code }, messages));
                }
            }
            messages += 1;
        }
    }
}
