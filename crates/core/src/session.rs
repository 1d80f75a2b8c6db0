//! Line-oriented command session: the harness side of the serial protocol.
//!
//! Each line is a base64 encoded ULP binary. Input is echoed as it
//! arrives, `^` drops the line being typed, and every submitted line gets
//! exactly one reply ending in `OK` or `ERR`.

use crate::memory::RTC_SLOW_MEM_BYTES;
use crate::supervisor::{SupervisionReport, Supervisor};
use crate::{Clock, Coprocessor, HarnessError, HarnessResult, SharedMemory};
use base64::Engine;
use std::io::{BufReader, Read, Write};
use tracing::{debug, info, warn};

pub const COMMAND_CAPACITY: usize = 100 * 1024;
pub const BINARY_CAPACITY: usize = RTC_SLOW_MEM_BYTES;

/// mbedtls `MBEDTLS_ERR_BASE64_BUFFER_TOO_SMALL`
pub const DECODE_BUFFER_TOO_SMALL: i32 = -0x002A;
/// mbedtls `MBEDTLS_ERR_BASE64_INVALID_CHARACTER`
pub const DECODE_INVALID_CHARACTER: i32 = -0x002C;

const ABORT: u8 = b'^';

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub command_capacity: usize,
    pub binary_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command_capacity: COMMAND_CAPACITY,
            binary_capacity: BINARY_CAPACITY,
        }
    }
}

/// Decodes one command line into a binary of at most `capacity` bytes.
pub fn decode_command(line: &[u8], capacity: usize) -> HarnessResult<Vec<u8>> {
    let binary = base64::engine::general_purpose::STANDARD
        .decode(line)
        .map_err(|e| HarnessError::Decode {
            code: DECODE_INVALID_CHARACTER,
            reason: e.to_string(),
        })?;
    if binary.len() > capacity {
        return Err(HarnessError::Decode {
            code: DECODE_BUFFER_TOO_SMALL,
            reason: format!("{} bytes exceed the {} byte buffer", binary.len(), capacity),
        });
    }
    Ok(binary)
}

/// Reply text for a finished command, written after the echoed line.
pub fn reply(result: &HarnessResult<()>) -> String {
    match result {
        Ok(()) => " OK\n".to_string(),
        Err(e @ HarnessError::Decode { .. }) => {
            format!("decoding {} ERR\n", e.code().unwrap_or_default())
        }
        Err(e) => match e.code() {
            Some(code) => format!("ulp {} ERR\n", code),
            None => " ERR\n".to_string(),
        },
    }
}

pub struct CommandSession<M: SharedMemory, K: Clock, C: Coprocessor> {
    supervisor: Supervisor<M, K>,
    coprocessor: C,
    config: SessionConfig,
}

impl<M: SharedMemory, K: Clock, C: Coprocessor> CommandSession<M, K, C> {
    pub fn new(supervisor: Supervisor<M, K>, coprocessor: C, config: SessionConfig) -> Self {
        Self {
            supervisor,
            coprocessor,
            config,
        }
    }

    pub fn supervisor(&self) -> &Supervisor<M, K> {
        &self.supervisor
    }

    pub fn coprocessor_mut(&mut self) -> &mut C {
        &mut self.coprocessor
    }

    /// Runs one complete command. An empty line is a no-op that succeeds.
    pub fn submit<W: Write + ?Sized>(
        &mut self,
        line: &[u8],
        output: &mut W,
    ) -> HarnessResult<Option<SupervisionReport>> {
        if line.is_empty() {
            return Ok(None);
        }
        let binary = decode_command(line, self.config.binary_capacity)?;
        debug!("Decoded {} byte binary", binary.len());

        self.supervisor.memory().erase();
        let report = self
            .supervisor
            .supervise(&mut self.coprocessor, &binary, output)?;
        report.outcome.into_result()?;
        Ok(Some(report))
    }

    /// Serves commands from `input` until it is exhausted.
    pub fn serve<R: Read, W: Write>(&mut self, input: R, mut output: W) -> HarnessResult<()> {
        let mut line = Vec::new();
        let mut discarding = false;

        for byte in BufReader::new(input).bytes() {
            let byte = byte?;
            match byte {
                b'\r' => continue,
                b'\n' if discarding => {
                    discarding = false;
                }
                b'\n' => {
                    output.write_all(b" ")?;
                    let result = match self.submit(&line, &mut output) {
                        Err(HarnessError::Io(e)) => return Err(HarnessError::Io(e)),
                        other => other.map(|_| ()),
                    };
                    if let Err(e) = &result {
                        warn!("Command failed: {}", e);
                    } else {
                        self.supervisor.clock().pause();
                    }
                    output.write_all(reply(&result).as_bytes())?;
                    line.clear();
                }
                ABORT => {
                    debug!("Line aborted");
                    line.clear();
                    discarding = false;
                }
                _ if discarding => {}
                _ => {
                    output.write_all(&[byte])?;
                    line.push(byte);
                    if line.len() > self.config.command_capacity {
                        let result = Err(HarnessError::InputTooLarge {
                            capacity: self.config.command_capacity,
                        });
                        output.write_all(reply(&result).as_bytes())?;
                        line.clear();
                        discarding = true;
                    }
                }
            }
            output.flush()?;
        }

        info!("Command input closed");
        Ok(())
    }
}
