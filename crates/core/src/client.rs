//! Host side of the command session, for driving a harness over a serial
//! port or any other byte stream.

use base64::Engine;
use std::io::{self, Read, Write};
use tracing::{debug, warn};

const MAX_ATTEMPTS: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("Transport closed before the reply was complete")]
    Closed,
    #[error("ULP app not sent correctly: {0:?}")]
    Echo(String),
    #[error("Error from test app: {0:?}")]
    Remote(String),
}

pub struct HostLink<T: Read + Write> {
    transport: T,
    attempts: usize,
}

impl<T: Read + Write> HostLink<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            attempts: MAX_ATTEMPTS,
        }
    }

    pub fn with_attempts(mut self, attempts: usize) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Sends one line and returns the reply with the echoed payload removed.
    pub fn execute_raw(&mut self, payload: &str) -> Result<String, LinkError> {
        self.transport.write_all(payload.as_bytes())?;
        self.transport.write_all(b"\n")?;
        self.transport.flush()?;

        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            if self.transport.read(&mut byte)? == 0 {
                return Err(LinkError::Closed);
            }
            match byte[0] {
                b'\r' => continue,
                b'\n' => break,
                b => line.push(b),
            }
        }

        let line = String::from_utf8_lossy(&line).into_owned();
        let echo = format!("{} ", payload);
        match line.strip_prefix(&echo) {
            Some(rest) => Ok(rest.to_string()),
            None => Err(LinkError::Echo(line)),
        }
    }

    /// Runs `binary` on the harness and returns what the coprocessor printed.
    pub fn execute(&mut self, binary: &[u8]) -> Result<String, LinkError> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(binary);
        let mut last_error = LinkError::Closed;

        for attempt in 1..=self.attempts {
            match self.execute_raw(&encoded) {
                Ok(words) => {
                    if let Some(output) = words.strip_suffix(" OK") {
                        debug!("Harness run succeeded on attempt {}", attempt);
                        return Ok(output.to_string());
                    }
                    let words = words.strip_suffix(" ERR").unwrap_or(&words).to_string();
                    warn!("Harness reported failure on attempt {}: {:?}", attempt, words);
                    last_error = LinkError::Remote(words);
                }
                Err(e) => {
                    warn!("Link error on attempt {}: {}", attempt, e);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }
}
