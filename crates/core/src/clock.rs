use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Wall-clock source and cooperative pause for the supervisor loop.
pub trait Clock: Send + Sync {
    /// Milliseconds since an arbitrary, fixed origin.
    fn now_ms(&self) -> u64;

    /// Gives other work a chance to run between empty polls.
    fn pause(&self);
}

#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
    pause: Duration,
}

impl SystemClock {
    pub fn new(pause: Duration) -> Self {
        Self {
            origin: Instant::now(),
            pause,
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        // one FreeRTOS tick
        Self::new(Duration::from_millis(1))
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn pause(&self) {
        if self.pause.is_zero() {
            std::thread::yield_now();
        } else {
            std::thread::sleep(self.pause);
        }
    }
}

/// Deterministic clock for tests. Time only moves when it is read, paused
/// or advanced explicitly.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
    read_step: u64,
    pause_step: u64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `now_ms` call moves time forward by `ms` after reporting.
    pub fn with_read_step(mut self, ms: u64) -> Self {
        self.read_step = ms;
        self
    }

    /// Every `pause` call moves time forward by `ms`.
    pub fn with_pause_step(mut self, ms: u64) -> Self {
        self.pause_step = ms;
        self
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn peek(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.fetch_add(self.read_step, Ordering::SeqCst)
    }

    fn pause(&self) {
        self.advance(self.pause_step);
    }
}

impl<K: Clock + ?Sized> Clock for std::sync::Arc<K> {
    fn now_ms(&self) -> u64 {
        (**self).now_ms()
    }

    fn pause(&self) {
        (**self).pause()
    }
}
