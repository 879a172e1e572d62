//! Drift-free periodic scheduling
//!
//! Tick `n` is due at `origin + n * period`. A late wake-up shortens the next
//! wait instead of pushing every later tick back.

use std::time::{Duration, Instant};

/// Fixed-origin tick schedule
#[derive(Debug, Clone)]
pub struct Pacer {
    origin: Instant,
    period: Duration,
    ticks: u64,
}

impl Pacer {
    /// Start a schedule whose first tick is one period from now
    pub fn new(period: Duration) -> Self {
        Self::starting_at(Instant::now(), period)
    }

    pub fn starting_at(origin: Instant, period: Duration) -> Self {
        Self {
            origin,
            period,
            ticks: 0,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Ticks handed out so far
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Deadline of the next tick without consuming it
    pub fn peek_deadline(&self) -> Instant {
        self.deadline_of(self.ticks + 1)
    }

    /// Consume the next tick and return its deadline
    pub fn next_deadline(&mut self) -> Instant {
        self.ticks += 1;
        self.deadline_of(self.ticks)
    }

    /// Block the current thread until the next tick is due
    pub fn wait_blocking(&mut self) {
        let deadline = self.next_deadline();
        let now = Instant::now();
        if deadline > now {
            std::thread::sleep(deadline - now);
        }
    }

    fn deadline_of(&self, tick: u64) -> Instant {
        let nanos = self.period.as_nanos().saturating_mul(tick as u128);
        self.origin + Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
    }
}
