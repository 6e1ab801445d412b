use tokio::time::{Duration, Instant};

/// Outcome of one periodic staleness check.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Verdict {
    Healthy,
    /// Stale, but strikes remain; the caller re-attaches.
    Stale { strikes: u32, silent_for: Duration },
    /// Consecutive strike limit reached; the caller gives up.
    Exhausted { strikes: u32 },
}

/// Tracks the last sample time of a feed and counts consecutive stale checks.
#[derive(Clone, Debug)]
pub struct StaleWatchdog {
    last_update: Instant,
    stale_after: Duration,
    strikes: u32,
    max_strikes: u32,
}

impl StaleWatchdog {
    pub fn new(stale_after: Duration, max_strikes: u32) -> Self {
        Self {
            last_update: Instant::now(),
            stale_after,
            strikes: 0,
            max_strikes,
        }
    }

    pub fn record_sample(&mut self) {
        self.last_update = Instant::now();
    }

    pub fn silent_for(&self) -> Duration {
        self.last_update.elapsed()
    }

    pub fn is_silent(&self) -> bool {
        self.silent_for() > self.stale_after
    }

    pub fn strikes(&self) -> u32 {
        self.strikes
    }

    /// A healthy check clears the strike count; strikes only accumulate
    /// across consecutive stale checks.
    pub fn check(&mut self) -> Verdict {
        if !self.is_silent() {
            self.strikes = 0;
            return Verdict::Healthy;
        }
        self.strikes += 1;
        if self.strikes >= self.max_strikes {
            Verdict::Exhausted {
                strikes: self.strikes,
            }
        } else {
            Verdict::Stale {
                strikes: self.strikes,
                silent_for: self.silent_for(),
            }
        }
    }
}
