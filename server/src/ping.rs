//! Round-trip latency tracking for one connection.
//!
//! Each session runs a ping task that emits a PING packet once per second
//! carrying the current wall-clock millis. The client echoes the payload in
//! a PONG; the difference is recorded here. The tracker keeps a rolling
//! window of the most recent samples and exposes their average for display.
//! A missed reply never terminates the connection; disconnect detection is
//! the read loop's job.

use std::collections::VecDeque;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// How often a session pings its client.
pub const PING_INTERVAL: Duration = Duration::from_secs(1);

/// Number of round-trip samples kept for the rolling average.
pub const RTT_WINDOW: usize = 10;

/// Current wall-clock time in milliseconds, the payload of outgoing pings.
pub fn timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

/// Rolling window of round-trip times for one connection.
#[derive(Debug, Default)]
pub struct PingTracker {
    samples: VecDeque<u64>,
}

impl PingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one round-trip sample, evicting the oldest once the window
    /// is full.
    pub fn record(&mut self, rtt_millis: u64) {
        if self.samples.len() == RTT_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(rtt_millis);
    }

    /// Average of the recorded window in milliseconds, 0.0 while empty.
    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<u64>() as f64 / self.samples.len() as f64
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
