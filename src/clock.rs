//! Server clock: wall-clock milliseconds guarded against backward jumps

use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Raw wall-clock milliseconds since the Unix epoch.
pub fn wall_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A cached millisecond clock that never runs backward.
///
/// Expiry timestamps are absolute wall milliseconds, so the clock they are
/// compared against must keep advancing even when the system clock is
/// stepped backward (e.g. an NTP correction). Between resyncs the clock
/// advances by a monotonic reading; a wall reading ahead of the
/// extrapolated value is adopted, a wall reading behind it is ignored.
#[derive(Debug)]
pub struct ServerClock {
    wall_at_sync: u64,
    mono_at_sync: Instant,
}

impl ServerClock {
    pub fn new() -> Self {
        Self {
            wall_at_sync: wall_ms(),
            mono_at_sync: Instant::now(),
        }
    }

    /// Current time. Monotonic extrapolation from the last sync point,
    /// fast-forwarded to the wall clock when the wall clock is ahead.
    pub fn now_ms(&mut self) -> u64 {
        let extrapolated =
            self.wall_at_sync + self.mono_at_sync.elapsed().as_millis() as u64;
        let wall = wall_ms();
        if wall > extrapolated {
            self.wall_at_sync = wall;
            self.mono_at_sync = Instant::now();
            wall
        } else {
            extrapolated
        }
    }

    /// Force the sync point to a specific reading. Only meaningful for
    /// driving time forward in tests; a backward value is overtaken by
    /// the wall clock on the next read.
    pub fn set_ms(&mut self, ms: u64) {
        self.wall_at_sync = ms;
        self.mono_at_sync = Instant::now();
    }
}

impl Default for ServerClock {
    fn default() -> Self {
        Self::new()
    }
}
