//! Loose synchronization with the verification server's clock.
//!
//! The server includes a CurrentServerTime message in most replies; the
//! offset to the local clock is remembered so results can carry timestamps
//! in server-local time.

use std::sync::atomic::{AtomicI64, Ordering};

use crate::now_unix;

pub struct ServerClock {
    // server time minus local time, seconds
    offset: AtomicI64,
}

impl ServerClock {
    pub fn new() -> Self {
        ServerClock {
            offset: AtomicI64::new(0),
        }
    }

    /// Record the difference between the server's clock and ours.
    pub fn sync(&self, server_time: u32) {
        self.offset
            .store(server_time as i64 - now_unix(), Ordering::Relaxed);
    }

    /// Estimate of the current time on the server.
    pub fn server_time(&self) -> i64 {
        now_unix() + self.offset.load(Ordering::Relaxed)
    }
}

impl Default for ServerClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_server_ahead() {
        let clock = ServerClock::new();
        clock.sync((now_unix() + 500) as u32);
        let est = clock.server_time();
        assert!((est - now_unix() - 500).abs() <= 1);
    }

    #[test]
    fn tracks_server_behind() {
        let clock = ServerClock::new();
        clock.sync((now_unix() - 500) as u32);
        let est = clock.server_time();
        assert!((est - now_unix() + 500).abs() <= 1);
    }
}
