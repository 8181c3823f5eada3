//! Service clock: a wall-clock epoch anchored to the runtime's monotonic
//! instant.
//!
//! All timestamps in the keeper are nanoseconds since the Unix epoch. The
//! anchor means elapsed time comes from the tokio clock, so tests running
//! under `tokio::time::pause` drive the exact production code path by
//! advancing virtual time.

use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

use crate::types::{TimestampNs, NANOS_PER_SEC};

#[derive(Debug, Clone)]
pub struct Clock {
    base_ns: u64,
    origin: Instant,
}

impl Clock {
    /// Anchor to the current wall clock. Must be called inside a runtime.
    pub fn system() -> Self {
        let base_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_nanos() as u64;
        Self {
            base_ns,
            origin: Instant::now(),
        }
    }

    /// Anchor to a fixed epoch; elapsed time still follows the tokio clock.
    pub fn fixed(base_ns: u64) -> Self {
        Self {
            base_ns,
            origin: Instant::now(),
        }
    }

    pub fn now_ns(&self) -> TimestampNs {
        self.base_ns
            .saturating_add(self.origin.elapsed().as_nanos() as u64)
    }

    pub fn now_secs(&self) -> u64 {
        self.now_ns() / NANOS_PER_SEC
    }

    /// The monotonic instant corresponding to an absolute timestamp.
    /// Instants in the past clamp to the origin, so due timers fire at once.
    pub fn instant_at(&self, at_ns: TimestampNs) -> Instant {
        self.origin + Duration::from_nanos(at_ns.saturating_sub(self.base_ns))
    }
}
