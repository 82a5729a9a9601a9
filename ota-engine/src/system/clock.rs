//! Wall clock and boot clock access.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Time source for the engine.
pub trait Clock: Send + Sync {
    /// Current wall-clock time. May jump backwards.
    fn wallclock_now(&self) -> DateTime<Utc>;

    /// Time elapsed since boot, including suspend.
    fn boot_time(&self) -> Duration;
}

/// Clock backed by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn wallclock_now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn boot_time(&self) -> Duration {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: `ts` is a valid, writable timespec for the duration of the call.
        let rc = unsafe { libc::clock_gettime(libc::CLOCK_BOOTTIME, &mut ts) };
        if rc != 0 {
            return Duration::ZERO;
        }
        Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)
    }
}
