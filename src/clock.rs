//! Global high-performance clock for hot-path timing.

use once_cell::sync::Lazy;
use quanta::Clock;

pub static CLOCK: Lazy<Clock> = Lazy::new(Clock::new);

/// Current instant (precise, TSC-backed where available).
#[inline]
pub fn now() -> quanta::Instant {
    CLOCK.now()
}
