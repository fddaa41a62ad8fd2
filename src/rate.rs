//! Token-bucket rate controller.
//!
//! Translates a target TPS and ramp-up window into a stream of permit
//! instants. One permit admits one task launch. During ramp-up the
//! effective rate climbs linearly from 1 TPS to the target; afterwards it
//! holds at the target.
//!
//! No backfill: a caller arriving more than one window late has the
//! schedule reset to `now` instead of receiving a burst of catch-up
//! permits.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::VajraError;

/// Arriving later than this resets the permit schedule to `now`.
const NO_BACKFILL_WINDOW_NANOS: u64 = 1_000_000_000;

/// Shapes task launches to a target rate with linear ramp-up.
///
/// The permit schedule lives in a single atomic (`next_permit_nanos`,
/// relative to construction); acquirers advance it with compare-and-set. A
/// lost race mutates nothing and simply retries.
pub struct RateController {
    target_tps: f64,
    ramp: Duration,
    start: Instant,
    next_permit_nanos: AtomicU64,
    permits: AtomicU64,
}

impl RateController {
    pub fn new(target_tps: f64, ramp: Duration) -> Self {
        Self {
            target_tps: target_tps.max(1.0),
            ramp,
            start: Instant::now(),
            next_permit_nanos: AtomicU64::new(0),
            permits: AtomicU64::new(0),
        }
    }

    /// Effective rate at `elapsed`: linear from 1 TPS to the target over
    /// the ramp, then the target.
    fn effective_tps(&self, elapsed: Duration) -> f64 {
        let ramp_secs = self.ramp.as_secs_f64();
        if ramp_secs <= 0.0 || elapsed >= self.ramp {
            return self.target_tps;
        }
        let frac = elapsed.as_secs_f64() / ramp_secs;
        1.0 + (self.target_tps - 1.0) * frac
    }

    fn interval_nanos(&self, elapsed: Duration) -> u64 {
        (1e9 / self.effective_tps(elapsed)).max(1.0) as u64
    }

    fn elapsed_nanos(&self) -> u64 {
        self.start.elapsed().as_nanos().min(u64::MAX as u128) as u64
    }

    /// Try to claim the permit at `next` (CAS). Returns false on a lost
    /// race; the schedule is untouched in that case.
    fn claim(&self, next: u64, now: u64) -> bool {
        let late = now.saturating_sub(next);
        let base = if late > NO_BACKFILL_WINDOW_NANOS {
            now
        } else {
            next
        };
        let new_next = base + self.interval_nanos(Duration::from_nanos(now));

        if self
            .next_permit_nanos
            .compare_exchange(next, new_next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.permits.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Block until one task may start, or fail with `Cancelled`.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), VajraError> {
        loop {
            if cancel.is_cancelled() {
                return Err(VajraError::Cancelled);
            }

            let now = self.elapsed_nanos();
            let next = self.next_permit_nanos.load(Ordering::Acquire);

            if next <= now {
                if self.claim(next, now) {
                    return Ok(());
                }
                // Lost the race; re-read and retry.
                continue;
            }

            let deadline = self.start + Duration::from_nanos(next);
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                _ = cancel.cancelled() => return Err(VajraError::Cancelled),
            }
        }
    }

    /// Non-blocking: true iff a permit was immediately available.
    pub fn try_acquire(&self) -> bool {
        let now = self.elapsed_nanos();
        let next = self.next_permit_nanos.load(Ordering::Acquire);
        next <= now && self.claim(next, now)
    }

    /// Permits issued so far.
    pub fn permits_issued(&self) -> u64 {
        self.permits.load(Ordering::Relaxed)
    }
}
