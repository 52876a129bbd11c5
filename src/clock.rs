//! Local clock abstraction and the precise-sleep primitive
//!
//! The scheduler never reads wall-clock time or sleeps directly; it goes
//! through the [`Clock`] trait so tests can substitute a deterministic fake.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Default wakeup tolerance for [`sleep_until`]
pub const DEFAULT_SLEEP_PRECISION: Duration = Duration::from_millis(10);

/// Longest single sleep taken by [`sleep_until`]; remaining time is
/// re-sampled after every increment so drift stays bounded
const MAX_SLEEP_STEP: Duration = Duration::from_secs(1);

/// Source of local time and suspension
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current local wall-clock time in UTC
    fn now(&self) -> DateTime<Utc>;

    /// Suspend the caller for the given duration
    async fn sleep(&self, duration: Duration);
}

/// System clock backed by `chrono` and the tokio timer
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Sleep until `clock.now() >= target`, waking within `precision` of the
/// target without busy-spinning the whole interval.
///
/// Sleeps in at-most-one-second increments and re-samples the clock each
/// iteration, so a single long timer inaccuracy cannot push the wakeup
/// past the tolerance.
pub async fn sleep_until(clock: &dyn Clock, target: DateTime<Utc>, precision: Duration) {
    loop {
        let remaining = match (target - clock.now()).to_std() {
            Ok(d) if !d.is_zero() => d,
            _ => return,
        };

        let step = remaining.saturating_sub(precision / 2).clamp(precision, MAX_SLEEP_STEP);
        clock.sleep(step).await;
    }
}


#[cfg(test)]
mod tests {
    use super::fake::FakeClock;
    use super::*;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 15, 10, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_sleep_until_reaches_target_within_precision() {
        let clock = FakeClock::new(start());
        let target = start() + chrono::Duration::seconds(5);
        let precision = Duration::from_millis(10);

        sleep_until(&clock, target, precision).await;

        let now = clock.now();
        assert!(now >= target, "returned before target: {now} < {target}");
        let overshoot = (now - target).to_std().unwrap();
        assert!(overshoot <= precision, "overshoot {overshoot:?} exceeds precision");
    }

    #[tokio::test]
    async fn test_sleep_until_past_target_returns_immediately() {
        let clock = FakeClock::new(start());
        let target = start() - chrono::Duration::seconds(30);

        sleep_until(&clock, target, DEFAULT_SLEEP_PRECISION).await;

        assert!(clock.slept().is_empty());
        assert_eq!(clock.now(), start());
    }

    #[tokio::test]
    async fn test_sleep_until_steps_are_bounded() {
        let clock = FakeClock::new(start());
        let target = start() + chrono::Duration::seconds(10);

        sleep_until(&clock, target, DEFAULT_SLEEP_PRECISION).await;

        let slept = clock.slept();
        assert!(!slept.is_empty());
        for step in &slept {
            assert!(*step <= Duration::from_secs(1), "step {step:?} exceeds 1s bound");
            assert!(*step >= DEFAULT_SLEEP_PRECISION, "step {step:?} below precision floor");
        }
    }
}
