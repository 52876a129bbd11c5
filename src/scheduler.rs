//! Minute-aligned attempt scheduler and retry state machine
//!
//! The eligibility window opens once per minute in the service's own time
//! zone, so each cycle takes "now" from the network time source, sleeps
//! precisely to the next minute boundary, adds a small random jitter, then
//! runs a bounded attempt loop against the authorization API. Outcomes route
//! to terminal success, a server-declared deadline backoff, or abandonment of
//! the cycle until the next boundary; the outer loop never terminates on
//! failure.

use chrono::{DateTime, Datelike, FixedOffset, NaiveDateTime, TimeDelta, TimeZone, Utc};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::api::{ApplyReply, AuthorizationApi};
use crate::clock::{Clock, sleep_until};
use crate::config::ScheduleConfig;
use crate::timesync::TimeSource;

/// Server-declared deadline format; the year is omitted by the service and
/// substituted with the current year at parse time
const DEADLINE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Classified result of a submitted application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplicationOutcome {
    /// Authorization granted
    Granted,
    /// Server asked to come back at the carried deadline
    RetryAfterDeadline(Option<String>),
    /// Server-side hiccup, retry after the fixed delay
    TemporaryError,
    /// Unrecognized result code, treated like a temporary error
    UnknownError,
}

/// Map a numeric apply result code onto an [`ApplicationOutcome`]
pub fn classify_apply(reply: &ApplyReply) -> ApplicationOutcome {
    match reply.result_code {
        1 => ApplicationOutcome::Granted,
        3 | 4 => ApplicationOutcome::RetryAfterDeadline(reply.deadline.clone()),
        5..=7 => ApplicationOutcome::TemporaryError,
        // Unknown codes are retried like temporary errors; revisit if some
        // turn out to be permanent rejections.
        _ => ApplicationOutcome::UnknownError,
    }
}

/// Attempts remaining within one scheduling cycle, paired with the fixed
/// inter-attempt delay
#[derive(Debug, Clone, Copy)]
pub struct RetryBudget {
    remaining: u32,
    delay: Duration,
}

impl RetryBudget {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            remaining: attempts,
            delay,
        }
    }

    /// Consume one attempt; returns false once the budget is exhausted
    pub fn spend(&mut self) -> bool {
        self.remaining = self.remaining.saturating_sub(1);
        self.remaining > 0
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

/// How one per-minute cycle ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Terminal success; the scheduler stops
    Granted,
    /// Server declared a deadline and the backoff sleep has completed
    DeadlineScheduled,
    /// Attempt budget spent with no terminal outcome; wait for the next minute
    BudgetExhausted,
}

/// Result of a single attempt within a cycle
enum AttemptOutcome {
    Granted,
    DeadlineBackoff(Option<String>),
    Failed,
}

/// Start of the minute strictly after `now`
pub fn next_minute_boundary(now: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
    let next_secs = now.timestamp().div_euclid(60) * 60 + 60;
    DateTime::from_timestamp(next_secs, 0)
        .unwrap_or_else(|| (now + TimeDelta::minutes(1)).to_utc())
        .with_timezone(&now.timezone())
}

/// Parse a server deadline string, substituting the current year and
/// localizing to the service zone. `None` when the string does not match
/// the declared format (callers fall back to the fixed retry delay).
pub fn parse_deadline(raw: &str, now: DateTime<FixedOffset>) -> Option<DateTime<FixedOffset>> {
    let naive = NaiveDateTime::parse_from_str(raw.trim(), DEADLINE_FORMAT).ok()?;
    let adjusted = naive.with_year(now.year())?;
    now.timezone().from_local_datetime(&adjusted).single()
}

/// Minute-aligned scheduler owning the attempt state machine
pub struct Scheduler {
    clock: Arc<dyn Clock>,
    time_source: Arc<dyn TimeSource>,
    api: Arc<dyn AuthorizationApi>,
    zone: FixedOffset,
    max_retries: u32,
    retry_delay: Duration,
    jitter_max_secs: f64,
    precision: Duration,
}

impl Scheduler {
    pub fn new(
        clock: Arc<dyn Clock>,
        time_source: Arc<dyn TimeSource>,
        api: Arc<dyn AuthorizationApi>,
        config: &ScheduleConfig,
    ) -> eyre::Result<Self> {
        Ok(Self {
            clock,
            time_source,
            api,
            zone: config.zone()?,
            max_retries: config.max_retries,
            retry_delay: config.retry_delay(),
            jitter_max_secs: config.jitter_max_secs,
            precision: config.sleep_precision(),
        })
    }

    /// Run cycles until authorization is granted. Every failure path inside a
    /// cycle degrades to waiting for the next boundary, so this returns only
    /// on success; cancellation is external (process interrupt).
    pub async fn run(&self) {
        loop {
            match self.run_cycle().await {
                CycleOutcome::Granted => {
                    info!("authorization obtained, stopping scheduler");
                    return;
                }
                CycleOutcome::DeadlineScheduled => {
                    debug!("deadline backoff complete, rescheduling");
                }
                CycleOutcome::BudgetExhausted => {
                    debug!("cycle abandoned, waiting for next minute boundary");
                }
            }
        }
    }

    /// Advance one full cycle: boundary sleep, jitter, attempt loop
    pub async fn run_cycle(&self) -> CycleOutcome {
        let reading = self.time_source.now().await;
        let now_local = reading.instant.with_timezone(&self.zone);
        let next = next_minute_boundary(now_local);
        info!(
            next = %next.format("%Y-%m-%d %H:%M:%S"),
            source = ?reading.provenance,
            "waiting for next minute boundary"
        );

        sleep_until(self.clock.as_ref(), next.with_timezone(&Utc), self.precision).await;

        if self.jitter_max_secs > 0.0 {
            let jitter = Duration::from_secs_f64(rand::rng().random_range(0.0..self.jitter_max_secs));
            debug!(jitter_ms = jitter.as_millis() as u64, "applying random jitter");
            self.clock.sleep(jitter).await;
        }

        self.run_attempts().await
    }

    /// The bounded attempt loop for one cycle
    async fn run_attempts(&self) -> CycleOutcome {
        let mut budget = RetryBudget::new(self.max_retries, self.retry_delay);

        loop {
            match self.attempt_once().await {
                AttemptOutcome::Granted => return CycleOutcome::Granted,
                AttemptOutcome::DeadlineBackoff(deadline) => {
                    self.backoff_until(deadline.as_deref()).await;
                    return CycleOutcome::DeadlineScheduled;
                }
                AttemptOutcome::Failed => {
                    if budget.spend() {
                        warn!(remaining = budget.remaining(), "attempt failed, retrying after delay");
                        self.clock.sleep(budget.delay()).await;
                    } else {
                        error!("attempt budget exhausted");
                        return CycleOutcome::BudgetExhausted;
                    }
                }
            }
        }
    }

    /// One attempt: check state, apply when the window is open, classify
    async fn attempt_once(&self) -> AttemptOutcome {
        let state = match self.api.check_state().await {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "state check failed");
                return AttemptOutcome::Failed;
            }
        };

        if state.granted {
            info!(deadline = state.deadline.as_deref().unwrap_or("-"), "authorization already granted");
            return AttemptOutcome::Granted;
        }

        if !state.can_apply {
            debug!("application window not open");
            return AttemptOutcome::Failed;
        }

        let reply = match self.api.apply().await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "apply request failed");
                return AttemptOutcome::Failed;
            }
        };

        match classify_apply(&reply) {
            ApplicationOutcome::Granted => {
                info!("application successful");
                AttemptOutcome::Granted
            }
            ApplicationOutcome::RetryAfterDeadline(deadline) => AttemptOutcome::DeadlineBackoff(deadline),
            ApplicationOutcome::TemporaryError => {
                warn!(code = reply.result_code, "temporary server error");
                AttemptOutcome::Failed
            }
            ApplicationOutcome::UnknownError => {
                warn!(code = reply.result_code, "unrecognized apply result");
                AttemptOutcome::Failed
            }
        }
    }

    /// Sleep until a server-declared deadline, or for the fixed retry delay
    /// when the deadline cannot be parsed
    async fn backoff_until(&self, raw: Option<&str>) {
        let now = self.clock.now().with_timezone(&self.zone);

        match raw.and_then(|r| parse_deadline(r, now)) {
            Some(target) if target > now => {
                info!(deadline = %target.format("%Y-%m-%d %H:%M:%S"), "server requested backoff until deadline");
                if let Ok(delay) = (target - now).to_std() {
                    self.clock.sleep(delay).await;
                }
            }
            Some(_) => {
                debug!("declared deadline already passed");
            }
            None => {
                warn!(raw = raw.unwrap_or("-"), "could not parse deadline, using fixed retry delay");
                self.clock.sleep(self.retry_delay).await;
            }
        }
    }
}
