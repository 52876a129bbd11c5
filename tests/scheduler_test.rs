//! Integration tests for the minute-aligned scheduler
//!
//! Drives the full scheduler loop through the public traits with a
//! deterministic clock and a scripted authorization API.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use miunlock::api::{ApiError, ApplyReply, AuthorizationApi, AuthorizationState};
use miunlock::clock::Clock;
use miunlock::config::ScheduleConfig;
use miunlock::scheduler::Scheduler;
use miunlock::timesync::{TimeProvenance, TimeReading, TimeSource};

// =============================================================================
// Deterministic collaborators
// =============================================================================

/// Clock whose sleeps advance a shared instant instead of waiting
#[derive(Clone)]
struct TestClock {
    inner: Arc<Mutex<DateTime<Utc>>>,
}

impl TestClock {
    fn new(start: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(start)),
        }
    }
}

#[async_trait]
impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        *self.inner.lock().unwrap()
    }

    async fn sleep(&self, duration: Duration) {
        let mut now = self.inner.lock().unwrap();
        *now += chrono::Duration::from_std(duration).unwrap();
    }
}

/// Time source that reports the test clock's instant as network time
struct TestTimeSource {
    clock: TestClock,
}

#[async_trait]
impl TimeSource for TestTimeSource {
    async fn now(&self) -> TimeReading {
        TimeReading {
            instant: self.clock.now(),
            provenance: TimeProvenance::Network,
        }
    }
}

/// Scripted authorization API; exhausted scripts fail with `MissingData`
#[derive(Default)]
struct ScriptedApi {
    checks: Mutex<VecDeque<Result<AuthorizationState, ApiError>>>,
    applies: Mutex<VecDeque<Result<ApplyReply, ApiError>>>,
    check_calls: AtomicU32,
    apply_calls: AtomicU32,
}

impl ScriptedApi {
    fn push_check(&self, result: Result<AuthorizationState, ApiError>) {
        self.checks.lock().unwrap().push_back(result);
    }

    fn push_apply(&self, result: Result<ApplyReply, ApiError>) {
        self.applies.lock().unwrap().push_back(result);
    }
}

#[async_trait]
impl AuthorizationApi for ScriptedApi {
    async fn check_state(&self) -> Result<AuthorizationState, ApiError> {
        self.check_calls.fetch_add(1, Ordering::SeqCst);
        self.checks
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(ApiError::MissingData))
    }

    async fn apply(&self) -> Result<ApplyReply, ApiError> {
        self.apply_calls.fetch_add(1, Ordering::SeqCst);
        self.applies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(ApiError::MissingData))
    }
}

fn build(api: Arc<ScriptedApi>) -> (Scheduler, TestClock) {
    let start = Utc.with_ymd_and_hms(2025, 3, 15, 2, 0, 30).unwrap();
    let clock = TestClock::new(start);
    let config = ScheduleConfig {
        jitter_max_secs: 0.0, // deterministic under test
        ..Default::default()
    };
    let scheduler = Scheduler::new(
        Arc::new(clock.clone()),
        Arc::new(TestTimeSource { clock: clock.clone() }),
        api,
        &config,
    )
    .unwrap();
    (scheduler, clock)
}

fn granted() -> AuthorizationState {
    AuthorizationState {
        granted: true,
        can_apply: false,
        deadline: None,
    }
}

fn open_window() -> AuthorizationState {
    AuthorizationState {
        granted: false,
        can_apply: true,
        deadline: None,
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn run_survives_an_exhausted_cycle_and_stops_on_grant() {
    let api = Arc::new(ScriptedApi::default());
    // first cycle: five failing checks exhaust the budget;
    // second cycle: the grant has come through
    for _ in 0..5 {
        api.push_check(Err(ApiError::MissingData));
    }
    api.push_check(Ok(granted()));
    let (scheduler, clock) = build(api.clone());

    let start = clock.now();
    scheduler.run().await;

    assert_eq!(api.check_calls.load(Ordering::SeqCst), 6);
    assert_eq!(api.apply_calls.load(Ordering::SeqCst), 0);
    // two minute boundaries plus four 60s retry delays were waited out
    let elapsed = (clock.now() - start).to_std().unwrap();
    assert!(elapsed >= Duration::from_secs(30 + 4 * 60 + 60));
}

#[tokio::test]
async fn run_honors_server_deadline_before_the_next_attempt() {
    let api = Arc::new(ScriptedApi::default());
    // first cycle applies and is told to come back two hours later
    api.push_check(Ok(open_window()));
    api.push_apply(Ok(ApplyReply {
        result_code: 3,
        // 02:01 UTC is 10:01 in the service zone; deadline at 12:01
        deadline: Some("2025-03-15 12:01:00.000000".to_string()),
    }));
    // second cycle succeeds
    api.push_check(Ok(open_window()));
    api.push_apply(Ok(ApplyReply {
        result_code: 1,
        deadline: None,
    }));
    let (scheduler, clock) = build(api.clone());

    scheduler.run().await;

    assert_eq!(api.apply_calls.load(Ordering::SeqCst), 2);
    // the second attempt happened at the minute boundary after the deadline
    let resumed = Utc.with_ymd_and_hms(2025, 3, 15, 4, 1, 0).unwrap();
    assert!(clock.now() >= resumed, "resumed too early: {}", clock.now());
}

#[tokio::test]
async fn transient_transport_failures_do_not_stop_the_loop() {
    let api = Arc::new(ScriptedApi::default());
    api.push_check(Err(ApiError::Parse("gateway error page".to_string())));
    api.push_check(Ok(open_window()));
    api.push_apply(Ok(ApplyReply {
        result_code: 1,
        deadline: None,
    }));
    let (scheduler, _clock) = build(api.clone());

    scheduler.run().await;

    assert_eq!(api.check_calls.load(Ordering::SeqCst), 2);
    assert_eq!(api.apply_calls.load(Ordering::SeqCst), 1);
}
