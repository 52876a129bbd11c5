//! miunlock - minute-aligned bootloader unlock authorization watcher
//!
//! The Mi community service opens a narrow eligibility window once per minute
//! during which an unlock application can be submitted. This crate logs into
//! an account, then polls and applies on a schedule synchronized to network
//! time rather than the local clock, retrying through transient failures and
//! honoring server-declared "come back at <deadline>" responses.
//!
//! # Modules
//!
//! - [`timesync`] - trustworthy "now" from a prioritized list of NTP servers
//! - [`clock`] - local clock abstraction and the precise-sleep primitive
//! - [`scheduler`] - the minute-aligned attempt/retry state machine
//! - [`api`] - login handshake and authorization API client
//! - [`config`] - configuration types and loading
//! - [`cli`] - command-line interface

pub mod api;
pub mod cli;
pub mod clock;
pub mod config;
pub mod scheduler;
pub mod timesync;

// Re-export commonly used types
pub use api::{ApiError, ApplyReply, AuthError, AuthProvider, AuthorizationApi, AuthorizationState, SessionContext};
pub use clock::{Clock, SystemClock, sleep_until};
pub use config::{ApiConfig, Config, NtpConfig, ScheduleConfig};
pub use scheduler::{
    ApplicationOutcome, CycleOutcome, RetryBudget, Scheduler, classify_apply, next_minute_boundary, parse_deadline,
};
pub use timesync::{NtpTimeSource, TimeProvenance, TimeReading, TimeSource};
