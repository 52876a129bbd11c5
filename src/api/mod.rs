//! Remote service collaborators: login handshake and authorization API
//!
//! The scheduler consumes these through the [`AuthorizationApi`] trait so
//! tests can script state-check and apply results.

use async_trait::async_trait;
use thiserror::Error;

mod auth;
mod client;

pub use auth::{AuthError, AuthProvider, SessionContext, VerificationKind};
pub use client::CommunityClient;

/// Anti-hijack prefix the account service prepends to JSON bodies
pub(crate) const JSON_PREFIX: &str = "&&&START&&&";

/// Strip the account service's anti-hijack prefix, if present
pub(crate) fn strip_json_prefix(text: &str) -> &str {
    text.strip_prefix(JSON_PREFIX).unwrap_or(text)
}

/// Snapshot of authorization eligibility, superseded on every check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationState {
    /// Authorization has already been granted
    pub granted: bool,
    /// The application window is currently open
    pub can_apply: bool,
    /// Server-formatted grant deadline, when one is declared
    pub deadline: Option<String>,
}

/// Raw result of a submitted application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReply {
    /// Numeric result code; see [`crate::scheduler::classify_apply`]
    pub result_code: i64,
    /// Server-formatted deadline accompanying "retry later" codes
    pub deadline: Option<String>,
}

/// Errors from authorization API calls
///
/// Both variants of failure indicate a non-authoritative response, so the
/// scheduler treats every `ApiError` as a retryable failed attempt.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("network error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("malformed response: {0}")]
    Parse(String),

    #[error("response carried no data")]
    MissingData,
}

/// Authorization state-check and apply operations
#[async_trait]
pub trait AuthorizationApi: Send + Sync {
    /// Fetch the current eligibility snapshot
    async fn check_state(&self) -> Result<AuthorizationState, ApiError>;

    /// Submit an application request
    async fn apply(&self) -> Result<ApplyReply, ApiError>;
}
