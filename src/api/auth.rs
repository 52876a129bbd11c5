//! Account login handshake
//!
//! Mirrors the browser login flow of the account service: a form POST with a
//! digested password, a region lookup, then a redirect hop whose Set-Cookie
//! bundle becomes the session used by the community API. Transport and parse
//! failures are retried a bounded number of times; credential and
//! verification failures are surfaced to the caller immediately.

use md5::{Digest, Md5};
use reqwest::header::{self, HeaderMap};
use reqwest::redirect::Policy;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use super::strip_json_prefix;
use crate::config::{ApiConfig, ScheduleConfig};

/// Login callback registered for the community service
const CALLBACK_URL: &str = "https://sgp-api.buy.mi.com/bbs/api/global/user/login-back?followup=https%3A%2F%2Fnew.c.mi.com%2Fglobal%2F&sign=NTRhYmNhZWI1ZWM2YTFmY2U3YzU1NzZhOTBhYjJmZWI1ZjY3MWNiNQ%2C%2C";

/// Static request signature expected by the login endpoint
const LOGIN_SIGN: &str = "Phs2y/c0Xf7vJZG9Z6n9c+Nbn7g=";

/// Fixed service parameters for the login form
const SERVICE_PARAM: &str = r#"{"checkSafePhone":false,"checkSafeAddress":false,"lsrp_score":0.0}"#;

/// Result code the account service uses for bad credentials
const INVALID_CREDENTIALS_CODE: i64 = 70016;

/// Manual account action the service demands before login can proceed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationKind {
    Email,
    Phone,
    Other,
}

impl VerificationKind {
    fn from_url(url: &str) -> Self {
        if url.contains("SetEmail") {
            Self::Email
        } else if url.contains("BindAppealOrSafePhone") {
            Self::Phone
        } else {
            Self::Other
        }
    }
}

impl fmt::Display for VerificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Email => write!(f, "add a recovery email address to the account"),
            Self::Phone => write!(f, "bind a phone number to the account"),
            Self::Other => write!(f, "complete manual account verification"),
        }
    }
}

/// Errors from the login flow
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid username or password")]
    InvalidCredentials,

    #[error("account verification required: {kind}, then retry - {url}")]
    VerificationRequired { kind: VerificationKind, url: String },

    #[error("network error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("malformed login response: {0}")]
    Parse(String),

    #[error("login retries exhausted")]
    RetriesExhausted,
}

impl AuthError {
    /// Transport and parse failures are non-authoritative and worth retrying;
    /// credential and verification failures are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Parse(_))
    }
}

/// Authenticated session: cookie bundle plus the account's region code
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub cookies: HashMap<String, String>,
    pub region: String,
}

impl SessionContext {
    /// Render the bundle as a `Cookie` header value
    pub fn cookie_header(&self) -> String {
        self.cookies
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Performs the account login handshake
pub struct AuthProvider {
    http: reqwest::Client,
    config: ApiConfig,
    max_retries: u32,
    retry_delay: Duration,
}

impl AuthProvider {
    /// Build a provider; redirects are not followed because the final hop's
    /// Set-Cookie headers must be captured, not consumed.
    pub fn new(api: &ApiConfig, schedule: &ScheduleConfig) -> Result<Self, AuthError> {
        let http = reqwest::Client::builder()
            .user_agent(&api.user_agent)
            .timeout(api.timeout())
            .cookie_store(true)
            .redirect(Policy::none())
            .build()?;

        Ok(Self {
            http,
            config: api.clone(),
            max_retries: schedule.max_retries,
            retry_delay: schedule.retry_delay(),
        })
    }

    /// Log in, retrying transport and parse failures with a fixed delay
    pub async fn login(&self, user: &str, password: &str) -> Result<SessionContext, AuthError> {
        for attempt in 1..=self.max_retries {
            if attempt > 1 {
                tokio::time::sleep(self.retry_delay).await;
            }

            match self.try_login(user, password).await {
                Ok(session) => {
                    info!(region = %session.region, "login successful");
                    return Ok(session);
                }
                Err(e) if e.is_retryable() => {
                    warn!(attempt, max = self.max_retries, error = %e, "login attempt failed");
                }
                Err(e) => return Err(e),
            }
        }

        Err(AuthError::RetriesExhausted)
    }

    async fn try_login(&self, user: &str, password: &str) -> Result<SessionContext, AuthError> {
        let hash = password_hash(password);
        let form = [
            ("callback", CALLBACK_URL),
            ("sid", self.config.service_sid.as_str()),
            ("_sign", LOGIN_SIGN),
            ("user", user),
            ("hash", hash.as_str()),
            ("_json", "true"),
            ("serviceParam", SERVICE_PARAM),
        ];

        let text = self
            .http
            .post(&self.config.auth_url)
            .form(&form)
            .send()
            .await?
            .text()
            .await?;
        let reply: serde_json::Value =
            serde_json::from_str(strip_json_prefix(&text)).map_err(|e| AuthError::Parse(e.to_string()))?;

        if reply.get("code").and_then(|c| c.as_i64()) == Some(INVALID_CREDENTIALS_CODE) {
            return Err(AuthError::InvalidCredentials);
        }

        if let Some(url) = reply.get("notificationUrl").and_then(|u| u.as_str()) {
            return Err(AuthError::VerificationRequired {
                kind: VerificationKind::from_url(url),
                url: url.to_string(),
            });
        }

        let location = reply
            .get("location")
            .and_then(|l| l.as_str())
            .ok_or_else(|| AuthError::Parse("login reply carried no location".to_string()))?;

        let region = self.fetch_region().await?;
        let cookies = self.fetch_service_cookies(location).await?;

        Ok(SessionContext { cookies, region })
    }

    /// Look up the account's region code
    async fn fetch_region(&self) -> Result<String, AuthError> {
        let text = self.http.get(&self.config.region_url).send().await?.text().await?;
        let reply: serde_json::Value =
            serde_json::from_str(strip_json_prefix(&text)).map_err(|e| AuthError::Parse(e.to_string()))?;

        reply
            .pointer("/data/region")
            .and_then(|r| r.as_str())
            .map(str::to_string)
            .ok_or_else(|| AuthError::Parse("region reply carried no region".to_string()))
    }

    /// Follow the login callback one hop and harvest the service cookies
    async fn fetch_service_cookies(&self, location: &str) -> Result<HashMap<String, String>, AuthError> {
        let response = self.http.get(location).send().await?;
        Ok(cookies_from_headers(response.headers()))
    }
}

/// Uppercase hex MD5 digest, as the login endpoint expects
pub(crate) fn password_hash(password: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(password.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02X}"))
        .collect()
}

/// Collect `name=value` pairs from Set-Cookie headers, dropping attributes
fn cookies_from_headers(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|cookie| cookie.split(';').next())
        .filter_map(|pair| pair.split_once('='))
        .map(|(name, value)| (name.trim().to_string(), value.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_hash_uppercase_md5() {
        assert_eq!(password_hash("password"), "5F4DCC3B5AA765D61D8327DEB882CF99");
    }

    #[test]
    fn test_verification_kind_from_url() {
        assert_eq!(
            VerificationKind::from_url("https://account.example.com/SetEmail?x=1"),
            VerificationKind::Email
        );
        assert_eq!(
            VerificationKind::from_url("https://account.example.com/BindAppealOrSafePhone"),
            VerificationKind::Phone
        );
        assert_eq!(
            VerificationKind::from_url("https://account.example.com/somethingelse"),
            VerificationKind::Other
        );
    }

    #[test]
    fn test_auth_error_retryability() {
        assert!(AuthError::Parse("bad".to_string()).is_retryable());
        assert!(!AuthError::InvalidCredentials.is_retryable());
        assert!(
            !AuthError::VerificationRequired {
                kind: VerificationKind::Email,
                url: "https://example.com".to_string(),
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_cookies_from_headers() {
        let mut headers = HeaderMap::new();
        headers.append(
            header::SET_COOKIE,
            "serviceToken=abc123; Path=/; HttpOnly".parse().unwrap(),
        );
        headers.append(header::SET_COOKIE, "uid=42; Secure".parse().unwrap());

        let cookies = cookies_from_headers(&headers);
        assert_eq!(cookies.get("serviceToken").map(String::as_str), Some("abc123"));
        assert_eq!(cookies.get("uid").map(String::as_str), Some("42"));
        assert_eq!(cookies.len(), 2);
    }

    #[test]
    fn test_cookie_header_round_trip() {
        let session = SessionContext {
            cookies: HashMap::from([("serviceToken".to_string(), "abc".to_string())]),
            region: "SG".to_string(),
        };
        assert_eq!(session.cookie_header(), "serviceToken=abc");
    }
}
