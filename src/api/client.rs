//! Authorization API client
//!
//! Thin reqwest wrapper over the community endpoints. The session cookie
//! bundle obtained at login is attached to every request; payloads are plain
//! JSON (unlike the account service, these endpoints carry no prefix).

use reqwest::header;
use serde::Deserialize;
use tracing::debug;

use super::auth::SessionContext;
use super::{ApiError, ApplyReply, AuthorizationApi, AuthorizationState};
use crate::config::ApiConfig;
use async_trait::async_trait;

/// Community API client holding the authenticated session
pub struct CommunityClient {
    http: reqwest::Client,
    base_url: String,
    cookie_header: String,
}

impl CommunityClient {
    /// Build a client bound to the given session
    pub fn new(config: &ApiConfig, session: &SessionContext) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout())
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url.clone(),
            cookie_header: session.cookie_header(),
        })
    }
}

#[async_trait]
impl AuthorizationApi for CommunityClient {
    async fn check_state(&self) -> Result<AuthorizationState, ApiError> {
        let url = format!("{}user/bl-switch/state", self.base_url);
        debug!(%url, "checking authorization state");

        let response = self
            .http
            .get(&url)
            .header(header::COOKIE, &self.cookie_header)
            .send()
            .await?;
        let text = response.text().await?;

        parse_state_payload(&text)
    }

    async fn apply(&self) -> Result<ApplyReply, ApiError> {
        let url = format!("{}apply/bl-auth", self.base_url);
        debug!(%url, "submitting application");

        let response = self
            .http
            .post(&url)
            .header(header::COOKIE, &self.cookie_header)
            .json(&serde_json::json!({ "is_retry": true }))
            .send()
            .await?;
        let text = response.text().await?;

        parse_apply_payload(&text)
    }
}

#[derive(Debug, Deserialize)]
struct StateResponse {
    data: Option<StateData>,
}

#[derive(Debug, Deserialize)]
struct StateData {
    #[serde(default)]
    is_pass: i64,
    #[serde(default)]
    button_state: i64,
    deadline_format: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApplyResponse {
    data: Option<ApplyData>,
}

#[derive(Debug, Deserialize)]
struct ApplyData {
    #[serde(default)]
    apply_result: i64,
    deadline_format: Option<String>,
}

fn parse_state_payload(text: &str) -> Result<AuthorizationState, ApiError> {
    let response: StateResponse = serde_json::from_str(text).map_err(|e| ApiError::Parse(e.to_string()))?;
    let data = response.data.ok_or(ApiError::MissingData)?;

    Ok(AuthorizationState {
        granted: data.is_pass == 1,
        can_apply: data.button_state == 1,
        deadline: data.deadline_format,
    })
}

fn parse_apply_payload(text: &str) -> Result<ApplyReply, ApiError> {
    let response: ApplyResponse = serde_json::from_str(text).map_err(|e| ApiError::Parse(e.to_string()))?;
    let data = response.data.ok_or(ApiError::MissingData)?;

    Ok(ApplyReply {
        result_code: data.apply_result,
        deadline: data.deadline_format,
    })
}
