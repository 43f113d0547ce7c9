//! HTTP client for the backend's REST surface.
//!
//! Everything here is request/response glue around the `api/v1` routes:
//! login, device listing, report history, and schedule download/upload.
//! Realtime report delivery lives in [`crate::stream`].

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::{MemoryTokenStore, TokenProvider};
use crate::retry::{retry_async, RetryPolicy};
use crate::stream::proto::Report;

const ERROR_BODY_SNIPPET_LEN: usize = 220;
/// Production base URL for the backend.
pub const API_BASE_URL: &str = "https://api.thermolink.io";
/// Local development base URL for the backend.
pub const LOCAL_API_BASE_URL: &str = "http://localhost:8000";

/// Default timeouts and retry settings for REST calls.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RestApiDefaults;

impl RestApiDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
    pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(8);
    pub const MAX_ATTEMPTS: usize = 2;
    pub const BACKOFF: Duration = Duration::from_millis(100);
    pub const JITTER: Duration = Duration::from_millis(50);
}

/// Tunable options for [`RestApiClient`].
#[derive(Clone, Debug)]
pub struct RestApiOptions {
    pub connect_timeout: Duration,
    pub attempt_timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for RestApiOptions {
    fn default() -> Self {
        Self {
            connect_timeout: RestApiDefaults::CONNECT_TIMEOUT,
            attempt_timeout: RestApiDefaults::ATTEMPT_TIMEOUT,
            retry_policy: RetryPolicy {
                max_attempts: RestApiDefaults::MAX_ATTEMPTS,
                initial_backoff: RestApiDefaults::BACKOFF,
                max_backoff: RestApiDefaults::BACKOFF,
                jitter: RestApiDefaults::JITTER,
            },
        }
    }
}

/// REST client for login, device, and schedule calls.
///
/// Login stores the issued token in the shared [`MemoryTokenStore`]; every
/// later call attaches it as a bearer header. A 401 response clears the
/// store so the application can route the user back to login.
#[derive(Clone)]
pub struct RestApiClient {
    http: Client,
    tokens: Arc<MemoryTokenStore>,
    attempt_timeout: Duration,
    retry_policy: RetryPolicy,
    local: bool,
    endpoint_override: Option<String>,
}

impl RestApiClient {
    /// Creates a client with a fresh, empty token store.
    pub fn new() -> Result<Self, RestApiError> {
        Self::with_options(Arc::new(MemoryTokenStore::new()), RestApiOptions::default())
    }

    /// Creates a client sharing an existing token store.
    ///
    /// Pass the same store to [`ReportStreamClient`](crate::stream::client::ReportStreamClient)
    /// so stream connections pick up tokens issued through login.
    pub fn with_token_store(tokens: Arc<MemoryTokenStore>) -> Result<Self, RestApiError> {
        Self::with_options(tokens, RestApiOptions::default())
    }

    /// Creates a client with explicit options.
    pub fn with_options(
        tokens: Arc<MemoryTokenStore>,
        options: RestApiOptions,
    ) -> Result<Self, RestApiError> {
        let http = Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(RestApiError::Transport)?;

        Ok(Self {
            http,
            tokens,
            attempt_timeout: options.attempt_timeout,
            retry_policy: options.retry_policy,
            local: false,
            endpoint_override: None,
        })
    }

    /// Enables or disables local mode endpoint routing.
    pub fn with_local_mode(mut self, local: bool) -> Self {
        self.local = local;
        self
    }

    /// Sets an explicit base-URL override.
    ///
    /// The override takes precedence over local mode when set.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        self.endpoint_override = Some(endpoint.trim_end().to_string());
        self
    }

    /// Returns the token store backing this client.
    pub fn token_store(&self) -> Arc<MemoryTokenStore> {
        Arc::clone(&self.tokens)
    }

    /// Returns whether a bearer token is currently stored.
    pub fn is_authenticated(&self) -> bool {
        self.tokens.is_authenticated()
    }

    /// Authenticates with the password grant and stores the issued token.
    pub async fn login(
        &self,
        username: &str,
        password: &str,
    ) -> Result<TokenResponse, RestApiError> {
        let endpoint = self.endpoint("/api/v1/auth/user/login");
        let form = [
            ("username", username),
            ("password", password),
            ("grant_type", "password"),
        ];

        let response = retry_async(
            &self.retry_policy,
            |_| {
                let endpoint = endpoint.clone();
                async move {
                    let request = self
                        .http
                        .post(&endpoint)
                        .timeout(self.attempt_timeout)
                        .form(&form);
                    self.execute::<TokenResponse>(request).await
                }
            },
            RestApiError::is_retryable,
        )
        .await?;

        self.tokens
            .store(SecretString::new(response.access_token.clone()));
        Ok(response)
    }

    /// Discards the stored token.
    pub fn logout(&self) {
        self.tokens.clear();
    }

    /// Lists the authenticated user's devices.
    pub async fn devices(&self) -> Result<Vec<UserDevice>, RestApiError> {
        self.get_json("/api/v1/user/device").await
    }

    /// Fetches the report history for a device.
    pub async fn device_reports(&self, device_id: &str) -> Result<Vec<Report>, RestApiError> {
        self.get_json(&format!("/api/v1/user/device/{device_id}/reports"))
            .await
    }

    /// Downloads a device's schedule.
    pub async fn schedule(&self, device_id: &str) -> Result<ThermostatSchedule, RestApiError> {
        self.get_json(&format!("/api/v1/user/device/{device_id}/schedule"))
            .await
    }

    /// Uploads a device's schedule.
    pub async fn upload_schedule(
        &self,
        device_id: &str,
        schedule: &ThermostatSchedule,
    ) -> Result<(), RestApiError> {
        let endpoint = self.endpoint(&format!("/api/v1/user/device/{device_id}/schedule"));

        retry_async(
            &self.retry_policy,
            |_| {
                let endpoint = endpoint.clone();
                async move {
                    let request = self
                        .http
                        .post(&endpoint)
                        .timeout(self.attempt_timeout)
                        .json(schedule);
                    // Upload acknowledgments carry no payload the caller
                    // needs; only the status matters.
                    self.execute_raw(request).await
                }
            },
            RestApiError::is_retryable,
        )
        .await?;
        Ok(())
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, RestApiError> {
        let endpoint = self.endpoint(path);

        retry_async(
            &self.retry_policy,
            |_| {
                let endpoint = endpoint.clone();
                async move {
                    let request = self.http.get(&endpoint).timeout(self.attempt_timeout);
                    self.execute::<T>(request).await
                }
            },
            RestApiError::is_retryable,
        )
        .await
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, RestApiError> {
        let body = self.execute_raw(request).await?;
        serde_json::from_str(&body).map_err(|error| RestApiError::Parse(error.to_string()))
    }

    async fn execute_raw(&self, request: reqwest::RequestBuilder) -> Result<String, RestApiError> {
        let mut request = request.header(ACCEPT, "application/json");
        if let Some(token) = self.tokens.bearer_token() {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token.expose_secret()));
        }

        let response = request.send().await.map_err(RestApiError::Transport)?;
        let status = response.status();
        let body = response.text().await.map_err(RestApiError::Transport)?;

        if status == StatusCode::UNAUTHORIZED {
            // Mirror of the original client's response interceptor: a
            // rejected token is dropped so the caller can re-login.
            self.tokens.clear();
            return Err(RestApiError::AuthRejected);
        }
        if !status.is_success() {
            return Err(RestApiError::HttpStatus {
                status,
                body: summarize_error_body(&body),
            });
        }

        Ok(body)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url(), path)
    }

    fn base_url(&self) -> &str {
        if let Some(endpoint) = self.endpoint_override.as_deref() {
            return endpoint;
        }
        if self.local {
            LOCAL_API_BASE_URL
        } else {
            API_BASE_URL
        }
    }
}

/// Token issued by the login endpoint.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
}

/// One device registered to the authenticated user.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct UserDevice {
    pub device_id: String,
    pub user_id: String,
    pub schedule: Option<ThermostatSchedule>,
}

/// Weekly heating schedule for a device.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ThermostatSchedule {
    pub schedule: Vec<DaySchedule>,
}

/// Time slots for one day of the week.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DaySchedule {
    /// Day name, `Monday` through `Sunday`.
    pub day: String,
    pub slots: Vec<TimeSlot>,
}

/// One schedule entry.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TimeSlot {
    /// Start time in `HH:MM` format.
    pub time: String,
    /// Target temperature in degrees Celsius.
    pub temperature: f64,
}

/// Errors produced by REST transport and response handling.
#[derive(Debug, Error)]
pub enum RestApiError {
    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("authentication rejected (http 401)")]
    AuthRejected,

    #[error("failed to parse response: {0}")]
    Parse(String),
}

impl RestApiError {
    /// Returns whether a retry may succeed without caller intervention.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(error) => error.is_timeout() || error.is_connect(),
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::AuthRejected | Self::Parse(_) => false,
        }
    }
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        detail: Option<String>,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.detail.or(parsed.error).or(parsed.message) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}
