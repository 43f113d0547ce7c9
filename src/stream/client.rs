//! Low-level report stream transport.
//!
//! The client opens the device's report-stream endpoint and hands ownership
//! of the connection to a background worker. The worker decodes inbound
//! server-sent events, forwards well-formed reports, and retries transient
//! mid-stream interruptions with bounded backoff. Open-acknowledgment
//! failures are fatal and never retried.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::StatusCode;
use secrecy::ExposeSecret;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, warn};

use crate::auth::TokenProvider;
use crate::rest_api::{API_BASE_URL, LOCAL_API_BASE_URL};
use crate::retry::RetryPolicy;
use crate::stream::proto::{Report, ReportEventKind, SseFrameDecoder};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Entry point for opening report stream connections.
#[derive(Clone)]
pub struct ReportStreamClient {
    http: reqwest::Client,
    tokens: Arc<dyn TokenProvider>,
    local: bool,
    endpoint_override: Option<String>,
    reconnect_policy: RetryPolicy,
}

impl ReportStreamClient {
    /// Creates a stream client that looks up bearer tokens through `tokens`.
    ///
    /// The provider is consulted on every connection attempt, so a token
    /// refreshed elsewhere is picked up on the next open.
    pub fn new(tokens: Arc<dyn TokenProvider>) -> Result<Self, ReportStreamError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(ReportStreamError::Transport)?;

        Ok(Self {
            http,
            tokens,
            local: false,
            endpoint_override: None,
            reconnect_policy: RetryPolicy::streaming(),
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

    /// Replaces the reconnect pacing for transient mid-stream interruptions.
    pub fn with_reconnect_policy(mut self, policy: RetryPolicy) -> Self {
        self.reconnect_policy = policy;
        self
    }

    /// Opens the report stream for a device.
    ///
    /// This spawns a background worker that owns the transport and returns a
    /// handle for receiving [`StreamUpdate`]s. The call itself does not wait
    /// for the open acknowledgment; the outcome arrives as the first update.
    /// Must be called from within a Tokio runtime.
    pub fn connect(&self, device_id: &str) -> Result<ReportStreamConnection, ReportStreamError> {
        if device_id.is_empty() {
            return Err(ReportStreamError::EmptyDeviceId);
        }

        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let http = self.http.clone();
        let url = self.stream_url(device_id);
        let tokens = Arc::clone(&self.tokens);
        let policy = self.reconnect_policy.clone();

        let worker = tokio::spawn(async move {
            report_stream_worker(http, url, tokens, policy, updates_tx).await;
        });

        Ok(ReportStreamConnection {
            updates: updates_rx,
            worker,
        })
    }

    fn stream_url(&self, device_id: &str) -> String {
        format!(
            "{}/api/v1/user/device/{device_id}/reports/stream",
            self.base_url()
        )
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

/// Transport lifecycle and data updates produced by the stream worker.
#[derive(Debug)]
pub enum StreamUpdate {
    /// The open acknowledgment succeeded; report events may follow.
    Opened,
    /// A report event tagged `historical` or `update`.
    Report {
        /// Which report tag the event carried.
        kind: ReportEventKind,
        /// The parsed payload.
        report: Report,
    },
    /// The server ended the stream cleanly.
    Closed,
    /// The transport failed; for retryable failures this is sent only after
    /// the reconnect policy is exhausted.
    Failed(ReportStreamError),
}

/// Handle to an active stream connection.
///
/// Dropping the handle aborts the background worker, so a connection never
/// outlives its owner.
#[derive(Debug)]
pub struct ReportStreamConnection {
    updates: mpsc::UnboundedReceiver<StreamUpdate>,
    worker: JoinHandle<()>,
}

impl ReportStreamConnection {
    /// Receives the next update from the stream worker.
    pub async fn recv(&mut self) -> Option<StreamUpdate> {
        self.updates.recv().await
    }

    /// Returns a handle that aborts the worker without consuming `self`.
    pub fn abort_handle(&self) -> AbortHandle {
        self.worker.abort_handle()
    }

    /// Aborts the stream worker, tearing down the transport.
    pub fn abort(&self) {
        self.worker.abort();
    }
}

impl Drop for ReportStreamConnection {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

/// Errors produced by stream transport and open-acknowledgment handling.
#[derive(Debug, Error)]
pub enum ReportStreamError {
    /// Request could not be sent or the streaming body failed mid-flight.
    #[error("transport error: {0}")]
    Transport(reqwest::Error),

    /// The server rejected the bearer credential at open time.
    #[error("stream open rejected credentials: http {status}")]
    AuthRejected {
        /// Status carried by the open acknowledgment (401 or 403).
        status: StatusCode,
    },

    /// The open acknowledgment carried a non-success status.
    #[error("stream open failed: http {status}")]
    OpenRejected {
        /// Status carried by the open acknowledgment.
        status: StatusCode,
    },

    /// Stream connections are always bound to a device.
    #[error("device id must not be empty")]
    EmptyDeviceId,
}

impl ReportStreamError {
    /// Returns whether the reconnect loop may retry after this error.
    ///
    /// Only transport-level interruptions are transient; a rejected open
    /// acknowledgment will not improve without caller intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

async fn report_stream_worker(
    http: reqwest::Client,
    url: String,
    tokens: Arc<dyn TokenProvider>,
    policy: RetryPolicy,
    updates: mpsc::UnboundedSender<StreamUpdate>,
) {
    let mut interruptions = 0usize;

    loop {
        match run_stream_once(&http, &url, tokens.as_ref(), &updates, &mut interruptions).await {
            Ok(()) => {
                let _ = updates.send(StreamUpdate::Closed);
                return;
            }
            Err(error) if !error.is_retryable() => {
                let _ = updates.send(StreamUpdate::Failed(error));
                return;
            }
            Err(error) => {
                interruptions += 1;
                if interruptions >= policy.max_attempts.max(1) {
                    let _ = updates.send(StreamUpdate::Failed(error));
                    return;
                }

                let delay = policy.delay_for_attempt(interruptions);
                debug!(
                    event = "stream_reconnect",
                    attempt = interruptions,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                );
                tokio::time::sleep(delay).await;
            }
        }

        if updates.is_closed() {
            return;
        }
    }
}

/// Runs one open-and-read cycle. `Ok(())` means a clean end-of-stream.
async fn run_stream_once(
    http: &reqwest::Client,
    url: &str,
    tokens: &dyn TokenProvider,
    updates: &mpsc::UnboundedSender<StreamUpdate>,
    interruptions: &mut usize,
) -> Result<(), ReportStreamError> {
    let mut request = http.get(url).header(ACCEPT, "application/json");
    if let Some(token) = tokens.bearer_token() {
        request = request.header(AUTHORIZATION, format!("Bearer {}", token.expose_secret()));
    }

    let response = request.send().await.map_err(ReportStreamError::Transport)?;
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(ReportStreamError::AuthRejected { status });
    }
    if !status.is_success() {
        return Err(ReportStreamError::OpenRejected { status });
    }

    *interruptions = 0;
    let _ = updates.send(StreamUpdate::Opened);

    let mut decoder = SseFrameDecoder::new();
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(ReportStreamError::Transport)?;
        for frame in decoder.feed(&chunk) {
            let Some(kind) = ReportEventKind::from_event_name(&frame.event) else {
                debug!(event = %frame.event, "ignoring unrecognized stream event tag");
                continue;
            };
            match Report::from_text(&frame.data) {
                Ok(report) => {
                    if updates.send(StreamUpdate::Report { kind, report }).is_err() {
                        // Receiver gone; treat as a caller-initiated close.
                        return Ok(());
                    }
                }
                Err(error) => {
                    warn!(%error, "discarding malformed report payload");
                }
            }
        }
    }

    Ok(())
}
