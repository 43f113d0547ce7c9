//! Report stream session: connection lifecycle, retention, and status.
//!
//! `StreamSession` binds a device id to at most one live stream connection,
//! applies inbound reports to a shared retention window, and publishes the
//! connection status. Both the window and the status are exposed as watch
//! channels so any number of readers can observe them while only the
//! session mutates.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};

use crate::stream::client::{
    ReportStreamClient, ReportStreamConnection, ReportStreamError, StreamUpdate,
};
use crate::stream::proto::Report;

/// How long a report stays in the live window.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(15 * 60);

/// Connection status of a stream session.
///
/// Transitions are driven solely by session lifecycle events; `Error` and
/// `Disconnected` are terminal until the next [`StreamSession::connect`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ConnectionStatus {
    /// No live connection; the initial state and the result of a clean
    /// close or an explicit disconnect.
    #[default]
    Disconnected,
    /// A connection attempt is underway, before the open acknowledgment.
    Connecting,
    /// The open acknowledgment succeeded and events are flowing.
    Connected,
    /// The connection failed; awaiting a caller-initiated reconnect.
    Error,
}

/// Returns the reports strictly newer than `now - horizon`.
///
/// Arrival order is preserved. Trimming an already-trimmed window at the
/// same instant returns an identical window, and the result never grows
/// relative to the input.
pub fn trim_reports(reports: &[Report], horizon: Duration, now: DateTime<Utc>) -> Vec<Report> {
    let cutoff = retention_cutoff(now, horizon);
    reports
        .iter()
        .filter(|report| report.timestamp > cutoff)
        .cloned()
        .collect()
}

fn retention_cutoff(now: DateTime<Utc>, horizon: Duration) -> DateTime<Utc> {
    now - chrono::Duration::seconds(horizon.as_secs() as i64)
}

/// Stateful wrapper around the report stream for one device at a time.
pub struct StreamSession {
    client: ReportStreamClient,
    retention: Duration,
    epoch: Arc<RwLock<u64>>,
    status_tx: Arc<watch::Sender<ConnectionStatus>>,
    reports_tx: Arc<watch::Sender<Vec<Report>>>,
    error_tx: mpsc::UnboundedSender<ReportStreamError>,
    error_rx: Option<mpsc::UnboundedReceiver<ReportStreamError>>,
    active: Option<ActiveConnection>,
}

struct ActiveConnection {
    device_id: String,
    transport: AbortHandle,
    pump: JoinHandle<()>,
}

impl StreamSession {
    /// Creates a session with the default 15-minute retention window.
    pub fn new(client: ReportStreamClient) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        let (reports_tx, _) = watch::channel(Vec::new());
        let (error_tx, error_rx) = mpsc::unbounded_channel();

        Self {
            client,
            retention: DEFAULT_RETENTION,
            epoch: Arc::new(RwLock::new(0)),
            status_tx: Arc::new(status_tx),
            reports_tx: Arc::new(reports_tx),
            error_tx,
            error_rx: Some(error_rx),
            active: None,
        }
    }

    /// Overrides the retention horizon.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Returns a receiver observing the connection status.
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    /// Returns the status at this instant.
    pub fn current_status(&self) -> ConnectionStatus {
        *self.status_tx.borrow()
    }

    /// Returns a receiver observing the report window.
    pub fn reports(&self) -> watch::Receiver<Vec<Report>> {
        self.reports_tx.subscribe()
    }

    /// Takes the receiver for connection-level errors.
    ///
    /// Each failed connection surfaces exactly one error here. Returns
    /// `None` after the first call.
    pub fn errors(&mut self) -> Option<mpsc::UnboundedReceiver<ReportStreamError>> {
        self.error_rx.take()
    }

    /// Returns the device id of the current connection, if any.
    pub fn device_id(&self) -> Option<&str> {
        self.active.as_ref().map(|active| active.device_id.as_str())
    }

    /// Opens the report stream for `device_id`.
    ///
    /// Any outstanding connection is cancelled first, so at most one
    /// physical connection exists per session; events from the superseded
    /// connection are never delivered. The call does not wait for the open
    /// acknowledgment: status moves to `Connecting` immediately and to
    /// `Connected`, `Disconnected`, or `Error` as the transport reports
    /// back. Must be called from within a Tokio runtime.
    pub fn connect(&mut self, device_id: impl Into<String>) -> Result<(), ReportStreamError> {
        let device_id = device_id.into();
        if device_id.is_empty() {
            return Err(ReportStreamError::EmptyDeviceId);
        }

        self.supersede();
        self.status_tx.send_replace(ConnectionStatus::Connecting);

        let connection = match self.client.connect(&device_id) {
            Ok(connection) => connection,
            Err(error) => {
                self.status_tx.send_replace(ConnectionStatus::Disconnected);
                return Err(error);
            }
        };

        let transport = connection.abort_handle();
        let my_epoch = current_epoch(&self.epoch);
        let handles = SessionHandles {
            status_tx: Arc::clone(&self.status_tx),
            reports_tx: Arc::clone(&self.reports_tx),
            error_tx: self.error_tx.clone(),
            retention: self.retention,
        };
        let epoch = Arc::clone(&self.epoch);
        let pump = tokio::spawn(pump_updates(connection, epoch, my_epoch, handles));

        self.active = Some(ActiveConnection {
            device_id,
            transport,
            pump,
        });
        Ok(())
    }

    /// Cancels the live connection and resets the status.
    ///
    /// Idempotent and safe to call from any status. The transport is torn
    /// down before this returns; a no-op when nothing was ever connected.
    pub fn disconnect(&mut self) {
        if self.supersede() {
            self.status_tx.send_replace(ConnectionStatus::Disconnected);
        }
    }

    /// Removes reports older than the retention horizon from the window.
    ///
    /// The same predicate runs after every inbound event; this entry point
    /// exists for periodic or manual cleanup while the stream is quiet.
    pub fn trim_now(&self) {
        let cutoff = retention_cutoff(Utc::now(), self.retention);
        self.reports_tx.send_if_modified(|reports| {
            let before = reports.len();
            reports.retain(|report| report.timestamp > cutoff);
            reports.len() != before
        });
    }

    /// Aborts the current connection, if any. Returns whether one existed.
    ///
    /// The epoch bump happens before the abort, so a pump mid-delivery can
    /// never apply another update afterwards.
    fn supersede(&mut self) -> bool {
        bump_epoch(&self.epoch);
        match self.active.take() {
            Some(active) => {
                active.transport.abort();
                active.pump.abort();
                true
            }
            None => false,
        }
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.transport.abort();
            active.pump.abort();
        }
    }
}

/// Shared-state handles a pump task mutates on behalf of its session.
#[derive(Clone)]
struct SessionHandles {
    status_tx: Arc<watch::Sender<ConnectionStatus>>,
    reports_tx: Arc<watch::Sender<Vec<Report>>>,
    error_tx: mpsc::UnboundedSender<ReportStreamError>,
    retention: Duration,
}

impl SessionHandles {
    fn apply(&self, update: StreamUpdate) {
        match update {
            StreamUpdate::Opened => {
                self.status_tx.send_replace(ConnectionStatus::Connected);
            }
            StreamUpdate::Report { report, .. } => {
                let cutoff = retention_cutoff(Utc::now(), self.retention);
                self.reports_tx.send_modify(|reports| {
                    reports.push(report);
                    reports.retain(|kept| kept.timestamp > cutoff);
                });
            }
            StreamUpdate::Closed => {
                self.status_tx.send_replace(ConnectionStatus::Disconnected);
            }
            StreamUpdate::Failed(error) => {
                self.status_tx.send_replace(ConnectionStatus::Error);
                let _ = self.error_tx.send(error);
            }
        }
    }
}

async fn pump_updates(
    mut connection: ReportStreamConnection,
    epoch: Arc<RwLock<u64>>,
    my_epoch: u64,
    handles: SessionHandles,
) {
    while let Some(update) = connection.recv().await {
        if !apply_if_current(&epoch, my_epoch, &handles, update) {
            return;
        }
    }
}

/// Applies `update` unless the session has moved on to a newer connection.
///
/// The epoch read guard is held across the apply, so a concurrent
/// supersession is either fully before (update dropped) or fully after
/// (update applied) this delivery.
fn apply_if_current(
    epoch: &RwLock<u64>,
    my_epoch: u64,
    handles: &SessionHandles,
    update: StreamUpdate,
) -> bool {
    let Ok(guard) = epoch.read() else {
        return false;
    };
    if *guard != my_epoch {
        return false;
    }
    handles.apply(update);
    true
}

fn bump_epoch(epoch: &Arc<RwLock<u64>>) {
    if let Ok(mut guard) = epoch.write() {
        *guard += 1;
    }
}

fn current_epoch(epoch: &Arc<RwLock<u64>>) -> u64 {
    epoch.read().map(|guard| *guard).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, RwLock};
    use std::time::Duration;

    use chrono::{DateTime, TimeZone, Utc};
    use reqwest::StatusCode;
    use tokio::sync::{mpsc, watch};

    use super::{
        apply_if_current, trim_reports, ConnectionStatus, SessionHandles, StreamSession,
        DEFAULT_RETENTION,
    };
    use crate::auth::Anonymous;
    use crate::stream::client::{ReportStreamClient, ReportStreamError, StreamUpdate};
    use crate::stream::proto::{Report, ReportEventKind};

    fn report_at(timestamp: DateTime<Utc>, temperature: f64) -> Report {
        Report {
            temperature_celcius: temperature,
            heater_on: false,
            timestamp,
        }
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 5, 12, 0, 0).unwrap()
    }

    fn session() -> StreamSession {
        let client = ReportStreamClient::new(Arc::new(Anonymous)).expect("build client");
        StreamSession::new(client)
    }

    fn handles() -> (
        SessionHandles,
        watch::Receiver<ConnectionStatus>,
        watch::Receiver<Vec<Report>>,
        mpsc::UnboundedReceiver<ReportStreamError>,
    ) {
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);
        let (reports_tx, reports_rx) = watch::channel(Vec::new());
        let (error_tx, error_rx) = mpsc::unbounded_channel();
        let handles = SessionHandles {
            status_tx: Arc::new(status_tx),
            reports_tx: Arc::new(reports_tx),
            error_tx,
            retention: DEFAULT_RETENTION,
        };
        (handles, status_rx, reports_rx, error_rx)
    }

    #[test]
    fn trim_drops_reports_past_the_horizon() {
        let now = fixed_now();
        let stale = report_at(now - chrono::Duration::minutes(16), 21.5);
        let fresh = report_at(now, 19.0);

        let trimmed = trim_reports(&[stale, fresh.clone()], DEFAULT_RETENTION, now);
        assert_eq!(trimmed, vec![fresh]);
    }

    #[test]
    fn trim_is_idempotent_at_a_fixed_instant() {
        let now = fixed_now();
        let window = vec![
            report_at(now - chrono::Duration::minutes(14), 20.0),
            report_at(now - chrono::Duration::minutes(2), 21.0),
        ];

        let once = trim_reports(&window, DEFAULT_RETENTION, now);
        let twice = trim_reports(&once, DEFAULT_RETENTION, now);
        assert_eq!(once, twice);
    }

    #[test]
    fn trim_of_empty_window_is_a_noop() {
        assert!(trim_reports(&[], DEFAULT_RETENTION, fixed_now()).is_empty());
    }

    #[test]
    fn trim_requires_strictly_newer_than_cutoff() {
        let now = fixed_now();
        let at_cutoff = report_at(now - chrono::Duration::minutes(15), 18.0);
        assert!(trim_reports(&[at_cutoff], DEFAULT_RETENTION, now).is_empty());
    }

    #[test]
    fn trim_preserves_arrival_order_and_never_grows() {
        let now = fixed_now();
        // Arrival order deliberately disagrees with timestamp order.
        let window = vec![
            report_at(now - chrono::Duration::minutes(3), 20.0),
            report_at(now - chrono::Duration::minutes(10), 19.0),
            report_at(now - chrono::Duration::minutes(1), 21.0),
        ];

        let trimmed = trim_reports(&window, DEFAULT_RETENTION, now);
        assert_eq!(trimmed, window);
        assert!(trimmed.len() <= window.len());
    }

    #[test]
    fn status_follows_the_session_lifecycle() {
        let (handles, status_rx, _reports_rx, mut error_rx) = handles();

        handles.apply(StreamUpdate::Opened);
        assert_eq!(*status_rx.borrow(), ConnectionStatus::Connected);

        handles.apply(StreamUpdate::Failed(ReportStreamError::OpenRejected {
            status: StatusCode::INTERNAL_SERVER_ERROR,
        }));
        assert_eq!(*status_rx.borrow(), ConnectionStatus::Error);
        assert!(matches!(
            error_rx.try_recv(),
            Ok(ReportStreamError::OpenRejected { .. })
        ));
        // The failure is surfaced once, not repeatedly.
        assert!(error_rx.try_recv().is_err());
    }

    #[test]
    fn clean_close_resets_status_to_disconnected() {
        let (handles, status_rx, _reports_rx, _error_rx) = handles();
        handles.apply(StreamUpdate::Opened);
        handles.apply(StreamUpdate::Closed);
        assert_eq!(*status_rx.borrow(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn inbound_reports_append_then_trim() {
        let (handles, _status_rx, reports_rx, _error_rx) = handles();

        let stale = report_at(Utc::now() - chrono::Duration::minutes(16), 21.5);
        let fresh = report_at(Utc::now(), 19.0);
        handles.apply(StreamUpdate::Report {
            kind: ReportEventKind::Historical,
            report: stale,
        });
        handles.apply(StreamUpdate::Report {
            kind: ReportEventKind::Update,
            report: fresh.clone(),
        });

        assert_eq!(*reports_rx.borrow(), vec![fresh]);
    }

    #[test]
    fn stale_epoch_updates_are_never_applied() {
        let (handles, status_rx, _reports_rx, _error_rx) = handles();
        let epoch = RwLock::new(0u64);

        assert!(apply_if_current(&epoch, 0, &handles, StreamUpdate::Opened));
        assert_eq!(*status_rx.borrow(), ConnectionStatus::Connected);

        // A superseding connect bumps the epoch; the old pump's deliveries
        // must stop dead.
        *epoch.write().unwrap() += 1;
        assert!(!apply_if_current(
            &epoch,
            0,
            &handles,
            StreamUpdate::Closed
        ));
        assert_eq!(*status_rx.borrow(), ConnectionStatus::Connected);
    }

    #[test]
    fn disconnect_without_a_connection_is_a_noop() {
        let mut session = session();
        assert_eq!(session.current_status(), ConnectionStatus::Disconnected);

        session.disconnect();
        session.disconnect();
        assert_eq!(session.current_status(), ConnectionStatus::Disconnected);
        assert!(session.device_id().is_none());
    }

    #[test]
    fn connect_rejects_empty_device_id_without_state_change() {
        let mut session = session();
        let error = session.connect("").expect_err("empty device id");
        assert!(matches!(error, ReportStreamError::EmptyDeviceId));
        assert_eq!(session.current_status(), ConnectionStatus::Disconnected);
        assert!(session.device_id().is_none());
    }

    #[test]
    fn errors_receiver_can_only_be_taken_once() {
        let mut session = session();
        assert!(session.errors().is_some());
        assert!(session.errors().is_none());
    }

    #[test]
    fn trim_now_prunes_the_shared_window() {
        let session = session();
        let reports = session.reports();

        let stale = report_at(Utc::now() - chrono::Duration::minutes(20), 22.0);
        let fresh = report_at(Utc::now(), 20.5);
        session.reports_tx.send_modify(|window| {
            window.push(stale);
            window.push(fresh.clone());
        });

        session.trim_now();
        assert_eq!(*reports.borrow(), vec![fresh]);

        // Idempotent at session level too.
        session.trim_now();
        assert_eq!(reports.borrow().len(), 1);
    }
}
