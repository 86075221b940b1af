//! # Session Controller
//!
//! Starts and stops tracking sessions.
//!
//! ## Lifecycle
//!
//! `Idle → Tracking → Idle`. A stopped session is never resumed; every
//! `start()` opens a new session with a fresh identifier.
//!
//! Stop ordering:
//! 1. Unsubscribe from the sample source
//! 2. Tell the owner task to stop, which disarms the time trigger
//! 3. Await the final drain and flush
//! 4. Clear the session and report `Idle`
//!
//! Dropping a controller mid-session detaches the source and lets the owner
//! task run the same drain on its own, without anyone awaiting it.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::identity::IdentityProvider;
use super::journal::DeliveryJournal;
use super::source::{SampleSource, SubscriptionHandle};
use super::types::{BatchMeta, PipelineStatus, Session, TrackingState};
use super::uploader::UploadEndpoint;
use super::worker::{Command, SessionWorker, StopReport, WorkerSettings};
use crate::config::{Config, JournalConfig};
use crate::error::{Result, UplinkError};

/// Pipeline tunables taken from [`Config`]
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub capacity: usize,
    pub shed_factor: usize,
    pub flush_interval: Duration,
    pub sampling_rate_hz: f64,
    pub client_tag: String,
    pub journal: JournalConfig,
}

impl From<&Config> for PipelineSettings {
    fn from(config: &Config) -> Self {
        Self {
            capacity: config.buffer.capacity,
            shed_factor: config.buffer.shed_factor,
            flush_interval: config.scheduler.flush_interval(),
            sampling_rate_hz: config.source.sampling_rate_hz,
            client_tag: config.upload.client_tag.clone(),
            journal: config.journal.clone(),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

struct ActiveSession {
    session: Session,
    subscription: SubscriptionHandle,
    commands: mpsc::Sender<Command>,
    worker: JoinHandle<StopReport>,
}

/// Orchestrates one tracking session at a time
pub struct SessionController {
    settings: PipelineSettings,
    identity: Arc<IdentityProvider>,
    source: Arc<dyn SampleSource>,
    endpoint: Arc<dyn UploadEndpoint>,
    status_tx: Arc<watch::Sender<PipelineStatus>>,
    status_rx: watch::Receiver<PipelineStatus>,
    active: Option<ActiveSession>,
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("state", &self.state())
            .field("session_id", &self.session_id())
            .finish_non_exhaustive()
    }
}

impl SessionController {
    pub fn new(
        settings: PipelineSettings,
        identity: Arc<IdentityProvider>,
        source: Arc<dyn SampleSource>,
        endpoint: Arc<dyn UploadEndpoint>,
    ) -> Self {
        let (status_tx, status_rx) = watch::channel(PipelineStatus::default());
        Self {
            settings,
            identity,
            source,
            endpoint,
            status_tx: Arc::new(status_tx),
            status_rx,
            active: None,
        }
    }

    /// Begin a new tracking session
    ///
    /// # Returns
    ///
    /// * `Result<Session>` - The freshly opened session
    ///
    /// # Errors
    ///
    /// Returns `AlreadyTracking` if a session is active
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use motion_uplink::telemetry::identity::{IdentityProvider, MemoryIdentityStore};
    /// use motion_uplink::telemetry::session::{PipelineSettings, SessionController};
    /// use motion_uplink::telemetry::source::SimulatedSource;
    /// use motion_uplink::telemetry::uploader::HttpEndpoint;
    /// use std::sync::Arc;
    /// use std::time::Duration;
    ///
    /// #[tokio::main]
    /// async fn main() -> anyhow::Result<()> {
    ///     let mut controller = SessionController::new(
    ///         PipelineSettings::default(),
    ///         Arc::new(IdentityProvider::new(Arc::new(MemoryIdentityStore::new()))),
    ///         Arc::new(SimulatedSource::new(50.0)),
    ///         Arc::new(HttpEndpoint::new("http://localhost:8000", Duration::from_secs(10))?),
    ///     );
    ///
    ///     let session = controller.start()?;
    ///     println!("Tracking session {}", session.session_id);
    ///     controller.stop().await;
    ///     Ok(())
    /// }
    /// ```
    pub fn start(&mut self) -> Result<Session> {
        if let Some(active) = &self.active {
            return Err(UplinkError::AlreadyTracking(active.session.session_id.clone()));
        }

        let identity = self.identity.device_identity();
        if !identity.persisted {
            warn!("Tracking with ephemeral device id {}", identity.device_id);
        }
        let session = Session::begin(identity.device_id);

        let journal = match DeliveryJournal::from_config(&self.settings.journal) {
            Ok(journal) => journal,
            Err(e) => {
                warn!("Delivery journal unavailable: {}", e);
                None
            }
        };

        let settings = WorkerSettings {
            capacity: self.settings.capacity,
            shed_factor: self.settings.shed_factor,
            flush_interval: self.settings.flush_interval,
            meta: BatchMeta {
                sampling_rate_hz: self.settings.sampling_rate_hz,
                client_tag: self.settings.client_tag.clone(),
            },
        };
        let worker = SessionWorker::new(
            session.clone(),
            settings,
            Arc::clone(&self.endpoint),
            journal,
            Arc::clone(&self.status_tx),
        );

        let (sample_tx, sample_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::channel(1);

        let subscription = self.source.subscribe(sample_tx);
        let worker = tokio::spawn(worker.run(sample_rx, command_rx));

        info!(
            "Started session {} on device {}",
            session.session_id, session.device_id
        );

        self.active = Some(ActiveSession {
            session: session.clone(),
            subscription,
            commands: command_tx,
            worker,
        });
        Ok(session)
    }

    /// Stop the active session, waiting for the final flush.
    ///
    /// Calling this while idle does nothing.
    ///
    /// # Returns
    ///
    /// * `Option<StopReport>` - `None` when no session was active
    pub async fn stop(&mut self) -> Option<StopReport> {
        let Some(active) = self.active.take() else {
            debug!("Stop requested while idle");
            return None;
        };

        let ActiveSession { session, subscription, commands, worker } = active;

        self.source.unsubscribe(subscription);
        if commands.send(Command::Stop).await.is_err() {
            warn!("Owner task for session {} already exited", session.session_id);
        }

        let report = match worker.await {
            Ok(report) => report,
            Err(e) => {
                error!("Owner task for session {} failed: {}", session.session_id, e);
                StopReport {
                    session_id: session.session_id.clone(),
                    ..StopReport::default()
                }
            }
        };

        self.status_tx.send_modify(|status| {
            status.state = TrackingState::Idle;
            status.session_id = None;
            status.buffered = 0;
        });

        info!(
            "Stopped session {}: {} samples delivered, {} unsent, {} shed",
            session.session_id, report.samples_delivered, report.unsent, report.shed_total
        );
        Some(report)
    }

    pub fn state(&self) -> TrackingState {
        if self.active.is_some() {
            TrackingState::Tracking
        } else {
            TrackingState::Idle
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.session.session_id.as_str())
    }

    pub fn current_session(&self) -> Option<&Session> {
        self.active.as_ref().map(|a| &a.session)
    }

    /// Latest status snapshot
    pub fn status(&self) -> PipelineStatus {
        self.status_rx.borrow().clone()
    }

    /// Receiver that is notified on every status change
    pub fn subscribe_status(&self) -> watch::Receiver<PipelineStatus> {
        self.status_rx.clone()
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            warn!(
                "Session controller dropped while tracking {}, draining in background",
                active.session.session_id
            );
            self.source.unsubscribe(active.subscription);
            // Closing the command channel makes the owner task drain and exit
            drop(active.commands);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UploadError;
    use crate::telemetry::identity::MemoryIdentityStore;
    use crate::telemetry::source::ManualSource;
    use crate::telemetry::types::Sample;
    use crate::telemetry::uploader::mocks::RecordingEndpoint;
    use tokio::time::sleep;

    struct Harness {
        controller: SessionController,
        source: Arc<ManualSource>,
        endpoint: RecordingEndpoint,
    }

    fn harness(capacity: usize, shed_factor: usize) -> Harness {
        let settings = PipelineSettings {
            capacity,
            shed_factor,
            flush_interval: Duration::from_millis(5000),
            sampling_rate_hz: 50.0,
            client_tag: "test".to_string(),
            journal: JournalConfig::default(),
        };
        let source = Arc::new(ManualSource::new());
        let endpoint = RecordingEndpoint::new();
        let identity = Arc::new(IdentityProvider::new(Arc::new(MemoryIdentityStore::new())));

        let controller = SessionController::new(settings, identity, source.clone(), Arc::new(endpoint.clone()));
        Harness { controller, source, endpoint }
    }

    fn emit(source: &ManualSource, range: std::ops::RangeInclusive<i64>) {
        for ts in range {
            source.emit(Sample::new(ts, 0.0, 0.0, 9.81));
        }
    }

    /// Let the owner task and upload tasks run without reaching a flush tick
    async fn settle() {
        sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_520_samples_one_size_batch_then_tick() {
        let mut h = harness(500, 10);
        h.controller.start().unwrap();

        emit(&h.source, 1..=520);
        settle().await;

        assert_eq!(h.endpoint.delivered_sizes(), vec![500]);
        assert_eq!(h.controller.status().buffered, 20);

        sleep(Duration::from_millis(5000)).await;
        assert_eq!(h.endpoint.delivered_sizes(), vec![500, 20]);
        assert_eq!(h.endpoint.delivered_timestamps(), (1..=520).collect::<Vec<_>>());

        let report = h.controller.stop().await.unwrap();
        assert_eq!(report.final_batch, 0, "Nothing left for the final flush");
        assert_eq!(report.samples_delivered, 520);
        assert_eq!(h.endpoint.attempt_sizes(), vec![500, 20]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_flushes_buffered_samples_once() {
        let mut h = harness(500, 10);
        h.controller.start().unwrap();

        emit(&h.source, 1..=7);
        settle().await;
        assert!(h.endpoint.attempt_sizes().is_empty());

        let report = h.controller.stop().await.unwrap();
        assert_eq!(report.final_batch, 7);
        assert!(report.final_delivered);
        assert_eq!(h.endpoint.attempt_sizes(), vec![7]);

        assert_eq!(h.controller.state(), TrackingState::Idle);
        assert_eq!(h.controller.session_id(), None);
        let status = h.controller.status();
        assert_eq!(status.state, TrackingState::Idle);
        assert_eq!(status.session_id, None);
        assert_eq!(status.last_flush_count, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_when_idle_is_noop() {
        let mut h = harness(500, 10);
        assert!(h.controller.stop().await.is_none());

        h.controller.start().unwrap();
        assert!(h.controller.stop().await.is_some());
        assert!(h.controller.stop().await.is_none(), "Second stop is a no-op");
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_while_tracking_fails() {
        let mut h = harness(500, 10);
        let session = h.controller.start().unwrap();

        match h.controller.start() {
            Err(UplinkError::AlreadyTracking(id)) => assert_eq!(id, session.session_id),
            other => panic!("Expected AlreadyTracking, got: {:?}", other),
        }
        assert_eq!(h.controller.session_id(), Some(session.session_id.as_str()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_gets_fresh_session_same_device() {
        let mut h = harness(500, 10);
        let first = h.controller.start().unwrap();
        h.controller.stop().await;
        let second = h.controller.start().unwrap();

        assert_ne!(first.session_id, second.session_id);
        assert_eq!(first.device_id, second.device_id);
        assert_eq!(h.controller.status().buffered, 0, "New session starts empty");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_unsubscribes_source() {
        let mut h = harness(500, 10);
        h.controller.start().unwrap();
        assert_eq!(h.source.subscriber_count(), 1);

        h.controller.stop().await;
        assert_eq!(h.source.subscriber_count(), 0);
        assert_eq!(h.source.emit(Sample::new(1, 0.0, 0.0, 9.81)), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_waits_for_outstanding_upload() {
        let mut h = harness(5, 10);
        h.endpoint.set_latency(Duration::from_millis(1000));
        h.controller.start().unwrap();

        emit(&h.source, 1..=5);
        settle().await;
        emit(&h.source, 6..=8);
        settle().await;
        assert_eq!(h.endpoint.attempt_sizes(), vec![5]);
        assert!(h.endpoint.delivered_sizes().is_empty(), "First attempt still outstanding");

        let report = h.controller.stop().await.unwrap();
        assert_eq!(h.endpoint.delivered_sizes(), vec![5, 3]);
        assert_eq!(report.final_batch, 3);
        assert_eq!(report.batches_delivered, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outstanding_failure_at_stop_is_retried_in_final_flush() {
        let mut h = harness(5, 10);
        h.endpoint.set_latency(Duration::from_millis(1000));
        h.endpoint.fail_next(1, UploadError::Network("reset".to_string()));
        h.controller.start().unwrap();

        emit(&h.source, 1..=5);
        settle().await;
        emit(&h.source, 6..=8);
        settle().await;

        let report = h.controller.stop().await.unwrap();
        assert_eq!(report.final_batch, 8);
        assert!(report.final_delivered);
        assert_eq!(report.unsent, 0);
        assert_eq!(h.endpoint.delivered_timestamps(), (1..=8).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_error_is_surfaced_without_ending_session() {
        let mut h = harness(500, 10);
        h.endpoint.fail_next(
            1,
            UploadError::Rejected {
                status: 503,
                message: "collector overloaded".to_string(),
            },
        );
        h.controller.start().unwrap();

        emit(&h.source, 1..=2);
        sleep(Duration::from_millis(5001)).await;

        let status = h.controller.status();
        assert_eq!(status.state, TrackingState::Tracking);
        assert_eq!(status.buffered, 2);
        assert_eq!(status.last_error.as_deref(), Some("Upload rejected (503): collector overloaded"));

        sleep(Duration::from_millis(5000)).await;
        let status = h.controller.status();
        assert_eq!(status.buffered, 0);
        assert_eq!(status.last_error, None);
        assert_eq!(h.endpoint.delivered_timestamps(), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sustained_failure_sheds_oldest_and_reports() {
        let mut h = harness(2, 2);
        h.endpoint.fail_next(100, UploadError::Network("offline".to_string()));
        h.controller.start().unwrap();

        emit(&h.source, 1..=10);
        settle().await;

        let status = h.controller.status();
        assert_eq!(status.buffered, 4, "Buffer held at shed_factor * C");
        assert_eq!(status.shed_total, 6);
        assert!(status.last_error.is_some());

        let report = h.controller.stop().await.unwrap();
        assert_eq!(report.final_batch, 4);
        assert_eq!(report.unsent, 4);
        assert_eq!(report.shed_total, 6);
        assert!(h.endpoint.delivered_sizes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_controller_drains_in_background() {
        let h = harness(500, 10);
        let Harness { mut controller, source, endpoint } = h;
        controller.start().unwrap();

        emit(&source, 1..=3);
        settle().await;
        drop(controller);
        settle().await;

        assert_eq!(endpoint.delivered_sizes(), vec![3]);
        assert_eq!(source.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_journal_records_deliveries() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut h = harness(3, 10);
        h.controller.settings.journal = JournalConfig {
            enabled: true,
            log_dir: dir.path().to_string_lossy().to_string(),
            max_records_per_file: 100,
            max_files_to_keep: 2,
        };
        h.controller.start().unwrap();

        emit(&h.source, 1..=4);
        settle().await;
        h.controller.stop().await;

        let journal = DeliveryJournal::new(dir.path(), 100, 2).unwrap();
        let files = journal.journal_files().unwrap();
        assert_eq!(files.len(), 1);
        let contents = std::fs::read_to_string(&files[0]).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"trigger\":\"size\""));
        assert!(lines[1].contains("\"trigger\":\"stop\""));
    }
}
