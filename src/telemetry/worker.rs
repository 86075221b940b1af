//! # Session Worker
//!
//! The single owner of a session's buffer, scheduler and uploader.
//!
//! Sample intake, flush ticks, upload completions and the stop command are
//! all serialized through one `tokio::select!` loop, so the buffer is never
//! touched from two contexts. Uploads run as separate tasks; the loop keeps
//! appending samples while one is outstanding.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::buffer::SampleBuffer;
use super::journal::{DeliveryJournal, JournalRecord, Outcome};
use super::scheduler::FlushScheduler;
use super::types::{Batch, BatchMeta, FlushTrigger, PipelineStatus, Sample, Session, TrackingState};
use super::uploader::{Attempt, Delivery, UploadEndpoint, Uploader};

/// Messages from the controller to the owner task
#[derive(Debug)]
pub enum Command {
    /// Drain, make the final attempt and exit
    Stop,
}

/// Tunables for one session
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub capacity: usize,
    pub shed_factor: usize,
    pub flush_interval: Duration,
    pub meta: BatchMeta,
}

/// Summary returned once a session has closed
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StopReport {
    pub session_id: String,
    /// Size of the stop-trigger batch (0 if the buffer was empty)
    pub final_batch: usize,
    /// Whether the stop-trigger batch was accepted
    pub final_delivered: bool,
    /// Samples still undelivered after the final attempt; dropped with the session
    pub unsent: usize,
    pub batches_delivered: u64,
    pub samples_delivered: u64,
    pub shed_total: u64,
}

/// Owner task state for one session
pub struct SessionWorker {
    session: Session,
    meta: BatchMeta,
    flush_interval: Duration,
    buffer: SampleBuffer,
    scheduler: FlushScheduler,
    uploader: Uploader,
    journal: Option<DeliveryJournal>,
    status: Arc<watch::Sender<PipelineStatus>>,
    last_error: Option<String>,
}

impl std::fmt::Debug for SessionWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionWorker")
            .field("session_id", &self.session.session_id)
            .field("buffered", &self.buffer.len())
            .field("uploader", &self.uploader)
            .finish_non_exhaustive()
    }
}

impl SessionWorker {
    pub fn new(
        session: Session,
        settings: WorkerSettings,
        endpoint: Arc<dyn UploadEndpoint>,
        journal: Option<DeliveryJournal>,
        status: Arc<watch::Sender<PipelineStatus>>,
    ) -> Self {
        let worker = Self {
            session,
            meta: settings.meta,
            flush_interval: settings.flush_interval,
            buffer: SampleBuffer::new(settings.capacity, settings.shed_factor),
            scheduler: FlushScheduler::new(settings.capacity),
            uploader: Uploader::new(endpoint),
            journal,
            status,
            last_error: None,
        };
        worker.publish();
        worker
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Run until stopped or until the controller goes away.
    ///
    /// A closed command channel is treated like `Stop`, which gives a dropped
    /// controller the same best-effort drain.
    pub async fn run(
        mut self,
        mut samples: mpsc::UnboundedReceiver<Sample>,
        mut commands: mpsc::Receiver<Command>,
    ) -> StopReport {
        let mut ticker = interval_at(Instant::now() + self.flush_interval, self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut source_closed = false;

        info!(
            "Session {} tracking (C={}, T={:?})",
            self.session.session_id,
            self.buffer.capacity(),
            self.flush_interval
        );

        loop {
            let busy = self.uploader.is_busy();

            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(Command::Stop) => debug!("Stop requested for session {}", self.session.session_id),
                        None => warn!("Controller dropped without stop, draining session {}", self.session.session_id),
                    }
                    break;
                }
                sample = samples.recv(), if !source_closed => {
                    match sample {
                        Some(sample) => self.on_sample(sample),
                        None => {
                            debug!("Sample source closed for session {}", self.session.session_id);
                            source_closed = true;
                        }
                    }
                }
                _ = ticker.tick() => self.on_tick(),
                Some(attempt) = self.uploader.settle(), if busy => self.on_settled(attempt),
            }
        }

        self.finish(samples).await
    }

    /// Accept one sample and evaluate the size trigger
    pub fn on_sample(&mut self, sample: Sample) {
        self.append(sample);
        self.scheduler.evaluate_size(self.buffer.len());
        self.pump();
    }

    /// Time trigger fired
    pub fn on_tick(&mut self) {
        self.scheduler.on_tick();
        self.pump();
    }

    /// An upload attempt finished
    pub fn on_settled(&mut self, attempt: Attempt) {
        self.apply(attempt);
        self.pump();
    }

    fn append(&mut self, sample: Sample) {
        let shed = self.buffer.append(sample);
        if shed > 0 {
            self.report_shed(shed);
        }
    }

    fn report_shed(&mut self, shed: usize) {
        let message = format!(
            "BufferOverflowShed: dropped {} oldest samples (total {})",
            shed,
            self.buffer.shed_total()
        );
        warn!("{}", message);
        self.last_error = Some(message);
    }

    /// Start the next attempt if the uploader is free and a trigger is due.
    ///
    /// Every attempt gets a new `Batch` built from the buffer head. A retry of
    /// requeued samples is therefore rebuilt too, and may carry samples
    /// captured after the failed attempt, always behind the requeued ones.
    fn pump(&mut self) {
        if !self.uploader.is_busy() {
            if let Some((trigger, samples)) = self.scheduler.next_batch(&mut self.buffer) {
                self.dispatch(trigger, samples);
            }
        }
        self.publish();
    }

    fn dispatch(&mut self, trigger: FlushTrigger, samples: Vec<Sample>) {
        let Some(batch) = Batch::new(&self.session, samples, self.meta.clone()) else {
            return;
        };

        if let Err(batch) = self.uploader.dispatch(trigger, batch) {
            // Unreachable while pump checks is_busy; keep the samples regardless
            self.requeue(batch);
        }
    }

    fn requeue(&mut self, batch: Batch) {
        let shed = self.buffer.prepend(batch.into_samples());
        if shed > 0 {
            self.report_shed(shed);
        }
    }

    fn apply(&mut self, attempt: Attempt) -> Delivery {
        let delivery = self.uploader.complete(attempt, &mut self.buffer);

        match &delivery {
            Delivery::Delivered { .. } => {
                self.scheduler.evaluate_size(self.buffer.len());
                self.last_error = None;
            }
            Delivery::Requeued { error, shed, .. } => {
                self.last_error = Some(error.to_string());
                if *shed > 0 {
                    self.report_shed(*shed);
                }
            }
        }

        self.journal_delivery(&delivery);
        delivery
    }

    fn journal_delivery(&mut self, delivery: &Delivery) {
        let Some(journal) = self.journal.as_mut() else {
            return;
        };

        let record = match delivery {
            Delivery::Delivered { trigger, count, .. } => JournalRecord {
                at: chrono::Utc::now(),
                session_id: self.session.session_id.clone(),
                trigger: *trigger,
                samples: *count,
                outcome: Outcome::Delivered,
                error: None,
                shed: 0,
            },
            Delivery::Requeued { trigger, count, error, shed } => JournalRecord {
                at: chrono::Utc::now(),
                session_id: self.session.session_id.clone(),
                trigger: *trigger,
                samples: *count,
                outcome: if *trigger == FlushTrigger::Stop { Outcome::Unsent } else { Outcome::Requeued },
                error: Some(error.to_string()),
                shed: *shed,
            },
        };

        if let Err(e) = journal.record(&record) {
            warn!("Failed to write delivery journal: {}", e);
        }
    }

    /// Stop sequence: cut off intake, settle the outstanding attempt, then
    /// drain everything into one final attempt.
    async fn finish(mut self, mut samples: mpsc::UnboundedReceiver<Sample>) -> StopReport {
        // Anything already queued was captured before the source was detached
        samples.close();
        while let Ok(sample) = samples.try_recv() {
            self.append(sample);
        }

        self.scheduler.disarm();

        // Only the outstanding attempt's own outcome decides its samples' fate
        if let Some(attempt) = self.uploader.settle().await {
            self.apply(attempt);
        }

        let mut final_batch = 0;
        let mut final_delivered = false;

        let remaining = self.scheduler.stop(&mut self.buffer);
        if let Some(batch) = Batch::new(&self.session, remaining, self.meta.clone()) {
            final_batch = batch.len();
            info!("Final flush of {} samples for session {}", final_batch, self.session.session_id);

            match self.uploader.dispatch(FlushTrigger::Stop, batch) {
                Ok(()) => {
                    if let Some(attempt) = self.uploader.settle().await {
                        final_delivered = matches!(self.apply(attempt), Delivery::Delivered { .. });
                    }
                }
                Err(batch) => {
                    error!("Uploader still busy at final flush");
                    self.requeue(batch);
                }
            }
        }

        let unsent = self.buffer.len();
        if unsent > 0 {
            warn!(
                "Session {} closed with {} undelivered samples",
                self.session.session_id, unsent
            );
        }

        self.publish();

        let report = StopReport {
            session_id: self.session.session_id.clone(),
            final_batch,
            final_delivered,
            unsent,
            batches_delivered: self.uploader.batches_delivered(),
            samples_delivered: self.uploader.samples_delivered(),
            shed_total: self.buffer.shed_total(),
        };

        self.buffer.clear();
        info!("Session {} closed: {:?}", self.session.session_id, report);
        report
    }

    fn publish(&self) {
        self.status.send_replace(PipelineStatus {
            state: TrackingState::Tracking,
            session_id: Some(self.session.session_id.clone()),
            buffered: self.buffer.len(),
            last_flush_at: self.uploader.last_success_at(),
            last_flush_count: self.uploader.last_success_count(),
            last_error: self.last_error.clone(),
            batches_delivered: self.uploader.batches_delivered(),
            samples_delivered: self.uploader.samples_delivered(),
            shed_total: self.buffer.shed_total(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UploadError;
    use crate::telemetry::uploader::mocks::RecordingEndpoint;

    fn sample(ts: i64) -> Sample {
        Sample::new(ts, 0.0, 0.0, 9.81)
    }

    fn worker(capacity: usize, endpoint: &RecordingEndpoint) -> (SessionWorker, watch::Receiver<PipelineStatus>) {
        let (tx, rx) = watch::channel(PipelineStatus::default());
        let settings = WorkerSettings {
            capacity,
            shed_factor: 10,
            flush_interval: Duration::from_millis(5000),
            meta: BatchMeta {
                sampling_rate_hz: 50.0,
                client_tag: "test".to_string(),
            },
        };
        let worker = SessionWorker::new(
            Session::begin("device-1"),
            settings,
            Arc::new(endpoint.clone()),
            None,
            Arc::new(tx),
        );
        (worker, rx)
    }

    /// Wait for the outstanding attempt and apply it
    async fn settle(worker: &mut SessionWorker) {
        let attempt = worker.uploader.settle().await.expect("attempt in flight");
        worker.on_settled(attempt);
    }

    #[tokio::test]
    async fn test_520_samples_flush_500_then_20_on_tick() {
        let endpoint = RecordingEndpoint::new();
        let (mut worker, status) = worker(500, &endpoint);

        for ts in 1..=520 {
            worker.on_sample(sample(ts));
            if ts == 500 {
                assert!(worker.uploader.is_busy(), "Size trigger fires at the C-th sample");
            }
        }
        assert_eq!(status.borrow().buffered, 20);

        settle(&mut worker).await;
        assert_eq!(endpoint.delivered_sizes(), vec![500]);
        assert_eq!(worker.buffer.len(), 20);

        worker.on_tick();
        settle(&mut worker).await;
        assert_eq!(endpoint.delivered_sizes(), vec![500, 20]);
        assert_eq!(endpoint.delivered_timestamps(), (1..=520).collect::<Vec<_>>());

        let snapshot = status.borrow().clone();
        assert_eq!(snapshot.buffered, 0);
        assert_eq!(snapshot.last_flush_count, 20);
        assert_eq!(snapshot.samples_delivered, 520);
        assert!(snapshot.last_flush_at.is_some());
    }

    #[tokio::test]
    async fn test_tick_without_samples_sends_nothing() {
        let endpoint = RecordingEndpoint::new();
        let (mut worker, _status) = worker(500, &endpoint);

        worker.on_tick();
        assert!(!worker.uploader.is_busy());
        assert!(endpoint.attempt_sizes().is_empty());

        worker.on_sample(sample(1));
        worker.on_tick();
        settle(&mut worker).await;
        assert_eq!(endpoint.delivered_sizes(), vec![1]);
    }

    #[tokio::test]
    async fn test_single_failure_retries_in_capture_order() {
        let endpoint = RecordingEndpoint::new();
        endpoint.fail_next(1, UploadError::Network("timeout".to_string()));
        let (mut worker, status) = worker(5, &endpoint);

        for ts in 1..=5 {
            worker.on_sample(sample(ts));
        }
        // Captured while the first attempt is outstanding
        for ts in 6..=8 {
            worker.on_sample(sample(ts));
        }

        settle(&mut worker).await;
        assert_eq!(worker.buffer.len(), 8);
        assert_eq!(status.borrow().last_error.as_deref(), Some("Upload network error: timeout"));
        assert!(!worker.uploader.is_busy(), "Retry waits for the next trigger");

        worker.on_tick();
        settle(&mut worker).await;

        assert_eq!(endpoint.attempt_sizes(), vec![5, 8]);
        assert_eq!(endpoint.delivered_timestamps(), (1..=8).collect::<Vec<_>>());
        assert_eq!(status.borrow().last_error, None);
    }

    #[tokio::test]
    async fn test_failed_batch_retries_on_size_trigger_without_tick() {
        let endpoint = RecordingEndpoint::new();
        endpoint.fail_next(1, UploadError::Network("timeout".to_string()));
        let (mut worker, _status) = worker(5, &endpoint);

        for ts in 1..=5 {
            worker.on_sample(sample(ts));
        }
        settle(&mut worker).await;
        assert_eq!(worker.buffer.len(), 5, "Failed batch requeued");

        for ts in 6..=40 {
            worker.on_sample(sample(ts));
        }
        assert!(worker.uploader.is_busy(), "Retry started without waiting for a tick");
        assert_eq!(worker.buffer.len(), 35);

        settle(&mut worker).await;
        assert_eq!(endpoint.attempt_sizes(), vec![5, 5]);
        assert_eq!(endpoint.delivered_timestamps(), (1..=5).collect::<Vec<_>>());
        assert!(worker.uploader.is_busy(), "Backlog keeps leaving in C-sized batches");
        assert_eq!(worker.buffer.len(), 30);
    }

    #[tokio::test]
    async fn test_requeue_over_limit_reports_shed() {
        let endpoint = RecordingEndpoint::new();
        let (mut worker, status) = worker(2, &endpoint);

        for ts in 11..=30 {
            worker.append(sample(ts));
        }
        assert_eq!(worker.buffer.len(), 20);
        let batch = Batch::new(
            &worker.session,
            (1..=3).map(sample).collect(),
            worker.meta.clone(),
        )
        .unwrap();
        worker.requeue(batch);
        worker.publish();

        assert_eq!(worker.buffer.len(), 20);
        assert_eq!(worker.buffer.shed_total(), 3);
        let snapshot = status.borrow().clone();
        assert_eq!(snapshot.shed_total, 3);
        assert!(snapshot.last_error.unwrap().starts_with("BufferOverflowShed"));
    }

    #[tokio::test]
    async fn test_appends_continue_while_upload_outstanding() {
        let endpoint = RecordingEndpoint::new();
        let (mut worker, _status) = worker(3, &endpoint);

        for ts in 1..=10 {
            worker.on_sample(sample(ts));
        }
        assert!(worker.uploader.is_busy());
        assert_eq!(worker.buffer.len(), 7, "Intake is never blocked by an upload");

        // Pending size trigger is served as soon as the first attempt settles
        settle(&mut worker).await;
        assert!(worker.uploader.is_busy());
        assert_eq!(worker.buffer.len(), 4);

        // Size is re-evaluated after a delivery, not only on append
        settle(&mut worker).await;
        assert!(worker.uploader.is_busy());
        assert_eq!(worker.buffer.len(), 1);

        settle(&mut worker).await;
        assert_eq!(endpoint.delivered_sizes(), vec![3, 3, 3]);
        assert_eq!(endpoint.delivered_timestamps(), (1..=9).collect::<Vec<_>>());
        assert!(!worker.uploader.is_busy());
    }

    #[tokio::test]
    async fn test_run_stop_drains_once() {
        let endpoint = RecordingEndpoint::new();
        let (worker, _status) = worker(500, &endpoint);
        let (sample_tx, sample_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::channel(1);

        for ts in 1..=7 {
            sample_tx.send(sample(ts)).unwrap();
        }
        let task = tokio::spawn(worker.run(sample_rx, command_rx));
        command_tx.send(Command::Stop).await.unwrap();

        let report = task.await.unwrap();
        assert_eq!(report.final_batch, 7);
        assert!(report.final_delivered);
        assert_eq!(report.unsent, 0);
        assert_eq!(endpoint.delivered_sizes(), vec![7]);
        assert!(sample_tx.send(sample(8)).is_err(), "Intake is closed after stop");
    }

    #[tokio::test]
    async fn test_final_failure_is_reported_unsent() {
        let endpoint = RecordingEndpoint::new();
        endpoint.fail_next(1, UploadError::Rejected { status: 502, message: "bad gateway".to_string() });
        let (worker, status) = worker(500, &endpoint);
        let (sample_tx, sample_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::channel(1);

        for ts in 1..=4 {
            sample_tx.send(sample(ts)).unwrap();
        }
        drop(command_tx);

        let report = worker.run(sample_rx, command_rx).await;
        assert_eq!(report.final_batch, 4);
        assert!(!report.final_delivered);
        assert_eq!(report.unsent, 4);
        assert_eq!(endpoint.attempt_sizes(), vec![4], "Exactly one final attempt");
        assert!(status.borrow().last_error.as_deref().unwrap().contains("502"));
    }
}
