//! # Telemetry Types
//!
//! Data carried through the pipeline: samples, batches, sessions and the
//! observable status snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One accelerometer reading.
///
/// Capture order is authoritative; `timestamp` may be coarse or jittery.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub ax: f64,
    pub ay: f64,
    pub az: f64,
}

impl Sample {
    pub fn new(timestamp: i64, ax: f64, ay: f64, az: f64) -> Self {
        Self { timestamp, ax, ay, az }
    }
}

/// Metadata attached to every batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchMeta {
    pub sampling_rate_hz: f64,
    pub client_tag: String,
}

/// An ordered group of samples sent in one upload attempt.
///
/// Fields are private so a batch cannot be mutated after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    device_id: String,
    session_id: String,
    samples: Vec<Sample>,
    meta: BatchMeta,
}

impl Batch {
    /// Build a batch for one delivery attempt
    ///
    /// # Returns
    ///
    /// * `Option<Batch>` - `None` when `samples` is empty
    pub fn new(session: &Session, samples: Vec<Sample>, meta: BatchMeta) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }

        Some(Self {
            device_id: session.device_id.clone(),
            session_id: session.session_id.clone(),
            samples,
            meta,
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn meta(&self) -> &BatchMeta {
        &self.meta
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Give the samples back, e.g. to requeue them after a failed attempt
    pub fn into_samples(self) -> Vec<Sample> {
        self.samples
    }
}

/// Success body returned by the collector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub inserted: u64,
    pub session_id: String,
}

/// One continuous tracking run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub device_id: String,
}

impl Session {
    /// Open a session with a freshly minted identifier
    pub fn begin(device_id: impl Into<String>) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            device_id: device_id.into(),
        }
    }
}

/// Why a flush was started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushTrigger {
    /// Buffer reached capacity `C`
    Size,
    /// Periodic interval `T` elapsed
    Time,
    /// Session is stopping
    Stop,
}

/// Session controller state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackingState {
    #[default]
    Idle,
    Tracking,
}

/// Read-only snapshot for presentation layers.
///
/// Only the session owner task writes it.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineStatus {
    pub state: TrackingState,
    pub session_id: Option<String>,
    pub buffered: usize,
    pub last_flush_at: Option<DateTime<Utc>>,
    pub last_flush_count: usize,
    pub last_error: Option<String>,
    pub batches_delivered: u64,
    pub samples_delivered: u64,
    pub shed_total: u64,
}
