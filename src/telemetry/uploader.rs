//! # Uploader
//!
//! Ships batches to the remote collector, one attempt at a time.
//!
//! This module handles:
//! - The `UploadEndpoint` seam (HTTP in production, mocks in tests)
//! - Running each attempt as its own task so sample intake never waits on I/O
//! - Requeueing a failed batch at the buffer head, in its original order
//! - Delivery bookkeeping for the status surface

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::buffer::SampleBuffer;
use super::types::{Batch, FlushTrigger, UploadReceipt};
use crate::error::{Result, UploadError, UplinkError};

/// Collector route accepting one JSON batch
pub const BATCH_PATH: &str = "/api/imu/batch";

/// Trait for the remote write operation
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UploadEndpoint: Send + Sync {
    /// Deliver one batch
    async fn send(&self, batch: &Batch) -> std::result::Result<UploadReceipt, UploadError>;
}

/// JSON-over-HTTP collector endpoint
#[derive(Debug, Clone)]
pub struct HttpEndpoint {
    client: Client,
    url: String,
}

impl HttpEndpoint {
    /// Create an endpoint for the collector at `base_url`
    ///
    /// # Arguments
    ///
    /// * `base_url` - Collector origin, e.g. `https://collector.example.org`
    /// * `timeout` - Whole-request timeout; expiry counts as a network error
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be constructed
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use motion_uplink::telemetry::uploader::HttpEndpoint;
    /// use std::time::Duration;
    ///
    /// let endpoint = HttpEndpoint::new("http://localhost:8000", Duration::from_secs(10))?;
    /// assert_eq!(endpoint.url(), "http://localhost:8000/api/imu/batch");
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| UplinkError::Upload(UploadError::Network(format!("Failed to create HTTP client: {}", e))))?;

        Ok(Self {
            client,
            url: format!("{}{}", base_url.trim_end_matches('/'), BATCH_PATH),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl UploadEndpoint for HttpEndpoint {
    async fn send(&self, batch: &Batch) -> std::result::Result<UploadReceipt, UploadError> {
        let response = self
            .client
            .post(&self.url)
            .json(batch)
            .send()
            .await
            .map_err(|e| UploadError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UploadError::Rejected {
                status: status.as_u16(),
                message: rejection_message(&body, status.canonical_reason()),
            });
        }

        response
            .json::<UploadReceipt>()
            .await
            .map_err(|e| UploadError::Network(format!("Invalid receipt: {}", e)))
    }
}

/// Pull a readable message out of an error body (`{"detail": ...}` or raw text)
fn rejection_message(body: &str, reason: Option<&str>) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        for key in ["detail", "message", "error"] {
            if let Some(text) = value.get(key).and_then(|v| v.as_str()) {
                return text.to_string();
            }
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        reason.unwrap_or("no response body").to_string()
    } else {
        trimmed.to_string()
    }
}

/// Result of one finished attempt, before bookkeeping
#[derive(Debug)]
pub struct Attempt {
    pub trigger: FlushTrigger,
    pub batch: Batch,
    pub result: std::result::Result<UploadReceipt, UploadError>,
}

/// What happened to an attempt's samples
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// Collector accepted the batch; samples are gone for good
    Delivered {
        trigger: FlushTrigger,
        count: usize,
        receipt: UploadReceipt,
    },
    /// Attempt failed; samples went back to the buffer head
    Requeued {
        trigger: FlushTrigger,
        count: usize,
        error: UploadError,
        /// Samples lost to the shed policy while requeueing
        shed: usize,
    },
}

struct InFlight {
    trigger: FlushTrigger,
    batch: Arc<Batch>,
    handle: JoinHandle<std::result::Result<UploadReceipt, UploadError>>,
}

/// Single-flight uploader for one session
pub struct Uploader {
    endpoint: Arc<dyn UploadEndpoint>,
    in_flight: Option<InFlight>,
    last_success_at: Option<DateTime<Utc>>,
    last_success_count: usize,
    batches_delivered: u64,
    samples_delivered: u64,
}

impl std::fmt::Debug for Uploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Uploader")
            .field("busy", &self.is_busy())
            .field("batches_delivered", &self.batches_delivered)
            .field("samples_delivered", &self.samples_delivered)
            .finish_non_exhaustive()
    }
}

impl Uploader {
    pub fn new(endpoint: Arc<dyn UploadEndpoint>) -> Self {
        Self {
            endpoint,
            in_flight: None,
            last_success_at: None,
            last_success_count: 0,
            batches_delivered: 0,
            samples_delivered: 0,
        }
    }

    /// True while an attempt is outstanding
    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Start sending `batch` in the background.
    ///
    /// # Returns
    ///
    /// * `Err(batch)` - An attempt is already outstanding; nothing was sent
    pub fn dispatch(&mut self, trigger: FlushTrigger, batch: Batch) -> std::result::Result<(), Batch> {
        if self.in_flight.is_some() {
            return Err(batch);
        }

        debug!(
            "Dispatching {:?} batch of {} samples for session {}",
            trigger,
            batch.len(),
            batch.session_id()
        );

        let batch = Arc::new(batch);
        let endpoint = Arc::clone(&self.endpoint);
        let task_batch = Arc::clone(&batch);
        let handle = tokio::spawn(async move { endpoint.send(&task_batch).await });

        self.in_flight = Some(InFlight { trigger, batch, handle });
        Ok(())
    }

    /// Wait for the outstanding attempt.
    ///
    /// Cancel safe: dropping the future leaves the attempt outstanding.
    /// Resolves to `None` when nothing is in flight.
    pub async fn settle(&mut self) -> Option<Attempt> {
        let joined = match self.in_flight.as_mut() {
            Some(in_flight) => (&mut in_flight.handle).await,
            None => return None,
        };

        let InFlight { trigger, batch, .. } = self.in_flight.take()?;
        let batch = Arc::try_unwrap(batch).unwrap_or_else(|shared| (*shared).clone());
        let result = joined.unwrap_or_else(|e| Err(UploadError::Network(format!("Upload task failed: {}", e))));

        Some(Attempt { trigger, batch, result })
    }

    /// Apply an attempt's outcome.
    ///
    /// Success records delivery bookkeeping. Failure prepends the batch's
    /// samples to `buffer` so capture order survives the retry.
    pub fn complete(&mut self, attempt: Attempt, buffer: &mut SampleBuffer) -> Delivery {
        let Attempt { trigger, batch, result } = attempt;
        let count = batch.len();

        match result {
            Ok(receipt) => {
                self.last_success_at = Some(Utc::now());
                self.last_success_count = count;
                self.batches_delivered += 1;
                self.samples_delivered += count as u64;

                if receipt.inserted != count as u64 {
                    warn!(
                        "Collector inserted {} of {} samples for session {}",
                        receipt.inserted,
                        count,
                        batch.session_id()
                    );
                }
                info!("Delivered {:?} batch of {} samples", trigger, count);

                Delivery::Delivered { trigger, count, receipt }
            }
            Err(error) => {
                warn!("Upload of {} samples failed, requeueing: {}", count, error);
                let shed = buffer.prepend(batch.into_samples());
                Delivery::Requeued { trigger, count, error, shed }
            }
        }
    }

    pub fn last_success_at(&self) -> Option<DateTime<Utc>> {
        self.last_success_at
    }

    pub fn last_success_count(&self) -> usize {
        self.last_success_count
    }

    pub fn batches_delivered(&self) -> u64 {
        self.batches_delivered
    }

    pub fn samples_delivered(&self) -> u64 {
        self.samples_delivered
    }
}
