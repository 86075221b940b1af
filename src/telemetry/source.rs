//! # Sample Sources
//!
//! Producers of motion samples, consumed through a subscription.
//!
//! Subscribers hand over an unbounded channel sender so a producer is never
//! stalled by a slow consumer; backpressure is absorbed by the sample buffer.

use chrono::Utc;
use std::collections::HashMap;
use std::f64::consts::PI;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::debug;

use super::types::Sample;

/// Standard gravity in m/s²
pub const GRAVITY: f64 = 9.80665;

/// Receiving end handed to a source on subscribe
pub type SampleSink = mpsc::UnboundedSender<Sample>;

/// Token identifying one subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

/// Subscription interface of a sample producer
pub trait SampleSource: Send + Sync {
    /// Start delivering samples into `sink`
    fn subscribe(&self, sink: SampleSink) -> SubscriptionHandle;

    /// Stop delivering to the subscription; unknown handles are ignored
    fn unsubscribe(&self, handle: SubscriptionHandle);
}

fn next_handle(counter: &AtomicU64) -> SubscriptionHandle {
    SubscriptionHandle(counter.fetch_add(1, Ordering::Relaxed))
}

/// Accelerometer simulator.
///
/// Produces gravity on the z axis plus a small resting tremor on x and y at the
/// configured nominal rate. Stands in for a hardware driver. Must be subscribed
/// from within a tokio runtime.
pub struct SimulatedSource {
    rate_hz: f64,
    tremor_hz: f64,
    amplitude: f64,
    next_id: AtomicU64,
    tasks: Mutex<HashMap<SubscriptionHandle, JoinHandle<()>>>,
}

impl std::fmt::Debug for SimulatedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedSource")
            .field("rate_hz", &self.rate_hz)
            .field("tremor_hz", &self.tremor_hz)
            .finish_non_exhaustive()
    }
}

impl SimulatedSource {
    /// Creates a simulator emitting at `rate_hz` with a 5 Hz, 0.3 m/s² tremor
    pub fn new(rate_hz: f64) -> Self {
        Self::with_tremor(rate_hz, 5.0, 0.3)
    }

    pub fn with_tremor(rate_hz: f64, tremor_hz: f64, amplitude: f64) -> Self {
        Self {
            rate_hz,
            tremor_hz,
            amplitude,
            next_id: AtomicU64::new(1),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Nominal period between samples
    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.rate_hz)
    }

    /// Sample number `n` of a run, stamped with `timestamp`
    pub fn sample_at(&self, n: u64, timestamp: i64) -> Sample {
        let t = n as f64 / self.rate_hz;
        let phase = 2.0 * PI * self.tremor_hz * t;
        Sample::new(
            timestamp,
            self.amplitude * phase.sin(),
            0.5 * self.amplitude * phase.cos(),
            GRAVITY,
        )
    }
}

impl SampleSource for SimulatedSource {
    fn subscribe(&self, sink: SampleSink) -> SubscriptionHandle {
        let handle = next_handle(&self.next_id);
        let period = self.period();
        let generator = SimulatedSource::with_tremor(self.rate_hz, self.tremor_hz, self.amplitude);

        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut n: u64 = 0;

            loop {
                ticker.tick().await;
                let sample = generator.sample_at(n, Utc::now().timestamp_millis());
                if sink.send(sample).is_err() {
                    debug!("Sample sink closed, simulator stopping");
                    break;
                }
                n += 1;
            }
        });

        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.insert(handle, task);
        }
        handle
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) {
        let task = self.tasks.lock().ok().and_then(|mut tasks| tasks.remove(&handle));
        if let Some(task) = task {
            task.abort();
        }
    }
}

impl Drop for SimulatedSource {
    fn drop(&mut self) {
        if let Ok(tasks) = self.tasks.get_mut() {
            for (_, task) in tasks.drain() {
                task.abort();
            }
        }
    }
}

/// Caller-driven source: samples are pushed with [`ManualSource::emit`]
#[derive(Debug, Default)]
pub struct ManualSource {
    next_id: AtomicU64,
    sinks: Mutex<HashMap<SubscriptionHandle, SampleSink>>,
}

impl ManualSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `sample` to every live subscription.
    ///
    /// # Returns
    ///
    /// * `usize` - Number of subscribers that accepted the sample
    pub fn emit(&self, sample: Sample) -> usize {
        match self.sinks.lock() {
            Ok(sinks) => sinks.values().filter(|sink| sink.send(sample).is_ok()).count(),
            Err(_) => 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sinks.lock().map(|sinks| sinks.len()).unwrap_or(0)
    }
}

impl SampleSource for ManualSource {
    fn subscribe(&self, sink: SampleSink) -> SubscriptionHandle {
        let handle = next_handle(&self.next_id);
        if let Ok(mut sinks) = self.sinks.lock() {
            sinks.insert(handle, sink);
        }
        handle
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) {
        if let Ok(mut sinks) = self.sinks.lock() {
            sinks.remove(&handle);
        }
    }
}
