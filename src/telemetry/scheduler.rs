//! # Flush Scheduler
//!
//! Decides when buffered samples are handed to the uploader.
//!
//! Three triggers share one delivery path:
//! - **Size**: buffer reached `C`; drains exactly `C` oldest samples
//! - **Time**: every interval `T`; drains the whole buffer
//! - **Stop**: once, on session stop; drains the whole buffer
//!
//! Triggers are queued and served one at a time, in the order they fired.
//! A size trigger and a time trigger are never merged. Samples are taken from
//! the buffer when a trigger is *served*, not when it fires, so a batch
//! requeued after a failure is picked up from the head by the next trigger of
//! either kind.
//!
//! The scheduler holds no timer of its own. The session owner feeds it
//! `on_tick` from whatever clock it runs on.

use std::collections::VecDeque;

use super::buffer::SampleBuffer;
use super::types::{FlushTrigger, Sample};

/// Pending-trigger queue for one session
#[derive(Debug)]
pub struct FlushScheduler {
    capacity: usize,
    pending: VecDeque<FlushTrigger>,
}

impl FlushScheduler {
    /// Creates a scheduler with size threshold `capacity`
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            pending: VecDeque::new(),
        }
    }

    /// Evaluate the size trigger against the current buffer length.
    ///
    /// # Returns
    ///
    /// * `bool` - true if a size trigger was queued
    pub fn evaluate_size(&mut self, buffered: usize) -> bool {
        if buffered < self.capacity {
            return false;
        }
        self.enqueue_once(FlushTrigger::Size)
    }

    /// Time trigger fired
    pub fn on_tick(&mut self) -> bool {
        self.enqueue_once(FlushTrigger::Time)
    }

    fn enqueue_once(&mut self, trigger: FlushTrigger) -> bool {
        if self.pending.contains(&trigger) {
            return false;
        }
        self.pending.push_back(trigger);
        true
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending(&self) -> impl Iterator<Item = &FlushTrigger> {
        self.pending.iter()
    }

    /// Serve queued triggers until one produces samples.
    ///
    /// Triggers that find nothing to drain are consumed without producing a
    /// batch.
    ///
    /// # Returns
    ///
    /// * `Option<(FlushTrigger, Vec<Sample>)>` - Trigger and the drained samples
    pub fn next_batch(&mut self, buffer: &mut SampleBuffer) -> Option<(FlushTrigger, Vec<Sample>)> {
        while let Some(trigger) = self.pending.pop_front() {
            let samples = Self::drain_for(trigger, self.capacity, buffer);
            if !samples.is_empty() {
                return Some((trigger, samples));
            }
        }
        None
    }

    /// Drain the whole buffer for the final flush, discarding queued triggers
    pub fn stop(&mut self, buffer: &mut SampleBuffer) -> Vec<Sample> {
        self.disarm();
        Self::drain_for(FlushTrigger::Stop, self.capacity, buffer)
    }

    /// Drop all queued triggers
    pub fn disarm(&mut self) {
        self.pending.clear();
    }

    fn drain_for(trigger: FlushTrigger, capacity: usize, buffer: &mut SampleBuffer) -> Vec<Sample> {
        match trigger {
            FlushTrigger::Size => buffer.drain_up_to(capacity),
            FlushTrigger::Time | FlushTrigger::Stop => buffer.drain_all(),
        }
    }
}
