//! # Sample Buffer
//!
//! Ordered holding area for samples awaiting delivery.
//!
//! ## Capacity
//!
//! The capacity `C` is a soft bound: `append` never rejects, it only lets the
//! flush scheduler know a size-triggered flush is due. A separate hard limit of
//! `shed_factor * C` caps growth while uploads keep failing. Past the hard limit
//! the oldest samples are shed and counted.
//!
//! ## Usage
//!
//! ```
//! use motion_uplink::telemetry::buffer::SampleBuffer;
//! use motion_uplink::telemetry::types::Sample;
//!
//! let mut buffer = SampleBuffer::new(2, 10);
//! buffer.append(Sample::new(1, 0.0, 0.0, 9.81));
//! buffer.append(Sample::new(2, 0.0, 0.0, 9.81));
//! assert!(buffer.is_full());
//!
//! let head = buffer.drain_up_to(1);
//! assert_eq!(head[0].timestamp, 1);
//! buffer.prepend(head);
//! assert_eq!(buffer.drain_all().len(), 2);
//! ```

use std::collections::VecDeque;

use super::types::Sample;

/// FIFO sample buffer with a soft capacity and an explicit shed limit.
#[derive(Debug)]
pub struct SampleBuffer {
    samples: VecDeque<Sample>,
    capacity: usize,
    shed_limit: usize,
    shed_total: u64,
}

impl SampleBuffer {
    /// Creates an empty buffer.
    ///
    /// # Arguments
    ///
    /// * `capacity` - Size-trigger threshold `C` (at least 1)
    /// * `shed_factor` - Hard limit multiplier; the buffer never holds more than
    ///   `shed_factor * capacity` samples (factor is at least 1)
    #[must_use]
    pub fn new(capacity: usize, shed_factor: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            shed_limit: capacity.saturating_mul(shed_factor.max(1)),
            shed_total: 0,
        }
    }

    /// Adds a sample at the tail.
    ///
    /// # Returns
    ///
    /// * `usize` - Number of oldest samples shed to stay within the hard limit
    pub fn append(&mut self, sample: Sample) -> usize {
        self.samples.push_back(sample);
        self.shed_excess()
    }

    /// Removes and returns the whole buffer, oldest first
    pub fn drain_all(&mut self) -> Vec<Sample> {
        self.samples.drain(..).collect()
    }

    /// Removes and returns at most `n` samples from the head
    pub fn drain_up_to(&mut self, n: usize) -> Vec<Sample> {
        let n = n.min(self.samples.len());
        self.samples.drain(..n).collect()
    }

    /// Reinserts a previously drained sequence ahead of everything buffered since.
    ///
    /// # Returns
    ///
    /// * `usize` - Number of oldest samples shed to stay within the hard limit
    pub fn prepend(&mut self, samples: Vec<Sample>) -> usize {
        for sample in samples.into_iter().rev() {
            self.samples.push_front(sample);
        }
        self.shed_excess()
    }

    fn shed_excess(&mut self) -> usize {
        let excess = self.samples.len().saturating_sub(self.shed_limit);
        if excess > 0 {
            self.samples.drain(..excess);
            self.shed_total += excess as u64;
        }
        excess
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// True once the size trigger threshold has been reached
    pub fn is_full(&self) -> bool {
        self.samples.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn shed_limit(&self) -> usize {
        self.shed_limit
    }

    /// Samples discarded by the shed policy since the last `clear`
    pub fn shed_total(&self) -> u64 {
        self.shed_total
    }

    /// Empties the buffer and resets the shed counter
    pub fn clear(&mut self) {
        self.samples.clear();
        self.shed_total = 0;
    }
}
