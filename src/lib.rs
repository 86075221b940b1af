//! # Motion Uplink Library
//!
//! Capture accelerometer samples on a device and deliver them to a remote
//! collector in batches.
//!
//! Samples are buffered per tracking session and flushed when the buffer
//! fills, on a fixed interval, and once more when the session stops. At most
//! one upload is outstanding at a time; failed batches go back to the head of
//! the buffer and are retried by the next flush.

pub mod config;
pub mod error;
pub mod telemetry;
