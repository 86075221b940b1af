//! # Telemetry Module
//!
//! Buffers motion samples and uploads them to the collector in batches.
//!
//! This module handles:
//! - Receiving samples from a `SampleSource` subscription
//! - Buffering them in capture order, shedding the oldest under sustained failure
//! - Deciding when to flush (size, interval, stop)
//! - Uploading one batch at a time and requeueing on failure
//! - Resolving a stable device identifier
//! - Optionally journaling delivery outcomes to rotating JSONL files

pub mod buffer;
pub mod identity;
pub mod journal;
pub mod scheduler;
pub mod session;
pub mod source;
pub mod types;
pub mod uploader;
pub mod worker;

pub use identity::{FileIdentityStore, IdentityProvider, MemoryIdentityStore};
pub use session::{PipelineSettings, SessionController};
pub use source::{SampleSource, SimulatedSource};
pub use types::{Batch, FlushTrigger, PipelineStatus, Sample, Session, TrackingState};
pub use uploader::{HttpEndpoint, UploadEndpoint};
pub use worker::StopReport;
