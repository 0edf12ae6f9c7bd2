//! Job queue client for the asynchronous generation backend.
//!
//! The backend only exposes a job queue: a prompt is submitted, a job handle
//! comes back, and the caller polls until the job completes or fails. This
//! module provides:
//! - The [`GenerationBackend`] seam and its HTTP implementation
//! - The [`RequestTracker`], an in-memory registry of submitted jobs
//! - The [`JobQueueClient`] with single, batched and blocking polling

mod backend;
mod client;
mod tracker;
mod types;

pub use backend::{GenerationBackend, HttpBackend, HttpBackendConfig};
pub use client::{JobQueueClient, QueueClientConfig};
pub use tracker::RequestTracker;
pub use types::{
    GenerationJob, GenerationOutput, GenerationRequest, JobStatus, PollBudget, StatusReport,
};
