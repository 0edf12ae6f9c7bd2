//! Job and status types shared by the queue client and the tracker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Job is queued on the backend.
    Pending,
    /// Job is being processed by the backend.
    Processing,
    /// Job completed successfully.
    Completed,
    /// Job failed.
    Failed,
}

impl JobStatus {
    /// Map a backend status string onto a job status.
    ///
    /// Unknown strings are treated as still queued.
    pub fn from_backend(status: &str) -> Self {
        match status {
            "IN_PROGRESS" => Self::Processing,
            "COMPLETED" => Self::Completed,
            "FAILED" | "ERROR" => Self::Failed,
            _ => Self::Pending,
        }
    }

    /// Whether the job can no longer change state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single generation request sent to the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Pipeline step this request implements. Not sent to the backend.
    #[serde(skip)]
    pub step: String,
    /// Model identifier.
    pub model: String,
    /// User prompt.
    pub prompt: String,
    /// Optional system prompt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Sampling temperature.
    pub temperature: f32,
}

impl GenerationRequest {
    pub fn new(
        step: impl Into<String>,
        model: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            step: step.into(),
            model: model.into(),
            prompt: prompt.into(),
            system_prompt: None,
            temperature: 0.7,
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: Option<String>) -> Self {
        self.system_prompt = system_prompt;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

/// Output payload of a completed job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationOutput {
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl GenerationOutput {
    pub fn new(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            reasoning: None,
        }
    }
}

/// Status of a job as reported by one poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: JobStatus,
    /// Log lines the backend produced since submission.
    #[serde(default)]
    pub logs: Vec<String>,
    /// Failure reason when `status` is `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<u32>,
}

impl StatusReport {
    pub fn new(status: JobStatus) -> Self {
        Self {
            status,
            logs: Vec::new(),
            error: None,
            queue_position: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(JobStatus::Failed)
        }
    }
}

/// One tracked asynchronous unit of backend work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationJob {
    /// Handle assigned by the backend.
    pub job_id: String,
    /// Logical pipeline step.
    pub step_name: String,
    /// Work item the job belongs to.
    pub work_item_id: String,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
    /// Last time the status changed.
    pub updated_at: DateTime<Utc>,
    pub result: Option<GenerationOutput>,
    pub error: Option<String>,
    /// Number of backend log lines seen so far.
    #[serde(default)]
    pub log_lines: usize,
}

impl GenerationJob {
    pub fn new(
        job_id: impl Into<String>,
        step_name: impl Into<String>,
        work_item_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.into(),
            step_name: step_name.into(),
            work_item_id: work_item_id.into(),
            status: JobStatus::Pending,
            submitted_at: now,
            updated_at: now,
            result: None,
            error: None,
            log_lines: 0,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        !self.status.is_terminal()
    }
}

/// Attempt/interval budget for polling a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollBudget {
    /// Maximum number of status checks.
    pub max_attempts: u32,
    /// Delay between status checks in milliseconds.
    pub interval_ms: u64,
}

impl PollBudget {
    pub const fn new(max_attempts: u32, interval_ms: u64) -> Self {
        Self {
            max_attempts,
            interval_ms,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Upper bound of the wall-clock time spent sleeping.
    pub fn total(&self) -> Duration {
        self.interval() * self.max_attempts
    }
}

impl Default for PollBudget {
    fn default() -> Self {
        // 5 minutes at a 2 second cadence
        Self::new(150, 2000)
    }
}
