//! Multi-step generation pipelines.
//!
//! This module provides:
//! - Fixed step definitions per pipeline variant
//! - Prompt rendering and output parsing
//! - The execution engine with its retry scopes
//! - Result sinks and the run manager

pub mod definition;
pub mod engine;
pub mod manager;
pub mod parser;
pub mod prompts;
pub mod retry;
pub mod segments;
pub mod sink;
pub mod steps;

pub use definition::{
    EngineConfig, PipelineDefinition, PipelineOptions, PipelineVariant, StepConfig,
    ValidationLimits,
};
pub use engine::{
    AbortReason, BatchSummary, EnrichmentRecord, ItemOutcome, ItemState, PipelineEngine,
    ScriptResult, WorkItem,
};
pub use manager::{PipelineManager, PipelineStats, RunState, RunStatus};
pub use parser::{OutputFormat, PostProcess};
pub use prompts::{PromptTemplate, PromptTemplates, PromptVars};
pub use retry::RetryBackoff;
pub use sink::{FileResultSink, MemoryResultSink, ResultSink, SavedResult};
pub use steps::{JobRecord, PipelineAttempt, StepRunner};
