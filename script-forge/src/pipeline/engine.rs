//! Pipeline execution engine.
//!
//! Each work item runs through an explicit state machine:
//!
//! ```text
//! Running(n) ──ok──────────────► Done
//!     │
//!     └─abort─► Retrying(n) ──backoff──► Running(n+1)
//!                   │
//!                   └─ n == max_attempts ─► Aborted
//! ```
//!
//! Inside an attempt there are three retry scopes, each with its own bound:
//! - the attempt itself (any step failure aborts it, the item is retried)
//! - the shortening loop of the validation gate
//! - the per-artifact retry of a grouped enrichment, which skips only that
//!   group when exhausted

use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::definition::{
    EngineConfig, EnrichmentSteps, PipelineDefinition, PipelineOptions, PipelineVariant,
    StepConfig,
};
use super::parser::numbered;
use super::prompts::{PromptTemplates, PromptVars};
use super::segments::{Segment, segment};
use super::sink::{ResultSink, SavedResult};
use super::steps::{JobRecord, PendingStep, PipelineAttempt, StepRunner};
use crate::Error;
use crate::hub::RunReporter;
use crate::queue::{JobQueueClient, JobStatus, PollBudget};

/// One unit of user input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Song or topic name.
    pub topic: String,
    /// Lyric lines, one scene each.
    pub lines: Vec<String>,
}

impl WorkItem {
    pub fn new(topic: impl Into<String>, lines: Vec<String>) -> Self {
        Self {
            topic: topic.into(),
            lines,
        }
    }
}

/// Secondary artifacts generated for one group of primary records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentRecord {
    pub group: usize,
    /// First and one-past-last primary record covered by the group.
    pub start: usize,
    pub end: usize,
    pub image_prompt: String,
    pub video_prompt: String,
}

/// Finished result of one work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptResult {
    pub work_item_id: String,
    pub topic: String,
    pub variant: PipelineVariant,
    /// Attempt that produced this result.
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_prompts: Option<Vec<String>>,
    pub video_prompts: Vec<String>,
    pub titles: Vec<String>,
    pub hashtags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<Value>,
    pub enrichment: Vec<EnrichmentRecord>,
    /// Enrichment groups that exhausted their retries.
    pub skipped_groups: Vec<usize>,
    pub jobs: Vec<JobRecord>,
    pub generated_at: DateTime<Utc>,
}

/// Why an attempt was abandoned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AbortReason {
    /// A step failed to produce usable output.
    StepFailed { step: String, error: String },
    /// A step did not reach a terminal status within its budget.
    Timeout { step: String },
    /// A field stayed over its limit after every shortening sub-attempt.
    ValidationExhausted {
        field: String,
        limit: usize,
        actual: usize,
    },
    /// Per-scene artifacts disagree in count.
    SceneCountMismatch { expected: usize, actual: usize },
    /// Fewer segment outputs than segments.
    SegmentCountMismatch { expected: usize, actual: usize },
    /// The result could not be persisted.
    SinkFailed { error: String },
}

impl AbortReason {
    /// Convert a step error into an abort reason.
    pub fn from_step_error(step: &str, error: Error) -> Self {
        match error {
            Error::Timeout(_) => Self::Timeout {
                step: step.to_string(),
            },
            Error::Validation {
                field,
                limit,
                actual,
            } => Self::ValidationExhausted {
                field,
                limit,
                actual,
            },
            Error::Consistency { expected, actual } => {
                Self::SceneCountMismatch { expected, actual }
            }
            other => Self::StepFailed {
                step: step.to_string(),
                error: other.to_string(),
            },
        }
    }
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StepFailed { step, error } => write!(f, "{} failed: {}", step, error),
            Self::Timeout { step } => write!(f, "{} timed out", step),
            Self::ValidationExhausted {
                field,
                limit,
                actual,
            } => write!(
                f,
                "{} still {} chars after shortening (limit {})",
                field, actual, limit
            ),
            Self::SceneCountMismatch { expected, actual } => write!(
                f,
                "scene count mismatch: expected {}, got {}",
                expected, actual
            ),
            Self::SegmentCountMismatch { expected, actual } => write!(
                f,
                "segment count mismatch: expected {}, got {}",
                expected, actual
            ),
            Self::SinkFailed { error } => write!(f, "saving result failed: {}", error),
        }
    }
}

/// State of one work item.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemState {
    Running { attempt: u32 },
    Retrying { attempt: u32, reason: AbortReason },
    /// Permanently skipped after the last attempt.
    Aborted { attempts: u32, reason: AbortReason },
    Done { attempt: u32, saved: SavedResult },
}

/// Where inside an attempt the engine currently is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptStage {
    RunningStep(String),
    Validating(String),
    Enriching(usize),
    Saving,
}

impl std::fmt::Display for AttemptStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RunningStep(step) => write!(f, "running {}", step),
            Self::Validating(field) => write!(f, "validating {}", field),
            Self::Enriching(group) => write!(f, "enriching group {}", group + 1),
            Self::Saving => write!(f, "saving"),
        }
    }
}

/// Final outcome of one work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ItemOutcome {
    Completed {
        index: usize,
        topic: String,
        attempts: u32,
        saved: SavedResult,
    },
    Skipped {
        index: usize,
        topic: String,
        attempts: u32,
        reason: AbortReason,
    },
}

impl ItemOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Summary of one batch run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub request_id: String,
    pub total: usize,
    pub completed: usize,
    pub skipped: usize,
    pub saved: Vec<SavedResult>,
    /// Per-item outcomes ordered by item index.
    pub items: Vec<ItemOutcome>,
}

impl BatchSummary {
    fn from_outcomes(request_id: &str, mut items: Vec<ItemOutcome>) -> Self {
        items.sort_by_key(|outcome| match outcome {
            ItemOutcome::Completed { index, .. } | ItemOutcome::Skipped { index, .. } => *index,
        });
        let saved: Vec<SavedResult> = items
            .iter()
            .filter_map(|outcome| match outcome {
                ItemOutcome::Completed { saved, .. } => Some(saved.clone()),
                ItemOutcome::Skipped { .. } => None,
            })
            .collect();
        Self {
            request_id: request_id.to_string(),
            total: items.len(),
            completed: saved.len(),
            skipped: items.len() - saved.len(),
            saved,
            items,
        }
    }

    /// Human-readable completion message.
    pub fn message(&self) -> String {
        format!(
            "Pipeline finished: {}/{} item(s) completed, {} skipped",
            self.completed, self.total, self.skipped
        )
    }
}

/// Per-attempt working state.
struct AttemptContext<'a> {
    reporter: &'a RunReporter,
    item: &'a WorkItem,
    attempt: PipelineAttempt,
    stage: AttemptStage,
}

impl AttemptContext<'_> {
    fn log(&self, message: impl AsRef<str>) {
        self.reporter
            .log(format!("[{}] {}", self.item.topic, message.as_ref()));
    }

    fn enter(&mut self, stage: AttemptStage) {
        debug!(
            work_item_id = %self.attempt.work_item_id,
            attempt = self.attempt.attempt_number,
            stage = %stage,
            "Attempt stage"
        );
        self.stage = stage;
    }

    fn base_vars(&self) -> PromptVars {
        PromptVars::new()
            .set("topic", self.item.topic.clone())
            .set("lyrics", numbered(&self.item.lines))
    }
}

/// Runs fixed step pipelines over batches of work items.
pub struct PipelineEngine {
    runner: StepRunner,
    sink: Arc<dyn ResultSink>,
    config: EngineConfig,
}

impl PipelineEngine {
    pub fn new(
        client: Arc<JobQueueClient>,
        templates: Arc<PromptTemplates>,
        sink: Arc<dyn ResultSink>,
        config: EngineConfig,
    ) -> Self {
        Self {
            runner: StepRunner::new(client, templates),
            sink,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn client(&self) -> &Arc<JobQueueClient> {
        self.runner.client()
    }

    /// Process a batch. A failing item never affects the others.
    pub async fn run_batch(
        &self,
        reporter: &RunReporter,
        items: Vec<WorkItem>,
        options: &PipelineOptions,
    ) -> BatchSummary {
        let definition = PipelineDefinition::from_options(options);
        let concurrency = self.config.item_concurrency.max(1);
        reporter.log(format!(
            "Starting {} pipeline for {} item(s)",
            definition.variant,
            items.len()
        ));

        let definition = &definition;
        let outcomes: Vec<ItemOutcome> = futures::stream::iter(items.into_iter().enumerate())
            .map(|(index, item)| async move {
                self.run_item(reporter, definition, index, &item).await
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let summary = BatchSummary::from_outcomes(reporter.request_id(), outcomes);
        reporter.log(format!(
            "Batch finished: {} completed, {} skipped",
            summary.completed, summary.skipped
        ));
        info!(
            request_id = %summary.request_id,
            total = summary.total,
            completed = summary.completed,
            skipped = summary.skipped,
            "Batch finished"
        );
        summary
    }

    /// Drive one work item to `Done` or `Aborted`.
    pub async fn run_item(
        &self,
        reporter: &RunReporter,
        definition: &PipelineDefinition,
        index: usize,
        item: &WorkItem,
    ) -> ItemOutcome {
        let work_item_id = format!("{}:{}", reporter.request_id(), index);
        let max_attempts = self.config.max_attempts.max(1);
        let mut state = ItemState::Running { attempt: 1 };

        loop {
            state = match state {
                ItemState::Running { attempt } => {
                    reporter.log(format!(
                        "[{}] Attempt {}/{} started",
                        item.topic, attempt, max_attempts
                    ));
                    let ctx = AttemptContext {
                        reporter,
                        item,
                        attempt: PipelineAttempt::new(attempt, &work_item_id),
                        stage: AttemptStage::RunningStep(String::new()),
                    };
                    match self.run_attempt(ctx, definition).await {
                        Ok(saved) => ItemState::Done { attempt, saved },
                        Err(reason) if attempt >= max_attempts => ItemState::Aborted {
                            attempts: attempt,
                            reason,
                        },
                        Err(reason) => ItemState::Retrying { attempt, reason },
                    }
                }
                ItemState::Retrying { attempt, reason } => {
                    let delay = self.config.backoff.delay_after(attempt);
                    reporter.log(format!(
                        "[{}] Attempt {}/{} aborted ({}); retrying item",
                        item.topic, attempt, max_attempts, reason
                    ));
                    warn!(
                        work_item_id = %work_item_id,
                        attempt,
                        reason = %reason,
                        delay_ms = delay.as_millis() as u64,
                        "Attempt aborted"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    ItemState::Running {
                        attempt: attempt + 1,
                    }
                }
                ItemState::Aborted { attempts, reason } => {
                    reporter.log(format!(
                        "[{}] Item skipped after {} attempt(s): {}",
                        item.topic, attempts, reason
                    ));
                    warn!(work_item_id = %work_item_id, attempts, reason = %reason, "Item skipped");
                    return ItemOutcome::Skipped {
                        index,
                        topic: item.topic.clone(),
                        attempts,
                        reason,
                    };
                }
                ItemState::Done { attempt, saved } => {
                    reporter.log(format!(
                        "[{}] Item finished on attempt {}, saved as {}",
                        item.topic, attempt, saved.filename
                    ));
                    return ItemOutcome::Completed {
                        index,
                        topic: item.topic.clone(),
                        attempts: attempt,
                        saved,
                    };
                }
            };
        }
    }

    async fn run_attempt(
        &self,
        mut ctx: AttemptContext<'_>,
        definition: &PipelineDefinition,
    ) -> Result<SavedResult, AbortReason> {
        let outcome = match definition.variant {
            PipelineVariant::Sequential => self.run_sequential(&mut ctx, definition).await,
            PipelineVariant::FanOut => self.run_fan_out(&mut ctx, definition).await,
        };
        let mut result = match outcome {
            Ok(result) => result,
            Err(reason) => {
                debug!(
                    work_item_id = %ctx.attempt.work_item_id,
                    attempt = ctx.attempt.attempt_number,
                    stage = %ctx.stage,
                    reason = %reason,
                    "Attempt aborted"
                );
                return Err(reason);
            }
        };

        ctx.enter(AttemptStage::Saving);
        result.jobs = std::mem::take(&mut ctx.attempt.jobs);
        let value = serde_json::to_value(&result).map_err(|e| AbortReason::SinkFailed {
            error: e.to_string(),
        })?;
        self.sink
            .save(&ctx.item.topic, &value)
            .await
            .map_err(|e| AbortReason::SinkFailed {
                error: e.to_string(),
            })
    }

    /// Steps awaited one at a time; titles per segment.
    async fn run_sequential(
        &self,
        ctx: &mut AttemptContext<'_>,
        definition: &PipelineDefinition,
    ) -> Result<ScriptResult, AbortReason> {
        let image_prompts = self.run_primary(ctx, definition, self.config.step_poll).await?;
        let scenes = image_prompts.clone().unwrap_or_else(|| ctx.item.lines.clone());

        let vars = ctx.base_vars().set("previous", numbered(&scenes));
        let mut video_prompts = self
            .required_step(ctx, &definition.derived, vars, self.config.step_poll)
            .await?;
        check_scene_count(scenes.len(), video_prompts.len())?;
        self.enforce_limit(
            ctx,
            definition,
            "video prompt",
            &mut video_prompts,
            self.config.limits.video_prompt_max_chars,
        )
        .await?;

        let segments = segment(&video_prompts, definition.segment_size);
        let mut titles = Vec::with_capacity(segments.len());
        for seg in &segments {
            if let Some(title) = self.segment_title(ctx, definition, seg, segments.len()).await {
                titles.push(title);
            }
        }
        if titles.len() != segments.len() {
            return Err(AbortReason::SegmentCountMismatch {
                expected: segments.len(),
                actual: titles.len(),
            });
        }
        self.enforce_limit(
            ctx,
            definition,
            "title",
            &mut titles,
            self.config.limits.title_max_chars,
        )
        .await?;

        let hashtags = match &definition.hashtags {
            Some(step) => {
                let vars = ctx.base_vars();
                self.required_step(ctx, step, vars, self.config.step_poll)
                    .await?
            }
            None => Vec::new(),
        };

        let (enrichment, skipped_groups) = self
            .enrich(ctx, definition.enrichment.as_ref(), &scenes)
            .await;

        Ok(ScriptResult {
            work_item_id: ctx.attempt.work_item_id.clone(),
            topic: ctx.item.topic.clone(),
            variant: definition.variant,
            attempt: ctx.attempt.attempt_number,
            image_prompts,
            video_prompts,
            titles,
            hashtags,
            score: None,
            enrichment,
            skipped_groups,
            jobs: Vec::new(),
            generated_at: Utc::now(),
        })
    }

    /// Prerequisite first, then independent steps submitted together and
    /// awaited by batch polling.
    async fn run_fan_out(
        &self,
        ctx: &mut AttemptContext<'_>,
        definition: &PipelineDefinition,
    ) -> Result<ScriptResult, AbortReason> {
        let image_prompts = self
            .run_primary(ctx, definition, self.config.prerequisite_poll)
            .await?;
        let scenes = image_prompts.clone().unwrap_or_else(|| ctx.item.lines.clone());
        let scene_list = numbered(&scenes);

        let mut fan_out: Vec<(&StepConfig, PromptVars)> = vec![
            (
                &definition.derived,
                ctx.base_vars().set("previous", scene_list.clone()),
            ),
            (
                &definition.title,
                ctx.base_vars().set("segment", scene_list.clone()),
            ),
        ];
        if let Some(step) = &definition.hashtags {
            fan_out.push((step, ctx.base_vars()));
        }
        if let Some(step) = &definition.scoring {
            fan_out.push((step, ctx.base_vars().set("previous", scene_list)));
        }

        let mut outputs = self.await_fan_out(ctx, fan_out).await?;
        let mut take = |name: &str| outputs.remove(name).unwrap_or_default();

        let mut video_prompts = take(&definition.derived.name);
        let mut titles = take(&definition.title.name);
        titles.truncate(1);
        let hashtags = definition
            .hashtags
            .as_ref()
            .map(|step| take(&step.name))
            .unwrap_or_default();
        let score = match &definition.scoring {
            Some(step) => {
                let raw = take(&step.name);
                raw.first()
                    .map(|s| serde_json::from_str::<Value>(s))
                    .transpose()
                    .map_err(|e| AbortReason::StepFailed {
                        step: step.name.clone(),
                        error: e.to_string(),
                    })?
            }
            None => None,
        };

        check_scene_count(scenes.len(), video_prompts.len())?;
        self.enforce_limit(
            ctx,
            definition,
            "video prompt",
            &mut video_prompts,
            self.config.limits.video_prompt_max_chars,
        )
        .await?;
        self.enforce_limit(
            ctx,
            definition,
            "title",
            &mut titles,
            self.config.limits.title_max_chars,
        )
        .await?;

        let (enrichment, skipped_groups) = self
            .enrich(ctx, definition.enrichment.as_ref(), &scenes)
            .await;

        Ok(ScriptResult {
            work_item_id: ctx.attempt.work_item_id.clone(),
            topic: ctx.item.topic.clone(),
            variant: definition.variant,
            attempt: ctx.attempt.attempt_number,
            image_prompts,
            video_prompts,
            titles,
            hashtags,
            score,
            enrichment,
            skipped_groups,
            jobs: Vec::new(),
            generated_at: Utc::now(),
        })
    }

    async fn run_primary(
        &self,
        ctx: &mut AttemptContext<'_>,
        definition: &PipelineDefinition,
        budget: PollBudget,
    ) -> Result<Option<Vec<String>>, AbortReason> {
        let Some(step) = &definition.primary else {
            return Ok(None);
        };
        let vars = ctx.base_vars();
        self.required_step(ctx, step, vars, budget).await.map(Some)
    }

    /// Run a step, logging start and outcome.
    async fn step(
        &self,
        ctx: &mut AttemptContext<'_>,
        step: &StepConfig,
        label: &str,
        vars: PromptVars,
        budget: PollBudget,
    ) -> crate::Result<Vec<String>> {
        ctx.enter(AttemptStage::RunningStep(step.name.clone()));
        ctx.log(format!("{} started", label));
        match self.runner.run(&mut ctx.attempt, step, &vars, budget).await {
            Ok(records) => {
                ctx.log(format!("{} succeeded ({} record(s))", label, records.len()));
                Ok(records)
            }
            Err(e) => {
                ctx.log(format!("{} failed: {}", label, e));
                Err(e)
            }
        }
    }

    /// A step whose failure aborts the attempt.
    async fn required_step(
        &self,
        ctx: &mut AttemptContext<'_>,
        step: &StepConfig,
        vars: PromptVars,
        budget: PollBudget,
    ) -> Result<Vec<String>, AbortReason> {
        self.step(ctx, step, &step.name, vars, budget)
            .await
            .map_err(|e| AbortReason::from_step_error(&step.name, e))
    }

    async fn segment_title(
        &self,
        ctx: &mut AttemptContext<'_>,
        definition: &PipelineDefinition,
        seg: &Segment<String>,
        total: usize,
    ) -> Option<String> {
        let label = format!("{} {}/{}", definition.title.name, seg.index + 1, total);
        let vars = ctx.base_vars().set("segment", numbered(&seg.records));
        match self
            .step(ctx, &definition.title, &label, vars, self.config.step_poll)
            .await
        {
            Ok(records) => records.into_iter().next(),
            Err(_) => None,
        }
    }

    /// Validation gate: shorten every record over `limit`, or abort.
    async fn enforce_limit(
        &self,
        ctx: &mut AttemptContext<'_>,
        definition: &PipelineDefinition,
        field: &str,
        records: &mut [String],
        limit: Option<usize>,
    ) -> Result<(), AbortReason> {
        let Some(limit) = limit else {
            return Ok(());
        };
        let max_sub_attempts = self.config.shorten_attempts.max(1);

        for (index, record) in records.iter_mut().enumerate() {
            let mut actual = record.chars().count();
            if actual <= limit {
                continue;
            }
            ctx.enter(AttemptStage::Validating(format!("{} {}", field, index + 1)));
            ctx.log(format!(
                "{} {} is {} chars (limit {}), shortening",
                field,
                index + 1,
                actual,
                limit
            ));

            let mut candidate = record.clone();
            let mut accepted = false;
            for sub_attempt in 1..=max_sub_attempts {
                let label = format!(
                    "{} for {} {} ({}/{})",
                    definition.shorten.name,
                    field,
                    index + 1,
                    sub_attempt,
                    max_sub_attempts
                );
                let vars = PromptVars::new()
                    .set("field", field.to_string())
                    .set("limit", limit.to_string())
                    .set("text", candidate.clone());
                let Ok(shortened) = self
                    .step(ctx, &definition.shorten, &label, vars, self.config.step_poll)
                    .await
                else {
                    continue;
                };

                candidate = shortened.join(" ");
                actual = candidate.chars().count();
                if actual <= limit {
                    accepted = true;
                    break;
                }
                ctx.log(format!("{} still {} chars", label, actual));
            }

            if !accepted {
                return Err(AbortReason::ValidationExhausted {
                    field: field.to_string(),
                    limit,
                    actual,
                });
            }
            *record = candidate;
        }
        Ok(())
    }

    /// Grouped enrichment. Exhausting a group's retries skips that group.
    async fn enrich(
        &self,
        ctx: &mut AttemptContext<'_>,
        steps: Option<&EnrichmentSteps>,
        scenes: &[String],
    ) -> (Vec<EnrichmentRecord>, Vec<usize>) {
        let Some(steps) = steps else {
            return (Vec::new(), Vec::new());
        };
        let groups = segment(scenes, steps.group_size);
        let mut records = Vec::with_capacity(groups.len());
        let mut skipped = Vec::new();

        for group in &groups {
            ctx.enter(AttemptStage::Enriching(group.index));
            match self.enrich_group(ctx, steps, group, groups.len()).await {
                Some(record) => records.push(record),
                None => {
                    ctx.log(format!(
                        "Enrichment group {}/{} skipped after {} attempt(s) per artifact",
                        group.index + 1,
                        groups.len(),
                        self.config.enrichment_attempts.max(1)
                    ));
                    skipped.push(group.index);
                }
            }
        }
        (records, skipped)
    }

    async fn enrich_group(
        &self,
        ctx: &mut AttemptContext<'_>,
        steps: &EnrichmentSteps,
        group: &Segment<String>,
        total: usize,
    ) -> Option<EnrichmentRecord> {
        let vars = ctx.base_vars().set("segment", numbered(&group.records));
        let image_prompt = self
            .artifact(ctx, &steps.primary, group.index, total, vars)
            .await?;

        let vars = ctx.base_vars().set("previous", image_prompt.clone());
        let video_prompt = self
            .artifact(ctx, &steps.derived, group.index, total, vars)
            .await?;

        let range = group.range();
        Some(EnrichmentRecord {
            group: group.index,
            start: range.start,
            end: range.end,
            image_prompt,
            video_prompt,
        })
    }

    /// One enrichment artifact with its own bounded retry.
    async fn artifact(
        &self,
        ctx: &mut AttemptContext<'_>,
        step: &StepConfig,
        group: usize,
        total: usize,
        vars: PromptVars,
    ) -> Option<String> {
        let max_tries = self.config.enrichment_attempts.max(1);
        for n in 1..=max_tries {
            let label = format!(
                "{} group {}/{} (try {}/{})",
                step.name,
                group + 1,
                total,
                n,
                max_tries
            );
            if let Ok(records) = self
                .step(ctx, step, &label, vars.clone(), self.config.step_poll)
                .await
            {
                return Some(records.join(" "));
            }
        }
        None
    }

    /// Submit independent steps together, then batch-poll the outstanding
    /// subset until every one is consumed or the budget runs out.
    async fn await_fan_out(
        &self,
        ctx: &mut AttemptContext<'_>,
        steps: Vec<(&StepConfig, PromptVars)>,
    ) -> Result<HashMap<String, Vec<String>>, AbortReason> {
        for (step, _) in &steps {
            ctx.log(format!("{} started", step.name));
        }

        let attempt = &ctx.attempt;
        let submissions = join_all(
            steps
                .iter()
                .map(|(step, vars)| self.runner.submit(attempt, step, vars)),
        )
        .await;

        let mut outstanding: Vec<PendingStep> = Vec::with_capacity(submissions.len());
        let mut failure = None;
        for ((step, _), submission) in steps.iter().zip(submissions) {
            match submission {
                Ok(pending) => outstanding.push(pending),
                Err(e) => {
                    ctx.log(format!("{} failed: {}", step.name, e));
                    failure.get_or_insert_with(|| AbortReason::from_step_error(&step.name, e));
                }
            }
        }
        if let Some(reason) = failure {
            self.abandon_all(ctx, outstanding);
            return Err(reason);
        }

        let budget = self.config.fan_out_poll;
        let mut outputs = HashMap::with_capacity(outstanding.len());

        for round in 1..=budget.max_attempts.max(1) {
            let ids: Vec<String> = outstanding.iter().map(|p| p.job_id.clone()).collect();
            let reports = self.client().batch_poll_status(&ids).await;
            debug!(
                work_item_id = %ctx.attempt.work_item_id,
                round,
                outstanding = ids.len(),
                answered = reports.len(),
                "Fan-out poll round"
            );

            let mut still_waiting = Vec::with_capacity(outstanding.len());
            let mut failure = None;
            for pending in std::mem::take(&mut outstanding) {
                if failure.is_some() {
                    still_waiting.push(pending);
                    continue;
                }
                let report = reports.get(&pending.job_id);
                match report.map(|r| r.status) {
                    Some(JobStatus::Completed) => {
                        let name = pending.step.name.clone();
                        match self.runner.finish(&mut ctx.attempt, pending).await {
                            Ok(records) => {
                                ctx.log(format!(
                                    "{} succeeded ({} record(s))",
                                    name,
                                    records.len()
                                ));
                                outputs.insert(name, records);
                            }
                            Err(e) => {
                                ctx.log(format!("{} failed: {}", name, e));
                                failure = Some(AbortReason::from_step_error(&name, e));
                            }
                        }
                    }
                    Some(JobStatus::Failed) => {
                        let error = report
                            .and_then(|r| r.error.clone())
                            .unwrap_or_else(|| "backend reported failure".to_string());
                        ctx.log(format!("{} failed: {}", pending.step.name, error));
                        failure = Some(AbortReason::StepFailed {
                            step: pending.step.name.clone(),
                            error,
                        });
                        self.runner.abandon(&mut ctx.attempt, pending);
                    }
                    _ => still_waiting.push(pending),
                }
            }

            if let Some(reason) = failure {
                self.abandon_all(ctx, still_waiting);
                return Err(reason);
            }
            outstanding = still_waiting;
            if outstanding.is_empty() {
                return Ok(outputs);
            }
            if round < budget.max_attempts && !budget.interval().is_zero() {
                tokio::time::sleep(budget.interval()).await;
            }
        }

        let step = outstanding
            .first()
            .map(|p| p.step.name.clone())
            .unwrap_or_default();
        ctx.log(format!("{} timed out", step));
        self.abandon_all(ctx, outstanding);
        Err(AbortReason::Timeout { step })
    }

    fn abandon_all(&self, ctx: &mut AttemptContext<'_>, pending: Vec<PendingStep>) {
        for p in pending {
            self.runner.abandon(&mut ctx.attempt, p);
        }
    }
}

fn check_scene_count(expected: usize, actual: usize) -> Result<(), AbortReason> {
    if expected != actual {
        return Err(AbortReason::SceneCountMismatch { expected, actual });
    }
    Ok(())
}
