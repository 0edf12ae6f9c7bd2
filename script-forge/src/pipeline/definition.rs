//! Step and pipeline configuration.
//!
//! Step graphs are fixed per pipeline variant. Models and temperatures are
//! part of the definition and cannot be chosen by callers; callers only pick
//! the variant and a handful of structural options.

use serde::{Deserialize, Serialize};

use super::parser::{OutputFormat, PostProcess};
use super::retry::RetryBackoff;
use crate::queue::PollBudget;

/// Step names.
pub mod step_names {
    pub const IMAGE_PROMPTS: &str = "IMAGE_PROMPTS";
    pub const VIDEO_PROMPTS: &str = "VIDEO_PROMPTS";
    pub const SHORTEN: &str = "SHORTEN";
    pub const TITLE: &str = "TITLE";
    pub const HASHTAGS: &str = "HASHTAGS";
    pub const SCORING: &str = "SCORING";
    pub const ENRICH_IMAGE: &str = "ENRICH_IMAGE";
    pub const ENRICH_VIDEO: &str = "ENRICH_VIDEO";
}

const REASONING_MODEL: &str = "anthropic/claude-3.7-sonnet";
const FAST_MODEL: &str = "google/gemini-flash-1.5";

/// One generation step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepConfig {
    /// Step name, used for tracking and logs.
    pub name: String,
    pub model: String,
    pub temperature: f32,
    /// Prompt template reference.
    pub template: String,
    /// How the output is parsed into records.
    pub format: OutputFormat,
    /// Optional clean-up applied to parsed records.
    #[serde(default)]
    pub post_process: Option<PostProcess>,
}

impl StepConfig {
    pub fn new(name: &str, model: &str, temperature: f32, format: OutputFormat) -> Self {
        Self {
            name: name.to_string(),
            model: model.to_string(),
            temperature,
            template: name.to_ascii_lowercase(),
            format,
            post_process: None,
        }
    }

    pub fn with_post_process(mut self, post_process: PostProcess) -> Self {
        self.post_process = Some(post_process);
        self
    }
}

/// Pipeline variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineVariant {
    /// Steps are awaited one at a time; titles are produced per segment.
    #[default]
    Sequential,
    /// Independent steps after the prerequisite are submitted together and
    /// awaited by batch polling.
    FanOut,
}

impl std::fmt::Display for PipelineVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sequential => write!(f, "sequential"),
            Self::FanOut => write!(f, "fan-out"),
        }
    }
}

/// Per-run options supplied by the trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineOptions {
    pub variant: PipelineVariant,
    /// Skip the image prompt step; video prompts are then derived from the
    /// lyrics directly.
    pub skip_primary: bool,
    /// Derived records per title segment.
    pub segment_size: usize,
    /// Generate the grouped secondary artifacts.
    pub enrichment: bool,
    /// Primary records per enrichment group.
    pub enrichment_group_size: usize,
    /// Generate hashtags.
    pub hashtags: bool,
    /// Score the finished script (fan-out only).
    pub scoring: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            variant: PipelineVariant::Sequential,
            skip_primary: false,
            segment_size: 4,
            enrichment: false,
            enrichment_group_size: 3,
            hashtags: true,
            scoring: false,
        }
    }
}

/// Enrichment step pair: a primary artifact and one derived from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentSteps {
    pub primary: StepConfig,
    pub derived: StepConfig,
    pub group_size: usize,
}

/// A fully resolved pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub variant: PipelineVariant,
    /// Image prompts, one per lyric line.
    pub primary: Option<StepConfig>,
    /// Video prompts, one per scene.
    pub derived: StepConfig,
    /// Rewrites an over-length field.
    pub shorten: StepConfig,
    /// Titles: one per segment (sequential) or one per item (fan-out).
    pub title: StepConfig,
    pub segment_size: usize,
    pub hashtags: Option<StepConfig>,
    pub scoring: Option<StepConfig>,
    pub enrichment: Option<EnrichmentSteps>,
}

impl PipelineDefinition {
    /// Resolve the fixed step graph for the given options.
    pub fn from_options(options: &PipelineOptions) -> Self {
        let primary = (!options.skip_primary).then(|| {
            StepConfig::new(
                step_names::IMAGE_PROMPTS,
                REASONING_MODEL,
                0.8,
                OutputFormat::JsonList,
            )
            .with_post_process(PostProcess::CollapseWhitespace)
        });
        let derived = StepConfig::new(
            step_names::VIDEO_PROMPTS,
            REASONING_MODEL,
            0.7,
            OutputFormat::JsonList,
        )
        .with_post_process(PostProcess::CollapseWhitespace);
        let shorten = StepConfig::new(step_names::SHORTEN, FAST_MODEL, 0.3, OutputFormat::PlainText)
            .with_post_process(PostProcess::StripQuotes);
        let title = StepConfig::new(step_names::TITLE, FAST_MODEL, 0.9, OutputFormat::PlainText)
            .with_post_process(PostProcess::StripQuotes);
        let hashtags = options.hashtags.then(|| {
            StepConfig::new(step_names::HASHTAGS, FAST_MODEL, 0.7, OutputFormat::PlainText)
                .with_post_process(PostProcess::Hashtags)
        });
        let scoring = (options.scoring && options.variant == PipelineVariant::FanOut).then(|| {
            StepConfig::new(step_names::SCORING, FAST_MODEL, 0.2, OutputFormat::JsonObject)
        });
        let enrichment = options.enrichment.then(|| EnrichmentSteps {
            primary: StepConfig::new(
                step_names::ENRICH_IMAGE,
                REASONING_MODEL,
                0.9,
                OutputFormat::PlainText,
            )
            .with_post_process(PostProcess::CollapseWhitespace),
            derived: StepConfig::new(
                step_names::ENRICH_VIDEO,
                REASONING_MODEL,
                0.7,
                OutputFormat::PlainText,
            )
            .with_post_process(PostProcess::CollapseWhitespace),
            group_size: options.enrichment_group_size.max(1),
        });

        Self {
            variant: options.variant,
            primary,
            derived,
            shorten,
            title,
            segment_size: options.segment_size.max(1),
            hashtags,
            scoring,
            enrichment,
        }
    }
}

/// Maximum field lengths enforced by the validation gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationLimits {
    /// Maximum characters per video prompt.
    pub video_prompt_max_chars: Option<usize>,
    /// Maximum characters per title.
    pub title_max_chars: Option<usize>,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            video_prompt_max_chars: Some(400),
            title_max_chars: Some(80),
        }
    }
}

/// Engine-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Full passes per work item before it is skipped.
    pub max_attempts: u32,
    /// Sub-attempts of the shortening loop.
    pub shorten_attempts: u32,
    /// Attempts per enrichment artifact.
    pub enrichment_attempts: u32,
    /// Work items processed concurrently.
    pub item_concurrency: usize,
    /// Budget for ordinary steps.
    pub step_poll: PollBudget,
    /// Budget for the prerequisite step of the fan-out variant.
    pub prerequisite_poll: PollBudget,
    /// Budget for awaiting the fan-out set.
    pub fan_out_poll: PollBudget,
    /// Delay between attempts of the same item.
    pub backoff: RetryBackoff,
    pub limits: ValidationLimits,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            shorten_attempts: 3,
            enrichment_attempts: 3,
            item_concurrency: 1,
            step_poll: PollBudget::new(150, 2000),
            prerequisite_poll: PollBudget::new(300, 2000),
            fan_out_poll: PollBudget::new(150, 2000),
            backoff: RetryBackoff::default(),
            limits: ValidationLimits::default(),
        }
    }
}
