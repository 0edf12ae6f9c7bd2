//! Shared fixtures: a scripted in-memory backend and an engine wired to it
//! with zero delays.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use script_forge::hub::{HubMessage, LogHub, RunReporter, Subscription};
use script_forge::pipeline::definition::step_names::{
    ENRICH_IMAGE, ENRICH_VIDEO, HASHTAGS, IMAGE_PROMPTS, SCORING, SHORTEN, TITLE, VIDEO_PROMPTS,
};
use script_forge::pipeline::{
    EngineConfig, MemoryResultSink, PipelineEngine, PromptTemplates, RetryBackoff,
    ValidationLimits,
};
use script_forge::queue::{
    GenerationBackend, GenerationOutput, GenerationRequest, JobQueueClient, JobStatus, PollBudget,
    QueueClientConfig, RequestTracker, StatusReport,
};
use script_forge::{Error, Result};

/// What a submitted job does.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Completes with this raw output.
    Output(String),
    /// Reported as `FAILED` with this reason.
    Fail(String),
    /// Never leaves `IN_PROGRESS`.
    Hang,
}

pub fn output(raw: impl Into<String>) -> Reply {
    Reply::Output(raw.into())
}

/// A JSON list of `n` distinct prompts.
pub fn json_list(prefix: &str, n: usize) -> String {
    let items: Vec<String> = (1..=n).map(|i| format!("{} {}", prefix, i)).collect();
    serde_json::to_string(&items).unwrap()
}

/// Backend that answers per step from a script.
///
/// Each step has a queue of replies; every submission consumes the front
/// one, and the last reply repeats once the queue is down to one entry.
pub struct ScriptedBackend {
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    jobs: Mutex<HashMap<String, (String, Reply)>>,
    calls: Mutex<HashMap<String, usize>>,
    next_id: AtomicUsize,
    /// Largest number of tracked in-flight jobs seen for one (item, step).
    max_per_item_step: AtomicUsize,
    tracker: Mutex<Option<Arc<RequestTracker>>>,
}

impl ScriptedBackend {
    /// Happy-path replies for a work item with `lines` lines.
    pub fn happy(lines: usize) -> Self {
        let backend = Self {
            scripts: Mutex::new(HashMap::new()),
            jobs: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            next_id: AtomicUsize::new(0),
            max_per_item_step: AtomicUsize::new(0),
            tracker: Mutex::new(None),
        };
        backend.script(IMAGE_PROMPTS, vec![output(json_list("image", lines))]);
        backend.script(VIDEO_PROMPTS, vec![output(json_list("video", lines))]);
        backend.script(TITLE, vec![output("\"Midnight Drive\"")]);
        backend.script(HASHTAGS, vec![output("#synthwave #night #drive")]);
        backend.script(SHORTEN, vec![output("short")]);
        backend.script(SCORING, vec![output(r#"{"score": 8, "notes": "tight"}"#)]);
        backend.script(ENRICH_IMAGE, vec![output("a neon skyline")]);
        backend.script(ENRICH_VIDEO, vec![output("slow pan across the skyline")]);
        backend
    }

    /// Replace the replies for `step`.
    pub fn script(&self, step: &str, replies: Vec<Reply>) {
        self.scripts
            .lock()
            .insert(step.to_string(), replies.into_iter().collect());
    }

    /// Submissions seen for `step`.
    pub fn calls(&self, step: &str) -> usize {
        self.calls.lock().get(step).copied().unwrap_or(0)
    }

    pub fn max_in_flight_per_item_step(&self) -> usize {
        self.max_per_item_step.load(Ordering::SeqCst)
    }

    fn watch(&self, tracker: Arc<RequestTracker>) {
        *self.tracker.lock() = Some(tracker);
    }

    fn sample_in_flight(&self, work_item_id: &str) {
        let Some(tracker) = self.tracker.lock().clone() else {
            return;
        };
        let mut per_step: HashMap<String, usize> = HashMap::new();
        for job in tracker.jobs_for_item(work_item_id) {
            if job.is_in_flight() {
                *per_step.entry(job.step_name).or_default() += 1;
            }
        }
        let max = per_step.values().copied().max().unwrap_or(0);
        self.max_per_item_step.fetch_max(max, Ordering::SeqCst);
    }

    fn next_reply(&self, step: &str) -> Reply {
        let mut scripts = self.scripts.lock();
        match scripts.get_mut(step) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or(Reply::Hang),
            Some(queue) => queue.front().cloned().unwrap_or(Reply::Hang),
            None => Reply::Fail(format!("no script for {}", step)),
        }
    }
}

#[async_trait]
impl GenerationBackend for ScriptedBackend {
    async fn submit(&self, request: &GenerationRequest) -> Result<String> {
        *self.calls.lock().entry(request.step.clone()).or_default() += 1;
        let reply = self.next_reply(&request.step);
        let job_id = format!("job-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.jobs
            .lock()
            .insert(job_id.clone(), (request.step.clone(), reply));
        Ok(job_id)
    }

    async fn status(&self, job_id: &str) -> Result<StatusReport> {
        let tracked_item = self
            .tracker
            .lock()
            .clone()
            .and_then(|t| t.get(job_id))
            .map(|job| job.work_item_id);
        if let Some(work_item_id) = tracked_item {
            self.sample_in_flight(&work_item_id);
        }

        let reply = self.jobs.lock().get(job_id).map(|(_, r)| r.clone());
        match reply {
            Some(Reply::Output(_)) => Ok(StatusReport::new(JobStatus::Completed)),
            Some(Reply::Fail(reason)) => Ok(StatusReport::failed(reason)),
            Some(Reply::Hang) => Ok(StatusReport::new(JobStatus::Processing)),
            None => Err(Error::Poll(format!("unknown job {}", job_id))),
        }
    }

    async fn result(&self, job_id: &str) -> Result<GenerationOutput> {
        match self.jobs.lock().get(job_id) {
            Some((_, Reply::Output(raw))) => Ok(GenerationOutput::new(raw.clone())),
            _ => Err(Error::ResultNotReady(job_id.to_string())),
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// Engine configuration with tiny budgets and no sleeping.
pub fn fast_config() -> EngineConfig {
    let poll = PollBudget::new(3, 0);
    EngineConfig {
        max_attempts: 3,
        shorten_attempts: 3,
        enrichment_attempts: 3,
        item_concurrency: 1,
        step_poll: poll,
        prerequisite_poll: poll,
        fan_out_poll: poll,
        backoff: RetryBackoff::none(),
        limits: ValidationLimits::default(),
    }
}

pub struct Harness {
    pub backend: Arc<ScriptedBackend>,
    pub tracker: Arc<RequestTracker>,
    pub sink: Arc<MemoryResultSink>,
    pub engine: Arc<PipelineEngine>,
    pub hub: LogHub,
}

impl Harness {
    pub fn new(backend: ScriptedBackend, config: EngineConfig) -> Self {
        let backend = Arc::new(backend);
        let tracker = Arc::new(RequestTracker::new());
        backend.watch(tracker.clone());

        let client = Arc::new(JobQueueClient::with_config(
            backend.clone(),
            tracker.clone(),
            QueueClientConfig {
                batch_size: 10,
                batch_delay_ms: 0,
                poll: PollBudget::new(3, 0),
            },
        ));
        let sink = Arc::new(MemoryResultSink::new());
        let engine = Arc::new(PipelineEngine::new(
            client,
            Arc::new(PromptTemplates::default()),
            sink.clone(),
            config,
        ));

        Self {
            backend,
            tracker,
            sink,
            engine,
            hub: LogHub::new(),
        }
    }

    pub fn reporter(&self, request_id: &str) -> RunReporter {
        RunReporter::new(self.hub.clone(), request_id)
    }
}

/// Drain every log line currently buffered for `subscription`.
pub fn drain_logs(subscription: &mut Subscription) -> Vec<String> {
    let mut logs = Vec::new();
    while let Some(message) = subscription.try_recv() {
        if let HubMessage::Log { log, .. } = message {
            logs.push(log);
        }
    }
    logs
}

pub fn lines(n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("lyric line {}", i)).collect()
}
