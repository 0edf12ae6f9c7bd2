//! Background runs through the pipeline manager.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Harness, Reply, ScriptedBackend, fast_config, lines};
use script_forge::Error;
use script_forge::hub::HubMessage;
use script_forge::pipeline::definition::step_names::VIDEO_PROMPTS;
use script_forge::pipeline::{
    EngineConfig, PipelineManager, PipelineOptions, RunState, WorkItem,
};
use script_forge::queue::PollBudget;

fn manager(harness: &Harness) -> PipelineManager {
    PipelineManager::new(harness.engine.clone(), harness.hub.clone())
}

/// Collect messages until the completion notice arrives.
async fn until_complete(
    subscription: &mut script_forge::hub::Subscription,
) -> (Vec<String>, String) {
    let mut logs = Vec::new();
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), subscription.recv())
            .await
            .expect("run did not complete in time")
            .expect("hub closed");
        match message {
            HubMessage::Log { log, .. } => logs.push(log),
            HubMessage::Complete { message, .. } => return (logs, message),
            HubMessage::Connected { .. } => {}
        }
    }
}

#[tokio::test]
async fn test_run_completes_with_single_notice() {
    let harness = Harness::new(ScriptedBackend::happy(3), fast_config());
    let manager = manager(&harness);

    let request_id = manager
        .start(
            vec![WorkItem::new("Neon Hearts", lines(3))],
            PipelineOptions::default(),
        )
        .unwrap();
    let mut subscription = harness.hub.subscribe(Some(request_id.clone()));

    let (logs, message) = until_complete(&mut subscription).await;
    assert_eq!(message, "Pipeline finished: 1/1 item(s) completed, 0 skipped");
    assert!(logs.iter().any(|l| l.contains("Item finished on attempt 1")));
    assert!(subscription.try_recv().is_none());

    manager.stop().await;
    let status = manager.run_status(&request_id).unwrap();
    assert_eq!(status.state, RunState::Finished);
    assert_eq!(status.summary.unwrap().completed, 1);

    let stats = manager.stats();
    assert_eq!(stats.active_runs, 0);
    assert_eq!(stats.finished_runs, 1);
    assert_eq!(stats.in_flight_steps, 0);
}

#[tokio::test]
async fn test_invalid_batch_is_rejected_before_start() {
    let harness = Harness::new(ScriptedBackend::happy(1), fast_config());
    let manager = manager(&harness);

    let err = manager
        .start(Vec::new(), PipelineOptions::default())
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));

    let err = manager
        .start(
            vec![WorkItem::new("t", vec!["".into()])],
            PipelineOptions::default(),
        )
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));
    assert_eq!(manager.stats().active_runs, 0);
}

#[tokio::test]
async fn test_stop_cancels_running_batch() {
    let backend = ScriptedBackend::happy(2);
    backend.script(VIDEO_PROMPTS, vec![Reply::Hang]);
    let config = EngineConfig {
        step_poll: PollBudget::new(10_000, 5),
        ..fast_config()
    };
    let harness = Harness::new(backend, config);
    let manager = Arc::new(manager(&harness));

    let request_id = manager
        .start(vec![WorkItem::new("t", lines(2))], PipelineOptions::default())
        .unwrap();
    let mut subscription = harness.hub.subscribe(Some(request_id.clone()));
    tokio::time::sleep(Duration::from_millis(50)).await;

    manager.stop().await;

    let (_, message) = until_complete(&mut subscription).await;
    assert_eq!(message, "Pipeline cancelled");
    let status = manager.run_status(&request_id).unwrap();
    assert_eq!(status.state, RunState::Cancelled);
    assert!(status.summary.is_none());

    let err = manager
        .start(vec![WorkItem::new("t", lines(2))], PipelineOptions::default())
        .unwrap_err();
    assert!(matches!(err, Error::Other(_)));
}
