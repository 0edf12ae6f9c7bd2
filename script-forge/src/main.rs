use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use script_forge::api::{ApiServer, ApiServerConfig, AppState};
use script_forge::config::AppConfig;
use script_forge::hub::LogHub;
use script_forge::logging::init_logging;
use script_forge::pipeline::{FileResultSink, PipelineEngine, PipelineManager, PromptTemplates};
use script_forge::queue::{HttpBackend, JobQueueClient, RequestTracker};
use script_forge::utils::http_client::install_rustls_provider;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = AppConfig::from_env();

    // Keep the guard alive so buffered file logs are flushed on exit.
    let (logging_config, _log_guard) = init_logging(&config.log_dir)?;
    let shutdown_token = CancellationToken::new();
    logging_config.start_retention_cleanup(shutdown_token.clone());

    install_rustls_provider();

    let backend_ready = config.has_credentials();
    if !backend_ready {
        warn!("GENERATION_API_KEY is not set; pipeline runs will be rejected");
    }

    let backend = Arc::new(HttpBackend::new(config.backend.clone()));
    let tracker = Arc::new(RequestTracker::new());
    let client = Arc::new(JobQueueClient::with_config(
        backend,
        tracker,
        config.queue.clone(),
    ));

    let hub = LogHub::new();
    let sink = Arc::new(FileResultSink::new(config.output_dir.clone()));
    let engine = Arc::new(PipelineEngine::new(
        client,
        Arc::new(PromptTemplates::default()),
        sink,
        config.engine.clone(),
    ));
    let manager = Arc::new(PipelineManager::new(engine, hub.clone()));

    let state = AppState::new(hub)
        .with_pipeline_manager(manager.clone())
        .with_logging_config(logging_config)
        .with_backend_ready(backend_ready);

    let server = Arc::new(ApiServer::with_state(
        ApiServerConfig::from_env_or_default(),
        state,
    ));

    info!(
        output_dir = %config.output_dir.display(),
        max_attempts = config.engine.max_attempts,
        "script-forge initialized"
    );

    let server_task = {
        let server = server.clone();
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("API server error: {}", e);
            }
        })
    };

    let server_token = server.cancel_token();
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received");
        }
        _ = server_token.cancelled() => {}
    }

    server.shutdown();
    manager.stop().await;
    shutdown_token.cancel();
    let _ = server_task.await;

    info!("script-forge stopped");
    Ok(())
}
