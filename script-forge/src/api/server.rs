//! HTTP server: state, router assembly and lifecycle.

use axum::Router;
use axum::body::Body;
use axum::extract::Request;
use axum::http::Response;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, MakeSpan, OnResponse, TraceLayer};
use tracing::{Level, Span, info};

use crate::api::routes;
use crate::error::{Error, Result};
use crate::hub::LogHub;
use crate::logging::LoggingConfig;
use crate::pipeline::PipelineManager;

const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 12580;

/// Paths whose requests are not traced: probes and long-lived streams.
const UNTRACED_PREFIXES: &[&str] = &["/health", "/api/logs/stream"];

/// Where and how the API listens.
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub enable_cors: bool,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            port: DEFAULT_PORT,
            enable_cors: true,
        }
    }
}

impl ApiServerConfig {
    /// Defaults overridden by `API_BIND_ADDRESS` and `API_PORT`.
    pub fn from_env_or_default() -> Self {
        let mut config = Self::default();

        if let Ok(address) = std::env::var("API_BIND_ADDRESS")
            && !address.trim().is_empty()
        {
            config.bind_address = address.trim().to_string();
        }
        if let Ok(raw) = std::env::var("API_PORT")
            && let Ok(port) = raw.trim().parse::<u16>()
        {
            config.port = port;
        }

        config
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.bind_address, self.port)
            .parse()
            .map_err(|e| Error::config(format!("invalid API listen address: {}", e)))
    }
}

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub start_time: Instant,
    /// Source of the live progress stream.
    pub hub: LogHub,
    pub pipeline_manager: Option<Arc<PipelineManager>>,
    pub logging_config: Option<Arc<LoggingConfig>>,
    /// Whether a backend credential is configured.
    pub backend_ready: bool,
}

impl AppState {
    pub fn new(hub: LogHub) -> Self {
        Self {
            start_time: Instant::now(),
            hub,
            pipeline_manager: None,
            logging_config: None,
            backend_ready: false,
        }
    }

    pub fn with_pipeline_manager(mut self, manager: Arc<PipelineManager>) -> Self {
        self.pipeline_manager = Some(manager);
        self
    }

    pub fn with_logging_config(mut self, config: Arc<LoggingConfig>) -> Self {
        self.logging_config = Some(config);
        self
    }

    pub fn with_backend_ready(mut self, ready: bool) -> Self {
        self.backend_ready = ready;
        self
    }
}

fn is_traced(path: &str) -> bool {
    !UNTRACED_PREFIXES.iter().any(|prefix| path.starts_with(prefix))
}

/// Request spans at INFO, except for untraced paths.
fn make_request_span(request: &Request) -> Span {
    if is_traced(request.uri().path()) {
        DefaultMakeSpan::new().level(Level::INFO).make_span(request)
    } else {
        Span::none()
    }
}

fn log_response(response: &Response<Body>, latency: Duration, span: &Span) {
    if !span.is_disabled() {
        DefaultOnResponse::new()
            .level(Level::INFO)
            .on_response(response, latency, span);
    }
}

pub struct ApiServer {
    config: ApiServerConfig,
    state: AppState,
    cancel_token: CancellationToken,
}

impl ApiServer {
    pub fn with_state(config: ApiServerConfig, state: AppState) -> Self {
        Self {
            config,
            state,
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    fn build_router(&self) -> Router {
        let router = routes::create_router(self.state.clone());
        let router = if self.config.enable_cors {
            router.layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            )
        } else {
            router
        };

        router.layer(
            TraceLayer::new_for_http()
                .make_span_with(make_request_span)
                .on_response(log_response),
        )
    }

    /// Serve until [`shutdown`](Self::shutdown) is called.
    pub async fn run(&self) -> Result<()> {
        let addr = self.config.socket_addr()?;
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "API server listening");

        let cancel_token = self.cancel_token.clone();
        axum::serve(listener, self.build_router())
            .with_graceful_shutdown(async move {
                cancel_token.cancelled().await;
                info!("API server draining connections");
            })
            .await
            .map_err(|e| Error::Other(format!("API server failed: {}", e)))
    }

    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}
