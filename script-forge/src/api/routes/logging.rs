//! Logging routes.
//!
//! Log filter configuration and the live progress stream over WebSocket.

use axum::{
    Json, Router,
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::hub::{HubMessage, LogHub};

/// Heartbeat ping interval.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Router mounted at `/api/logging`.
pub fn config_router() -> Router<AppState> {
    Router::new().route("/", get(get_logging_config).put(update_logging_config))
}

/// Router mounted at `/api/logs`.
pub fn stream_router() -> Router<AppState> {
    Router::new().route("/stream", get(progress_stream_ws))
}

#[derive(Debug, Serialize)]
pub struct LoggingConfigResponse {
    pub filter: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateLogFilterRequest {
    pub filter: String,
}

#[derive(Debug, Deserialize)]
pub struct StreamParams {
    /// Only stream events of this run.
    pub request_id: Option<String>,
}

async fn get_logging_config(
    State(state): State<AppState>,
) -> ApiResult<Json<LoggingConfigResponse>> {
    let logging_config = state
        .logging_config
        .as_ref()
        .ok_or_else(|| ApiError::internal("Logging configuration not available"))?;

    Ok(Json(LoggingConfigResponse {
        filter: logging_config.get_filter(),
    }))
}

async fn update_logging_config(
    State(state): State<AppState>,
    Json(request): Json<UpdateLogFilterRequest>,
) -> ApiResult<Json<LoggingConfigResponse>> {
    let logging_config = state
        .logging_config
        .as_ref()
        .ok_or_else(|| ApiError::internal("Logging configuration not available"))?;

    logging_config
        .set_filter(&request.filter)
        .map_err(|e| ApiError::bad_request(e.to_string()))?;

    Ok(Json(LoggingConfigResponse {
        filter: request.filter,
    }))
}

/// WebSocket handler for live pipeline progress.
async fn progress_stream_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<StreamParams>,
) -> impl IntoResponse {
    let hub = state.hub.clone();
    let filter = params.request_id.filter(|id| !id.trim().is_empty());
    ws.on_upgrade(move |socket| handle_socket(socket, hub, filter))
}

/// Forward hub messages to one connection until the run completes or the
/// client goes away.
async fn handle_socket(socket: WebSocket, hub: LogHub, filter: Option<String>) {
    let (mut sender, mut receiver) = socket.split();
    let mut subscription = hub.subscribe(filter);
    debug!(handle = ?subscription.handle(), "Progress stream attached");

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick fires immediately.
    heartbeat.tick().await;

    loop {
        tokio::select! {
            message = subscription.recv() => {
                let Some(message) = message else { break };
                let is_complete = message.is_complete();
                let Ok(json) = encode(&message) else { continue };
                if sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
                if is_complete {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            }

            _ = heartbeat.tick() => {
                if sender.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(_)) => break,
                }
            }
        }
    }

    subscription.unsubscribe();
    debug!(handle = ?subscription.handle(), "Progress stream detached");
}

/// Wire form of a hub message.
pub fn encode(message: &HubMessage) -> serde_json::Result<String> {
    serde_json::to_string(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_request_deserialize() {
        let request: UpdateLogFilterRequest =
            serde_json::from_str(r#"{"filter": "script_forge=debug"}"#).unwrap();
        assert_eq!(request.filter, "script_forge=debug");
    }

    #[test]
    fn test_stream_params() {
        let params: StreamParams = serde_json::from_str(r#"{"request_id": "abc"}"#).unwrap();
        assert_eq!(params.request_id.as_deref(), Some("abc"));
        let params: StreamParams = serde_json::from_str("{}").unwrap();
        assert!(params.request_id.is_none());
    }

    #[tokio::test]
    async fn test_complete_message_wire_shape() {
        let hub = LogHub::new();
        let mut subscription = hub.subscribe(Some("req-1".into()));
        hub.complete("req-1", "done");

        let connected = encode(&subscription.recv().await.unwrap()).unwrap();
        assert!(connected.contains(r#""type":"connected""#));

        let complete = subscription.recv().await.unwrap();
        assert!(complete.is_complete());
        assert!(encode(&complete).unwrap().contains(r#""type":"complete""#));
    }
}
