//! HTTP handlers for the sync server.
//!
//! Implements:
//! - GET /sync/{workspace_id}/{doc_id} - WebSocket sync session
//! - GET /health - Health check endpoint

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use axum::Json;
use docsync_concurrency::ConcurrencyStats;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::coordinator::SyncCoordinator;
use crate::error::ServerError;
use crate::session::JoinedSession;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<SyncCoordinator>,
}

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub version: &'static str,
    pub store: &'static str,
    pub stats: ConcurrencyStats,
}

/// GET /health - Health check endpoint.
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let concurrency = state.coordinator.concurrency();
    Json(HealthResponse {
        healthy: concurrency.is_accepting(),
        version: env!("CARGO_PKG_VERSION"),
        store: concurrency.provider().backend_name(),
        stats: concurrency.stats(),
    })
}

/// Identifiers become lock keys and path components, so they must not
/// contain key or path separators.
fn validate_identifier(id: &str) -> Result<(), ServerError> {
    let invalid = id.is_empty()
        || id == "."
        || id == ".."
        || id.contains([':', '/', '\\', '\0']);
    if invalid {
        Err(ServerError::InvalidIdentifier(id.to_string()))
    } else {
        Ok(())
    }
}

/// GET /sync/{workspace_id}/{doc_id} - Upgrade to a sync session.
pub async fn sync_handler(
    State(state): State<AppState>,
    Path((workspace_id, doc_id)): Path<(String, String)>,
    upgrade: WebSocketUpgrade,
) -> Result<Response, ServerError> {
    validate_identifier(&workspace_id)?;
    validate_identifier(&doc_id)?;
    if !state.coordinator.concurrency().is_accepting() {
        return Err(ServerError::ShuttingDown);
    }

    let coordinator = state.coordinator;
    Ok(upgrade.on_upgrade(move |socket| run_session(coordinator, workspace_id, doc_id, socket)))
}

async fn run_session(
    coordinator: Arc<SyncCoordinator>,
    workspace_id: String,
    doc_id: String,
    socket: WebSocket,
) {
    let JoinedSession {
        id,
        sender,
        mut receiver,
    } = coordinator.join(&workspace_id, &doc_id).await;
    info!(workspace_id = %workspace_id, doc_id = %doc_id, session = id, "sync session opened");

    let (mut sink, mut stream) = socket.split();

    // Replies and broadcasts share one outbox so frames reach the socket in order.
    let writer = tokio::spawn(async move {
        while let Some(message) = receiver.recv().await {
            if sink.send(Message::Binary(message.encode().into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                debug!(session = id, "websocket error: {}", e);
                break;
            }
        };

        match frame {
            Message::Binary(data) => {
                match coordinator
                    .handle_frame(&workspace_id, &doc_id, id, &data)
                    .await
                {
                    Ok(replies) => {
                        for reply in replies {
                            if sender.send(reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(e) => warn!(
                        workspace_id = %workspace_id,
                        doc_id = %doc_id,
                        session = id,
                        code = e.code(),
                        "frame rejected: {}",
                        e
                    ),
                }
            }
            Message::Close(_) => break,
            // Text frames are not part of the protocol; ping/pong is handled by axum.
            _ => {}
        }
    }

    drop(sender);
    if let Err(e) = coordinator.leave(&workspace_id, &doc_id, id).await {
        warn!(
            workspace_id = %workspace_id,
            doc_id = %doc_id,
            session = id,
            code = e.code(),
            "failed to release document on leave: {}",
            e
        );
    }
    let _ = writer.await;
    info!(workspace_id = %workspace_id, doc_id = %doc_id, session = id, "sync session closed");
}
