//! Live progress over WebSocket, plus a REST snapshot.
//!
//! `GET /ws/progress` replays the current run log and then streams
//! [`ProgressMessage`]s as JSON text frames. `GET /api/progress` returns the
//! current log and derived metrics.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use super::{ProgressLog, ProgressMessage, ProgressMetrics, ProgressReporter};

/// Body of `GET /api/progress`.
#[derive(Debug, Serialize)]
pub struct ProgressSnapshot {
    pub log: Option<ProgressLog>,
    pub metrics: Option<ProgressMetrics>,
}

/// Build the progress router.
pub fn progress_routes(reporter: Arc<ProgressReporter>) -> Router {
    Router::new()
        .route("/ws/progress", get(ws_handler))
        .route("/api/progress", get(snapshot_handler))
        .layer(CorsLayer::permissive())
        .with_state(reporter)
}

async fn snapshot_handler(State(reporter): State<Arc<ProgressReporter>>) -> impl IntoResponse {
    let log = reporter.snapshot().await;
    let metrics = log.as_ref().map(|l| l.metrics(Utc::now()));
    Json(ProgressSnapshot { log, metrics })
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(reporter): State<Arc<ProgressReporter>>,
) -> impl IntoResponse {
    info!("Progress WebSocket client connecting");
    ws.on_upgrade(move |socket| handle_socket(socket, reporter))
}

async fn handle_socket(mut socket: WebSocket, reporter: Arc<ProgressReporter>) {
    // History and live stream are split atomically: nothing is lost or
    // replayed twice.
    let (log, mut rx) = reporter.observe().await;

    if let Some(log) = log {
        let mut replay = vec![ProgressMessage::RunStarted {
            run_id: log.run_id,
            kind: log.kind,
            total: log.total,
            started_at: log.started_at,
        }];
        replay.extend(log.events.iter().cloned().map(|event| ProgressMessage::Event {
            run_id: log.run_id,
            event,
        }));
        for msg in replay {
            if send_json(&mut socket, &msg).await.is_err() {
                warn!("Failed to replay progress log, client disconnected");
                return;
            }
        }
    }

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(msg) => {
                        if send_json(&mut socket, &msg).await.is_err() {
                            debug!("Progress WS client disconnected during send");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "Progress WS client lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Progress broadcast channel closed");
                        break;
                    }
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Progress WebSocket client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Progress WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }
}

async fn send_json(socket: &mut WebSocket, msg: &ProgressMessage) -> Result<(), ()> {
    let json = serde_json::to_string(msg).map_err(|e| {
        warn!(error = %e, "Failed to serialize progress message");
    })?;
    socket
        .send(Message::Text(json.into()))
        .await
        .map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{EventKind, RunKind};
    use crate::recipients::RecipientId;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn snapshot_without_run_is_empty() {
        let reporter = Arc::new(ProgressReporter::new());
        let app = progress_routes(reporter);
        let response = app
            .oneshot(Request::get("/api/progress").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(json["log"].is_null());
        assert!(json["metrics"].is_null());
    }

    #[tokio::test]
    async fn snapshot_reports_metrics() {
        let reporter = Arc::new(ProgressReporter::new());
        reporter.start_run(RunKind::Generation, 2).await;
        reporter
            .emit(EventKind::Success, "ok", Some(RecipientId::new("a")))
            .await;

        let app = progress_routes(Arc::clone(&reporter));
        let response = app
            .oneshot(Request::get("/api/progress").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["metrics"]["succeeded"], 1);
        assert_eq!(json["metrics"]["total"], 2);
        assert_eq!(json["log"]["events"][0]["kind"], "success");
    }

    #[test]
    fn progress_message_serde_tag() {
        let msg = ProgressMessage::RunFinished {
            run_id: uuid::Uuid::new_v4(),
            finished_at: Utc::now(),
            summary: "1 of 1 succeeded".into(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"run_finished\""));
        let parsed: ProgressMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.run_id(), msg.run_id());
    }
}
