//! Integration tests for the progress WebSocket + REST surface.
//!
//! Each test spins up an Axum server on a random port, connects via
//! tokio-tungstenite, and exercises the real WS / REST contract.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use outreach::config::PipelineConfig;
use outreach::error::GenerationError;
use outreach::generation::{
    BatchOrchestrator, CancelFlag, ContentGenerator, GeneratedContent, GenerationParams,
    GenerationRequest, GenerationResponse,
};
use outreach::progress::ws::progress_routes;
use outreach::progress::{ProgressReporter, RunKind};
use outreach::recipients::{Recipient, RecipientId};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Generator that answers every recipient, no network involved.
struct EchoGenerator;

#[async_trait]
impl ContentGenerator for EchoGenerator {
    fn name(&self) -> &str {
        "echo"
    }

    async fn generate_batch(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, GenerationError> {
        Ok(GenerationResponse {
            results: request
                .recipients
                .iter()
                .map(|r| GeneratedContent {
                    recipient_id: r.recipient_id.clone(),
                    success: true,
                    subject: "Hi".into(),
                    body: format!("Hello {}", r.name),
                    scraped_info: None,
                    error: None,
                })
                .collect(),
        })
    }
}

/// Start an Axum server on a random port, return (port, reporter).
async fn start_server() -> (u16, Arc<ProgressReporter>) {
    let reporter = Arc::new(ProgressReporter::new());
    let app = progress_routes(Arc::clone(&reporter));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    (port, reporter)
}

/// Parse a WS text frame into a serde_json::Value.
fn parse_ws_json(msg: &Message) -> Value {
    match msg {
        Message::Text(txt) => serde_json::from_str(txt).expect("invalid JSON from server"),
        other => panic!("expected Text frame, got {:?}", other),
    }
}

fn recipients(n: usize) -> Vec<Recipient> {
    (0..n)
        .map(|i| {
            Recipient::catalog(
                format!("org-{i}"),
                format!("Org {i}"),
                Some(format!("org{i}@example.com")),
            )
        })
        .collect()
}

// ── WebSocket Tests ──────────────────────────────────────────────────

#[tokio::test]
async fn ws_replays_current_run_on_connect() {
    timeout(TEST_TIMEOUT, async {
        let (port, reporter) = start_server().await;

        let run_id = reporter.start_run(RunKind::Generation, 3).await;
        reporter.processing("Generating batch 1 of 1").await;
        reporter.success(&RecipientId::new("org-0"), "Generated message for Org 0").await;

        let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{port}/ws/progress"))
            .await
            .expect("WS connect failed");

        let started = parse_ws_json(&ws.next().await.unwrap().unwrap());
        assert_eq!(started["type"], "run_started");
        assert_eq!(started["run_id"], run_id.to_string());
        assert_eq!(started["kind"], "generation");
        assert_eq!(started["total"], 3);

        let first = parse_ws_json(&ws.next().await.unwrap().unwrap());
        assert_eq!(first["type"], "event");
        assert_eq!(first["event"]["kind"], "processing");

        let second = parse_ws_json(&ws.next().await.unwrap().unwrap());
        assert_eq!(second["event"]["kind"], "success");
        assert_eq!(second["event"]["recipient_id"], "org-0");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn ws_receives_live_events() {
    timeout(TEST_TIMEOUT, async {
        let (port, reporter) = start_server().await;
        reporter.start_run(RunKind::Dispatch, 1).await;

        let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{port}/ws/progress"))
            .await
            .unwrap();

        // Consume the replayed run_started; the handler is subscribed by now.
        let _ = ws.next().await.unwrap().unwrap();

        reporter
            .error(Some(&RecipientId::new("org-9")), "Failed to send to org9@example.com")
            .await;
        let msg = parse_ws_json(&ws.next().await.unwrap().unwrap());
        assert_eq!(msg["type"], "event");
        assert_eq!(msg["event"]["kind"], "error");
        assert_eq!(msg["event"]["recipient_id"], "org-9");

        reporter.finish_run().await;
        let finished = parse_ws_json(&ws.next().await.unwrap().unwrap());
        assert_eq!(finished["type"], "run_finished");
        assert_eq!(finished["summary"], "0 of 1 succeeded");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn ws_streams_a_whole_generation_run() {
    timeout(TEST_TIMEOUT, async {
        let (port, reporter) = start_server().await;
        // A finished placeholder run gives the handler something to replay.
        reporter.start_run(RunKind::Generation, 0).await;
        reporter.finish_run().await;

        let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{port}/ws/progress"))
            .await
            .unwrap();
        let _ = ws.next().await.unwrap().unwrap();

        let orchestrator = BatchOrchestrator::new(
            Arc::new(EchoGenerator),
            Arc::clone(&reporter),
            PipelineConfig::unpaced(),
        );
        let run = orchestrator
            .run(&recipients(7), &[], &GenerationParams::default(), false, &CancelFlag::new())
            .await;
        assert_eq!(run.succeeded(), 7);

        let mut kinds = Vec::new();
        loop {
            let json = parse_ws_json(&ws.next().await.unwrap().unwrap());
            if json["type"] == "run_finished" {
                assert_eq!(json["run_id"], run.run_id.to_string());
                break;
            }
            if json["type"] == "event" {
                kinds.push(json["event"]["kind"].as_str().unwrap().to_string());
            }
        }
        assert_eq!(kinds.iter().filter(|k| *k == "processing").count(), 2);
        assert_eq!(kinds.iter().filter(|k| *k == "success").count(), 7);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn ws_answers_ping() {
    timeout(TEST_TIMEOUT, async {
        let (port, reporter) = start_server().await;
        reporter.start_run(RunKind::Generation, 1).await;

        let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{port}/ws/progress"))
            .await
            .unwrap();
        let _ = ws.next().await.unwrap().unwrap();

        ws.send(Message::Ping(b"hi".to_vec().into())).await.unwrap();
        let msg = ws.next().await.unwrap().unwrap();
        assert!(matches!(msg, Message::Pong(_)));
    })
    .await
    .expect("test timed out");
}

// ── REST Tests ───────────────────────────────────────────────────────

#[tokio::test]
async fn rest_snapshot_reports_metrics() {
    timeout(TEST_TIMEOUT, async {
        let (port, reporter) = start_server().await;
        reporter.start_run(RunKind::Generation, 4).await;
        reporter.success(&RecipientId::new("a"), "ok").await;
        reporter.error(Some(&RecipientId::new("b")), "failed").await;

        let resp = reqwest::get(format!("http://127.0.0.1:{port}/api/progress"))
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let json: Value = resp.json().await.unwrap();
        assert_eq!(json["log"]["events"].as_array().unwrap().len(), 2);
        assert_eq!(json["metrics"]["completed"], 2);
        assert_eq!(json["metrics"]["succeeded"], 1);
        assert_eq!(json["metrics"]["failed"], 1);
        assert_eq!(json["metrics"]["finished"], false);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn rest_snapshot_without_run_is_empty() {
    timeout(TEST_TIMEOUT, async {
        let (port, _reporter) = start_server().await;

        let json: Value = reqwest::get(format!("http://127.0.0.1:{port}/api/progress"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(json["log"].is_null());
        assert!(json["metrics"].is_null());
    })
    .await
    .expect("test timed out");
}
