//! Integration tests for the admin REST API.
//!
//! Each test starts a coordinator run loop plus an Axum server on a random
//! port and drives it over HTTP with reqwest.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use quizgen_worker::admin::admin_routes;
use quizgen_worker::ai::{GeneratedQuestion, GenerationRequest, QuestionGenerator};
use quizgen_worker::config::WorkerConfig;
use quizgen_worker::error::{GenerationError, WorkerError};
use quizgen_worker::store::{Database, LearnerProfile, LibSqlBackend};
use quizgen_worker::worker::WorkerCoordinator;
use quizgen_worker::worker::model::LearningPreferences;

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Stub generator for integration tests (no real API calls).
#[derive(Default)]
struct StubGenerator {
    calls: AtomicUsize,
}

#[async_trait]
impl QuestionGenerator for StubGenerator {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GeneratedQuestion, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(GeneratedQuestion {
            language: request.language.clone(),
            level: request.level.clone(),
            topic: request.topic.clone(),
            question_type: request.question_type,
            content: serde_json::json!({"question": "stub"}),
        })
    }
}

struct TestServer {
    base: String,
    generator: Arc<StubGenerator>,
    shutdown: CancellationToken,
    worker: JoinHandle<Result<(), WorkerError>>,
}

/// Start a coordinator and its admin server on a random port.
async fn start_server() -> TestServer {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    for topic in ["animals", "colors", "family"] {
        db.add_topic("french", "A1", topic).await.unwrap();
    }
    let profile = LearnerProfile {
        user_id: 1,
        username: "marie".to_string(),
        language: "french".to_string(),
        level: "A1".to_string(),
        ai_provider: "ollama".to_string(),
        ai_model: String::new(),
        ai_api_key: None,
    };
    let preferences = LearningPreferences {
        daily_goal: 2,
        ..Default::default()
    };
    db.upsert_learner(&profile, &preferences, true).await.unwrap();

    let config = WorkerConfig {
        instance: "api-test".to_string(),
        admin_port: None,
        cycle_interval: Duration::from_secs(3600),
        heartbeat_interval: Duration::from_millis(50),
        ..Default::default()
    };
    let generator = Arc::new(StubGenerator::default());
    let coordinator = WorkerCoordinator::new(config, db, generator.clone())
        .await
        .unwrap();
    let app = admin_routes(coordinator.handle());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let shutdown = CancellationToken::new();
    let worker = tokio::spawn(coordinator.run(shutdown.clone()));

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestServer {
        base: format!("http://127.0.0.1:{port}"),
        generator,
        shutdown,
        worker,
    }
}

async fn get_json(client: &reqwest::Client, url: &str) -> Value {
    client.get(url).send().await.unwrap().json().await.unwrap()
}

async fn post(client: &reqwest::Client, url: &str) -> (u16, Value) {
    let resp = client.post(url).send().await.unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap())
}

/// Poll `url` until `done` accepts the body.
async fn wait_for(client: &reqwest::Client, url: &str, done: impl Fn(&Value) -> bool) -> Value {
    loop {
        let body = get_json(client, url).await;
        if done(&body) {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn pause_trigger_resume_lifecycle() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let client = reqwest::Client::new();
        let runs_url = format!("{}/api/worker/runs", server.base);
        let status_url = format!("{}/api/worker/status", server.base);

        // The first cycle runs on startup and meets the daily goal.
        let runs = wait_for(&client, &runs_url, |b| b.as_array().is_some_and(|r| !r.is_empty())).await;
        assert_eq!(runs[0]["generated"], 2);
        assert_eq!(server.generator.calls.load(Ordering::SeqCst), 2);
        wait_for(&client, &status_url, |b| b["state"] == "idle").await;

        let (code, body) = post(&client, &format!("{}/api/worker/pause", server.base)).await;
        assert_eq!(code, 200);
        assert_eq!(body["scope"], "global");

        let (code, body) = post(&client, &format!("{}/api/worker/trigger", server.base)).await;
        assert_eq!(code, 202);
        assert_eq!(body["result"], "accepted");
        let status = wait_for(&client, &status_url, |b| b["state"] == "paused").await;
        assert_eq!(status["status"]["is_paused"], true);

        post(&client, &format!("{}/api/worker/resume", server.base)).await;
        let (code, _) = post(&client, &format!("{}/api/worker/trigger", server.base)).await;
        assert_eq!(code, 202);
        let runs = wait_for(&client, &runs_url, |b| b.as_array().is_some_and(|r| r.len() == 2)).await;
        // Daily goal already met: the second run generates nothing.
        assert_eq!(runs[0]["generated"], 0);
        assert_eq!(server.generator.calls.load(Ordering::SeqCst), 2);

        server.shutdown.cancel();
        server.worker.await.unwrap().unwrap();

        let status = get_json(&client, &status_url).await;
        assert_eq!(status["state"], "stopped");
        assert_eq!(status["status"]["is_running"], false);
        let (code, body) = post(&client, &format!("{}/api/worker/trigger", server.base)).await;
        assert_eq!(code, 409);
        assert_eq!(body["result"], "rejected");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn health_lists_the_live_instance() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let client = reqwest::Client::new();
        let url = format!("{}/api/worker/health", server.base);

        let health = wait_for(&client, &url, |b| b["healthy_count"] == 1).await;
        assert_eq!(health["total_count"], 1);
        assert_eq!(health["global_paused"], false);
        assert_eq!(health["instances"][0]["instance"], "api-test");
        assert_eq!(health["instances"][0]["healthy"], true);

        let concurrency = get_json(&client, &format!("{}/api/worker/concurrency", server.base)).await;
        assert!(concurrency["total_limit"].as_u64().unwrap() >= 1);

        server.shutdown.cancel();
        server.worker.await.unwrap().unwrap();
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn instance_pause_and_user_priority() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let client = reqwest::Client::new();

        let (code, body) = post(&client, &format!("{}/api/worker/instance/pause", server.base)).await;
        assert_eq!(code, 200);
        assert_eq!(body["instance"], "api-test");

        let (code, _) = post(&client, &format!("{}/api/worker/users/1/pause", server.base)).await;
        assert_eq!(code, 200);
        let report = get_json(&client, &format!("{}/api/worker/users/1/priority", server.base)).await;
        assert_eq!(report["report"]["paused"], true);
        assert_eq!(report["report"]["daily_goal"], 2);

        let resp = client
            .get(format!("{}/api/worker/users/999/priority", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 404);

        let (code, _) = post(&client, &format!("{}/api/worker/instance/resume", server.base)).await;
        assert_eq!(code, 200);

        server.shutdown.cancel();
        server.worker.await.unwrap().unwrap();
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn cors_headers_are_present() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let resp = reqwest::Client::new()
            .get(format!("{}/health", server.base))
            .header("Origin", "http://dashboard.local")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        assert_eq!(
            resp.headers()
                .get("access-control-allow-origin")
                .and_then(|v| v.to_str().ok()),
            Some("*")
        );

        server.shutdown.cancel();
        server.worker.await.unwrap().unwrap();
    })
    .await
    .expect("test timed out");
}
