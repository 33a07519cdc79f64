use std::time::Duration;

use reqwest::StatusCode;
use serde_json::{json, Value};

use retrier_api::app::{build_app, services::AppRuntime};
use retrier_api::config::AppConfig;
use retrier_infra::runs::RetryOptions;

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
    runtime: Option<AppRuntime>,
}

impl TestServer {
    async fn spawn() -> Self {
        // Same router as prod, in-memory store, fast backoffs, ephemeral port.
        let config = AppConfig {
            worker_poll_interval: Duration::from_millis(5),
            defaults: RetryOptions::default()
                .with_initial_backoff_ms(10.0)
                .with_wait_backoff_ms(10.0)
                .with_max_failures(2),
            ..AppConfig::default()
        };
        let runtime = AppRuntime::start(&config).await.expect("failed to start services");
        let app = build_app(runtime.services.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            handle,
            runtime: Some(runtime),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown();
        }
    }
}

async fn start_run(client: &reqwest::Client, server: &TestServer, body: Value) -> String {
    let res = client
        .post(server.url("/runs"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let body: Value = res.json().await.unwrap();
    body["run_id"].as_str().unwrap().to_string()
}

async fn status_eventually_completed(
    client: &reqwest::Client,
    server: &TestServer,
    run_id: &str,
) -> Value {
    // Attempts and checks run on the worker thread; poll until the run finalizes.
    for _ in 0..200 {
        let res = client
            .get(server.url(&format!("/runs/{run_id}")))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let status: Value = res.json().await.unwrap();
        if status["state"] == "completed" {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    panic!("run {run_id} did not complete within timeout");
}

#[tokio::test]
async fn health_is_public() {
    let server = TestServer::spawn().await;
    let res = reqwest::get(server.url("/health")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn successful_run_completes_and_can_be_cleaned_up() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let run_id = start_run(
        &client,
        &server,
        json!({ "action": "example.my_action", "args": { "action": "succeed" } }),
    )
    .await;

    let status = status_eventually_completed(&client, &server, &run_id).await;
    assert_eq!(status["result"]["type"], "success");

    let record: Value = client
        .get(server.url(&format!("/runs/{run_id}/record")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(record["attempts"], 1);
    assert_eq!(record["state"], "completed");

    let res = client
        .delete(server.url(&format!("/runs/{run_id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);

    let res = client
        .get(server.url(&format!("/runs/{run_id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn failing_run_exhausts_its_budget() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let run_id = start_run(
        &client,
        &server,
        json!({
            "action": "example.my_action",
            "args": { "action": "fail always" },
            "options": { "max_failures": 1 }
        }),
    )
    .await;

    let status = status_eventually_completed(&client, &server, &run_id).await;
    assert_eq!(status["result"]["type"], "failed");
    assert_eq!(status["result"]["error"], "action failed.");

    let record: Value = client
        .get(server.url(&format!("/runs/{run_id}/record")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(record["attempts"], 2);
}

#[tokio::test]
async fn unknown_and_malformed_ids() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .get(server.url(&format!("/runs/{}", uuid_like())))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "not_found");

    let res = client.get(server.url("/runs/not-a-uuid")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client
        .post(server.url(&format!("/runs/{}/cancel", uuid_like())))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

fn uuid_like() -> &'static str {
    "0190f5d4-8f3a-7c2e-9b1d-3e4f5a6b7c8d"
}

#[tokio::test]
async fn invalid_options_are_rejected() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .post(server.url("/runs"))
        .json(&json!({
            "action": "example.my_action",
            "args": { "action": "succeed" },
            "options": { "initial_backoff_ms": -5.0 }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "validation_error");

    let res = client
        .post(server.url("/runs"))
        .json(&json!({ "action": "  " }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn cancel_pending_run_and_cleanup_guard() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    // Far enough out that neither the attempt nor its first check runs during the test.
    let run_id = start_run(
        &client,
        &server,
        json!({
            "action": "example.my_action",
            "args": { "action": "succeed" },
            "options": { "run_after_ms": 600000 }
        }),
    )
    .await;

    let res = client
        .delete(server.url(&format!("/runs/{run_id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "not_completed");

    let res = client
        .post(server.url(&format!("/runs/{run_id}/cancel")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["accepted"], true);

    let record: Value = client
        .get(server.url(&format!("/runs/{run_id}/record")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(record["cancel_requested"], true);
    assert_eq!(record["state"], "in_progress");
}

#[tokio::test]
async fn cancel_after_completion_is_not_accepted() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let run_id = start_run(
        &client,
        &server,
        json!({ "action": "example.my_action", "args": { "action": "succeed" } }),
    )
    .await;
    status_eventually_completed(&client, &server, &run_id).await;

    let body: Value = client
        .post(server.url(&format!("/runs/{run_id}/cancel")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["accepted"], false);
}

#[tokio::test]
async fn kickoff_starts_demo_run_and_stats_count_it() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .post(server.url("/examples/my_action"))
        .json(&json!({ "action": "succeed" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let body: Value = res.json().await.unwrap();
    let run_id = body["run_id"].as_str().unwrap().to_string();

    let status = status_eventually_completed(&client, &server, &run_id).await;
    assert_eq!(status["result"]["type"], "success");

    let stats: Value = client
        .get(server.url("/stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["store"], "in_memory");
    assert_eq!(stats["runs"]["total"], 1);
    assert_eq!(stats["runs"]["succeeded"], 1);
    assert!(stats["worker"]["jobs_processed"].as_u64().unwrap() >= 1);
}
