//! End-to-end API tests
//!
//! Spin up the full router on an ephemeral port with the in-memory store
//! and a real dispatcher, then drive it over HTTP.

use capstan::store::JobStore;
use capstan::{
    BlobStore, CallbackSender, Dispatcher, DispatcherConfig, MemoryStore, QueueConfig, Sweeper,
};
use nutriscan_parse::{ParserConfig, Pipeline};
use nutriscan_server::limiter::RateGate;
use nutriscan_server::metrics::Metrics;
use nutriscan_server::{build_router, AppState, ServerConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

struct TestApp {
    base: String,
    client: reqwest::Client,
    store: Arc<dyn JobStore>,
    _blob_dir: tempfile::TempDir,
    shutdown: CancellationToken,
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn spawn_app(mutate: impl FnOnce(&mut ServerConfig), dispatcher: bool) -> TestApp {
    let mut config = ServerConfig {
        rate_limit_enabled: false,
        queue: QueueConfig {
            lease_duration: Duration::from_secs(2),
            sweep_interval: Duration::from_millis(200),
            max_attempts: 3,
        },
        sync_deadline: Duration::from_secs(10),
        ..Default::default()
    };
    mutate(&mut config);
    let config = Arc::new(config);

    let store: Arc<dyn JobStore> = Arc::new(MemoryStore::new());
    let blob_dir = tempfile::tempdir().unwrap();
    let blobs = Arc::new(BlobStore::new(blob_dir.path()));
    let pipeline = Arc::new(Pipeline::new(ParserConfig::default()));
    let callbacks = CallbackSender::new(config.callback.clone());
    let metrics = Arc::new(Metrics::new(callbacks.stats()));
    let gate = Arc::new(RateGate::new(
        config.rate_limit_enabled,
        config.rate_per_minute,
        config.rate_per_hour,
    ));
    let wake = Arc::new(Notify::new());
    let shutdown = CancellationToken::new();

    if dispatcher {
        let executor = Arc::new(nutriscan_server::executor::ParseExecutor::new(
            Arc::clone(&blobs),
            Arc::clone(&pipeline),
        ));
        Dispatcher::new(
            Arc::clone(&store),
            executor,
            DispatcherConfig {
                concurrency: 2,
                queue: config.queue.clone(),
                ..Default::default()
            },
            Arc::clone(&wake),
            shutdown.clone(),
        )
        .with_callbacks(callbacks)
        .spawn();
        Sweeper::new(Arc::clone(&store), config.queue.clone(), shutdown.clone()).spawn();
    }

    let state = AppState::new(
        Arc::clone(&store),
        blobs,
        pipeline,
        gate,
        metrics,
        Arc::clone(&config),
        wake,
    );
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    TestApp {
        base: format!("http://{}", addr),
        client: reqwest::Client::new(),
        store,
        _blob_dir: blob_dir,
        shutdown,
    }
}

/// Minimal one-page PDF whose text layer contains `text`.
fn pdf_with_text(text: &str) -> Vec<u8> {
    let mut content = String::new();
    for line in text.lines() {
        let escaped = line
            .replace('\\', "\\\\")
            .replace('(', "\\(")
            .replace(')', "\\)");
        content.push_str(&format!("BT /F1 12 Tf ({}) Tj ET\n", escaped));
    }
    format!(
        "%PDF-1.4\n1 0 obj\n<< /Type /Catalog /Pages 2 0 R >>\nendobj\n\
         2 0 obj\n<< /Type /Pages /Kids [3 0 R] /Count 1 >>\nendobj\n\
         3 0 obj\n<< /Type /Page /Parent 2 0 R /Contents 4 0 R >>\nendobj\n\
         4 0 obj\n<< /Length {} >>\nstream\n{}endstream\nendobj\n%%EOF\n",
        content.len(),
        content
    )
    .into_bytes()
}

fn label_pdf() -> Vec<u8> {
    pdf_with_text(
        "Oat Crunch Bar\nNutrition Facts\nCalories 250\nTotal Fat 10 g\n\
         Protein 6 g\nSodium 120 mg\nTotal Carbohydrates 32 g\nSugars 12 g",
    )
}

fn form(name: &str, bytes: Vec<u8>) -> reqwest::multipart::Form {
    reqwest::multipart::Form::new().part(
        "file",
        reqwest::multipart::Part::bytes(bytes).file_name(name.to_string()),
    )
}

async fn json_of(resp: reqwest::Response) -> serde_json::Value {
    resp.json().await.unwrap()
}

async fn wait_for_terminal(app: &TestApp, job_id: &str) -> serde_json::Value {
    for _ in 0..200 {
        let resp = app
            .client
            .get(format!("{}/parse/status/{}", app.base, job_id))
            .send()
            .await
            .unwrap();
        let body = json_of(resp).await;
        let state = body["data"]["state"].as_str().unwrap_or("").to_string();
        if matches!(state.as_str(), "completed" | "failed" | "cancelled") {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("job {} never reached a terminal state", job_id);
}

#[tokio::test]
async fn async_happy_path_parses_nutrition_label() {
    let app = spawn_app(|_| {}, true).await;

    let resp = app
        .client
        .post(format!("{}/parse/async?parsing_type=auto", app.base))
        .multipart(form("label.pdf", label_pdf()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    assert!(resp.headers().contains_key("x-request-id"));
    assert_eq!(
        resp.headers().get("x-content-type-options").unwrap(),
        "nosniff"
    );

    let body = json_of(resp).await;
    assert_eq!(body["code"], 202);
    let job_id = body["data"]["job_id"].as_str().unwrap().to_string();

    let status = wait_for_terminal(&app, &job_id).await;
    assert_eq!(status["data"]["state"], "completed");
    assert_eq!(status["data"]["progress"], 100);

    let resp = app
        .client
        .get(format!("{}/parse/result/{}", app.base, job_id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body = json_of(resp).await;
    let result = &body["data"]["result"];
    assert_eq!(result["type"], "nutrition_label");
    assert_eq!(result["nutrition"]["calories"]["value"], 250.0);
    assert_eq!(result["nutrition"]["calories"]["unit"], "kcal");
}

#[tokio::test]
async fn sync_parse_returns_result_inline() {
    let app = spawn_app(|_| {}, false).await;

    let resp = app
        .client
        .post(format!(
            "{}/parse/sync?parsing_type=nutrition_label",
            app.base
        ))
        .multipart(form("label.pdf", label_pdf()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let body = json_of(resp).await;
    assert_eq!(body["data"]["result"]["type"], "nutrition_label");

    // The job record is terminal even on the inline path.
    let job_id = body["data"]["job_id"].as_str().unwrap();
    let status = app
        .client
        .get(format!("{}/parse/status/{}", app.base, job_id))
        .send()
        .await
        .unwrap();
    let status_body = json_of(status).await;
    assert_eq!(status_body["data"]["state"], "completed");
}

#[tokio::test]
async fn oversize_sync_upload_recommends_async() {
    let app = spawn_app(
        |config| {
            config.max_sync_file_size = 512;
            config.max_file_size = 50 * 1024 * 1024;
        },
        false,
    )
    .await;

    let big = pdf_with_text(&"padding line for size\n".repeat(100));
    assert!(big.len() > 512);

    let resp = app
        .client
        .post(format!("{}/parse/sync", app.base))
        .multipart(form("big.pdf", big))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 413);

    let body = json_of(resp).await;
    assert_eq!(body["error"]["type"], "too_large");
    assert!(body["message"].as_str().unwrap().contains("/parse/async"));
}

#[tokio::test]
async fn malicious_upload_leaves_no_trace() {
    let app = spawn_app(|_| {}, false).await;

    let mut hostile = label_pdf();
    hostile.extend_from_slice(b"<< /S /JavaScript /JS (app.alert(1)) >>");

    let resp = app
        .client
        .post(format!("{}/parse/async", app.base))
        .multipart(form("evil.pdf", hostile))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body = json_of(resp).await;
    assert_eq!(body["error"]["type"], "suspected_malicious");

    // No job record, no queue entry.
    let (jobs, total) = app
        .store
        .list(&Default::default(), 1, 10)
        .await
        .unwrap();
    assert_eq!(total, 0);
    assert!(jobs.is_empty());
}

#[tokio::test]
async fn result_endpoint_distinguishes_missing_and_deleted() {
    let app = spawn_app(|_| {}, false).await;

    let unknown = uuid::Uuid::new_v4();
    let resp = app
        .client
        .get(format!("{}/parse/result/{}", app.base, unknown))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    // Submit (no dispatcher, so it stays queued), then delete.
    let resp = app
        .client
        .post(format!("{}/parse/async", app.base))
        .multipart(form("label.pdf", label_pdf()))
        .send()
        .await
        .unwrap();
    let job_id = json_of(resp).await["data"]["job_id"]
        .as_str()
        .unwrap()
        .to_string();

    let resp = app
        .client
        .delete(format!("{}/parse/{}", app.base, job_id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    let resp = app
        .client
        .get(format!("{}/parse/result/{}", app.base, job_id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 410);
}

#[tokio::test]
async fn cancel_queued_job_is_immediate() {
    let app = spawn_app(|_| {}, false).await;

    let resp = app
        .client
        .post(format!("{}/parse/async", app.base))
        .multipart(form("label.pdf", label_pdf()))
        .send()
        .await
        .unwrap();
    let job_id = json_of(resp).await["data"]["job_id"]
        .as_str()
        .unwrap()
        .to_string();

    let resp = app
        .client
        .post(format!("{}/parse/{}/cancel", app.base, job_id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(json_of(resp).await["data"]["state"], "cancelled");

    // A second cancel conflicts.
    let resp = app
        .client
        .post(format!("{}/parse/{}/cancel", app.base, job_id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
}

#[tokio::test]
async fn batch_submission_completes_all_jobs() {
    let app = spawn_app(|_| {}, true).await;

    let form = reqwest::multipart::Form::new()
        .part(
            "files",
            reqwest::multipart::Part::bytes(label_pdf()).file_name("a.pdf"),
        )
        .part(
            "files",
            reqwest::multipart::Part::bytes(pdf_with_text(
                "Pancakes\nIngredients\n2 cups flour\nInstructions\n1. Mix the batter well\n2. Fry until golden brown",
            ))
            .file_name("b.pdf"),
        );

    let resp = app
        .client
        .post(format!("{}/parse/batch?parsing_type=auto", app.base))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    let body = json_of(resp).await;
    let batch_id = body["data"]["batch_id"].as_str().unwrap().to_string();
    let job_ids: Vec<String> = body["data"]["job_ids"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    assert_eq!(job_ids.len(), 2);

    for job_id in &job_ids {
        wait_for_terminal(&app, job_id).await;
    }

    let resp = app
        .client
        .get(format!("{}/parse/batch/{}", app.base, batch_id))
        .send()
        .await
        .unwrap();
    let body = json_of(resp).await;
    assert_eq!(body["data"]["totals"]["completed"], 2);
}

#[tokio::test]
async fn history_filters_by_state() {
    let app = spawn_app(|_| {}, false).await;

    for name in ["a.pdf", "b.pdf"] {
        app.client
            .post(format!("{}/parse/async", app.base))
            .multipart(form(name, label_pdf()))
            .send()
            .await
            .unwrap();
    }

    let resp = app
        .client
        .get(format!("{}/parse/history?state=queued&size=10", app.base))
        .send()
        .await
        .unwrap();
    let body = json_of(resp).await;
    assert_eq!(body["data"]["total"], 2);

    let resp = app
        .client
        .get(format!("{}/parse/history?state=completed", app.base))
        .send()
        .await
        .unwrap();
    let body = json_of(resp).await;
    assert_eq!(body["data"]["total"], 0);

    let resp = app
        .client
        .get(format!("{}/parse/history?state=bogus", app.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn health_endpoints_respond() {
    let app = spawn_app(|_| {}, false).await;

    let resp = app
        .client
        .get(format!("{}/health", app.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(json_of(resp).await["status"], "ok");

    let resp = app
        .client
        .get(format!("{}/health/detailed", app.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body = json_of(resp).await;
    assert_eq!(body["components"]["job_store"], "ok");
    assert_eq!(body["components"]["blob_store"], "ok");
}

#[tokio::test]
async fn rate_limit_rejects_with_retry_after() {
    let app = spawn_app(
        |config| {
            config.rate_limit_enabled = true;
            config.rate_per_minute = 2;
            config.rate_per_hour = 1000;
        },
        false,
    )
    .await;

    let mut limited = None;
    for _ in 0..10 {
        let resp = app
            .client
            .get(format!("{}/parse/history", app.base))
            .send()
            .await
            .unwrap();
        if resp.status() == 429 {
            limited = Some(resp);
            break;
        }
    }

    let resp = limited.expect("rate limit never engaged");
    assert!(resp.headers().contains_key("retry-after"));
    let body = json_of(resp).await;
    assert_eq!(body["error"]["type"], "rate_limited");
}

#[tokio::test]
async fn admin_metrics_and_stats() {
    let app = spawn_app(|_| {}, true).await;

    let resp = app
        .client
        .post(format!("{}/parse/async", app.base))
        .multipart(form("label.pdf", label_pdf()))
        .send()
        .await
        .unwrap();
    let job_id = json_of(resp).await["data"]["job_id"]
        .as_str()
        .unwrap()
        .to_string();
    wait_for_terminal(&app, &job_id).await;

    let resp = app
        .client
        .get(format!("{}/admin/metrics", app.base))
        .send()
        .await
        .unwrap();
    let body = json_of(resp).await;
    assert_eq!(body["data"]["process"]["jobs_submitted_total"], 1);
    assert_eq!(body["data"]["store"]["by_state"]["completed"], 1);

    let resp = app
        .client
        .get(format!("{}/admin/stats/real-time", app.base))
        .send()
        .await
        .unwrap();
    let body = json_of(resp).await;
    assert_eq!(body["data"]["completed_today"], 1);
    assert_eq!(body["data"]["success_rate"], 1.0);
}

#[tokio::test]
async fn cleanup_removes_terminal_jobs() {
    let app = spawn_app(|_| {}, true).await;

    let resp = app
        .client
        .post(format!("{}/parse/async", app.base))
        .multipart(form("label.pdf", label_pdf()))
        .send()
        .await
        .unwrap();
    let job_id = json_of(resp).await["data"]["job_id"]
        .as_str()
        .unwrap()
        .to_string();
    wait_for_terminal(&app, &job_id).await;

    let resp = app
        .client
        .post(format!("{}/admin/cleanup", app.base))
        .json(&serde_json::json!({ "days": 0 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body = json_of(resp).await;
    assert_eq!(body["data"]["deleted"], 1);

    let resp = app
        .client
        .get(format!("{}/parse/result/{}", app.base, job_id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 410);
}
