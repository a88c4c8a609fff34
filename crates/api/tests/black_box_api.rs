use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use docflow_api::app::{build_app, build_services, AppServices, Background};
use docflow_infra::AppConfig;
use reqwest::StatusCode;
use serde_json::{json, Value};

const SAMPLE: &str = "Quarterly report\nRevenue 120 million\nOperating margin 14 percent\n";

struct TestServer {
    base_url: String,
    services: Arc<AppServices>,
    background: Option<Background>,
    _dir: tempfile::TempDir,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    /// Server with workers and reaper running.
    async fn spawn() -> Self {
        let mut srv = Self::spawn_idle().await;
        srv.start_workers();
        srv
    }

    /// Server that accepts submissions but processes nothing until `start_workers`.
    async fn spawn_idle() -> Self {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let documents = dir.path().join("data");
        std::fs::create_dir_all(&documents).unwrap();
        std::fs::write(documents.join("sample.txt"), SAMPLE).unwrap();

        let env: HashMap<&str, String> = HashMap::from([
            ("ANALYZER", "offline".to_string()),
            ("DOCUMENTS_DIR", documents.display().to_string()),
            ("OUTPUT_DIR", dir.path().join("output").display().to_string()),
            ("DEFAULT_DOCUMENT", "sample.txt".to_string()),
            ("WORKER_COUNT", "2".to_string()),
            ("CONSUME_WAIT_MS", "50".to_string()),
        ]);
        let config = AppConfig::from_lookup(|key| env.get(key).cloned()).unwrap();
        let services = Arc::new(build_services(config).await.unwrap());

        // Same router as prod, bound to an ephemeral port.
        let app = build_app(services.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{}", addr),
            services,
            background: None,
            _dir: dir,
            handle,
        }
    }

    fn start_workers(&mut self) {
        self.background = Some(self.services.start());
    }

    fn documents_dir(&self) -> PathBuf {
        self.services.config.documents_dir.clone()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn submit(client: &reqwest::Client, srv: &TestServer, body: Value) -> (StatusCode, Value) {
    let res = client.post(srv.url("/jobs")).json(&body).send().await.unwrap();
    let status = res.status();
    (status, res.json().await.unwrap())
}

async fn wait_for_state(client: &reqwest::Client, srv: &TestServer, id: &str, state: &str) -> Value {
    for _ in 0..200 {
        let body: Value = client
            .get(srv.url(&format!("/jobs/{id}/status")))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if body["state"] == state {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("job {id} did not reach {state} in time");
}

#[tokio::test]
async fn health_reports_ok() {
    let srv = TestServer::spawn().await;
    let res = reqwest::get(srv.url("/health")).await.unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn submitted_job_runs_to_completion() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let (status, body) = submit(&client, &srv, json!({"query": "Summarize revenue", "file_ref": "sample.txt"})).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["existed"], false);
    let id = body["job_id"].as_str().unwrap().to_string();

    let done = wait_for_state(&client, &srv, &id, "completed").await;
    assert_eq!(done["attempt"], 1);

    let res = client.get(srv.url(&format!("/jobs/{id}/result"))).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["state"], "completed");
    assert!(body["result"]["analysis_text"].as_str().unwrap().contains("Summarize revenue"));
    let artifact = body["result"]["artifact_path"].as_str().unwrap();
    assert!(Path::new(artifact).exists(), "missing artifact {artifact}");

    let job: Value = client
        .get(srv.url(&format!("/jobs/{id}")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(job["state"], "completed");
    assert!(job["lease"].is_null());
}

#[tokio::test]
async fn idempotency_key_returns_the_same_job() {
    let srv = TestServer::spawn_idle().await;
    let client = reqwest::Client::new();
    let body = json!({"query": "Summarize", "file_ref": "sample.txt", "idempotency_key": "client-42"});

    let (first_status, first) = submit(&client, &srv, body.clone()).await;
    let (second_status, second) = submit(&client, &srv, body).await;

    assert_eq!(first_status, StatusCode::ACCEPTED);
    assert_eq!(second_status, StatusCode::ACCEPTED);
    assert_eq!(first["job_id"], second["job_id"]);
    assert_eq!(second["existed"], true);

    let jobs: Value = reqwest::get(srv.url("/jobs")).await.unwrap().json().await.unwrap();
    assert_eq!(jobs.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn invalid_submissions_are_rejected() {
    let srv = TestServer::spawn_idle().await;
    let client = reqwest::Client::new();

    let (status, body) = submit(&client, &srv, json!({"query": "   ", "file_ref": "sample.txt"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");

    let (status, _) = submit(&client, &srv, json!({"query": "Summarize", "file_ref": "missing.pdf"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = submit(&client, &srv, json!({"query": "Summarize", "file_ref": "../etc/passwd"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let jobs: Value = reqwest::get(srv.url("/jobs")).await.unwrap().json().await.unwrap();
    assert!(jobs.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn unknown_and_malformed_ids() {
    let srv = TestServer::spawn_idle().await;

    let res = reqwest::get(srv.url("/jobs/not-a-uuid/status")).await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "invalid_id");

    let missing = uuid::Uuid::now_v7();
    let res = reqwest::get(srv.url(&format!("/jobs/{missing}/result"))).await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn result_is_accepted_while_pending() {
    let srv = TestServer::spawn_idle().await;
    let client = reqwest::Client::new();

    let (_, body) = submit(&client, &srv, json!({"query": "Summarize", "file_ref": "sample.txt"})).await;
    let id = body["job_id"].as_str().unwrap();

    let res = client.get(srv.url(&format!("/jobs/{id}/result"))).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["state"], "pending");

    // Only running jobs can be cancelled.
    let res = client.post(srv.url(&format!("/jobs/{id}/cancel"))).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
    let res = client.post(srv.url(&format!("/jobs/{id}/retry"))).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn failed_job_reports_error_and_can_be_retried() {
    let mut srv = TestServer::spawn_idle().await;
    let client = reqwest::Client::new();
    let document = srv.documents_dir().join("sample.txt");

    let (_, body) = submit(&client, &srv, json!({"query": "Summarize", "file_ref": "sample.txt"})).await;
    let id = body["job_id"].as_str().unwrap().to_string();

    // Gone before any worker picks it up: permanent failure.
    std::fs::remove_file(&document).unwrap();
    srv.start_workers();
    wait_for_state(&client, &srv, &id, "failed").await;

    let res = client.get(srv.url(&format!("/jobs/{id}/result"))).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"]["kind"], "permanent");

    std::fs::write(&document, SAMPLE).unwrap();
    let res = client.post(srv.url(&format!("/jobs/{id}/retry"))).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);

    let done = wait_for_state(&client, &srv, &id, "completed").await;
    assert_eq!(done["attempt"], 2);
}

#[tokio::test]
async fn multipart_upload_is_stored_and_analyzed() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let form = reqwest::multipart::Form::new().part(
        "file",
        reqwest::multipart::Part::bytes(SAMPLE.as_bytes().to_vec()).file_name("q3.txt"),
    );
    let res = client.post(srv.url("/analyze")).multipart(form).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let body: Value = res.json().await.unwrap();
    let id = body["job_id"].as_str().unwrap().to_string();

    wait_for_state(&client, &srv, &id, "completed").await;
    let job: Value = client
        .get(srv.url(&format!("/jobs/{id}")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(job["query"], "Analyze this financial document for investment insights");
    let file_ref = job["file_ref"].as_str().unwrap();
    assert!(file_ref.starts_with("uploads/") && file_ref.ends_with(".txt"));
    assert!(srv.documents_dir().join(file_ref).exists());

    let res = client
        .post(srv.url("/analyze"))
        .multipart(reqwest::multipart::Form::new().text("query", "no file"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

fn upload_form(query: Option<&str>, key: Option<&str>) -> reqwest::multipart::Form {
    let mut form = reqwest::multipart::Form::new().part(
        "file",
        reqwest::multipart::Part::bytes(SAMPLE.as_bytes().to_vec()).file_name("q3.txt"),
    );
    if let Some(query) = query {
        form = form.text("query", query.to_string());
    }
    if let Some(key) = key {
        form = form.text("idempotency_key", key.to_string());
    }
    form
}

#[tokio::test]
async fn blank_queries_fall_back_to_the_default_question() {
    let srv = TestServer::spawn_idle().await;
    let client = reqwest::Client::new();

    let res = client
        .post(srv.url("/analyze"))
        .multipart(upload_form(Some(""), None))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let upload: Value = res.json().await.unwrap();

    let res = client
        .post(srv.url("/analyze-default"))
        .json(&json!({"query": "   "}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let default: Value = res.json().await.unwrap();

    for body in [upload, default] {
        let id = body["job_id"].as_str().unwrap();
        let job: Value = client
            .get(srv.url(&format!("/jobs/{id}")))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(job["query"], "Analyze this financial document for investment insights");
    }
}

#[tokio::test]
async fn repeated_keyed_uploads_keep_one_file() {
    let srv = TestServer::spawn_idle().await;
    let client = reqwest::Client::new();

    let mut ids = Vec::new();
    for _ in 0..3 {
        let res = client
            .post(srv.url("/analyze"))
            .multipart(upload_form(Some("Summarize"), Some("k1")))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::ACCEPTED);
        let body: Value = res.json().await.unwrap();
        ids.push(body["job_id"].as_str().unwrap().to_string());
    }
    assert!(ids.iter().all(|id| *id == ids[0]));

    let stored = std::fs::read_dir(srv.documents_dir().join("uploads")).unwrap().count();
    assert_eq!(stored, 1);
}

#[tokio::test]
async fn default_document_analysis() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client.post(srv.url("/analyze-default")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let body: Value = res.json().await.unwrap();
    let id = body["job_id"].as_str().unwrap().to_string();

    wait_for_state(&client, &srv, &id, "completed").await;
    let job: Value = client
        .get(srv.url(&format!("/jobs/{id}")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(job["file_ref"], "sample.txt");
}

#[tokio::test]
async fn listing_filters_by_state_and_stats_count() {
    let srv = TestServer::spawn_idle().await;
    let client = reqwest::Client::new();
    for n in 0..3 {
        submit(&client, &srv, json!({"query": format!("q{n}"), "file_ref": "sample.txt"})).await;
    }

    let pending: Value = reqwest::get(srv.url("/jobs?state=pending")).await.unwrap().json().await.unwrap();
    assert_eq!(pending.as_array().unwrap().len(), 3);
    let running: Value = reqwest::get(srv.url("/jobs?state=running")).await.unwrap().json().await.unwrap();
    assert!(running.as_array().unwrap().is_empty());

    let res = reqwest::get(srv.url("/jobs?state=paused")).await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "invalid_state");

    let stats: Value = reqwest::get(srv.url("/stats")).await.unwrap().json().await.unwrap();
    assert_eq!(stats["jobs"]["pending"], 3);
    assert_eq!(stats["total"], 3);
    assert_eq!(stats["workers"]["claimed"], 0);
}

#[tokio::test]
async fn stream_pushes_state_changes() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let mut stream = client.get(srv.url("/stream")).send().await.unwrap();
    assert_eq!(stream.status(), StatusCode::OK);

    let (_, body) = submit(&client, &srv, json!({"query": "Summarize", "file_ref": "sample.txt"})).await;
    let id = body["job_id"].as_str().unwrap().to_string();

    let mut seen = String::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !seen.contains("\"state\":\"completed\"") {
        let chunk = tokio::time::timeout_at(deadline, stream.chunk())
            .await
            .expect("no completion event in time")
            .unwrap()
            .expect("stream ended");
        seen.push_str(&String::from_utf8_lossy(&chunk));
    }

    assert!(seen.contains("event: job.state"));
    assert!(seen.contains(&id));
    assert!(seen.contains("\"state\":\"pending\""));
}
