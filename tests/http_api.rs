mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;

use arkfleet::cluster::{ClusterService, MemoryStore};
use arkfleet::config::LifecycleConfig;
use arkfleet::runtime::{ArtifactWriter, FsSnapshotStore, JobTracker, LifecycleOrchestrator, ServerState};
use arkfleet::server::{create_router, AppState};
use common::{FixedLogs, RecordingSupervisor};

struct TestServer {
    base: String,
    client: reqwest::Client,
    supervisor: Arc<RecordingSupervisor>,
    _dir: TempDir,
}

async fn spawn_server() -> TestServer {
    let dir = TempDir::new().unwrap();
    let supervisor = RecordingSupervisor::with_servers(&[]);
    let orchestrator = Arc::new(LifecycleOrchestrator::new(
        supervisor.clone(),
        Arc::new(FsSnapshotStore::new(dir.path().join("servers"), dir.path().join("backups"))),
        LifecycleConfig::default(),
    ));
    let service = ClusterService::new(
        Arc::new(MemoryStore::new()),
        ArtifactWriter::new(dir.path().join("servers")),
        orchestrator,
        JobTracker::in_memory(),
    );
    let logs = Arc::new(FixedLogs(vec!["boot".into(), "Server started".into()]));
    let app = create_router(AppState::new(Arc::new(service), logs));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        base: format!("http://{}", addr),
        client: reqwest::Client::new(),
        supervisor,
        _dir: dir,
    }
}

impl TestServer {
    async fn get(&self, path: &str) -> reqwest::Response {
        self.client.get(format!("{}{}", self.base, path)).send().await.unwrap()
    }

    async fn post(&self, path: &str, body: Value) -> reqwest::Response {
        self.client
            .post(format!("{}{}", self.base, path))
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    async fn wait_for_job(&self, id: &str) -> Value {
        for _ in 0..100 {
            let job: Value = self.get(&format!("/v1/jobs/{}", id)).await.json().await.unwrap();
            if job["status"] != "pending" && job["status"] != "running" {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job {} did not finish", id);
    }
}

#[tokio::test]
async fn create_cluster_then_drive_a_server() {
    let server = spawn_server().await;

    let response = server
        .post(
            "/v1/clusters",
            json!({
                "name": "Main",
                "maps": [{"map": "TheIsland", "count": 1}, {"map": "Ragnarok", "count": 1}],
                "sharedMods": [928102]
            }),
        )
        .await;
    assert_eq!(response.status(), 202);
    let created: Value = response.json().await.unwrap();
    assert_eq!(created["cluster"]["servers"][0]["ports"]["game"], 7777);
    assert_eq!(created["cluster"]["servers"][1]["ports"]["game"], 7778);

    let job = server
        .wait_for_job(created["jobId"].as_str().unwrap())
        .await;
    assert_eq!(job["status"], "completed", "{}", job);
    assert_eq!(job["progress"], 100);
    assert_eq!(
        server.supervisor.state("Main-TheIsland"),
        Some(ServerState::Stopped)
    );

    let servers: Value = server.get("/v1/servers").await.json().await.unwrap();
    assert_eq!(servers["items"].as_array().unwrap().len(), 2);

    let response = server.post("/v1/servers/Main-TheIsland/start", json!({})).await;
    assert_eq!(response.status(), 200);

    let view: Value = server.get("/v1/servers/Main-TheIsland").await.json().await.unwrap();
    assert_eq!(view["status"]["status"], "running");
    assert_eq!(view["spec"]["mods"], json!([928102]));

    let response = server
        .post("/v1/servers/Main-TheIsland/rcon", json!({"command": "ListPlayers"}))
        .await;
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["output"], "ListPlayers ok");

    let logs: Value = server
        .get("/v1/servers/Main-TheIsland/logs?tail=1")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(logs["lines"], json!(["Server started"]));

    let response = server.post("/v1/servers/Main-TheIsland/stop", json!({})).await;
    assert_eq!(response.status(), 200);
    let calls = server.supervisor.calls();
    assert!(calls.contains(&"exec(SaveWorld):Main-TheIsland".to_string()));
}

#[tokio::test]
async fn errors_map_to_status_codes() {
    let server = spawn_server().await;

    let response = server.get("/v1/clusters/nope").await;
    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], false);

    let response = server
        .post(
            "/v1/clusters/plan",
            json!({
                "name": "Bad",
                "maps": [{"map": "TheIsland", "count": 2}],
                "portIncrement": 0
            }),
        )
        .await;
    assert_eq!(response.status(), 409);

    let response = server
        .post(
            "/v1/clusters/plan",
            json!({"name": "Bad", "maps": [{"map": "Atlantis", "count": 1}]}),
        )
        .await;
    assert!(response.status().is_client_error());
}

#[tokio::test]
async fn second_cluster_gets_next_free_ports() {
    let server = spawn_server().await;

    let first = server
        .post(
            "/v1/clusters",
            json!({"name": "A", "maps": [{"map": "TheIsland", "count": 2}]}),
        )
        .await;
    assert_eq!(first.status(), 202);

    let plan: Value = server
        .post(
            "/v1/clusters/plan",
            json!({"name": "B", "maps": [{"map": "TheCenter", "count": 1}]}),
        )
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(plan["servers"][0]["ports"]["game"], 7779);
}

#[tokio::test]
async fn lifecycle_calls_honor_timeout_secs() {
    let server = spawn_server().await;
    let created: Value = server
        .post(
            "/v1/clusters",
            json!({"name": "Slow", "maps": [{"map": "TheIsland", "count": 1}]}),
        )
        .await
        .json()
        .await
        .unwrap();
    server
        .wait_for_job(created["jobId"].as_str().unwrap())
        .await;

    server.supervisor.set_delay(Duration::from_secs(5));
    let started = std::time::Instant::now();
    let response = server
        .post("/v1/servers/Slow-TheIsland/start?timeoutSecs=1", json!({}))
        .await;
    assert_eq!(response.status(), 504);
    assert!(started.elapsed() < Duration::from_secs(4));

    let response = server
        .post("/v1/servers/Slow-TheIsland/restart?timeoutSecs=soon", json!({}))
        .await;
    assert_eq!(response.status(), 400);
}
