// E2E tests for session discovery, matching and delivery
//
// Runs with signatures disabled and no UI automation service, so every
// delivery has to take the headless path.

use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use talkie_bridge::{ApprovalPolicy, AuthMode, Settings};
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::sleep;

const SESSION_ID: &str = "9e6bb0a4-3f55-4b4e-8f0e-7f1f4d6c2a10";

fn write_project(root: &Path, folder: &str, cwd: &Path) {
    let dir = root.join(folder);
    std::fs::create_dir_all(&dir).unwrap();
    let header = json!({
        "type": "user",
        "sessionId": SESSION_ID,
        "cwd": cwd.to_string_lossy(),
        "message": {"role": "user", "content": "hello"},
    });
    let reply = json!({
        "type": "assistant",
        "message": {"content": [{"type": "text", "text": "hi"}]},
    });
    std::fs::write(
        dir.join(format!("{SESSION_ID}.jsonl")),
        format!("{header}\n{reply}\n"),
    )
    .unwrap();
}

#[tokio::test]
async fn e2e_sessions_are_discovered_and_resolvable() {
    let temp = TempDir::new().unwrap();
    let workdir = temp.path().join("work").join("talkie");
    std::fs::create_dir_all(&workdir).unwrap();
    write_project(&temp.path().join("projects"), "-work-talkie", &workdir);
    let (port, server) = start(temp.path()).await;
    let client = http_client();
    let base = format!("http://127.0.0.1:{port}");

    let health: Value = client
        .get(format!("{base}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    let list: Value = client
        .get(format!("{base}/sessions?refresh=true"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list["count"], 1);
    let session = &list["sessions"][0];
    assert_eq!(session["id"], SESSION_ID);
    assert_eq!(session["folderName"], "-work-talkie");
    assert_eq!(session["displayName"], "talkie");
    assert_eq!(session["messageCount"], 2);
    assert_eq!(session["isLive"], false);

    for key in [SESSION_ID, "-work-talkie"] {
        let one: Value = client
            .get(format!("{base}/sessions/{key}"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(one["id"], SESSION_ID);
    }

    let missing = client
        .get(format!("{base}/sessions/does-not-exist"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let status: Value = client
        .get(format!("{base}/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["cache"]["state"], "polling");
    assert_eq!(status["cache"]["count"], 1);
    assert_eq!(status["auth"], "disabled");

    server.abort();
}

#[tokio::test]
async fn e2e_delivery_without_ui_goes_headless() {
    let temp = TempDir::new().unwrap();
    let workdir = temp.path().join("work").join("talkie");
    std::fs::create_dir_all(&workdir).unwrap();
    write_project(&temp.path().join("projects"), "-work-talkie", &workdir);
    let (port, server) = start(temp.path()).await;
    let client = http_client();
    let url = format!("http://127.0.0.1:{port}/sessions/{SESSION_ID}/message");

    // the agent cli does not exist, so the headless path fails outright
    let response = client
        .post(&url)
        .json(&json!({"text": "run the tests"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "headless_failed");

    let response = client
        .post(&url)
        .json(&json!({"audio": "AAAA", "format": "m4a"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "audio_requires_ui");

    let response = client.post(&url).json(&json!({})).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["mode"], "headless");
    // macOS hosts may also report a locked screen
    assert!(matches!(
        body["modeReason"].as_str(),
        Some("ui_unavailable") | Some("locked")
    ));

    let unknown = client
        .post(format!("http://127.0.0.1:{port}/sessions/ghost/message"))
        .json(&json!({"text": "hi"}))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

    server.abort();
}

#[tokio::test]
async fn e2e_match_without_terminals_is_empty() {
    let temp = TempDir::new().unwrap();
    let (port, server) = start(temp.path()).await;
    let client = http_client();
    let base = format!("http://127.0.0.1:{port}");

    let report: Value = client
        .get(format!("{base}/match"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(report["matches"], json!([]));
    assert_eq!(report["unmatched"], json!([]));
    assert!(report["timestamp"].is_string());

    let scan = client.post(format!("{base}/match/scan")).send().await.unwrap();
    assert_eq!(scan.status(), StatusCode::OK);

    let confirm = client
        .post(format!("{base}/match/confirm"))
        .json(&json!({"terminalFingerprint": "com.apple.Terminal|zsh", "sessionId": "ghost"}))
        .send()
        .await
        .unwrap();
    assert_eq!(confirm.status(), StatusCode::NOT_FOUND);

    server.abort();
}

async fn start(root: &Path) -> (u16, JoinHandle<()>) {
    let port = find_free_port().await;
    let projects = root.join("projects");
    std::fs::create_dir_all(&projects).unwrap();
    let settings = Settings {
        listen: ([127, 0, 0, 1], port).into(),
        state_dir: root.join("state"),
        projects_dir: projects,
        ui_automation_url: format!("http://127.0.0.1:{}", find_free_port().await),
        agent_cli: "talkie-bridge-missing-cli".into(),
        agent_process: "talkie-bridge-missing-agent".into(),
        approval: ApprovalPolicy::AutoApprove,
        auth_mode: AuthMode::Disabled,
        device_ttl_days: 0,
        otlp_endpoint: None,
        write_discovery: false,
    };
    let server = tokio::spawn(async move {
        talkie_bridge::run(settings).await.unwrap();
    });
    wait_for_port(port).await;
    (port, server)
}

fn http_client() -> Client {
    Client::builder().no_proxy().build().unwrap()
}

async fn find_free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

async fn wait_for_port(port: u16) {
    let mut attempts = 0;
    loop {
        match TcpStream::connect(("127.0.0.1", port)).await {
            Ok(stream) => {
                drop(stream);
                break;
            }
            Err(_) if attempts < 50 => {
                attempts += 1;
                sleep(Duration::from_millis(50)).await;
            }
            Err(err) => {
                panic!("bridge did not start listening on port {}: {}", port, err);
            }
        }
    }
}
