use am_core::{CandidateKey, StaticKeySource};
use am_hub::{router, HubConfig, HubState};
use am_storage::{AssignmentStore, NewUser};
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

const BOSS: &str = "boss-token";
const USERX: &str = "userx-token";

struct Harness {
    app: Router,
    database: PathBuf,
    _dir: TempDir,
}

fn harness(foreground_task_limit: usize, keys: &[&str]) -> Harness {
    let dir = TempDir::new().expect("temp dir");
    let database = dir.path().join("assignments.db");
    let mut store = AssignmentStore::open(&database).expect("open store");
    for (name, permissions) in [("boss", vec!["admin", "cleave"]), ("userx", vec!["cleave"])] {
        store.add_user(&NewUser::named(name)).expect("add user");
        store.grant_permissions(name, permissions).expect("grant");
    }

    let mut config = HubConfig::default();
    config.database = database.clone();
    config.foreground_task_limit = foreground_task_limit;
    config.authorized.insert(BOSS.to_string(), "boss".to_string());
    config.authorized.insert(USERX.to_string(), "userx".to_string());

    let source = StaticKeySource::new(keys.iter().map(|key| CandidateKey::new(*key)).collect());
    let state = HubState::new(config)
        .expect("hub state")
        .with_key_source(Arc::new(source));
    Harness {
        app: router(Arc::new(state)),
        database,
        _dir: dir,
    }
}

async fn call(
    app: &Router,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut request = Request::builder().uri(uri).method(method);
    if let Some(token) = token {
        request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    let body = match body {
        Some(value) => Body::from(value.to_string()),
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(request.body(body).expect("request"))
        .await
        .expect("response");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, value)
}

#[tokio::test]
async fn ping_reports_the_rest_envelope() {
    let hub = harness(100, &[]);
    let (status, body) = call(&hub.app, "GET", "/ping", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["rest"]["row_count"], 0);
    assert!(body["rest"]["elapsed_time"].is_string());
}

#[tokio::test]
async fn mutations_require_a_known_bearer_token() {
    let hub = harness(100, &["1"]);
    let payload = json!({"project_name": "demo"});
    let (status, body) = call(&hub.app, "POST", "/project/cleave", None, Some(payload.clone())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["rest"]["error"], "Missing token");

    let (status, _) = call(&hub.app, "POST", "/project/cleave", Some("bogus"), Some(payload)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn project_assignment_and_task_lifecycle_over_http() {
    let hub = harness(100, &["101", "102", "103"]);

    let (status, body) = call(
        &hub.app,
        "POST",
        "/project/cleave",
        Some(BOSS),
        Some(json!({"project_name": "demo", "note": "first pass"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["tasks"]["inserted"], 3);
    assert_eq!(body["project"]["name"], "demo");

    let (status, body) = call(
        &hub.app,
        "POST",
        "/assignment/demo",
        Some(BOSS),
        Some(json!({"name": "A1", "user": "userx", "tasks": 2})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["rest"]["row_count"], 2);
    assert_eq!(body["assignment"]["user"], "userx");

    let (status, body) = call(&hub.app, "GET", "/assignments?name=A1", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["rest"]["row_count"], 1);
    assert!(body["rest"]["sql_statement"]
        .as_str()
        .expect("statement")
        .contains("assignment_vw"));

    let (status, document) = call(&hub.app, "GET", "/assignment/json/A1", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(document["protocol"], "cleave");
    let ids = document["task list"]
        .as_array()
        .expect("task list")
        .iter()
        .map(|entry| entry["assignment_manager_task_id"].as_i64().expect("task id"))
        .collect::<Vec<_>>();
    assert_eq!(ids.len(), 2);

    let (status, body) =
        call(&hub.app, "POST", &format!("/task/{}/complete", ids[0]), Some(USERX), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["rest"]["error"], format!("Task {} was not started", ids[0]));

    for id in &ids {
        let (status, body) = call(&hub.app, "POST", &format!("/task/{id}/start"), Some(USERX), None).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        let (status, body) = call(
            &hub.app,
            "POST",
            &format!("/task/{id}/complete"),
            Some(USERX),
            Some(json!({"note": "looked fine"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
    }

    let (_, assignment) = call(&hub.app, "GET", "/assignments?name=A1", None, None).await;
    assert_eq!(assignment["data"][0]["disposition"], "Complete");

    let store = AssignmentStore::open(&hub.database).expect("open store");
    let project = store.project("demo").expect("load").expect("project");
    assert!(!project.is_complete());
    assert_eq!(store.unassigned_count(project.id).expect("count"), 1);
}

#[tokio::test]
async fn read_errors_map_to_status_codes() {
    let hub = harness(100, &[]);
    let (status, body) = call(&hub.app, "GET", "/tasks/abc", None, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["rest"]["class"], "validation");

    let (status, body) = call(&hub.app, "GET", "/projects?name=missing", None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["rest"]["error"]
        .as_str()
        .expect("message")
        .starts_with("No rows returned"));

    let (status, body) = call(&hub.app, "GET", "/assignments/columns", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["columns"]
        .as_array()
        .expect("columns")
        .iter()
        .any(|column| column == "working_duration"));
}

#[tokio::test]
async fn large_generation_runs_in_the_background() {
    let hub = harness(1, &["1", "2", "3"]);
    let (status, body) = call(
        &hub.app,
        "POST",
        "/project/cleave",
        Some(BOSS),
        Some(json!({"project_name": "bulk"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["tasks"]["inserted"], -1);

    let store = AssignmentStore::open(&hub.database).expect("open store");
    let project = store.project("bulk").expect("load").expect("project");
    let mut unassigned = 0;
    for _ in 0..100 {
        unassigned = store.unassigned_count(project.id).expect("count");
        if unassigned == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(unassigned, 3);
}

#[tokio::test]
async fn conflicts_surface_as_409() {
    let hub = harness(100, &["1"]);
    let payload = json!({"project_name": "demo"});
    let (status, _) = call(&hub.app, "POST", "/project/cleave", Some(BOSS), Some(payload.clone())).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = call(&hub.app, "POST", "/project/cleave", Some(BOSS), Some(payload)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["rest"]["error"], "Project demo already exists");
}

#[tokio::test]
async fn rejected_upload_does_not_create_its_assignment() {
    let hub = harness(100, &[]);
    let (status, body) = call(
        &hub.app,
        "POST",
        "/tasks/cleave/uploads",
        Some(BOSS),
        Some(json!({"tasks": {"5": {}}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["project"]["name"], "uploads");

    let (status, body) = call(
        &hub.app,
        "POST",
        "/tasks/cleave/uploads/batch2",
        Some(BOSS),
        Some(json!({"tasks": {"5": {}, "6": {}}, "user": "userx"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["rest"]["error"], "Task(s) already exist in project uploads: 5");

    let (status, _) = call(&hub.app, "GET", "/assignments?name=batch2", None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = call(
        &hub.app,
        "POST",
        "/tasks/cleave/uploads/batch2",
        Some(BOSS),
        Some(json!({"tasks": {"6": {}}, "user": "userx"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let (_, assignment) = call(&hub.app, "GET", "/assignments?name=batch2", None, None).await;
    assert_eq!(assignment["data"][0]["user"], "userx");
}
