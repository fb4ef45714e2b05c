//! HTTP collaborators against a local axum stand-in.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use serde_json::{Value, json};

use fleetgrid_clients::{HttpDispatcher, HttpEventBus, HttpRepoBuilder};
use fleetgrid_rollout::{
    DispatchRequest, Dispatcher, EventBus, NotificationSettings, Notifier, RepoBuilder,
};
use fleetgrid_state::{Commit, Rollout, RolloutStatus};

type Seen = Arc<Mutex<Vec<Value>>>;

/// Serve `router` on an ephemeral port and return its base URL.
async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

async fn record(State(seen): State<Seen>, Json(body): Json<Value>) -> Json<Value> {
    let recipient = body[0]["recipient"].as_str().unwrap_or_default().to_string();
    seen.lock().unwrap().push(body);
    if recipient == "offline" {
        return Json(json!([{ "code": 404 }]));
    }
    Json(json!([{ "code": 201, "id": format!("run-{recipient}") }]))
}

fn request(recipient: &str) -> DispatchRequest {
    DispatchRequest {
        recipient: recipient.to_string(),
        script_url: "http://fleet.example/api/v1/updates/1/update-playbook.yml".to_string(),
        account: "0000001".to_string(),
    }
}

#[tokio::test]
async fn dispatcher_posts_runs_and_maps_answers() {
    let seen = Seen::default();
    let router = Router::new()
        .route("/internal/dispatch", post(record))
        .with_state(seen.clone());
    let base = serve(router).await;
    let dispatcher = HttpDispatcher::new(&format!("{base}/"), Duration::from_secs(5)).unwrap();

    let accepted = dispatcher.execute(&request("rhc-1")).await.unwrap();
    assert_eq!(accepted.len(), 1);
    assert!(accepted[0].is_created());
    assert_eq!(accepted[0].correlation_id.as_deref(), Some("run-rhc-1"));

    let refused = dispatcher.execute(&request("offline")).await.unwrap();
    assert_eq!(refused[0].status_code, 404);
    assert_eq!(refused[0].correlation_id, None);

    let bodies = seen.lock().unwrap().clone();
    assert_eq!(bodies[0][0]["account"], "0000001");
    assert_eq!(
        bodies[0][0]["url"],
        "http://fleet.example/api/v1/updates/1/update-playbook.yml"
    );
}

#[tokio::test]
async fn dispatcher_server_error_is_a_failure() {
    let router = Router::new().route(
        "/internal/dispatch",
        post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
    );
    let base = serve(router).await;
    let dispatcher = HttpDispatcher::new(&base, Duration::from_secs(5)).unwrap();

    let err = dispatcher.execute(&request("rhc-1")).await.unwrap_err();
    assert!(err.to_string().contains("500"), "{err}");
}

#[tokio::test]
async fn slow_dispatcher_times_out() {
    let router = Router::new().route(
        "/internal/dispatch",
        post(|| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Json(json!([]))
        }),
    );
    let base = serve(router).await;
    let dispatcher = HttpDispatcher::new(&base, Duration::from_millis(100)).unwrap();

    let err = dispatcher.execute(&request("rhc-1")).await.unwrap_err();
    assert!(err.to_string().contains("timed out"), "{err}");
}

#[tokio::test]
async fn repo_builder_returns_repo_url() {
    let router = Router::new().route(
        "/api/v1/repos/build",
        post(|Json(body): Json<Value>| async move {
            let id = body["update_id"].as_u64().unwrap_or_default();
            Json(json!({ "url": format!("http://repo.example/{id}/repo") }))
        }),
    );
    let base = serve(router).await;
    let builder = HttpRepoBuilder::new(&base, Duration::from_secs(5)).unwrap();

    assert_eq!(builder.build(9).await.unwrap(), "http://repo.example/9/repo");
}

#[tokio::test]
async fn event_bus_posts_notification() {
    let seen = Seen::default();
    let router = Router::new()
        .route(
            "/notifications",
            post(|State(seen): State<Seen>, Json(body): Json<Value>| async move {
                seen.lock().unwrap().push(body);
                StatusCode::ACCEPTED
            }),
        )
        .with_state(seen.clone());
    let base = serve(router).await;
    let bus = HttpEventBus::new(format!("{base}/notifications"), Duration::from_secs(5)).unwrap();

    let rollout = Rollout {
        id: 4,
        account: "0000001".to_string(),
        commit: Some(Commit {
            id: 2,
            os_tree_commit: "abc".to_string(),
        }),
        repo_url: None,
        device_ids: vec![1],
        dispatch_record_ids: vec![],
        status: RolloutStatus::Success,
        failure: None,
        created_at: 0,
        updated_at: 0,
    };
    let notification = Notifier::disabled().build(&rollout);
    bus.publish(&notification).await.unwrap();

    let bodies = seen.lock().unwrap().clone();
    assert_eq!(bodies.len(), 1);
    assert_eq!(bodies[0]["account"], "0000001");
    assert_eq!(bodies[0]["context"], r#"{"CommitID":"2"}"#);
    assert_eq!(bodies[0]["bundle"], NotificationSettings::default().bundle);
}
