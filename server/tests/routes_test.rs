//! Routes that answer before touching the database.
//!
//! The pool is lazy and points nowhere, so these run without PostgreSQL.

use reqwest::StatusCode;
use shelf_engine::{DomainEvent, EventPayload, ItemEvent, ItemSnapshot, VectorClock};
use shelf_server::config::Config;
use shelf_server::routes::HealthResponse;
use shelf_server::{app, db, AppState};
use uuid::Uuid;

async fn serve(config: Config) -> String {
    let pool = db::create_lazy_pool(&config.database_url).unwrap();
    let router = app(AppState::new(pool, config));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

fn config() -> Config {
    Config::local("postgres://shelf@127.0.0.1:1/shelf")
}

fn event(title: &str) -> DomainEvent {
    DomainEvent::new(
        Uuid::new_v4(),
        "device-1",
        1_706_745_600_000,
        1,
        VectorClock::new().incremented("device-1"),
        EventPayload::Item(ItemEvent::Created(ItemSnapshot::titled(title))),
    )
}

#[tokio::test]
async fn health_reports_ok() {
    let url = serve(config()).await;
    let health: HealthResponse = reqwest::get(format!("{url}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health.status, "ok");
    assert_eq!(health.version, env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn sync_routes_require_a_bearer_token() {
    let url = serve(config()).await;
    let client = reqwest::Client::new();

    for path in ["/sync/latest", "/sync/pull", "/devices", "/ws"] {
        let response = client.get(format!("{url}{path}")).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{path}");
    }
    let response = client
        .post(format!("{url}/sync/push"))
        .json(&serde_json::json!({ "events": [] }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn wrong_secret_is_rejected() {
    let url = serve(Config {
        auth_secret: Some("s3cret".into()),
        ..config()
    })
    .await;

    let response = reqwest::Client::new()
        .get(format!("{url}/sync/latest"))
        .bearer_auth("alice:guess")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn oversized_pushes_hit_the_quota() {
    let url = serve(Config {
        max_push_batch: 2,
        ..config()
    })
    .await;

    let events = vec![event("Dune"), event("Emma"), event("Ulysses")];
    let response = reqwest::Client::new()
        .post(format!("{url}/sync/push"))
        .bearer_auth("alice")
        .json(&serde_json::json!({ "events": events }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn malformed_push_bodies_are_rejected() {
    let url = serve(config()).await;
    let response = reqwest::Client::new()
        .post(format!("{url}/sync/push"))
        .bearer_auth("alice")
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
