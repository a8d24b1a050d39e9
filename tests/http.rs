use apiflow_sdk::{app, from_json, AppState, Container};
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

const SETTING: &str = r#"{
  "sources": [{
    "identifier": "demo",
    "type": "SQL_MEMORY",
    "config": "{\"select * from items where status = 1\": [{\"id\": 1}]}"
  }],
  "torms": [{"name": "listItems", "source": "demo", "template": "select * from items where status = :Status"}],
  "apis": [{
    "name": "items",
    "route": "/items",
    "method": "GET,POST",
    "requestSchema": "fullname=status,format=int,default=1,dst=Status"
  }]
}"#;

fn state() -> AppState {
    let container = Container::new();
    container.register_setting(from_json(SETTING).unwrap()).unwrap();
    container.compile().unwrap();
    AppState::new(container)
}

async fn body_json(resp: axum::response::Response) -> Value {
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn requests_are_dispatched_by_path_and_method() {
    let resp = app(state())
        .oneshot(Request::builder().uri("/items?status=1").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await, json!([{"id": 1}]));

    let resp = app(state())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/items")
                .body(Body::from(r#"{"status": 1}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn unknown_routes_answer_404_envelope() {
    let resp = app(state())
        .oneshot(Request::builder().uri("/nothing").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(resp).await["error"]["code"], "not_found");
}

#[tokio::test]
async fn validation_failures_answer_422() {
    let resp = app(state())
        .oneshot(Request::builder().uri("/items?status=abc").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body_json(resp).await["error"]["code"], "validation_error");
}

#[tokio::test]
async fn health_and_ready() {
    let resp = app(state())
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let resp = app(state())
        .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(body_json(resp).await, json!({"status": "ok", "compiled": true}));
}
