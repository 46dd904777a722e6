use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tally::{config::Config, memory::MemoryStore, router, state::AppState};
use tower::ServiceExt;

fn app() -> Router {
    router(AppState::with_store(
        Config::default(),
        Arc::new(MemoryStore::new()),
    ))
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);

    (status, body)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

fn upvote(id: &str, voter: &str) -> Request<Body> {
    Request::post(format!("/features/{id}/upvote"))
        .header("x-voter-key", voter)
        .body(Body::empty())
        .unwrap()
}

fn add_vote(id: &str, key: &str) -> Request<Body> {
    Request::post(format!("/admin/features/{id}/votes"))
        .header("idempotency-key", key)
        .body(Body::empty())
        .unwrap()
}

async fn create(app: &Router, title: &str) -> String {
    let (status, body) = send(app, post_json("/features", json!({ "title": title }))).await;
    assert_eq!(status, StatusCode::CREATED);

    body["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn create_then_list_round_trip() {
    let app = app();

    let (status, created) = send(
        &app,
        post_json(
            "/features",
            json!({ "title": "Dark mode", "description": "" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["votes"], 0);

    let (status, listed) = send(&app, get("/features")).await;
    assert_eq!(status, StatusCode::OK);

    let listed = listed.as_array().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["id"], created["id"]);
    assert_eq!(listed[0]["title"], "Dark mode");
    assert_eq!(listed[0]["description"], "");
    assert_eq!(listed[0]["votes"], 0);
    assert!(listed[0]["created_at"].is_string());
}

#[tokio::test]
async fn create_rejects_bad_payloads() {
    let app = app();

    let (status, body) = send(&app, post_json("/features", json!({ "title": "  " }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    let (status, _) = send(&app, post_json("/features", json!({ "description": "x" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let request = Request::post("/features")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn list_is_ordered_and_paginated() {
    let app = app();
    for title in ["First", "Second", "Third"] {
        create(&app, title).await;
    }

    let (_, all) = send(&app, get("/features")).await;
    let titles: Vec<&str> = all
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["title"].as_str().unwrap())
        .collect();
    assert_eq!(titles, ["First", "Second", "Third"]);

    let (_, page) = send(&app, get("/features?offset=1&limit=1")).await;
    let page = page.as_array().unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0]["title"], "Second");
}

#[tokio::test]
async fn get_feature_by_id() {
    let app = app();
    let id = create(&app, "Dark mode").await;

    let (status, body) = send(&app, get(&format!("/features/{id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["title"], "Dark mode");

    let missing = uuid::Uuid::new_v4();
    let (status, _) = send(&app, get(&format!("/features/{missing}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn repeat_upvote_reports_duplicate() {
    let app = app();
    let id = create(&app, "Dark mode").await;

    let (status, first) = send(&app, upvote(&id, "A")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["votes"], 1);
    assert_eq!(first["outcome"], "applied");
    assert_eq!(first["has_voted"], true);

    let (status, second) = send(&app, upvote(&id, "A")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["votes"], 1);
    assert_eq!(second["outcome"], "duplicate");

    let (_, voter) = send(&app, get(&format!("/features/{id}/voters/A"))).await;
    assert_eq!(voter["has_voted"], true);
    let (_, voter) = send(&app, get(&format!("/features/{id}/voters/B"))).await;
    assert_eq!(voter["has_voted"], false);
}

#[tokio::test]
async fn upvote_requires_voter_and_feature() {
    let app = app();
    let id = create(&app, "Dark mode").await;

    let request = Request::post(format!("/features/{id}/upvote"))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let missing = uuid::Uuid::new_v4().to_string();
    let (status, _) = send(&app, upvote(&missing, "A")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, get(&format!("/admin/features/{missing}/events"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn admin_add_vote_uses_idempotency_key() {
    let app = app();
    let id = create(&app, "Dark mode").await;

    let (status, _) = send(
        &app,
        Request::post(format!("/admin/features/{id}/votes"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, first) = send(&app, add_vote(&id, "k1")).await;
    let (_, second) = send(&app, add_vote(&id, "k2")).await;
    let (_, retry) = send(&app, add_vote(&id, "k2")).await;

    assert_eq!(first["votes"], 1);
    assert_eq!(second["votes"], 2);
    assert_eq!(retry["votes"], 2);
    assert_eq!(retry["outcome"], "duplicate");
}

#[tokio::test]
async fn admin_negative_adjustment_and_recount() {
    let app = app();
    let id = create(&app, "Dark mode").await;
    send(&app, upvote(&id, "A")).await;

    let request = Request::post(format!("/admin/features/{id}/votes"))
        .header("idempotency-key", "reset-1")
        .header("content-type", "application/json")
        .body(Body::from(json!({ "delta": -5, "actor": "ops" }).to_string()))
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["votes"], 0);

    let (status, recount) = send(
        &app,
        Request::post(format!("/admin/features/{id}/recount"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(recount["recounted"], 0);
    assert_eq!(recount["drifted"], false);

    let (_, events) = send(&app, get(&format!("/admin/features/{id}/events"))).await;
    let events = events.as_array().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0]["kind"], "user_upvote");
    assert_eq!(events[1]["kind"], "admin_adjustment");
    assert_eq!(events[1]["delta"], -1);
    assert_eq!(events[1]["requested_delta"], -5);
    assert_eq!(events[1]["voter_key"], "ops");
}

#[tokio::test]
async fn admin_rejects_out_of_range_delta() {
    let app = app();
    let id = create(&app, "Dark mode").await;

    for (key, delta) in [("k1", i64::MAX), ("k2", 100_000_000_000_000)] {
        let request = Request::post(format!("/admin/features/{id}/votes"))
            .header("idempotency-key", key)
            .header("content-type", "application/json")
            .body(Body::from(json!({ "delta": delta }).to_string()))
            .unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
    }

    let (_, feature) = send(&app, get(&format!("/features/{id}"))).await;
    assert_eq!(feature["votes"], 0);
}

#[tokio::test]
async fn health() {
    let app = app();
    let response = app.oneshot(get("/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}
