use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use seekr_core::{Config, IndexMode, Seekr};
use seekr_server::{build_router, AppState};
use serde_json::Value;
use std::fs;
use std::sync::Arc;
use tempfile::{tempdir, TempDir};
use tower::ServiceExt;

const TOKEN: &str = "s3cret";

struct TestApp {
    router: Router,
    seekr: Arc<Seekr>,
    docs: TempDir,
    _data: TempDir,
}

fn build_test_app() -> TestApp {
    let docs = tempdir().unwrap();
    let data = tempdir().unwrap();
    fs::write(docs.path().join("notes.txt"), "quarterly report draft").unwrap();
    fs::write(docs.path().join("report.pdf"), "%PDF-1.4").unwrap();
    fs::write(docs.path().join("recipe.md"), "lemon tart").unwrap();

    let config = Config {
        index_path: data.path().join("index"),
        watch_paths: vec![docs.path().to_path_buf()],
        auto_index_on_startup: false,
        search_timeout_ms: 0,
        ..Config::default()
    };
    let seekr = Arc::new(Seekr::open(config).unwrap());
    seekr.index_now(vec![docs.path().to_path_buf()], IndexMode::Full).unwrap();
    let router = build_router(AppState { seekr: seekr.clone(), admin_token: Some(TOKEN.into()) });
    TestApp { router, seekr, docs, _data: data }
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::post(uri).header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header("X-ADMIN-TOKEN", token);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

#[tokio::test]
async fn search_returns_ranked_results() {
    let app = build_test_app();
    let (status, json) = send(&app.router, get("/search?q=quarterly%20report")).await;
    assert_eq!(status, StatusCode::OK);
    let results = json["results"].as_array().unwrap();
    assert_eq!(results[0]["filename"], "notes.txt");
    assert!(results[0]["snippet"]["text"].as_str().unwrap().contains("quarterly report"));
    assert_eq!(json["query"], "quarterly report");
    assert_eq!(json["truncated"], false);
}

#[tokio::test]
async fn search_field_restricts_matching() {
    let app = build_test_app();
    let filenames = |json: &Value| -> Vec<String> {
        json["results"].as_array().unwrap().iter().map(|r| r["filename"].as_str().unwrap().to_string()).collect()
    };

    let (status, json) = send(&app.router, get("/search?q=report&field=name")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(filenames(&json), vec!["report.pdf"]);

    let (status, json) = send(&app.router, get("/search?q=report&field=content")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(filenames(&json), vec!["notes.txt"]);

    let (status, _) = send(&app.router, get("/search?q=report&field=owner")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn search_applies_filters_and_limit() {
    let app = build_test_app();
    let (status, json) = send(&app.router, get("/search?q=ext:pdf")).await;
    assert_eq!(status, StatusCode::OK);
    let results = json["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["extension"], "pdf");

    let (_, json) = send(&app.router, get("/search?q=size%3C1mb&limit=2")).await;
    assert_eq!(json["results"].as_array().unwrap().len(), 2);
    assert_eq!(json["total_hits"], 3);
}

#[tokio::test]
async fn stats_and_doc_lookup() {
    let app = build_test_app();
    let (status, json) = send(&app.router, get("/stats")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["document_count"], 3);
    assert_eq!(json["watcher"], "stopped");

    let path = fs::canonicalize(app.docs.path().join("recipe.md")).unwrap();
    let uri = format!("/doc?path={}", path.display());
    let (status, json) = send(&app.router, get(&uri)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["filename"], "recipe.md");
    assert_eq!(json["text"], "lemon tart");

    let (status, _) = send(&app.router, get("/doc?path=/nowhere/at/all.txt")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn admin_endpoints_require_the_token() {
    let app = build_test_app();
    let (status, _) = send(&app.router, post("/reindex", None, Value::Null)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = send(&app.router, post("/cancel", Some("wrong"), Value::Null)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, json) = send(&app.router, post("/reindex", Some(TOKEN), Value::Null)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["queued"], true);
    app.seekr.wait_idle();
}

#[tokio::test]
async fn incremental_index_picks_up_new_files() {
    let app = build_test_app();
    let fresh = app.docs.path().join("fresh.txt");
    fs::write(&fresh, "brand new zucchini").unwrap();

    let body = serde_json::json!({ "paths": [fresh], "incremental": true });
    let (status, json) = send(&app.router, post("/index", Some(TOKEN), body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["stats"]["files_extracted"], 1);

    let (_, json) = send(&app.router, get("/search?q=zucchini")).await;
    assert_eq!(json["results"][0]["filename"], "fresh.txt");
}

#[tokio::test]
async fn clear_empties_the_index() {
    let app = build_test_app();
    let (status, _) = send(&app.router, post("/index/clear", Some(TOKEN), Value::Null)).await;
    assert_eq!(status, StatusCode::OK);
    let (_, json) = send(&app.router, get("/stats")).await;
    assert_eq!(json["document_count"], 0);
}

#[tokio::test]
async fn health() {
    let app = build_test_app();
    let resp = app.router.clone().oneshot(get("/health")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}
