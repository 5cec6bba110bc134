use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct ApiState {
    pub version: Arc<AtomicUsize>,
    pub flaky_calls: Arc<AtomicUsize>,
}

async fn create_user(Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    let name = body.get("name").cloned().unwrap_or(Value::Null);
    (StatusCode::CREATED, Json(json!({"id": 7, "name": name})))
}

async fn get_user(Path(id): Path<u64>) -> Result<Json<Value>, StatusCode> {
    if id == 7 {
        Ok(Json(json!({"id": 7, "name": "Alice"})))
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

async fn version(State(state): State<ApiState>) -> Json<Value> {
    Json(json!({"service": "users", "version": state.version.load(Ordering::SeqCst)}))
}

async fn flaky(State(state): State<ApiState>) -> (StatusCode, &'static str) {
    if state.flaky_calls.fetch_add(1, Ordering::SeqCst) < 2 {
        (StatusCode::SERVICE_UNAVAILABLE, "busy")
    } else {
        (StatusCode::OK, "recovered")
    }
}

async fn login() -> impl IntoResponse {
    ([(header::SET_COOKIE, "session=abc123; Path=/; HttpOnly")], "welcome")
}

async fn me(headers: HeaderMap) -> StatusCode {
    match headers.get(header::COOKIE).and_then(|value| value.to_str().ok()) {
        Some(cookies) if cookies.contains("session=abc123") => StatusCode::OK,
        _ => StatusCode::UNAUTHORIZED,
    }
}

/// Starts the fixture API on an ephemeral port.
pub async fn spawn_api(state: ApiState) -> SocketAddr {
    let app = Router::new()
        .route("/users", post(create_user))
        .route("/users/:id", get(get_user))
        .route("/version", get(version))
        .route("/flaky", get(flaky))
        .route("/login", get(login))
        .route("/me", get(me))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}
