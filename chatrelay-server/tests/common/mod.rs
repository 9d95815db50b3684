//! Fake Ollama server for integration tests.
//!
//! Behaviour is selected by the requested model name:
//! - `overloaded`: HTTP 500 with body `overloaded`
//! - `missing`: an `error` object in the stream
//! - `tail`: final `{"done":true}` without a trailing newline
//! - `slow`: five content lines, 50ms apart
//! - `drip`: four content lines, 400ms apart
//! - anything else: two content lines and a final done object

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chatrelay_server::{build_router, AppState, RelayConfig};
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpListener;

#[derive(Clone, Default)]
pub struct FakeOllama {
    /// Bodies of every chat request received
    pub requests: Arc<Mutex<Vec<Value>>>,
}

pub fn content_line(text: &str) -> String {
    format!(
        "{{\"model\":\"fake\",\"message\":{{\"role\":\"assistant\",\"content\":\"{}\"}},\"done\":false}}",
        text
    )
}

pub const DONE_LINE: &str =
    r#"{"model":"fake","message":{"role":"assistant","content":""},"done":true,"done_reason":"stop"}"#;

async fn chat(State(fake): State<FakeOllama>, Json(body): Json<Value>) -> Response {
    fake.requests.lock().push(body.clone());
    let model = body["model"].as_str().unwrap_or_default();

    match model {
        "overloaded" => (StatusCode::INTERNAL_SERVER_ERROR, "overloaded").into_response(),
        "missing" => ndjson(vec![r#"{"error":"model 'missing' not found"}"#.to_string() + "\n"], 0),
        "tail" => ndjson(vec![content_line("Hi") + "\n", r#"{"done":true}"#.to_string()], 0),
        "slow" => {
            let mut chunks: Vec<String> =
                (0..5).map(|i| content_line(&format!("w{}", i)) + "\n").collect();
            chunks.push(DONE_LINE.to_string() + "\n");
            ndjson(chunks, 50)
        }
        "drip" => {
            let mut chunks: Vec<String> =
                (0..4).map(|i| content_line(&format!("d{}", i)) + "\n").collect();
            chunks.push(DONE_LINE.to_string() + "\n");
            ndjson(chunks, 400)
        }
        _ => ndjson(
            vec![
                content_line("Hello") + "\n",
                content_line(" world") + "\n",
                DONE_LINE.to_string() + "\n",
            ],
            5,
        ),
    }
}

async fn tags() -> impl IntoResponse {
    Json(json!({ "models": [] }))
}

fn ndjson(chunks: Vec<String>, delay_ms: u64) -> Response {
    let stream = futures::stream::iter(chunks).then(move |chunk| async move {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        Ok::<_, std::io::Error>(chunk)
    });
    ([(header::CONTENT_TYPE, "application/x-ndjson")], Body::from_stream(stream)).into_response()
}

/// Start a fake Ollama; returns its chat endpoint URL
pub async fn spawn_fake_ollama() -> (String, FakeOllama) {
    let fake = FakeOllama::default();
    let app = Router::new()
        .route("/api/chat", post(chat))
        .route("/api/tags", get(tags))
        .with_state(fake.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{}/api/chat", addr), fake)
}

/// Start the relay in front of `ollama_url`
pub async fn spawn_relay(ollama_url: String) -> (SocketAddr, Arc<AppState>) {
    let config = RelayConfig {
        port: 0,
        ollama_url,
        system_prompt: "Be brief.".to_string(),
        ..Default::default()
    };
    let state = Arc::new(AppState::new(config).unwrap());
    let app = build_router(Arc::clone(&state));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, state)
}
