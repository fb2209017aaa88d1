//! Test utilities for tally-core
//!
//! A mock Ollama server that answers the classifier prompts over real HTTP, for
//! integration tests of `OllamaClassifier`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::{extract::Json, extract::State, routing::post, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::oneshot;

/// Mock Ollama server for tests
pub struct MockOllamaServer {
    addr: SocketAddr,
    requests: Arc<AtomicUsize>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl MockOllamaServer {
    /// Start the mock server on an available port
    pub async fn start() -> Self {
        let requests = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route("/api/generate", post(handle_generate))
            .with_state(requests.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock ollama listener");
        let addr = listener.local_addr().expect("mock ollama local addr");

        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await;
        });

        Self {
            addr,
            requests,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Get the base URL for this mock server
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Number of `/api/generate` calls served so far
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Stop the mock server
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for MockOllamaServer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Debug, Deserialize)]
struct GenerateRequest {
    model: String,
    prompt: String,
}

#[derive(Debug, Serialize)]
struct GenerateResponse {
    model: String,
    response: String,
    done: bool,
}

/// Canned category for well-known merchants
fn category_for(text: &str) -> (&'static str, f64) {
    let t = text.to_uppercase();
    match t.as_str() {
        m if m.contains("NETFLIX") || m.contains("SPOTIFY") => ("Subscriptions", 0.96),
        m if m.contains("STARBUCKS") || m.contains("CHIPOTLE") => ("Dining", 0.97),
        m if m.contains("WHOLE FOODS") || m.contains("SAFEWAY") => ("Groceries", 0.95),
        m if m.contains("UBER") || m.contains("SHELL") => ("Transport", 0.9),
        m if m.contains("AMAZON") || m.contains("AMZN") => ("Shopping", 0.8),
        _ => ("Other", 0.4),
    }
}

/// Ollama generate endpoint
async fn handle_generate(
    State(requests): State<Arc<AtomicUsize>>,
    Json(request): Json<GenerateRequest>,
) -> Json<GenerateResponse> {
    requests.fetch_add(1, Ordering::SeqCst);
    let prompt = &request.prompt;

    let response = if let Some(list) = prompt.split("Transactions (one per line, numbered):").nth(1) {
        // Batch classification: lines look like "N. date | name | ..."
        let results: Vec<_> = list
            .lines()
            .filter_map(|line| {
                let (index, rest) = line.trim().split_once(". ")?;
                let index: usize = index.parse().ok()?;
                let (category, confidence) = category_for(rest);
                Some(json!({"index": index, "category": category, "confidence": confidence}))
            })
            .collect();
        json!({ "results": results }).to_string()
    } else if let Some(tx) = prompt.split("Transaction:").nth(1) {
        let (category, confidence) = category_for(tx);
        format!(
            "Here is the classification:\n{}",
            json!({"category": category, "confidence": confidence, "reasoning": "mock"})
        )
    } else if prompt.contains("spending category") {
        json!({"description": "Mock description", "confidence": 0.7}).to_string()
    } else {
        json!({"coherence_score": 1.0, "issues": []}).to_string()
    };

    Json(GenerateResponse {
        model: request.model,
        response,
        done: true,
    })
}
