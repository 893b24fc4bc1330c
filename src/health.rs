//! Liveness responder.
//!
//! A single read-only route reporting the authorization state of the
//! reconciliation engine. The engine publishes its state into an atomic
//! cell; the responder never touches the Tado client or any other shared
//! state, so it cannot block (or be blocked by) the main loop.

use axum::{Router, extract::State, http::StatusCode, routing::get};
use log::{error, info};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

/// Session state as seen by the health responder. `Pending` still answers
/// 200 — waiting for user approval is not an outage.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    NotStarted,
    Pending,
    Completed,
    Failed,
}

/// Single-word encoding of [`SessionStatus`], safe to read from the health
/// thread while the engine writes it.
#[derive(Debug)]
pub struct StatusCell(AtomicU8);

impl StatusCell {
    pub fn shared() -> Arc<Self> {
        Arc::new(StatusCell(AtomicU8::new(SessionStatus::NotStarted as u8)))
    }

    pub fn set(&self, status: SessionStatus) {
        self.0.store(status as u8, Ordering::Relaxed);
    }

    pub fn get(&self) -> SessionStatus {
        match self.0.load(Ordering::Relaxed) {
            x if x == SessionStatus::Pending as u8 => SessionStatus::Pending,
            x if x == SessionStatus::Completed as u8 => SessionStatus::Completed,
            x if x == SessionStatus::Failed as u8 => SessionStatus::Failed,
            _ => SessionStatus::NotStarted,
        }
    }
}

/// Start the responder on its own thread. The reconciliation engine stays
/// blocking; only this thread runs an async runtime.
pub fn spawn(port: u16, status: Arc<StatusCell>) {
    let spawned = std::thread::Builder::new()
        .name("healthcheck".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(rt) => rt,
                Err(e) => {
                    error!("Health responder failed to start: {}", e);
                    return;
                }
            };
            runtime.block_on(async move {
                let app = Router::new().route("/", get(handle_status)).with_state(status);
                let addr = format!("0.0.0.0:{}", port);
                let listener = match tokio::net::TcpListener::bind(&addr).await {
                    Ok(l) => l,
                    Err(e) => {
                        error!("Health responder failed to bind {}: {}", addr, e);
                        return;
                    }
                };
                info!("Health responder listening on {}", addr);
                if let Err(e) = axum::serve(listener, app).await {
                    error!("Health responder failed: {}", e);
                }
            });
        });
    if let Err(e) = spawned {
        error!("Failed to spawn the healthcheck thread: {}", e);
    }
}

async fn handle_status(State(status): State<Arc<StatusCell>>) -> (StatusCode, &'static str) {
    status_response(status.get())
}

fn status_response(status: SessionStatus) -> (StatusCode, &'static str) {
    match status {
        SessionStatus::Completed => (StatusCode::OK, "Authenticated"),
        SessionStatus::Pending => (StatusCode::OK, "Pending User Auth"),
        SessionStatus::Failed => (StatusCode::SERVICE_UNAVAILABLE, "Error: authorization failed"),
        SessionStatus::NotStarted => {
            (StatusCode::SERVICE_UNAVAILABLE, "Error: session not initialized")
        }
    }
}
