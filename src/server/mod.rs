//! HTTP server for the deployment approver.
//!
//! # Endpoints
//!
//! - `POST /webhook` - GitHub webhook deliveries, see [`webhook`]
//! - `GET /health` - 200 while the process is serving

use std::sync::Arc;

use axum::http::StatusCode;

use crate::dispatch::EventSink;
use crate::webhooks::WebhookSecret;

pub mod webhook;

pub use webhook::{WebhookError, webhook_handler};

/// Shared application state, passed to handlers via axum's `State` extractor.
pub struct AppState<S> {
    inner: Arc<AppStateInner<S>>,
}

struct AppStateInner<S> {
    sink: Arc<S>,
    secret: WebhookSecret,
}

// Manual impl: `S` itself need not be `Clone`.
impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        AppState {
            inner: self.inner.clone(),
        }
    }
}

impl<S: EventSink> AppState<S> {
    pub fn new(sink: Arc<S>, secret: WebhookSecret) -> Self {
        AppState {
            inner: Arc::new(AppStateInner { sink, secret }),
        }
    }

    pub fn sink(&self) -> &S {
        &self.inner.sink
    }

    pub fn secret(&self) -> &WebhookSecret {
        &self.inner.secret
    }
}

pub async fn health_handler() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}

pub fn build_router<S: EventSink>(app_state: AppState<S>) -> axum::Router {
    use axum::routing::{get, post};

    axum::Router::new()
        .route("/webhook", post(webhook_handler::<S>))
        .route("/health", get(health_handler))
        .with_state(app_state)
}
