//! Webhook HTTP surface.
//!
//! Both platforms require a fast acknowledgment: the handlers validate,
//! detach the real pipeline onto a background task, and answer immediately.
//! A retried delivery is caught later by the dedup markers, so acknowledging
//! before processing finishes is safe.

use crate::platform::telegram::{TelegramAdapter, TgUpdate};
use crate::platform::vk::{VkAdapter, VkCallback};
use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

const TELEGRAM_SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

#[derive(Clone)]
pub struct AppState {
    pub vk: Arc<VkAdapter>,
    pub telegram: Arc<TelegramAdapter>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/vk", post(vk_webhook))
        .route("/webhooks/telegram", post(telegram_webhook))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({ "status": "ok" }))
}

async fn vk_webhook(
    State(state): State<AppState>,
    axum::Json(callback): axum::Json<VkCallback>,
) -> Response {
    if callback.kind == "confirmation" {
        // The confirmation handshake answers with the configured code as
        // plain text. VK may omit the secret on this event type, so it is
        // not gated on the usual validation.
        return match state.vk.confirmation_code() {
            Some(code) => code.to_string().into_response(),
            None => "ok".into_response(),
        };
    }

    if !state.vk.is_valid_event(&callback) {
        // Wrong secret or foreign group: acknowledge without processing so
        // the sender learns nothing and stops retrying.
        tracing::warn!(kind = %callback.kind, "rejected vk event failed validation");
        return "ok".into_response();
    }

    let vk = state.vk.clone();
    tokio::spawn(async move {
        if let Err(error) = vk.process(callback).await {
            tracing::error!(%error, "vk event processing failed");
        }
    });
    "ok".into_response()
}

async fn telegram_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    axum::Json(update): axum::Json<TgUpdate>,
) -> Response {
    if let Some(expected) = state.telegram.webhook_secret() {
        let presented = headers
            .get(TELEGRAM_SECRET_HEADER)
            .and_then(|v| v.to_str().ok());
        if presented != Some(expected) {
            tracing::warn!("telegram update with a bad secret token");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let telegram = state.telegram.clone();
    tokio::spawn(async move {
        if let Err(error) = telegram.process(update).await {
            tracing::error!(%error, "telegram update processing failed");
        }
    });
    "ok".into_response()
}

/// Serve the router until ctrl-c.
pub async fn serve(listener: tokio::net::TcpListener, state: AppState) -> crate::Result<()> {
    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await
        .map_err(crate::Error::Io)?;
    Ok(())
}
