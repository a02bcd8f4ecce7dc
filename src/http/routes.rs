use crate::http::types::{CallbackSummary, HttpError, HttpResult, HttpSuccess, SetLogLevelRequest};
use crate::http::HttpState;
use crate::line::{extract_text_events, WebhookPayload, SIGNATURE_HEADER};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use std::str::FromStr;
use tracing::instrument;
use tracing::log::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Webhook entry point. The body is taken as raw bytes since the signature
/// covers it exactly as sent.
#[instrument(skip_all, fields(delivery_id = %Uuid::new_v4()))]
pub async fn callback(
    State(state): State<HttpState>,
    headers: HeaderMap,
    body: Bytes,
) -> HttpResult<CallbackSummary> {
    info!("Received webhook callback, body length: {}", body.len());

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| {
            warn!("Webhook callback without a readable {SIGNATURE_HEADER} header");
            HttpError {
                status: StatusCode::BAD_REQUEST,
                message: format!("Missing {SIGNATURE_HEADER} header"),
            }
        })?;

    if !state.verifier.verify(&body, signature) {
        error!("Invalid signature in webhook callback");
        return Err(HttpError {
            status: StatusCode::BAD_REQUEST,
            message: "Invalid signature".to_string(),
        });
    }

    let payload: WebhookPayload = serde_json::from_slice(&body).map_err(|e| {
        warn!("Rejecting signed webhook with unexpected body: {e}");
        HttpError {
            status: StatusCode::BAD_REQUEST,
            message: format!("Invalid webhook body: {e}"),
        }
    })?;

    let events = extract_text_events(&payload);
    debug!(
        "Webhook for {:?} has {} event(s), {} answerable",
        payload.destination,
        payload.events.len(),
        events.len()
    );

    let mut summary = CallbackSummary {
        received: payload.events.len(),
        skipped: payload.events.len() - events.len(),
        ..Default::default()
    };

    // Events are answered one after another, each reply token only once.
    let mut failures = Vec::new();
    for event in &events {
        match state.bot.answer(event).await.failure() {
            None => summary.replied += 1,
            Some(failure) => {
                summary.failed += 1;
                failures.push(failure);
            }
        }
    }
    debug!("Handled webhook: {summary:?}");

    if !failures.is_empty() {
        return Err(HttpError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!(
                "Failed to answer {} of {} text message(s): {}",
                summary.failed,
                events.len(),
                failures.join("; ")
            ),
        });
    }
    Ok(HttpSuccess(summary))
}

pub async fn health() -> HttpResult<&'static str> {
    Ok(HttpSuccess("ok"))
}

pub async fn sys_version() -> HttpResult<String> {
    Ok(HttpSuccess(crate::VERSION.to_string()))
}

pub async fn sys_set_log_level(
    State(state): State<HttpState>,
    Json(payload): Json<SetLogLevelRequest>,
) -> HttpResult<bool> {
    let filter = EnvFilter::from_str(&payload.level).map_err(|e| HttpError {
        status: StatusCode::BAD_REQUEST,
        message: e.to_string(),
    })?;

    info!("Setting log level to {filter} via API");
    let success = state
        .tracing_reload
        .reload(filter)
        .map(|_| true)
        .map_err(|e| HttpError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: e.to_string(),
        })?;

    Ok(HttpSuccess(success))
}
