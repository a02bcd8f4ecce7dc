mod routes;
mod types;

use crate::bot::HomeworkBot;
use crate::config::HTTPConfig;
use crate::http::routes::*;
use crate::http::types::HttpError;
use crate::line::SignatureVerifier;
use crate::TracingReloadHandle;
use anyhow::{bail, Result};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::routing::{get, post};
use std::sync::Arc;
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::log::{debug, warn};

#[cfg(feature = "sentry")]
use {
    sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer},
    tower::ServiceBuilder,
};

#[derive(Clone)]
pub struct HttpState {
    pub bot: Arc<HomeworkBot>,
    pub verifier: SignatureVerifier,
    pub tracing_reload: TracingReloadHandle,
}

async fn auth_middleware(
    axum::extract::State(expected_token): axum::extract::State<String>,
    headers: axum::http::HeaderMap,
    request: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Result<axum::response::Response, HttpError> {
    let auth_header = headers.get("authorization").ok_or(HttpError {
        status: StatusCode::UNAUTHORIZED,
        message: "Missing authorization header".to_string(),
    })?;

    let auth_str = auth_header.to_str().map_err(|_| HttpError {
        status: StatusCode::BAD_REQUEST,
        message: "Invalid authorization header".to_string(),
    })?;

    let token = auth_str.strip_prefix("Bearer ").unwrap_or(auth_str).trim();
    if token != expected_token {
        return Err(HttpError {
            status: StatusCode::UNAUTHORIZED,
            message: "Invalid token".to_string(),
        });
    }

    Ok(next.run(request).await)
}

/// Builds the router. The `/sys` routes are only mounted when an admin token is given.
pub fn create_app(
    config: &HTTPConfig,
    admin_token: Option<String>,
    state: HttpState,
    _sentry: bool,
) -> Result<axum::Router> {
    if !config.callback_path.starts_with('/') {
        bail!(
            "http.callback_path must start with '/', got {:?}",
            config.callback_path
        );
    }

    let mut router = axum::Router::new()
        .route(&config.callback_path, post(callback))
        .route("/health", get(health));

    match admin_token {
        Some(token) => {
            debug!("Adding authenticated /sys routes!");
            router = router.merge(
                axum::Router::new()
                    .route("/sys/version", get(sys_version))
                    .route("/sys/set-log-level", post(sys_set_log_level))
                    .layer(axum::middleware::from_fn_with_state(token, auth_middleware)),
            );
        }
        None => warn!("No BOT_ADMIN_TOKEN set, /sys routes are disabled!"),
    }

    router = router.layer(SetResponseHeaderLayer::overriding(
        HeaderName::from_static("x-version"),
        HeaderValue::from_static(crate::VERSION),
    ));

    // If Sentry is enabled, include axum integration layers.
    #[cfg(feature = "sentry")]
    if _sentry {
        debug!("Adding Sentry HTTP layer!");
        router = router
            .layer(
                ServiceBuilder::new()
                    .layer(NewSentryLayer::<axum::http::Request<axum::body::Body>>::new_from_top()),
            )
            .layer(ServiceBuilder::new().layer(SentryHttpLayer::new().enable_transaction()))
    }

    Ok(router.with_state(state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::testing::{fake_bot, Call, CallLog};
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use tracing_subscriber::{reload, EnvFilter, Registry};

    const SECRET: &str = "channel-secret";
    const ADMIN: &str = "admin-token";

    type ReloadLayer = reload::Layer<EnvFilter, Registry>;

    struct TestApp {
        router: axum::Router,
        calls: CallLog,

        /// The reload handle only works while its layer is alive.
        _reload_layer: ReloadLayer,
    }

    fn app_with(answer: Option<&str>, accept_replies: bool) -> TestApp {
        let (bot, calls) = fake_bot(answer, accept_replies, Some("Sorry, try again later."));
        let (reload_layer, tracing_reload) = reload::Layer::new(EnvFilter::new("info"));

        let state = HttpState {
            bot: Arc::new(bot),
            verifier: SignatureVerifier::new(SECRET),
            tracing_reload,
        };
        let router =
            create_app(&HTTPConfig::default(), Some(ADMIN.to_string()), state, false).unwrap();

        TestApp {
            router,
            calls,
            _reload_layer: reload_layer,
        }
    }

    fn app() -> TestApp {
        app_with(Some("x = 2"), true)
    }

    fn text_event(token: &str, text: &str) -> Value {
        json!({
            "type": "message",
            "replyToken": token,
            "source": { "type": "user", "userId": "U4af4980629" },
            "timestamp": 1462629479859_i64,
            "message": { "type": "text", "id": "325708", "text": text }
        })
    }

    fn sticker_event(token: &str) -> Value {
        json!({
            "type": "message",
            "replyToken": token,
            "source": { "type": "user", "userId": "U4af4980629" },
            "message": { "type": "sticker", "id": "1501597916", "packageId": "446", "stickerId": "1988" }
        })
    }

    fn body(events: Value) -> String {
        json!({ "destination": "Udeadbeef", "events": events }).to_string()
    }

    fn signed(body: &str) -> Request<Body> {
        let signature = SignatureVerifier::new(SECRET).sign(body.as_bytes());
        Request::post("/callback")
            .header("content-type", "application/json")
            .header("x-line-signature", signature)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn send(router: &axum::Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn test_text_event_completes_then_replies() {
        let app = app();
        let (status, response) = send(
            &app.router,
            signed(&body(json!([text_event("token-1", "solve 2x+5=9")]))),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(response["response"]["replied"], 1);
        assert_eq!(
            *app.calls.lock().unwrap(),
            vec![
                Call::Complete("solve 2x+5=9".to_string()),
                Call::Reply {
                    token: "token-1".to_string(),
                    text: "x = 2".to_string()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_invalid_signature_rejected() {
        let app = app();
        let payload = body(json!([text_event("token-1", "solve 2x+5=9")]));
        let request = Request::post("/callback")
            .header("x-line-signature", SignatureVerifier::new("wrong").sign(payload.as_bytes()))
            .body(Body::from(payload))
            .unwrap();

        let (status, response) = send(&app.router, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(response["success"], false);
        assert!(app.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_signature_rejected() {
        let app = app();
        let request = Request::post("/callback")
            .body(Body::from(body(json!([text_event("token-1", "hi")]))))
            .unwrap();

        let (status, _) = send(&app.router, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(app.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sticker_is_skipped() {
        let app = app();
        let (status, response) = send(
            &app.router,
            signed(&body(json!([
                sticker_event("sticker-token"),
                text_event("text-token", "what is 7*6?")
            ]))),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            response["response"],
            json!({ "received": 2, "replied": 1, "skipped": 1, "failed": 0 })
        );

        let calls = app.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(
            calls[1],
            Call::Reply {
                token: "text-token".to_string(),
                text: "x = 2".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_only_non_text_events_is_noop() {
        let app = app();
        let (status, _) = send(
            &app.router,
            signed(&body(json!([sticker_event("a"), { "type": "follow", "replyToken": "b" }]))),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert!(app.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_verification_ping() {
        let app = app();
        let (status, response) = send(&app.router, signed(&body(json!([])))).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(response["response"]["received"], 0);
    }

    #[tokio::test]
    async fn test_completion_failure_is_distinguishable() {
        let app = app_with(None, true);
        let (status, response) = send(
            &app.router,
            signed(&body(json!([text_event("token-1", "solve 2x+5=9")]))),
        )
        .await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response["success"], false);

        // Only the fallback text goes out, never a model answer.
        let calls = app.calls.lock().unwrap();
        assert_eq!(
            *calls,
            vec![
                Call::Complete("solve 2x+5=9".to_string()),
                Call::Reply {
                    token: "token-1".to_string(),
                    text: "Sorry, try again later.".to_string()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_reply_failure_is_error() {
        let app = app_with(Some("x = 2"), false);
        let (status, _) = send(
            &app.router,
            signed(&body(json!([text_event("expired", "solve 2x+5=9")]))),
        )
        .await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_replay_is_not_deduplicated() {
        let app = app();
        let payload = body(json!([text_event("token-1", "solve 2x+5=9")]));

        for _ in 0..2 {
            let (status, _) = send(&app.router, signed(&payload)).await;
            assert_eq!(status, StatusCode::OK);
        }
        assert_eq!(app.calls.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_signed_garbage_body() {
        let app = app();
        let (status, _) = send(&app.router, signed("{\"no_events\": true}")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app.router, signed("not json")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(app.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_health_and_version_header() {
        let app = app();
        let response = app
            .router
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("x-version").unwrap(),
            crate::VERSION
        );
    }

    #[tokio::test]
    async fn test_sys_routes_require_token() {
        let app = app();
        let (status, _) = send(
            &app.router,
            Request::get("/sys/version").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, response) = send(
            &app.router,
            Request::get("/sys/version")
                .header("authorization", format!("Bearer {ADMIN}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(response["response"], crate::VERSION);
    }

    #[tokio::test]
    async fn test_set_log_level() {
        let app = app();
        let request = |level: &str| {
            Request::post("/sys/set-log-level")
                .header("authorization", format!("Bearer {ADMIN}"))
                .header("content-type", "application/json")
                .body(Body::from(json!({ "level": level }).to_string()))
                .unwrap()
        };

        let (status, response) = send(&app.router, request("debug,hyper=warn")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(response["response"], true);

        let (status, _) = send(&app.router, request("foo=notalevel")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_sys_routes_absent_without_token() {
        let (bot, _) = fake_bot(Some("x = 2"), true, None);
        let (_layer, tracing_reload) = reload::Layer::<EnvFilter, Registry>::new(EnvFilter::new("info"));
        let state = HttpState {
            bot: Arc::new(bot),
            verifier: SignatureVerifier::new(SECRET),
            tracing_reload,
        };
        let router = create_app(&HTTPConfig::default(), None, state, false).unwrap();

        let response = router
            .oneshot(
                Request::get("/sys/version")
                    .header("authorization", format!("Bearer {ADMIN}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_rejects_relative_callback_path() {
        let (bot, _) = fake_bot(None, true, None);
        let (_layer, tracing_reload) = reload::Layer::<EnvFilter, Registry>::new(EnvFilter::new("info"));
        let state = HttpState {
            bot: Arc::new(bot),
            verifier: SignatureVerifier::new(SECRET),
            tracing_reload,
        };
        let config = HTTPConfig {
            callback_path: "callback".to_string(),
            ..Default::default()
        };
        assert!(create_app(&config, None, state, false).is_err());
    }
}
