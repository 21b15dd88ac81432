//! Admission middleware.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, trace};

use crate::ratelimit::{AdmissionBackend, Resolution, RuleResolver};

/// Body text returned to denied callers.
pub const DENIAL_MESSAGE: &str =
    "you have reached the maximum number of requests or actions allowed within a certain time frame";

/// Body text returned when the admission check itself failed.
pub const INTERNAL_ERROR_MESSAGE: &str = "internal error";

/// JSON body of a denial or internal error response.
#[derive(Debug, Serialize)]
struct MessageBody {
    message: &'static str,
}

/// State shared by every admission check.
#[derive(Clone)]
pub struct AdmissionState {
    resolver: Arc<RuleResolver>,
    backend: Arc<dyn AdmissionBackend>,
}

impl AdmissionState {
    /// Create the middleware state from a resolver and a backend.
    pub fn new(resolver: Arc<RuleResolver>, backend: Arc<dyn AdmissionBackend>) -> Self {
        Self { resolver, backend }
    }
}

/// Admit, deny, or fail each request before it reaches the router.
///
/// Store failures fail closed: the caller gets a 500 and the request is not
/// forwarded.
pub async fn admission_control(
    State(state): State<AdmissionState>,
    req: Request,
    next: Next,
) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);

    let Resolution { identifier, rule } = state.resolver.resolve_request(req.headers(), peer);

    match state.backend.check(&identifier, &rule, Utc::now()).await {
        Ok(verdict) if verdict.allowed => {
            trace!(identifier = %identifier, "Request admitted");
            next.run(req).await
        }
        Ok(verdict) => {
            debug!(
                identifier = %identifier,
                retry_after_ms = verdict.retry_after.as_millis() as u64,
                "Request denied"
            );
            denied(verdict.retry_after)
        }
        Err(e) => {
            error!(identifier = %identifier, error = %e, "Admission check failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(MessageBody {
                    message: INTERNAL_ERROR_MESSAGE,
                }),
            )
                .into_response()
        }
    }
}

fn denied(retry_after: Duration) -> Response {
    let body = Json(MessageBody {
        message: DENIAL_MESSAGE,
    });

    if retry_after.is_zero() {
        return (StatusCode::TOO_MANY_REQUESTS, body).into_response();
    }

    (
        StatusCode::TOO_MANY_REQUESTS,
        [(header::RETRY_AFTER, retry_after_seconds(retry_after).to_string())],
        body,
    )
        .into_response()
}

/// Whole seconds for the `Retry-After` header, rounded up, never below one.
fn retry_after_seconds(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
    secs.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitingConfig;
    use crate::error::{Result, TurnstileError};
    use crate::ratelimit::{Identifier, Mode, Rule, Verdict};
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::routing::get;
    use axum::Router;
    use chrono::DateTime;
    use std::sync::Mutex;
    use tower::ServiceExt;

    /// Checker returning a canned outcome and recording what it was asked.
    struct FakeChecker {
        outcome: Option<Verdict>,
        seen: Mutex<Vec<(String, Rule)>>,
    }

    impl FakeChecker {
        fn allowing() -> Self {
            Self {
                outcome: Some(Verdict::allow()),
                seen: Mutex::default(),
            }
        }

        fn denying(retry_after: Duration) -> Self {
            Self {
                outcome: Some(Verdict::deny(retry_after)),
                seen: Mutex::default(),
            }
        }

        fn failing() -> Self {
            Self {
                outcome: None,
                seen: Mutex::default(),
            }
        }
    }

    #[async_trait]
    impl AdmissionBackend for FakeChecker {
        async fn check(&self, identifier: &Identifier, rule: &Rule, _: DateTime<Utc>) -> Result<Verdict> {
            self.seen
                .lock()
                .unwrap()
                .push((identifier.to_string(), *rule));
            self.outcome
                .ok_or_else(|| TurnstileError::StoreUnavailable("connection refused".to_string()))
        }
    }

    fn app(checker: Arc<FakeChecker>, mode: Mode) -> Router {
        let config = RateLimitingConfig {
            mode,
            ..RateLimitingConfig::default()
        };
        let resolver = Arc::new(RuleResolver::new(&config).unwrap());
        let state = AdmissionState::new(resolver, checker);

        Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(axum::middleware::from_fn_with_state(state, admission_control))
    }

    fn request() -> Request {
        axum::http::Request::builder()
            .uri("/")
            .header("API_KEY", "abc")
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_admitted_request_passes_through() {
        let response = app(Arc::new(FakeChecker::allowing()), Mode::Automatic)
            .oneshot(request())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"ok");
    }

    #[tokio::test]
    async fn test_denied_request_gets_429_with_retry_after() {
        let response = app(
            Arc::new(FakeChecker::denying(Duration::from_secs(3))),
            Mode::Automatic,
        )
        .oneshot(request())
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "3");
        assert_eq!(body_json(response).await["message"], DENIAL_MESSAGE);
    }

    #[tokio::test]
    async fn test_denial_without_retry_hint_omits_header() {
        let response = app(Arc::new(FakeChecker::denying(Duration::ZERO)), Mode::Automatic)
            .oneshot(request())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().get(header::RETRY_AFTER).is_none());
    }

    #[tokio::test]
    async fn test_store_failure_fails_closed() {
        let response = app(Arc::new(FakeChecker::failing()), Mode::Automatic)
            .oneshot(request())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["message"], INTERNAL_ERROR_MESSAGE);
        assert!(!body.to_string().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_resolution_reaches_backend() {
        let checker = Arc::new(FakeChecker::allowing());
        app(checker.clone(), Mode::Address)
            .oneshot(
                axum::http::Request::builder()
                    .uri("/")
                    .header("API_KEY", "abc")
                    .header("x-forwarded-for", "203.0.113.5")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let seen = checker.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "ip:203.0.113.5");
        assert_eq!(seen[0].1, Rule::new(10, Duration::from_secs(300)));
    }

    #[test]
    fn test_retry_after_seconds_rounds_up() {
        assert_eq!(retry_after_seconds(Duration::from_secs(5)), 5);
        assert_eq!(retry_after_seconds(Duration::from_millis(4001)), 5);
        assert_eq!(retry_after_seconds(Duration::from_millis(3999)), 4);
        assert_eq!(retry_after_seconds(Duration::from_millis(1)), 1);
    }
}
