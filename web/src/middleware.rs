//! Request middleware.
//!
//! - [`correlation_id_layer`]: tags every request with an `X-Correlation-ID`,
//!   records it on an `http_request` span and echoes it on the response.
//! - [`require_auth`]: bearer-token authentication for the buyer routes,
//!   renewing tokens that are about to expire.

use crate::auth::{AuthError, bearer_token};
use crate::error::AppError;
use crate::state::AppState;
use axum::{
    extract::{Request, State},
    http::{HeaderValue, header::AUTHORIZATION},
    middleware::Next,
    response::Response,
};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::Instrument;
use uuid::Uuid;

/// Header name for correlation ID.
pub const CORRELATION_ID_HEADER: &str = "X-Correlation-ID";

/// Correlation id of the current request, stored in request extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrelationId(pub Uuid);

/// Layer that assigns a correlation id to every request.
#[must_use]
pub const fn correlation_id_layer() -> CorrelationIdLayer {
    CorrelationIdLayer
}

/// Layer for correlation ID tracking.
#[derive(Clone, Copy, Debug)]
pub struct CorrelationIdLayer;

impl<S> Layer<S> for CorrelationIdLayer {
    type Service = CorrelationIdService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CorrelationIdService { inner }
    }
}

/// Service produced by [`CorrelationIdLayer`].
#[derive(Clone, Debug)]
pub struct CorrelationIdService<S> {
    inner: S,
}

impl<S> Service<Request> for CorrelationIdService<S>
where
    S: Service<Request, Response = Response> + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request) -> Self::Future {
        // Unparsable ids are replaced rather than echoed.
        let id = req
            .headers()
            .get(CORRELATION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| Uuid::parse_str(s.trim()).ok())
            .unwrap_or_else(Uuid::new_v4);
        req.extensions_mut().insert(CorrelationId(id));

        let span = tracing::info_span!(
            "http_request",
            correlation_id = %id,
            method = %req.method(),
            path = %req.uri().path(),
        );
        let fut = self.inner.call(req);

        Box::pin(
            async move {
                let mut response = fut.await?;
                if let Ok(value) = HeaderValue::from_str(&id.to_string()) {
                    response.headers_mut().insert(CORRELATION_ID_HEADER, value);
                }
                Ok(response)
            }
            .instrument(span),
        )
    }
}

/// Authenticate the bearer token and expose the caller as an
/// [`AuthUser`](crate::auth::AuthUser) extension.
///
/// | failure | status |
/// |---|---|
/// | no or malformed `Authorization` header | 401 |
/// | bad signature, expired or revoked token | 401 |
///
/// When the token expires within the refresh threshold the response carries
/// a renewed `Authorization: Bearer <token>` header.
///
/// # Errors
///
/// [`AppError`] with status 401 when authentication fails.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let now = state.clock.now();
    let header = req
        .headers()
        .get(AUTHORIZATION)
        .ok_or(AuthError::MissingToken)
        .and_then(|h| h.to_str().map_err(|_| AuthError::MalformedHeader))?;
    let token = bearer_token(header).ok_or(AuthError::MalformedHeader)?;
    if state.revocations.is_revoked(token, now) {
        return Err(AuthError::Revoked.into());
    }
    let user = state.jwt.verify(token, now)?;

    let renewed = match state.jwt.renewal(&user, now) {
        Ok(renewed) => renewed,
        Err(e) => {
            tracing::warn!(user_id = %user.user_id, error = %e, "Token renewal failed");
            None
        }
    };
    req.extensions_mut().insert(user);

    let mut response = next.run(req).await;
    if let Some(token) = renewed {
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
            response.headers_mut().insert(AUTHORIZATION, value);
        }
    }
    Ok(response)
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        tracing::debug!(error = %err, "Authentication failed");
        match err {
            AuthError::Generation(_) => Self::internal("Token generation failed"),
            other => Self::unauthorized(other.to_string()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::{Router, body::Body, http, routing::get};
    use tower::ServiceExt;

    fn app() -> Router {
        Router::new()
            .route(
                "/echo",
                get(|axum::Extension(id): axum::Extension<CorrelationId>| async move {
                    id.0.to_string()
                }),
            )
            .layer(correlation_id_layer())
    }

    #[tokio::test]
    async fn correlation_id_generated_if_missing() {
        let request = http::Request::builder().uri("/echo").body(Body::empty()).unwrap();

        let response = app().oneshot(request).await.unwrap();

        let header = response
            .headers()
            .get(CORRELATION_ID_HEADER)
            .expect("correlation id header")
            .to_str()
            .unwrap();
        assert!(Uuid::parse_str(header).is_ok());
    }

    #[tokio::test]
    async fn correlation_id_preserved_and_visible_to_handlers() {
        let id = Uuid::new_v4();
        let request = http::Request::builder()
            .uri("/echo")
            .header(CORRELATION_ID_HEADER, id.to_string())
            .body(Body::empty())
            .unwrap();

        let response = app().oneshot(request).await.unwrap();

        assert_eq!(
            response.headers().get(CORRELATION_ID_HEADER).unwrap(),
            id.to_string().as_str()
        );
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(body, id.to_string().as_bytes());
    }

    #[tokio::test]
    async fn invalid_correlation_id_is_replaced() {
        let request = http::Request::builder()
            .uri("/echo")
            .header(CORRELATION_ID_HEADER, "not-a-uuid")
            .body(Body::empty())
            .unwrap();

        let response = app().oneshot(request).await.unwrap();

        let header = response.headers().get(CORRELATION_ID_HEADER).unwrap();
        assert_ne!(header, "not-a-uuid");
    }
}
