//! Custom Axum extractors.
//!
//! - [`AuthUser`]: the caller authenticated by [`require_auth`](crate::middleware::require_auth)
//! - [`JsonBody`]: `Json<T>` whose rejections use the [`AppError`] body shape

use crate::auth::AuthUser;
use crate::error::AppError;
use axum::{
    Json, async_trait,
    extract::{FromRequest, FromRequestParts, Request, rejection::JsonRejection},
    http::request::Parts,
};
use serde::de::DeserializeOwned;

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Self>()
            .cloned()
            .ok_or_else(|| AppError::unauthorized("Authentication required"))
    }
}

/// JSON request body.
///
/// Syntax errors and a wrong content type give 400; well-formed JSON that
/// does not fit `T` gives 422.
#[derive(Debug, Clone)]
pub struct JsonBody<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for JsonBody<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(JsonRejection::JsonDataError(e)) => Err(AppError::new(
                axum::http::StatusCode::UNPROCESSABLE_ENTITY,
                e.body_text(),
                "VALIDATION_ERROR".to_string(),
            )),
            Err(other) => Err(AppError::bad_request(other.body_text())),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{self, StatusCode, header};
    use chrono::Utc;
    use serde::Deserialize;
    use storefront_core::UserId;

    #[derive(Debug, Deserialize)]
    struct Payload {
        quantity: u32,
    }

    fn json_request(body: &'static str) -> Request {
        http::Request::builder()
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn auth_user_comes_from_extensions() {
        let user = AuthUser {
            user_id: UserId::new(1),
            username: "ada".into(),
            role: "buyer".into(),
            token: "t".into(),
            expires_at: Utc::now(),
        };
        let mut req = http::Request::builder().body(()).unwrap();
        req.extensions_mut().insert(user.clone());
        let (mut parts, ()) = req.into_parts();

        let extracted = AuthUser::from_request_parts(&mut parts, &()).await.unwrap();

        assert_eq!(extracted, user);
    }

    #[tokio::test]
    async fn missing_auth_user_is_unauthorized() {
        let (mut parts, ()) = http::Request::builder().body(()).unwrap().into_parts();

        let err = AuthUser::from_request_parts(&mut parts, &()).await.unwrap_err();

        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn json_body_distinguishes_syntax_from_shape() {
        let JsonBody(ok) = JsonBody::<Payload>::from_request(json_request(r#"{"quantity": 2}"#), &())
            .await
            .unwrap();
        assert_eq!(ok.quantity, 2);

        let shape = JsonBody::<Payload>::from_request(json_request(r#"{"quantity": -1}"#), &())
            .await
            .unwrap_err();
        assert_eq!(shape.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let syntax = JsonBody::<Payload>::from_request(json_request("{"), &())
            .await
            .unwrap_err();
        assert_eq!(syntax.status(), StatusCode::BAD_REQUEST);
    }
}
