//! Provider notification endpoints.
//!
//! The raw body and headers are handed to the reconciler untouched; the
//! provider adapter authenticates them and encodes the acknowledgment.

use crate::error::AppError;
use crate::state::AppState;
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use storefront_core::payment::PaymentMethod;
use storefront_core::provider::InboundNotification;

/// `POST /payments/callback`
///
/// # Errors
///
/// 404 when Alipay is not configured.
pub async fn alipay(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    acknowledge(&state, PaymentMethod::Alipay, &headers, body).await
}

/// `POST /payments/wechat/callback`
///
/// # Errors
///
/// 404 when WeChat Pay is not configured.
pub async fn wechat(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    acknowledge(&state, PaymentMethod::Wechat, &headers, body).await
}

async fn acknowledge(
    state: &AppState,
    method: PaymentMethod,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let notification = InboundNotification {
        headers: headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect(),
        body: body.to_vec(),
    };

    let ack = state
        .reconciler
        .handle(method, &notification)
        .await
        .ok_or_else(|| AppError::not_found(format!("Payment method {method} is not configured")))?;

    let status = StatusCode::from_u16(ack.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    Ok((status, [(header::CONTENT_TYPE, ack.content_type)], ack.body).into_response())
}
