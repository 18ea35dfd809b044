//! Payment endpoints.

use super::orders::StatusFilter;
use crate::auth::AuthUser;
use crate::error::AppError;
use crate::extractors::JsonBody;
use crate::state::AppState;
use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use storefront_core::payment::{Payment, PaymentMethod, PaymentStatus};
use storefront_core::provider::ChargeAction;
use storefront_core::{CommerceError, Money, OrderId};
use uuid::Uuid;

/// Body of `POST /payments`.
#[derive(Debug, Deserialize)]
pub struct ChargeBody {
    /// Order to pay
    pub order_id: Uuid,
    /// Must equal the order total; string or number
    pub amount: Money,
    /// `alipay` or `wechat`
    pub method: String,
}

/// Response of `POST /payments`.
#[derive(Debug, Serialize)]
pub struct ChargeResponse {
    /// The pending payment
    pub payment: Payment,
    /// Redirect URL or QR payload
    pub action: ChargeAction,
    /// Whether an earlier pending payment was reused
    pub reused: bool,
}

/// `POST /payments`
///
/// 201 for a new payment, 200 when an existing pending one is reused.
///
/// # Errors
///
/// 422 for an unknown method or wrong amount, 409 when the order or its
/// payment is no longer pending, 502 when the provider fails.
pub async fn charge(
    State(state): State<AppState>,
    user: AuthUser,
    JsonBody(body): JsonBody<ChargeBody>,
) -> Result<(StatusCode, Json<ChargeResponse>), AppError> {
    let method: PaymentMethod = body
        .method
        .parse()
        .map_err(CommerceError::UnsupportedPaymentMethod)?;
    let outcome = state
        .payments
        .charge(user.user_id, OrderId::from_uuid(body.order_id), body.amount, method)
        .await?;

    let status = if outcome.reused {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((
        status,
        Json(ChargeResponse {
            payment: outcome.payment,
            action: outcome.action,
            reused: outcome.reused,
        }),
    ))
}

/// `GET /payments?status=`
///
/// # Errors
///
/// 400 for an unknown status.
pub async fn list(
    State(state): State<AppState>,
    user: AuthUser,
    Query(filter): Query<StatusFilter>,
) -> Result<Json<Vec<Payment>>, AppError> {
    let status = filter.parse::<PaymentStatus>()?;
    Ok(Json(state.payments.list(user.user_id, status).await?))
}
