//! Order endpoints.

use crate::auth::AuthUser;
use crate::error::AppError;
use crate::extractors::JsonBody;
use crate::state::AppState;
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::Deserialize;
use std::str::FromStr;
use storefront_core::OrderId;
use storefront_core::order::{NewOrder, Order, OrderStatus, OrderUpdate};
use uuid::Uuid;

/// `?status=` filter shared by the list endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct StatusFilter {
    /// Lowercase status name
    pub status: Option<String>,
}

impl StatusFilter {
    pub(crate) fn parse<T: FromStr<Err = String>>(&self) -> Result<Option<T>, AppError> {
        self.status
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(T::from_str)
            .transpose()
            .map_err(AppError::bad_request)
    }
}

/// `POST /orders`
///
/// # Errors
///
/// Validation, address, product and stock failures from order creation.
pub async fn create(
    State(state): State<AppState>,
    user: AuthUser,
    JsonBody(request): JsonBody<NewOrder>,
) -> Result<(StatusCode, Json<Order>), AppError> {
    let order = state.orders.create(user.user_id, request).await?;
    Ok((StatusCode::CREATED, Json(order)))
}

/// `GET /orders?status=`
///
/// # Errors
///
/// 400 for an unknown status.
pub async fn list(
    State(state): State<AppState>,
    user: AuthUser,
    Query(filter): Query<StatusFilter>,
) -> Result<Json<Vec<Order>>, AppError> {
    let status = filter.parse::<OrderStatus>()?;
    Ok(Json(state.orders.list(user.user_id, status).await?))
}

/// `GET /orders/:id`
///
/// # Errors
///
/// 404 for an unknown order, 403 for someone else's.
pub async fn get(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(state.orders.get(OrderId::from_uuid(id), user.user_id).await?))
}

/// `PUT /orders/:id`
///
/// # Errors
///
/// 422 when nothing would change, 409 once the order left `pending`.
pub async fn update(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    JsonBody(update): JsonBody<OrderUpdate>,
) -> Result<Json<Order>, AppError> {
    let order = state
        .orders
        .update(OrderId::from_uuid(id), user.user_id, update)
        .await?;
    Ok(Json(order))
}

/// `POST /orders/:id/cancel`
///
/// # Errors
///
/// 409 if the order is not `pending`.
pub async fn cancel(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(
        state
            .orders
            .cancel(OrderId::from_uuid(id), user.user_id)
            .await?,
    ))
}
