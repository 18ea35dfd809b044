//! Error taxonomy.
//!
//! Every rejection carries a stable [`ErrorKind`], a stable machine-readable
//! code and a human-readable message. No variant implies a state change:
//! failed operations roll back their whole unit of work.

use crate::order::OrderStatus;
use crate::payment::PaymentStatus;
use crate::types::{AddressId, Money, OrderId, ProductId};
use thiserror::Error;

/// Errors raised by persistence implementations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write.
    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    /// Connection, query or commit failure.
    #[error("Database error: {0}")]
    Database(String),
}

/// Coarse classification used for transport mapping and retry decisions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed request or missing field
    Validation,
    /// Requester does not own the resource
    Authorization,
    /// Order, product, address or payment missing
    NotFound,
    /// Wrong status for the requested transition
    Conflict,
    /// Insufficient stock
    ResourceExhausted,
    /// Payment provider failure or untrusted notification
    ExternalDependency,
    /// Commit or query failure, caller may retry
    Persistence,
}

impl ErrorKind {
    /// Lowercase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Authorization => "authorization",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::ResourceExhausted => "resource_exhausted",
            Self::ExternalDependency => "external_dependency",
            Self::Persistence => "persistence",
        }
    }
}

/// Domain error returned by every order and payment operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommerceError {
    /// Request failed validation.
    #[error("{0}")]
    Validation(String),

    /// Requester is not the owner of the resource.
    #[error("{0}")]
    Forbidden(String),

    /// Shipping address does not exist.
    #[error("Address {0} does not exist")]
    InvalidAddress(AddressId),

    /// Order does not exist.
    #[error("Order {0} not found")]
    OrderNotFound(OrderId),

    /// Product does not exist.
    #[error("Product {0} not found")]
    ProductNotFound(ProductId),

    /// Payment with this number does not exist.
    #[error("Payment {0} not found")]
    PaymentNotFound(String),

    /// Product exists but is not on sale.
    #[error("Product {0} is not available for sale")]
    ProductUnavailable(ProductId),

    /// Requested quantity exceeds the stock seen when reading the product.
    #[error("Insufficient stock for product {product_id}: requested {requested}, available {available}")]
    InsufficientStock {
        /// Product short on stock
        product_id: ProductId,
        /// Units requested
        requested: u32,
        /// Units available
        available: u32,
    },

    /// Conditional stock decrement affected no row.
    #[error("Product {0} is out of stock")]
    OutOfStock(ProductId),

    /// Order is not in a status that allows the requested action.
    #[error("Order {order_id} is {status}, cannot {action}")]
    InvalidState {
        /// Order in question
        order_id: OrderId,
        /// Its current status
        status: OrderStatus,
        /// Rejected action
        action: &'static str,
    },

    /// Existing payment for the order is no longer pending.
    #[error("Payment for this order is {0}, charge not supported")]
    InvalidPaymentState(PaymentStatus),

    /// Charge amount differs from the order total.
    #[error("Amount {actual} does not match order total {expected}")]
    AmountMismatch {
        /// Order total
        expected: Money,
        /// Requested amount
        actual: Money,
    },

    /// Payment method unknown or not configured.
    #[error("Unsupported payment method: {0}")]
    UnsupportedPaymentMethod(String),

    /// Order number collided or the header could not be written.
    #[error("Order creation failed: {0}")]
    OrderCreationFailed(String),

    /// Provider notification failed signature verification.
    #[error("Invalid notification signature")]
    InvalidSignature,

    /// Provider notification could not be parsed.
    #[error("Malformed notification: {0}")]
    MalformedNotification(String),

    /// Provider call failed.
    #[error("Payment provider error: {0}")]
    Provider(String),

    /// Persistence failure.
    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl CommerceError {
    /// Stable classification of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_)
            | Self::AmountMismatch { .. }
            | Self::UnsupportedPaymentMethod(_) => ErrorKind::Validation,
            Self::Forbidden(_) => ErrorKind::Authorization,
            Self::InvalidAddress(_)
            | Self::OrderNotFound(_)
            | Self::ProductNotFound(_)
            | Self::PaymentNotFound(_) => ErrorKind::NotFound,
            Self::ProductUnavailable(_)
            | Self::InvalidState { .. }
            | Self::InvalidPaymentState(_) => ErrorKind::Conflict,
            Self::InsufficientStock { .. } | Self::OutOfStock(_) => ErrorKind::ResourceExhausted,
            Self::InvalidSignature | Self::MalformedNotification(_) | Self::Provider(_) => {
                ErrorKind::ExternalDependency
            }
            Self::OrderCreationFailed(_) | Self::Storage(_) => ErrorKind::Persistence,
        }
    }

    /// Stable upper-snake code for clients.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::InvalidAddress(_) => "INVALID_ADDRESS",
            Self::OrderNotFound(_) => "ORDER_NOT_FOUND",
            Self::ProductNotFound(_) => "PRODUCT_NOT_FOUND",
            Self::PaymentNotFound(_) => "PAYMENT_NOT_FOUND",
            Self::ProductUnavailable(_) => "PRODUCT_UNAVAILABLE",
            Self::InsufficientStock { .. } => "INSUFFICIENT_STOCK",
            Self::OutOfStock(_) => "OUT_OF_STOCK",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::InvalidPaymentState(_) => "INVALID_PAYMENT_STATE",
            Self::AmountMismatch { .. } => "AMOUNT_MISMATCH",
            Self::UnsupportedPaymentMethod(_) => "UNSUPPORTED_PAYMENT_METHOD",
            Self::OrderCreationFailed(_) => "ORDER_CREATION_FAILED",
            Self::InvalidSignature => "INVALID_SIGNATURE",
            Self::MalformedNotification(_) => "MALFORMED_NOTIFICATION",
            Self::Provider(_) => "PROVIDER_ERROR",
            Self::Storage(_) => "PERSISTENCE_ERROR",
        }
    }
}

/// Result alias for domain operations.
pub type CommerceResult<T> = Result<T, CommerceError>;
