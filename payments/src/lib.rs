//! # Storefront Payments
//!
//! [`PaymentProvider`](storefront_core::provider::PaymentProvider) adapters
//! for the two supported channels:
//!
//! - **[`AlipayProvider`]**: page pay redirect URLs, RSA2-signed form notifications
//! - **[`WechatPayProvider`]**: API v3 native pay QR payloads, signed JSON
//!   notifications with an AES-256-GCM encrypted resource
//!
//! Adapters are registered in a
//! [`ProviderRegistry`](storefront_core::provider::ProviderRegistry) at startup;
//! a channel without credentials is simply not registered.
//!
//! ## Example
//!
//! ```ignore
//! use storefront_payments::{AlipayConfig, AlipayProvider};
//!
//! let alipay = AlipayProvider::new(config, clock.clone())?;
//! let registry = ProviderRegistry::new().with(Arc::new(alipay));
//! ```

use chrono::{DateTime, FixedOffset, Utc};
use storefront_core::provider::{ProviderError, ProviderResult};

pub mod alipay;
mod signing;
pub mod wechat;

pub use alipay::{AlipayConfig, AlipayProvider};
pub use wechat::{WechatPayConfig, WechatPayProvider};

/// Both providers expect wall-clock times in China Standard Time.
fn china_time(at: DateTime<Utc>) -> ProviderResult<DateTime<FixedOffset>> {
    FixedOffset::east_opt(8 * 3600)
        .map(|offset| at.with_timezone(&offset))
        .ok_or_else(|| ProviderError::Config("invalid UTC+8 offset".into()))
}
