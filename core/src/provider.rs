//! Payment-provider contract.
//!
//! Abstraction over third-party payment channels. Each provider knows how to
//! start a charge, how to authenticate its own notifications and how to
//! answer them in its native encoding.

use crate::payment::PaymentMethod;
use crate::types::Money;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Provider result
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Provider error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Credentials or keys are missing or unusable.
    #[error("Provider misconfigured: {0}")]
    Config(String),

    /// The provider could not be reached.
    #[error("Provider unreachable: {0}")]
    Transport(String),

    /// The provider answered with an error.
    #[error("Provider rejected request ({status}): {message}")]
    Rejected {
        /// HTTP status returned
        status: u16,
        /// Provider message
        message: String,
    },

    /// Notification signature did not verify.
    #[error("Invalid notification signature")]
    InvalidSignature,

    /// Notification could not be decoded.
    #[error("Malformed notification: {0}")]
    Malformed(String),
}

impl ProviderError {
    /// Whether retrying the same call may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Rejected { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// What the provider needs to start a charge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChargeRequest {
    /// Our payment number, echoed back in notifications
    pub payment_number: String,
    /// Order number, for the buyer-facing description
    pub order_number: String,
    /// Amount to charge
    pub amount: Money,
    /// Short description shown by the provider
    pub subject: String,
}

/// What the caller must do to complete a charge.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChargeAction {
    /// Send the buyer's browser here
    Redirect {
        /// Provider checkout URL
        url: String,
    },
    /// Render this payload as a QR code for the buyer to scan
    QrCode {
        /// Payload to encode
        payload: String,
    },
}

/// Raw inbound notification as received over HTTP.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InboundNotification {
    /// Header names lowercased
    pub headers: BTreeMap<String, String>,
    /// Raw body bytes
    pub body: Vec<u8>,
}

impl InboundNotification {
    /// Header value by case-insensitive name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Authenticated content of a notification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifiedNotification {
    /// Our payment number (`out_trade_no`)
    pub payment_number: String,
    /// Provider's own trade reference
    pub provider_trade_no: Option<String>,
    /// Provider status code as sent
    pub trade_status: String,
    /// Whether `trade_status` is one of the provider's success codes
    pub paid: bool,
    /// Amount the provider reports, if it reports one
    pub amount: Option<Money>,
}

/// Internal outcome to be encoded as a provider acknowledgment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckOutcome {
    /// Processed, duplicate or non-terminal: stop redelivering
    Accepted,
    /// Signature or payload rejected
    Rejected,
    /// Payment number unknown
    NotFound,
    /// Internal failure, redeliver later
    Retry,
}

/// Provider-native acknowledgment response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Acknowledgement {
    /// HTTP status code
    pub status: u16,
    /// `Content-Type` header value
    pub content_type: &'static str,
    /// Response body
    pub body: String,
}

/// Payment provider trait
pub trait PaymentProvider: Send + Sync {
    /// Method this provider serves.
    fn method(&self) -> PaymentMethod;

    /// Start a charge.
    ///
    /// # Errors
    ///
    /// Returns error if the provider call fails
    fn create_charge(
        &self,
        request: ChargeRequest,
    ) -> Pin<Box<dyn Future<Output = ProviderResult<ChargeAction>> + Send + '_>>;

    /// Authenticate and decode a notification.
    ///
    /// # Errors
    ///
    /// [`ProviderError::InvalidSignature`] or [`ProviderError::Malformed`].
    fn verify_notification(
        &self,
        notification: &InboundNotification,
    ) -> ProviderResult<VerifiedNotification>;

    /// Encode an acknowledgment in the provider's expected format.
    fn acknowledge(&self, outcome: AckOutcome) -> Acknowledgement;
}

/// Configured providers keyed by the method they serve.
///
/// Methods without a registered provider are rejected at charge time.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<PaymentMethod, Arc<dyn PaymentProvider>>,
}

impl ProviderRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `provider` under its own method, replacing any previous one.
    pub fn register(&mut self, provider: Arc<dyn PaymentProvider>) {
        self.providers.insert(provider.method(), provider);
    }

    /// Builder-style [`register`](Self::register).
    #[must_use]
    pub fn with(mut self, provider: Arc<dyn PaymentProvider>) -> Self {
        self.register(provider);
        self
    }

    /// Provider serving `method`.
    #[must_use]
    pub fn get(&self, method: PaymentMethod) -> Option<Arc<dyn PaymentProvider>> {
        self.providers.get(&method).cloned()
    }

    /// Whether no provider is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut methods: Vec<&str> = self.providers.keys().map(PaymentMethod::as_str).collect();
        methods.sort_unstable();
        f.debug_struct("ProviderRegistry")
            .field("methods", &methods)
            .finish()
    }
}
