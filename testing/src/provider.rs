//! Scriptable payment provider.
//!
//! Notifications are JSON bodies:
//!
//! ```json
//! {"payment_number": "…", "trade_status": "SUCCESS", "amount": "25.00"}
//! ```
//!
//! and verify only when carrying the header `x-mock-signature: valid`.

use serde::Deserialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use storefront_core::payment::PaymentMethod;
use storefront_core::provider::{
    AckOutcome, Acknowledgement, ChargeAction, ChargeRequest, InboundNotification,
    PaymentProvider, ProviderError, ProviderResult, VerifiedNotification,
};
use storefront_core::types::Money;

/// Header a notification must carry to verify.
pub const SIGNATURE_HEADER: &str = "x-mock-signature";

/// Trade status the mock treats as paid.
pub const PAID_STATUS: &str = "SUCCESS";

#[derive(Deserialize)]
struct MockNotification {
    payment_number: String,
    trade_status: String,
    #[serde(default)]
    amount: Option<Money>,
}

/// Payment provider double that records charges and answers from a script.
#[derive(Debug)]
pub struct MockProvider {
    method: PaymentMethod,
    charges: Mutex<Vec<ChargeRequest>>,
    failures: Mutex<Vec<ProviderError>>,
}

impl MockProvider {
    /// Provider for `method` that always succeeds.
    #[must_use]
    pub fn new(method: PaymentMethod) -> Self {
        Self {
            method,
            charges: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
        }
    }

    /// Queue errors returned by the next charge calls, first in first out.
    pub fn fail_next_charges(&self, errors: impl IntoIterator<Item = ProviderError>) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.extend(errors);
        }
    }

    /// Every charge request received, including failed ones.
    #[must_use]
    pub fn charges(&self) -> Vec<ChargeRequest> {
        self.charges.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// A notification this provider will accept.
    #[must_use]
    pub fn signed_notification(
        payment_number: &str,
        trade_status: &str,
        amount: Option<Money>,
    ) -> InboundNotification {
        let mut notification = Self::unsigned_notification(payment_number, trade_status, amount);
        notification
            .headers
            .insert(SIGNATURE_HEADER.to_string(), "valid".to_string());
        notification
    }

    /// A well-formed notification without a valid signature.
    #[must_use]
    pub fn unsigned_notification(
        payment_number: &str,
        trade_status: &str,
        amount: Option<Money>,
    ) -> InboundNotification {
        let body = serde_json::json!({
            "payment_number": payment_number,
            "trade_status": trade_status,
            "amount": amount,
        });
        InboundNotification {
            headers: [("content-type".to_string(), "application/json".to_string())].into(),
            body: body.to_string().into_bytes(),
        }
    }

    /// Redirect URL returned for a payment number.
    #[must_use]
    pub fn checkout_url(payment_number: &str) -> String {
        format!("https://pay.example.test/checkout/{payment_number}")
    }
}

impl PaymentProvider for MockProvider {
    fn method(&self) -> PaymentMethod {
        self.method
    }

    fn create_charge(
        &self,
        request: ChargeRequest,
    ) -> Pin<Box<dyn Future<Output = ProviderResult<ChargeAction>> + Send + '_>> {
        Box::pin(async move {
            let url = Self::checkout_url(&request.payment_number);
            if let Ok(mut charges) = self.charges.lock() {
                charges.push(request);
            }
            let failure = self.failures.lock().ok().and_then(|mut f| {
                if f.is_empty() { None } else { Some(f.remove(0)) }
            });
            match failure {
                Some(error) => Err(error),
                None => Ok(ChargeAction::Redirect { url }),
            }
        })
    }

    fn verify_notification(
        &self,
        notification: &InboundNotification,
    ) -> ProviderResult<VerifiedNotification> {
        if notification.header(SIGNATURE_HEADER) != Some("valid") {
            return Err(ProviderError::InvalidSignature);
        }
        let parsed: MockNotification = serde_json::from_slice(&notification.body)
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;
        Ok(VerifiedNotification {
            paid: parsed.trade_status == PAID_STATUS,
            payment_number: parsed.payment_number,
            provider_trade_no: None,
            trade_status: parsed.trade_status,
            amount: parsed.amount,
        })
    }

    fn acknowledge(&self, outcome: AckOutcome) -> Acknowledgement {
        let (status, body) = match outcome {
            AckOutcome::Accepted => (200, "success"),
            AckOutcome::Rejected => (400, "failure"),
            AckOutcome::NotFound => (404, "failure"),
            AckOutcome::Retry => (500, "failure"),
        };
        Acknowledgement {
            status,
            content_type: "text/plain",
            body: body.to_string(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn unsigned_notifications_are_rejected() {
        let provider = MockProvider::new(PaymentMethod::Alipay);
        let notification = MockProvider::unsigned_notification("abc", PAID_STATUS, None);
        assert_eq!(
            provider.verify_notification(&notification),
            Err(ProviderError::InvalidSignature)
        );
    }

    #[test]
    fn signed_notification_decodes_amount() {
        let provider = MockProvider::new(PaymentMethod::Alipay);
        let notification =
            MockProvider::signed_notification("abc", PAID_STATUS, Some(Money::from_cents(2500)));
        let verified = provider.verify_notification(&notification).unwrap();
        assert!(verified.paid);
        assert_eq!(verified.amount, Some(Money::from_cents(2500)));
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed_in_order() {
        let provider = MockProvider::new(PaymentMethod::Wechat);
        provider.fail_next_charges([ProviderError::Transport("reset".into())]);
        let request = ChargeRequest {
            payment_number: "p1".into(),
            order_number: "o1".into(),
            amount: Money::from_cents(100),
            subject: "o1".into(),
        };

        assert!(provider.create_charge(request.clone()).await.is_err());
        assert!(provider.create_charge(request).await.is_ok());
        assert_eq!(provider.charges().len(), 2);
    }
}
