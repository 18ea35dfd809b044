//! Alipay open platform adapter.
//!
//! Charges use `alipay.trade.page.pay`: the whole request is encoded into a
//! signed gateway URL the buyer's browser is redirected to, so starting a
//! charge makes no outbound call. Notifications arrive as
//! `application/x-www-form-urlencoded` posts signed with Alipay's RSA2 key.

use crate::china_time;
use crate::signing::{RsaSigner, RsaVerifier};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use storefront_core::Money;
use storefront_core::environment::Clock;
use storefront_core::payment::PaymentMethod;
use storefront_core::provider::{
    AckOutcome, Acknowledgement, ChargeAction, ChargeRequest, InboundNotification,
    PaymentProvider, ProviderError, ProviderResult, VerifiedNotification,
};

/// Production gateway.
pub const DEFAULT_GATEWAY: &str = "https://openapi.alipay.com/gateway.do";

const PAGE_PAY_METHOD: &str = "alipay.trade.page.pay";
const PRODUCT_CODE: &str = "FAST_INSTANT_TRADE_PAY";
const PAID_STATUSES: [&str; 2] = ["TRADE_SUCCESS", "TRADE_FINISHED"];

/// Alipay credentials and endpoints.
#[derive(Clone)]
pub struct AlipayConfig {
    /// Application id issued by Alipay
    pub app_id: String,
    /// Merchant application private key (PKCS#8 PEM or bare base64)
    pub private_key: String,
    /// Alipay public key (SPKI PEM or bare base64)
    pub alipay_public_key: String,
    /// Gateway URL, [`DEFAULT_GATEWAY`] in production
    pub gateway: String,
    /// Where Alipay posts asynchronous notifications
    pub notify_url: String,
    /// Where the buyer lands after paying
    pub return_url: Option<String>,
}

impl fmt::Debug for AlipayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlipayConfig")
            .field("app_id", &self.app_id)
            .field("gateway", &self.gateway)
            .field("notify_url", &self.notify_url)
            .field("return_url", &self.return_url)
            .finish_non_exhaustive()
    }
}

/// Alipay [`PaymentProvider`].
pub struct AlipayProvider {
    app_id: String,
    gateway: String,
    notify_url: String,
    return_url: Option<String>,
    signer: RsaSigner,
    verifier: RsaVerifier,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for AlipayProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlipayProvider")
            .field("app_id", &self.app_id)
            .field("gateway", &self.gateway)
            .finish_non_exhaustive()
    }
}

impl AlipayProvider {
    /// Build the adapter, parsing both keys up front.
    ///
    /// # Errors
    ///
    /// [`ProviderError::Config`] if a key cannot be parsed.
    pub fn new(config: AlipayConfig, clock: Arc<dyn Clock>) -> ProviderResult<Self> {
        Ok(Self {
            signer: RsaSigner::from_pem(&config.private_key)?,
            verifier: RsaVerifier::from_pem(&config.alipay_public_key)?,
            app_id: config.app_id,
            gateway: config.gateway,
            notify_url: config.notify_url,
            return_url: config.return_url,
            clock,
        })
    }

    /// Signed page-pay URL for `request`.
    ///
    /// # Errors
    ///
    /// [`ProviderError::Config`] if signing or encoding fails.
    pub fn page_pay_url(&self, request: &ChargeRequest) -> ProviderResult<String> {
        let biz_content = serde_json::json!({
            "out_trade_no": request.payment_number,
            "product_code": PRODUCT_CODE,
            "total_amount": request.amount.to_string(),
            "subject": request.subject,
        })
        .to_string();
        let timestamp = china_time(self.clock.now())?
            .format("%Y-%m-%d %H:%M:%S")
            .to_string();

        let mut params: Vec<(String, String)> = [
            ("app_id", self.app_id.as_str()),
            ("method", PAGE_PAY_METHOD),
            ("format", "JSON"),
            ("charset", "utf-8"),
            ("sign_type", "RSA2"),
            ("timestamp", timestamp.as_str()),
            ("version", "1.0"),
            ("notify_url", self.notify_url.as_str()),
            ("biz_content", biz_content.as_str()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect();
        if let Some(return_url) = &self.return_url {
            params.push(("return_url".into(), return_url.clone()));
        }

        // Requests sign everything but `sign` itself.
        let signature = self
            .signer
            .sign_base64(signing_content(&params, &["sign"]).as_bytes())?;
        params.push(("sign".into(), signature));

        let query = serde_urlencoded::to_string(&params)
            .map_err(|e| ProviderError::Config(format!("Cannot encode request: {e}")))?;
        Ok(format!("{}?{query}", self.gateway))
    }
}

/// `k=v` pairs sorted by key and joined with `&`, skipping `excluded` keys
/// and empty values.
pub(crate) fn signing_content(params: &[(String, String)], excluded: &[&str]) -> String {
    let mut pairs: Vec<&(String, String)> = params
        .iter()
        .filter(|(k, v)| !v.is_empty() && !excluded.contains(&k.as_str()))
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

impl PaymentProvider for AlipayProvider {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::Alipay
    }

    fn create_charge(
        &self,
        request: ChargeRequest,
    ) -> Pin<Box<dyn Future<Output = ProviderResult<ChargeAction>> + Send + '_>> {
        Box::pin(async move {
            let url = self.page_pay_url(&request)?;
            tracing::debug!(payment_number = %request.payment_number, "Alipay page pay URL built");
            Ok(ChargeAction::Redirect { url })
        })
    }

    fn verify_notification(
        &self,
        notification: &InboundNotification,
    ) -> ProviderResult<VerifiedNotification> {
        let params: Vec<(String, String)> = serde_urlencoded::from_bytes(&notification.body)
            .map_err(|e| ProviderError::Malformed(format!("Invalid form body: {e}")))?;
        let field = |name: &str| {
            params
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
                .filter(|v| !v.is_empty())
        };

        let signature = field("sign").ok_or(ProviderError::InvalidSignature)?;
        if field("sign_type").is_some_and(|t| t != "RSA2") {
            return Err(ProviderError::InvalidSignature);
        }
        // Notifications exclude `sign_type` from the signed content too.
        self.verifier.verify_base64(
            signing_content(&params, &["sign", "sign_type"]).as_bytes(),
            signature,
        )?;

        if field("app_id") != Some(self.app_id.as_str()) {
            return Err(ProviderError::Malformed(
                "Notification addressed to another app".into(),
            ));
        }
        let payment_number = field("out_trade_no")
            .ok_or_else(|| ProviderError::Malformed("Missing out_trade_no".into()))?;
        let trade_status = field("trade_status")
            .ok_or_else(|| ProviderError::Malformed("Missing trade_status".into()))?;
        let amount = field("total_amount")
            .map(Money::parse_decimal)
            .transpose()
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;

        Ok(VerifiedNotification {
            payment_number: payment_number.to_owned(),
            provider_trade_no: field("trade_no").map(str::to_owned),
            trade_status: trade_status.to_owned(),
            paid: PAID_STATUSES.contains(&trade_status),
            amount,
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
            content_type: "text/plain; charset=utf-8",
            body: body.into(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::signing::test_keys;
    use std::collections::BTreeMap;
    use storefront_testing::test_clock;

    const APP_ID: &str = "2021000000000001";

    fn provider() -> AlipayProvider {
        AlipayProvider::new(
            AlipayConfig {
                app_id: APP_ID.into(),
                private_key: test_keys::merchant().private_pem.clone(),
                alipay_public_key: test_keys::provider().public_pem.clone(),
                gateway: "https://openapi-sandbox.dl.alipaydev.com/gateway.do".into(),
                notify_url: "https://shop.example.test/payments/callback".into(),
                return_url: Some("https://shop.example.test/orders".into()),
            },
            Arc::new(test_clock()),
        )
        .unwrap()
    }

    /// A notification form as Alipay would post it.
    fn notification(fields: &[(&str, &str)], signer_pem: &str) -> InboundNotification {
        let mut params: Vec<(String, String)> = fields
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        let signer = RsaSigner::from_pem(signer_pem).unwrap();
        let signature = signer
            .sign_base64(signing_content(&params, &["sign", "sign_type"]).as_bytes())
            .unwrap();
        params.push(("sign_type".into(), "RSA2".into()));
        params.push(("sign".into(), signature));
        InboundNotification {
            headers: BTreeMap::from([(
                "content-type".to_owned(),
                "application/x-www-form-urlencoded".to_owned(),
            )]),
            body: serde_urlencoded::to_string(&params).unwrap().into_bytes(),
        }
    }

    fn paid_fields(status: &str) -> Vec<(&'static str, String)> {
        vec![
            ("app_id", APP_ID.to_owned()),
            ("out_trade_no", "a1b2c3".to_owned()),
            ("trade_no", "2025010122001400001".to_owned()),
            ("trade_status", status.to_owned()),
            ("total_amount", "25.00".to_owned()),
            ("buyer_logon_id", String::new()),
        ]
    }

    fn borrowed<'a>(fields: &'a [(&'static str, String)]) -> Vec<(&'static str, &'a str)> {
        fields.iter().map(|(k, v)| (*k, v.as_str())).collect()
    }

    #[test]
    fn signing_content_sorts_and_skips_empty_values() {
        let params = vec![
            ("b".to_owned(), "2".to_owned()),
            ("sign".to_owned(), "xyz".to_owned()),
            ("a".to_owned(), "1".to_owned()),
            ("c".to_owned(), String::new()),
            ("sign_type".to_owned(), "RSA2".to_owned()),
        ];

        assert_eq!(signing_content(&params, &["sign"]), "a=1&b=2&sign_type=RSA2");
        assert_eq!(signing_content(&params, &["sign", "sign_type"]), "a=1&b=2");
    }

    #[test]
    fn page_pay_url_carries_a_verifiable_signature() {
        let provider = provider();
        let request = ChargeRequest {
            payment_number: "a1b2c3".into(),
            order_number: "202501010000000001".into(),
            amount: Money::from_cents(2500),
            subject: "Order 202501010000000001".into(),
        };

        let url = provider.page_pay_url(&request).unwrap();

        let (gateway, query) = url.split_once('?').unwrap();
        assert!(gateway.ends_with("/gateway.do"));
        let params: Vec<(String, String)> = serde_urlencoded::from_str(query).unwrap();
        let get = |name: &str| params.iter().find(|(k, _)| k == name).unwrap().1.clone();
        assert_eq!(get("method"), "alipay.trade.page.pay");
        assert_eq!(get("timestamp"), "2025-01-01 08:00:00");
        let biz: serde_json::Value = serde_json::from_str(&get("biz_content")).unwrap();
        assert_eq!(biz["total_amount"], "25.00");
        assert_eq!(biz["product_code"], "FAST_INSTANT_TRADE_PAY");
        assert_eq!(biz["out_trade_no"], "a1b2c3");

        let verifier = RsaVerifier::from_pem(&test_keys::merchant().public_pem).unwrap();
        assert!(
            verifier
                .verify_base64(signing_content(&params, &["sign"]).as_bytes(), &get("sign"))
                .is_ok()
        );
    }

    #[tokio::test]
    async fn create_charge_redirects_to_the_gateway() {
        let provider = provider();
        let action = provider
            .create_charge(ChargeRequest {
                payment_number: "a1b2c3".into(),
                order_number: "1".into(),
                amount: Money::from_cents(100),
                subject: "Order 1".into(),
            })
            .await
            .unwrap();

        assert!(matches!(action, ChargeAction::Redirect { url } if url.contains("sign=")));
    }

    #[test]
    fn paid_notifications_verify() {
        let provider = provider();
        for status in PAID_STATUSES {
            let fields = paid_fields(status);
            let verified = provider
                .verify_notification(&notification(
                    &borrowed(&fields),
                    &test_keys::provider().private_pem,
                ))
                .unwrap();

            assert_eq!(verified.payment_number, "a1b2c3");
            assert_eq!(verified.provider_trade_no.as_deref(), Some("2025010122001400001"));
            assert!(verified.paid);
            assert_eq!(verified.amount, Some(Money::from_cents(2500)));
        }
    }

    #[test]
    fn waiting_status_is_not_paid() {
        let fields = paid_fields("WAIT_BUYER_PAY");
        let verified = provider()
            .verify_notification(&notification(
                &borrowed(&fields),
                &test_keys::provider().private_pem,
            ))
            .unwrap();

        assert!(!verified.paid);
        assert_eq!(verified.trade_status, "WAIT_BUYER_PAY");
    }

    #[test]
    fn forged_or_tampered_notifications_are_rejected() {
        let provider = provider();
        let fields = paid_fields("TRADE_SUCCESS");

        // Signed with the wrong key.
        let forged = notification(&borrowed(&fields), &test_keys::merchant().private_pem);
        assert_eq!(
            provider.verify_notification(&forged),
            Err(ProviderError::InvalidSignature)
        );

        // Amount edited after signing.
        let mut tampered = notification(&borrowed(&fields), &test_keys::provider().private_pem);
        let body = String::from_utf8(tampered.body).unwrap();
        tampered.body = body.replace("total_amount=25.00", "total_amount=0.01").into_bytes();
        assert_eq!(
            provider.verify_notification(&tampered),
            Err(ProviderError::InvalidSignature)
        );

        // Unsigned.
        let unsigned = InboundNotification {
            headers: BTreeMap::new(),
            body: b"out_trade_no=a1b2c3&trade_status=TRADE_SUCCESS".to_vec(),
        };
        assert_eq!(
            provider.verify_notification(&unsigned),
            Err(ProviderError::InvalidSignature)
        );
    }

    #[test]
    fn notifications_for_another_app_are_malformed() {
        let mut fields = paid_fields("TRADE_SUCCESS");
        fields[0].1 = "someone-else".into();
        let result = provider().verify_notification(&notification(
            &borrowed(&fields),
            &test_keys::provider().private_pem,
        ));

        assert!(matches!(result, Err(ProviderError::Malformed(_))));
    }

    #[test]
    fn acknowledgements_use_plain_text() {
        let provider = provider();
        let ok = provider.acknowledge(AckOutcome::Accepted);
        assert_eq!((ok.status, ok.body.as_str()), (200, "success"));
        assert!(ok.content_type.starts_with("text/plain"));
        assert_eq!(provider.acknowledge(AckOutcome::Rejected).status, 400);
        assert_eq!(provider.acknowledge(AckOutcome::NotFound).status, 404);
        let retry = provider.acknowledge(AckOutcome::Retry);
        assert_eq!((retry.status, retry.body.as_str()), (500, "failure"));
    }
}
