//! WeChat Pay API v3 adapter.
//!
//! Charges call the native pay endpoint and hand back the `code_url` the
//! buyer scans. Requests carry a `WECHATPAY2-SHA256-RSA2048` authorization
//! signed with the merchant key. Notifications are JSON envelopes signed by
//! the WeChat platform key whose `resource` is sealed with
//! `AEAD_AES_256_GCM` under the API v3 key.

use crate::china_time;
use crate::signing::{RsaSigner, RsaVerifier};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::SecondsFormat;
use rand::Rng;
use rand::distributions::Alphanumeric;
use reqwest::Client;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
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

/// Production API host.
pub const DEFAULT_BASE_URL: &str = "https://api.mch.weixin.qq.com";

/// Notification timestamp header.
pub const TIMESTAMP_HEADER: &str = "wechatpay-timestamp";
/// Notification nonce header.
pub const NONCE_HEADER: &str = "wechatpay-nonce";
/// Notification signature header.
pub const SIGNATURE_HEADER: &str = "wechatpay-signature";

const NATIVE_PATH: &str = "/v3/pay/transactions/native";
const AUTH_SCHEMA: &str = "WECHATPAY2-SHA256-RSA2048";
const RESOURCE_ALGORITHM: &str = "AEAD_AES_256_GCM";
const PAID_STATE: &str = "SUCCESS";
const NONCE_LEN: usize = 12;

/// WeChat Pay merchant credentials and endpoints.
#[derive(Clone)]
pub struct WechatPayConfig {
    /// Official account / app id bound to the merchant
    pub app_id: String,
    /// Merchant id
    pub mch_id: String,
    /// Serial number of the merchant API certificate
    pub mch_serial_no: String,
    /// Merchant API private key (PKCS#8 PEM)
    pub private_key: String,
    /// 32-byte API v3 key used to decrypt notifications
    pub api_v3_key: String,
    /// WeChat platform public key (SPKI PEM)
    pub platform_public_key: String,
    /// API host, [`DEFAULT_BASE_URL`] in production
    pub base_url: String,
    /// Where WeChat posts notifications
    pub notify_url: String,
    /// How long a QR code stays payable
    pub qr_expiry: chrono::Duration,
}

impl fmt::Debug for WechatPayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WechatPayConfig")
            .field("app_id", &self.app_id)
            .field("mch_id", &self.mch_id)
            .field("mch_serial_no", &self.mch_serial_no)
            .field("base_url", &self.base_url)
            .field("notify_url", &self.notify_url)
            .field("qr_expiry", &self.qr_expiry)
            .finish_non_exhaustive()
    }
}

/// WeChat Pay [`PaymentProvider`].
pub struct WechatPayProvider {
    client: Client,
    app_id: String,
    mch_id: String,
    mch_serial_no: String,
    base_url: String,
    notify_url: String,
    qr_expiry: chrono::Duration,
    signer: RsaSigner,
    verifier: RsaVerifier,
    cipher: Aes256Gcm,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for WechatPayProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WechatPayProvider")
            .field("mch_id", &self.mch_id)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct NativeOrder<'a> {
    appid: &'a str,
    mchid: &'a str,
    description: &'a str,
    out_trade_no: &'a str,
    time_expire: String,
    notify_url: &'a str,
    amount: OrderAmount,
}

#[derive(Serialize)]
struct OrderAmount {
    total: u64,
    currency: &'static str,
}

#[derive(Deserialize)]
struct NativeResponse {
    code_url: String,
}

#[derive(Deserialize)]
struct ApiError {
    code: String,
    message: String,
}

#[derive(Deserialize)]
struct Envelope {
    resource: EncryptedResource,
}

#[derive(Deserialize)]
struct EncryptedResource {
    algorithm: String,
    ciphertext: String,
    nonce: String,
    #[serde(default)]
    associated_data: String,
}

#[derive(Deserialize)]
struct Transaction {
    #[serde(default)]
    appid: Option<String>,
    #[serde(default)]
    mchid: Option<String>,
    out_trade_no: String,
    #[serde(default)]
    transaction_id: Option<String>,
    trade_state: String,
    #[serde(default)]
    amount: Option<TransactionAmount>,
}

#[derive(Deserialize)]
struct TransactionAmount {
    total: u64,
}

impl WechatPayProvider {
    /// Build the adapter, parsing keys up front.
    ///
    /// # Errors
    ///
    /// [`ProviderError::Config`] for unparsable keys or an API v3 key that is
    /// not 32 bytes long.
    pub fn new(config: WechatPayConfig, clock: Arc<dyn Clock>) -> ProviderResult<Self> {
        let cipher = Aes256Gcm::new_from_slice(config.api_v3_key.as_bytes())
            .map_err(|_| ProviderError::Config("API v3 key must be 32 bytes".into()))?;
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| ProviderError::Config(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            signer: RsaSigner::from_pem(&config.private_key)?,
            verifier: RsaVerifier::from_pem(&config.platform_public_key)?,
            cipher,
            app_id: config.app_id,
            mch_id: config.mch_id,
            mch_serial_no: config.mch_serial_no,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            notify_url: config.notify_url,
            qr_expiry: config.qr_expiry,
            clock,
        })
    }

    /// `Authorization` header value for one API call.
    fn authorization(
        &self,
        method: &str,
        path: &str,
        body: &str,
        timestamp: i64,
        nonce: &str,
    ) -> ProviderResult<String> {
        let message = format!("{method}\n{path}\n{timestamp}\n{nonce}\n{body}\n");
        let signature = self.signer.sign_base64(message.as_bytes())?;
        Ok(format!(
            "{AUTH_SCHEMA} mchid=\"{}\",nonce_str=\"{nonce}\",signature=\"{signature}\",timestamp=\"{timestamp}\",serial_no=\"{}\"",
            self.mch_id, self.mch_serial_no
        ))
    }

    async fn native_pay(&self, request: &ChargeRequest) -> ProviderResult<String> {
        let now = self.clock.now();
        let body = serde_json::to_string(&NativeOrder {
            appid: &self.app_id,
            mchid: &self.mch_id,
            description: &request.subject,
            out_trade_no: &request.payment_number,
            time_expire: china_time(now + self.qr_expiry)?
                .to_rfc3339_opts(SecondsFormat::Secs, false),
            notify_url: &self.notify_url,
            amount: OrderAmount {
                total: request.amount.cents(),
                currency: "CNY",
            },
        })
        .map_err(|e| ProviderError::Config(format!("Cannot encode order: {e}")))?;
        let nonce: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(32)
            .map(char::from)
            .collect();
        let authorization = self.authorization("POST", NATIVE_PATH, &body, now.timestamp(), &nonce)?;

        let response = self
            .client
            .post(format!("{}{NATIVE_PATH}", self.base_url))
            .header(AUTHORIZATION, authorization)
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        if !status.is_success() {
            let message = serde_json::from_str::<ApiError>(&text)
                .map_or(text, |e| format!("{}: {}", e.code, e.message));
            return Err(ProviderError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        serde_json::from_str::<NativeResponse>(&text)
            .map(|r| r.code_url)
            .map_err(|e| ProviderError::Rejected {
                status: status.as_u16(),
                message: format!("Unexpected native pay response: {e}"),
            })
    }

    fn decrypt(&self, resource: &EncryptedResource) -> ProviderResult<Vec<u8>> {
        if resource.algorithm != RESOURCE_ALGORITHM {
            return Err(ProviderError::Malformed(format!(
                "Unsupported resource algorithm {}",
                resource.algorithm
            )));
        }
        if resource.nonce.len() != NONCE_LEN {
            return Err(ProviderError::Malformed("Resource nonce must be 12 bytes".into()));
        }
        let ciphertext = STANDARD
            .decode(&resource.ciphertext)
            .map_err(|e| ProviderError::Malformed(format!("Resource is not base64: {e}")))?;
        self.cipher
            .decrypt(
                Nonce::from_slice(resource.nonce.as_bytes()),
                Payload {
                    msg: &ciphertext,
                    aad: resource.associated_data.as_bytes(),
                },
            )
            .map_err(|_| ProviderError::Malformed("Resource decryption failed".into()))
    }
}

impl PaymentProvider for WechatPayProvider {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::Wechat
    }

    fn create_charge(
        &self,
        request: ChargeRequest,
    ) -> Pin<Box<dyn Future<Output = ProviderResult<ChargeAction>> + Send + '_>> {
        Box::pin(async move {
            let payload = self.native_pay(&request).await?;
            tracing::info!(payment_number = %request.payment_number, "WeChat native order created");
            Ok(ChargeAction::QrCode { payload })
        })
    }

    fn verify_notification(
        &self,
        notification: &InboundNotification,
    ) -> ProviderResult<VerifiedNotification> {
        let header = |name| {
            notification
                .header(name)
                .ok_or(ProviderError::InvalidSignature)
        };
        let timestamp = header(TIMESTAMP_HEADER)?;
        let nonce = header(NONCE_HEADER)?;
        let signature = header(SIGNATURE_HEADER)?;
        let body = std::str::from_utf8(&notification.body)
            .map_err(|_| ProviderError::Malformed("Body is not UTF-8".into()))?;

        let message = format!("{timestamp}\n{nonce}\n{body}\n");
        self.verifier.verify_base64(message.as_bytes(), signature)?;

        let envelope: Envelope = serde_json::from_str(body)
            .map_err(|e| ProviderError::Malformed(format!("Invalid envelope: {e}")))?;
        let plaintext = self.decrypt(&envelope.resource)?;
        let transaction: Transaction = serde_json::from_slice(&plaintext)
            .map_err(|e| ProviderError::Malformed(format!("Invalid transaction: {e}")))?;

        if transaction.mchid.as_deref().is_some_and(|m| m != self.mch_id)
            || transaction.appid.as_deref().is_some_and(|a| a != self.app_id)
        {
            return Err(ProviderError::Malformed(
                "Notification addressed to another merchant".into(),
            ));
        }

        Ok(VerifiedNotification {
            paid: transaction.trade_state == PAID_STATE,
            payment_number: transaction.out_trade_no,
            provider_trade_no: transaction.transaction_id,
            trade_status: transaction.trade_state,
            amount: transaction.amount.map(|a| Money::from_cents(a.total)),
        })
    }

    fn acknowledge(&self, outcome: AckOutcome) -> Acknowledgement {
        let (status, code, message) = match outcome {
            AckOutcome::Accepted => (200, "SUCCESS", "OK"),
            AckOutcome::Rejected => (400, "FAIL", "invalid notification"),
            AckOutcome::NotFound => (404, "FAIL", "payment not found"),
            AckOutcome::Retry => (500, "FAIL", "temporarily unavailable"),
        };
        Acknowledgement {
            status,
            content_type: "application/json",
            body: serde_json::json!({ "code": code, "message": message }).to_string(),
        }
    }
}
