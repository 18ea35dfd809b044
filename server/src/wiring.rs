//! Assembles services from [`Config`].

use crate::config::{AuthConfig, Config};
use std::sync::Arc;
use storefront_core::environment::Clock;
use storefront_core::error::CommerceResult;
use storefront_core::provider::{ProviderRegistry, ProviderResult};
use storefront_core::store::BoxFuture;
use storefront_payments::{AlipayProvider, WechatPayProvider};
use storefront_runtime::{BackgroundJob, TickReport};
use storefront_web::{JwtKeys, TokenRevocations};

/// Register every provider whose credentials are configured.
///
/// # Errors
///
/// [`ProviderError::Config`](storefront_core::provider::ProviderError::Config)
/// if configured keys cannot be parsed.
pub fn providers(config: &Config, clock: &Arc<dyn Clock>) -> ProviderResult<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();
    if let Some(alipay) = &config.alipay {
        registry.register(Arc::new(AlipayProvider::new(alipay.clone(), clock.clone())?));
        tracing::info!(app_id = %alipay.app_id, "Alipay enabled");
    }
    if let Some(wechat) = &config.wechat {
        registry.register(Arc::new(WechatPayProvider::new(wechat.clone(), clock.clone())?));
        tracing::info!(mch_id = %wechat.mch_id, "WeChat Pay enabled");
    }
    if registry.is_empty() {
        tracing::warn!("No payment provider configured, charges will be rejected");
    }
    Ok(registry)
}

/// Token keys with the configured lifetimes.
#[must_use]
pub fn jwt_keys(auth: &AuthConfig) -> JwtKeys {
    JwtKeys::from_secret(auth.jwt_secret.as_bytes())
        .with_ttl(auth.token_ttl)
        .with_refresh_threshold(auth.refresh_threshold)
}

/// Evicts revoked tokens that have expired anyway.
pub struct RevocationCleanup {
    revocations: Arc<TokenRevocations>,
    clock: Arc<dyn Clock>,
}

impl RevocationCleanup {
    /// Cleanup over the shared revocation list.
    #[must_use]
    pub fn new(revocations: Arc<TokenRevocations>, clock: Arc<dyn Clock>) -> Self {
        Self { revocations, clock }
    }
}

impl BackgroundJob for RevocationCleanup {
    fn name(&self) -> &'static str {
        "revocation_cleanup"
    }

    fn tick(&self) -> BoxFuture<'_, CommerceResult<TickReport>> {
        Box::pin(async move {
            let examined = self.revocations.len();
            let changed = self.revocations.purge_expired(self.clock.now());
            if changed > 0 {
                tracing::debug!(removed = changed, "Expired revocations evicted");
            }
            Ok(TickReport {
                examined,
                changed,
                failed: 0,
            })
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Duration;
    use storefront_core::payment::PaymentMethod;
    use storefront_testing::{test_clock, test_time};

    fn config(pairs: &[(&str, &str)]) -> Config {
        let pairs: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Config::from_lookup(move |key| {
            pairs
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        })
        .unwrap()
    }

    #[test]
    fn unconfigured_providers_are_absent() {
        let clock: Arc<dyn Clock> = Arc::new(test_clock());
        let config = config(&[("DATABASE_URL", "postgres://db"), ("JWT_SECRET", "s")]);

        let registry = providers(&config, &clock).unwrap();

        assert!(registry.is_empty());
        assert!(registry.get(PaymentMethod::Alipay).is_none());
    }

    #[test]
    fn unusable_keys_fail_startup() {
        let clock: Arc<dyn Clock> = Arc::new(test_clock());
        let config = config(&[
            ("DATABASE_URL", "postgres://db"),
            ("JWT_SECRET", "s"),
            ("ALIPAY_APP_ID", "2021000000000001"),
            ("ALIPAY_PRIVATE_KEY", "not a key"),
            ("ALIPAY_PUBLIC_KEY", "not a key either"),
            ("ALIPAY_NOTIFY_URL", "https://shop.example.test/payments/callback"),
        ]);

        assert!(providers(&config, &clock).is_err());
    }

    #[test]
    fn jwt_keys_use_configured_lifetime() {
        let config = config(&[
            ("DATABASE_URL", "postgres://db"),
            ("JWT_SECRET", "s"),
            ("JWT_TTL_SECS", "3600"),
        ]);
        let keys = jwt_keys(&config.auth);

        let token = keys
            .issue(storefront_core::UserId::new(1), "ada", "buyer", test_time())
            .unwrap();

        let user = keys.verify(&token, test_time()).unwrap();
        assert_eq!(user.expires_at, test_time() + Duration::hours(1));
    }

    #[tokio::test]
    async fn cleanup_evicts_expired_revocations() {
        let revocations = Arc::new(TokenRevocations::new());
        revocations.revoke("old", test_time() - Duration::minutes(1));
        revocations.revoke("live", test_time() + Duration::hours(1));
        let job = RevocationCleanup::new(revocations.clone(), Arc::new(test_clock()));

        let report = job.tick().await.unwrap();

        assert_eq!(report.examined, 2);
        assert_eq!(report.changed, 1);
        assert!(revocations.is_revoked("live", test_time()));
    }
}
