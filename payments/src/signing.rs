//! SHA256withRSA signatures, base64-encoded, as both providers use them.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use std::fmt;
use storefront_core::provider::{ProviderError, ProviderResult};

/// Signs outgoing requests with our merchant key.
#[derive(Clone)]
pub(crate) struct RsaSigner(SigningKey<Sha256>);

impl RsaSigner {
    /// PKCS#8 PEM, or the bare base64 body providers hand out in their consoles.
    pub(crate) fn from_pem(pem: &str) -> ProviderResult<Self> {
        let pem = normalize_pem(pem, "PRIVATE KEY");
        RsaPrivateKey::from_pkcs8_pem(&pem)
            .map(|key| Self(SigningKey::new(key)))
            .map_err(|e| ProviderError::Config(format!("Invalid merchant private key: {e}")))
    }

    pub(crate) fn sign_base64(&self, message: &[u8]) -> ProviderResult<String> {
        let signature = self
            .0
            .try_sign(message)
            .map_err(|e| ProviderError::Config(format!("Signing failed: {e}")))?;
        Ok(STANDARD.encode(signature.to_bytes()))
    }
}

impl fmt::Debug for RsaSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RsaSigner(<redacted>)")
    }
}

/// Verifies notifications with the provider's public key.
#[derive(Clone)]
pub(crate) struct RsaVerifier(VerifyingKey<Sha256>);

impl RsaVerifier {
    /// SPKI PEM, or its bare base64 body.
    pub(crate) fn from_pem(pem: &str) -> ProviderResult<Self> {
        let pem = normalize_pem(pem, "PUBLIC KEY");
        RsaPublicKey::from_public_key_pem(&pem)
            .map(|key| Self(VerifyingKey::new(key)))
            .map_err(|e| ProviderError::Config(format!("Invalid provider public key: {e}")))
    }

    pub(crate) fn verify_base64(&self, message: &[u8], signature: &str) -> ProviderResult<()> {
        let raw = STANDARD
            .decode(signature.trim())
            .map_err(|_| ProviderError::InvalidSignature)?;
        let signature =
            Signature::try_from(raw.as_slice()).map_err(|_| ProviderError::InvalidSignature)?;
        self.0
            .verify(message, &signature)
            .map_err(|_| ProviderError::InvalidSignature)
    }
}

impl fmt::Debug for RsaVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RsaVerifier")
    }
}

/// Wrap a bare base64 key body in PEM armor with 64-column lines.
fn normalize_pem(input: &str, label: &str) -> String {
    let trimmed = input.trim();
    if trimmed.starts_with("-----BEGIN") {
        return trimmed.replace("\\n", "\n");
    }
    let body: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    let mut pem = format!("-----BEGIN {label}-----\n");
    for chunk in body.as_bytes().chunks(64) {
        pem.push_str(&String::from_utf8_lossy(chunk));
        pem.push('\n');
    }
    pem.push_str(&format!("-----END {label}-----\n"));
    pem
}

#[cfg(test)]
pub(crate) mod test_keys {
    use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
    use rsa::{RsaPrivateKey, RsaPublicKey};
    use std::sync::OnceLock;

    /// A PEM key pair, generated once per test binary.
    pub(crate) struct KeyPair {
        pub private_pem: String,
        pub public_pem: String,
    }

    fn generate() -> KeyPair {
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
        let public = RsaPublicKey::from(&private);
        KeyPair {
            private_pem: private.to_pkcs8_pem(LineEnding::LF).unwrap().to_string(),
            public_pem: public.to_public_key_pem(LineEnding::LF).unwrap(),
        }
    }

    pub(crate) fn merchant() -> &'static KeyPair {
        static KEYS: OnceLock<KeyPair> = OnceLock::new();
        KEYS.get_or_init(generate)
    }

    pub(crate) fn provider() -> &'static KeyPair {
        static KEYS: OnceLock<KeyPair> = OnceLock::new();
        KEYS.get_or_init(generate)
    }
}
