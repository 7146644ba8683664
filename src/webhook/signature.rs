//! Webhook Signature Verification
//!
//! Freemius signs each delivery as `hex(HMAC-SHA256(raw_body, secret_key))`
//! and sends it in the `X-Signature` header. The secret belongs to the
//! tenant named by the payload's `plugin_id`, so the body has to be decoded
//! before the signature can be checked.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::config::TenantRegistry;
use crate::error::{WebhookError, WebhookResult};
use crate::webhook::events::decode_payload;

type HmacSha256 = Hmac<Sha256>;

/// Compute the hex signature for a payload
pub fn sign(body: &[u8], secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC-SHA256 accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time check of `signature` against the payload's HMAC.
pub fn verify_with_secret(body: &[u8], signature: &str, secret: &str) -> bool {
    let signature = signature.trim().to_ascii_lowercase();
    if signature.is_empty() {
        return false;
    }
    let expected = sign(body, secret);
    expected.as_bytes().ct_eq(signature.as_bytes()).into()
}

/// Verifies inbound deliveries against the tenant registry
#[derive(Debug, Clone)]
pub struct SignatureVerifier {
    tenants: Arc<TenantRegistry>,
}

impl SignatureVerifier {
    /// Create a verifier over the registered tenants
    pub fn new(tenants: Arc<TenantRegistry>) -> Self {
        Self { tenants }
    }

    /// Verify a delivery and return the tenant's plugin id.
    ///
    /// Fails with `InvalidRequest` for undecodable bodies or a missing
    /// plugin id, `InvalidPlugin` for unknown tenants and `InvalidSignature`
    /// when the digest does not match.
    pub fn verify(&self, body: &[u8], signature: &str) -> WebhookResult<String> {
        let (_, plugin_id) = decode_payload(body)?;

        let tenant = self
            .tenants
            .get(&plugin_id)
            .ok_or(WebhookError::InvalidPlugin)?;

        if !verify_with_secret(body, signature, &tenant.secret_key) {
            tracing::debug!(plugin_id = %plugin_id, "Signature mismatch");
            return Err(WebhookError::InvalidSignature);
        }

        Ok(plugin_id)
    }
}
