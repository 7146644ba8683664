//! Property-based tests for webhook verification and event keys

use std::sync::Arc;

use proptest::prelude::*;

use freemkit::config::Settings;
use freemkit::error::WebhookError;
use freemkit::webhook::events::normalize_event_type;
use freemkit::webhook::{event_key, sign, SignatureVerifier};

fn verifier() -> SignatureVerifier {
    SignatureVerifier::new(Arc::new(Settings::test_config().tenants()))
}

fn body(note: &str) -> Vec<u8> {
    serde_json::json!({"plugin_id": "test-plugin", "note": note})
        .to_string()
        .into_bytes()
}

proptest! {
    /// A body signed with the tenant secret always verifies, whatever the
    /// case of the hex digest
    #[test]
    fn signed_bodies_verify(note in ".*", upper in any::<bool>()) {
        let raw = body(&note);
        let mut signature = sign(&raw, "test-secret");
        if upper {
            signature = signature.to_uppercase();
        }
        prop_assert_eq!(verifier().verify(&raw, &signature), Ok("test-plugin".to_string()));
    }

    /// Flipping any single bit of the body breaks the signature
    #[test]
    fn mutated_bodies_fail(note in "[a-z ]{0,64}", bit in 0usize..8, pos in any::<prop::sample::Index>()) {
        let raw = body(&note);
        let signature = sign(&raw, "test-secret");

        let mut tampered = raw.clone();
        let i = pos.index(tampered.len());
        tampered[i] ^= 1 << bit;

        let result = verifier().verify(&tampered, &signature);
        prop_assert!(result.is_err());
        if let Err(e) = result {
            prop_assert!(matches!(
                e,
                WebhookError::InvalidSignature
                    | WebhookError::InvalidRequest
                    | WebhookError::InvalidPlugin
            ));
        }
    }

    /// A different secret never verifies
    #[test]
    fn wrong_secret_fails(note in ".*", secret in "[a-zA-Z0-9]{1,32}") {
        prop_assume!(secret != "test-secret");
        let raw = body(&note);
        let signature = sign(&raw, &secret);
        prop_assert_eq!(verifier().verify(&raw, &signature), Err(WebhookError::InvalidSignature));
    }

    /// Event keys are always safe store-key suffixes
    #[test]
    fn event_keys_are_sanitized(id in ".*") {
        let raw = serde_json::json!({"id": id, "plugin_id": "p"}).to_string();
        let key = event_key(raw.as_bytes());
        prop_assert!(!key.is_empty());
        prop_assert!(key
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-'));
    }

    /// Event keys depend only on the payload
    #[test]
    fn event_keys_are_deterministic(raw in proptest::collection::vec(any::<u8>(), 0..256)) {
        prop_assert_eq!(event_key(&raw), event_key(&raw));
    }

    /// Normalizing twice changes nothing
    #[test]
    fn normalize_event_type_is_idempotent(event in "[a-zA-Z._ ]{0,32}") {
        let once = normalize_event_type(&event);
        prop_assert_eq!(normalize_event_type(&once), once);
    }
}
