//! Auth verifier: constant-time token check plus HMAC-SHA256
//! nonce challenge/response. A narrow primitive compared to full JOSE/X.509
//! validation: just a pre-shared secret and a single-use nonce.

use std::collections::HashMap;

use hex::ToHex as _;
use rand::RngCore as _;
use sha2::Sha256;
use smol_str::SmolStr;
use subtle::ConstantTimeEq as _;

use crate::model::ClientId;

/// Outcome of [`Verifier::verify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Ok,
    /// The caller must not reveal which check failed.
    Rejected,
}

/// The two operating modes fixed at boot.
#[derive(Debug, Clone)]
pub struct Verifier {
    auth_secret: Option<SmolStr>,
    expected_token: Option<SmolStr>,
    /// client_id → nonce, consumed on first verification attempt.
    nonces: HashMap<ClientId, SmolStr>,
}

impl Verifier {
    pub fn new(auth_secret: Option<SmolStr>, expected_token: Option<SmolStr>) -> Self {
        Self {
            auth_secret,
            expected_token,
            nonces: HashMap::new(),
        }
    }

    /// Dev mode (fail-open) iff neither secret is configured.
    pub fn is_auth_required(&self) -> bool {
        self.auth_secret.is_some() || self.expected_token.is_some()
    }

    /// Generates and stores a fresh 32-byte hex nonce for `client_id`. Only
    /// meaningful in prod mode; callers in dev mode should skip the challenge
    /// entirely.
    pub fn issue_challenge(&mut self, client_id: ClientId) -> SmolStr {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let nonce = SmolStr::new(bytes.encode_hex::<String>());
        self.nonces.insert(client_id, nonce.clone());
        nonce
    }

    /// Verifies `{token, nonce_response}` for `client_id`. The nonce is
    /// consumed regardless of outcome. Dev mode always succeeds without
    /// consuming anything.
    pub fn verify(&mut self, client_id: &str, token: &str, nonce_response: &str) -> AuthOutcome {
        if !self.is_auth_required() {
            return AuthOutcome::Ok;
        }

        // Consumed up front so every attempt, including a token mismatch,
        // burns the challenge, not just a successful one.
        let nonce = self.nonces.remove(client_id);

        let Some(expected_token) = self.expected_token.as_ref() else {
            return AuthOutcome::Rejected;
        };
        if !bool::from(token.as_bytes().ct_eq(expected_token.as_bytes())) {
            return AuthOutcome::Rejected;
        }

        let Some(secret) = self.auth_secret.as_ref() else {
            return AuthOutcome::Rejected;
        };

        let Some(nonce) = nonce else {
            return AuthOutcome::Rejected;
        };

        let expected_hex = hmac_sha256_hex(secret.as_bytes(), nonce.as_bytes(), client_id.as_bytes());

        if bool::from(nonce_response.as_bytes().ct_eq(expected_hex.as_bytes())) {
            AuthOutcome::Ok
        } else {
            AuthOutcome::Rejected
        }
    }
}

/// `HMAC-SHA256(secret, nonce || client_id)` as lowercase hex.
fn hmac_sha256_hex(secret: &[u8], nonce: &[u8], client_id: &[u8]) -> String {
    use hmac::{Hmac, Mac as _};
    type HmacSha256 = Hmac<Sha256>;

    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts keys of any length");
    mac.update(nonce);
    mac.update(client_id);
    mac.finalize().into_bytes().encode_hex::<String>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dev_mode_is_fail_open() {
        let mut verifier = Verifier::new(None, None);
        assert!(!verifier.is_auth_required());
        assert_eq!(verifier.verify("c1", "", ""), AuthOutcome::Ok);
    }

    #[test]
    fn prod_mode_round_trip() {
        let mut verifier = Verifier::new(Some("s3cr3t".into()), Some("T".into()));
        assert!(verifier.is_auth_required());

        let nonce = verifier.issue_challenge("c1".into());
        let response = hmac_sha256_hex(b"s3cr3t", nonce.as_bytes(), b"c1");

        assert_eq!(verifier.verify("c1", "T", &response), AuthOutcome::Ok);
    }

    #[test]
    fn nonce_is_single_use() {
        let mut verifier = Verifier::new(Some("s3cr3t".into()), Some("T".into()));
        let nonce = verifier.issue_challenge("c1".into());
        let response = hmac_sha256_hex(b"s3cr3t", nonce.as_bytes(), b"c1");

        assert_eq!(verifier.verify("c1", "T", &response), AuthOutcome::Ok);
        // Second attempt: nonce was consumed, so even the same response is rejected.
        assert_eq!(verifier.verify("c1", "T", &response), AuthOutcome::Rejected);
    }

    #[test]
    fn token_mismatch_is_rejected() {
        let mut verifier = Verifier::new(Some("s3cr3t".into()), Some("T".into()));
        let nonce = verifier.issue_challenge("c1".into());
        let response = hmac_sha256_hex(b"s3cr3t", nonce.as_bytes(), b"c1");
        assert_eq!(verifier.verify("c1", "WRONG", &response), AuthOutcome::Rejected);
    }

    #[test]
    fn token_mismatch_still_consumes_the_nonce() {
        let mut verifier = Verifier::new(Some("s3cr3t".into()), Some("T".into()));
        let nonce = verifier.issue_challenge("c1".into());
        let response = hmac_sha256_hex(b"s3cr3t", nonce.as_bytes(), b"c1");

        assert_eq!(verifier.verify("c1", "WRONG", &response), AuthOutcome::Rejected);
        // The nonce is gone even though the failure was a token mismatch, not
        // a bad nonce response; retrying with the correct token can't reuse it.
        assert_eq!(verifier.verify("c1", "T", &response), AuthOutcome::Rejected);
    }
}
