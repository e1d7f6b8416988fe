//! Sender tokens
//!
//! A token is `base64(HMAC-SHA256(secret, handle))` using the standard,
//! padded alphabet. It proves the sender knew the shared secret when it
//! claimed `handle`. Tokens are deterministic: they carry no nonce or
//! timestamp, so a captured token can be replayed for the same handle.

use base64::{engine::general_purpose::STANDARD, Engine};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Length in bytes of a decoded token (SHA-256 digest size)
pub const TOKEN_DIGEST_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("failed to compute token signature: {0}")]
    Signing(String),
}

/// Pre-shared secret used to sign and verify sender handles
#[derive(Clone)]
pub struct SharedSecret {
    key: String,
}

impl SharedSecret {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.key.as_bytes()
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedSecret([REDACTED])")
    }
}

/// Computes and checks sender tokens
pub struct TokenSigner;

impl TokenSigner {
    /// Sign `handle` with `secret`
    pub fn sign(secret: &SharedSecret, handle: &str) -> Result<String, TokenError> {
        let mac = Self::mac(secret, handle)?;
        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }

    /// Check `token` against `handle` in constant time
    ///
    /// Tokens that are not valid base64 never verify.
    pub fn verify(secret: &SharedSecret, handle: &str, token: &str) -> bool {
        let Ok(received) = STANDARD.decode(token) else {
            return false;
        };
        match Self::mac(secret, handle) {
            Ok(mac) => mac.verify_slice(&received).is_ok(),
            Err(_) => false,
        }
    }

    fn mac(secret: &SharedSecret, handle: &str) -> Result<HmacSha256, TokenError> {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| TokenError::Signing(e.to_string()))?;
        mac.update(handle.as_bytes());
        Ok(mac)
    }
}

/// Outcome of checking an inbound message's sender token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authenticity {
    /// Token present and valid for the sender handle
    Verified,
    /// No token header
    Unsigned,
    /// Token present but does not match the sender handle
    Forged,
    /// Receiver holds no secret, nothing was checked
    Unchecked,
}

impl fmt::Display for Authenticity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Authenticity::Verified => write!(f, "verified"),
            Authenticity::Unsigned => write!(f, "unsigned"),
            Authenticity::Forged => write!(f, "forged"),
            Authenticity::Unchecked => write!(f, "unchecked"),
        }
    }
}

/// Verify-only view of the shared secret
#[derive(Debug, Clone)]
pub struct Verifier {
    secret: SharedSecret,
}

impl Verifier {
    pub fn new(secret: SharedSecret) -> Self {
        Self { secret }
    }

    pub fn check(&self, handle: &str, token: Option<&str>) -> Authenticity {
        match token {
            None | Some("") => Authenticity::Unsigned,
            Some(token) if TokenSigner::verify(&self.secret, handle, token) => {
                Authenticity::Verified
            }
            Some(_) => Authenticity::Forged,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret() -> SharedSecret {
        SharedSecret::new("s3cret")
    }

    #[test]
    fn test_sign_is_deterministic() {
        let a = TokenSigner::sign(&secret(), "bob").unwrap();
        let b = TokenSigner::sign(&secret(), "bob").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_token_decodes_to_digest() {
        for handle in ["", "bob", "alice", "zoë", "a much longer handle with spaces"] {
            let token = TokenSigner::sign(&secret(), handle).unwrap();
            assert_eq!(token.len(), 44);
            assert!(token.ends_with('='));
            assert_eq!(STANDARD.decode(&token).unwrap().len(), TOKEN_DIGEST_LEN);
        }
    }

    #[test]
    fn test_distinct_handles_distinct_tokens() {
        let alice = TokenSigner::sign(&secret(), "alice").unwrap();
        let bob = TokenSigner::sign(&secret(), "bob").unwrap();
        assert_ne!(alice, bob);
    }

    #[test]
    fn test_distinct_secrets_distinct_tokens() {
        let a = TokenSigner::sign(&secret(), "bob").unwrap();
        let b = TokenSigner::sign(&SharedSecret::new("other"), "bob").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_known_vector() {
        // RFC 4231 test case 2
        let token = TokenSigner::sign(&SharedSecret::new("Jefe"), "what do ya want for nothing?")
            .unwrap();
        let expected = "W9zBRr9gdU5qBCQmCJV1x1oAPwidJzmDnexYuWTsOEM=";
        assert_eq!(token, expected);
    }

    #[test]
    fn test_verify() {
        let token = TokenSigner::sign(&secret(), "bob").unwrap();
        assert!(TokenSigner::verify(&secret(), "bob", &token));
        assert!(!TokenSigner::verify(&secret(), "mallory", &token));
        assert!(!TokenSigner::verify(&SharedSecret::new("guess"), "bob", &token));
        assert!(!TokenSigner::verify(&secret(), "bob", "not base64!"));
        assert!(!TokenSigner::verify(&secret(), "bob", ""));
    }

    #[test]
    fn test_verifier_classification() {
        let verifier = Verifier::new(secret());
        let token = TokenSigner::sign(&secret(), "bob").unwrap();

        assert_eq!(verifier.check("bob", Some(&token)), Authenticity::Verified);
        assert_eq!(verifier.check("eve", Some(&token)), Authenticity::Forged);
        assert_eq!(verifier.check("bob", None), Authenticity::Unsigned);
        assert_eq!(verifier.check("bob", Some("")), Authenticity::Unsigned);
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        assert_eq!(format!("{:?}", secret()), "SharedSecret([REDACTED])");
    }
}
