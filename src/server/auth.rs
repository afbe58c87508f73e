//! Bearer-token auth gate.
//!
//! Tokens are opaque HMAC-SHA256-signed strings carrying a subject and
//! an expiry. Expiry is enforced before any state is touched; signature
//! comparison is constant-time via the MAC verify. When no HMAC key is
//! configured the gate is disabled and requests are anonymous.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    Missing,
    #[error("malformed token")]
    Malformed,
    #[error("invalid token signature")]
    BadSignature,
    #[error("token expired")]
    Expired,
}

pub type AuthResult<T> = Result<T, AuthError>;

/// Who a request is acting as.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    /// Authenticated token subject.
    Subject(String),
    /// Unauthenticated peer, keyed by IP for rate limiting.
    Ip(String),
}

impl Identity {
    /// Stable key for rate-limit buckets.
    pub fn bucket_key(&self) -> String {
        match self {
            Self::Subject(s) => format!("sub:{s}"),
            Self::Ip(ip) => format!("ip:{ip}"),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Subject(_))
    }
}

/// HMAC-signed token issuer and validator.
#[derive(Clone)]
pub struct AuthGate {
    key: Option<Vec<u8>>,
    ttl_seconds: u64,
}

impl AuthGate {
    /// A gate with no key accepts every request as anonymous.
    pub fn new(key: Option<&str>, ttl_seconds: u64) -> Self {
        Self {
            key: key.map(|k| k.as_bytes().to_vec()),
            ttl_seconds,
        }
    }

    /// Whether bearer auth is required.
    pub fn enabled(&self) -> bool {
        self.key.is_some()
    }

    fn mac(&self, payload: &str) -> Option<Vec<u8>> {
        let key = self.key.as_ref()?;
        let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
        mac.update(payload.as_bytes());
        Some(mac.finalize().into_bytes().to_vec())
    }

    /// Issue a token for a subject, valid for the configured TTL.
    pub fn issue(&self, subject: &str) -> Option<String> {
        let expiry = Utc::now().timestamp() + self.ttl_seconds as i64;
        let payload = format!("{}.{expiry}", URL_SAFE_NO_PAD.encode(subject));
        let mac = self.mac(&payload)?;
        Some(format!("{payload}.{}", URL_SAFE_NO_PAD.encode(mac)))
    }

    /// Validate a presented token, returning its subject.
    pub fn verify(&self, token: &str) -> AuthResult<String> {
        if self.key.is_none() {
            // Auth disabled: any presented token maps to its subject
            // field if parseable, else anonymous handling upstream.
            return Err(AuthError::Missing);
        }
        let parts: Vec<&str> = token.split('.').collect();
        let [subject_b64, expiry_str, sig_b64] = *parts.as_slice() else {
            return Err(AuthError::Malformed);
        };
        let expiry: i64 = expiry_str.parse().map_err(|_| AuthError::Malformed)?;
        // Expiry first: no signature work for stale tokens.
        if expiry < Utc::now().timestamp() {
            return Err(AuthError::Expired);
        }

        let payload = format!("{subject_b64}.{expiry}");
        let key = self.key.as_ref().expect("checked above");
        let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
        mac.update(payload.as_bytes());
        let sig = URL_SAFE_NO_PAD
            .decode(sig_b64)
            .map_err(|_| AuthError::Malformed)?;
        mac.verify_slice(&sig).map_err(|_| AuthError::BadSignature)?;

        let subject = URL_SAFE_NO_PAD
            .decode(subject_b64)
            .ok()
            .and_then(|b| String::from_utf8(b).ok())
            .ok_or(AuthError::Malformed)?;
        Ok(subject)
    }

    /// Resolve a request to an identity. `token` comes from the
    /// `Authorization: Bearer` header or the `?token=` query parameter.
    pub fn identify(&self, token: Option<&str>, peer_ip: &str) -> AuthResult<Identity> {
        if !self.enabled() {
            return Ok(Identity::Ip(peer_ip.to_string()));
        }
        match token {
            Some(token) => self.verify(token).map(Identity::Subject),
            None => Err(AuthError::Missing),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> AuthGate {
        AuthGate::new(Some("a-very-secret-signing-key"), 3600)
    }

    #[test]
    fn test_issue_verify_roundtrip() {
        let gate = gate();
        let token = gate.issue("alice").unwrap();
        assert_eq!(gate.verify(&token).unwrap(), "alice");
    }

    #[test]
    fn test_tampered_signature_rejected() {
        let gate = gate();
        let mut token = gate.issue("alice").unwrap();
        token.pop();
        token.push('A');
        assert!(matches!(
            gate.verify(&token),
            Err(AuthError::BadSignature) | Err(AuthError::Malformed)
        ));
    }

    #[test]
    fn test_tampered_subject_rejected() {
        let gate = gate();
        let token = gate.issue("alice").unwrap();
        let parts: Vec<&str> = token.split('.').collect();
        let forged = format!(
            "{}.{}.{}",
            URL_SAFE_NO_PAD.encode("mallory"),
            parts[1],
            parts[2]
        );
        assert_eq!(gate.verify(&forged), Err(AuthError::BadSignature));
    }

    #[test]
    fn test_expired_token() {
        let gate = AuthGate::new(Some("key"), 0);
        let token = {
            // Build a token that expired one hour ago.
            let expiry = Utc::now().timestamp() - 3600;
            let payload = format!("{}.{expiry}", URL_SAFE_NO_PAD.encode("alice"));
            let mac = gate.mac(&payload).unwrap();
            format!("{payload}.{}", URL_SAFE_NO_PAD.encode(mac))
        };
        assert_eq!(gate.verify(&token), Err(AuthError::Expired));
    }

    #[test]
    fn test_malformed_tokens() {
        let gate = gate();
        assert_eq!(gate.verify("nonsense"), Err(AuthError::Malformed));
        assert_eq!(gate.verify("a.b.c.d"), Err(AuthError::Malformed));
        assert_eq!(gate.verify(""), Err(AuthError::Malformed));
    }

    #[test]
    fn test_disabled_gate_is_anonymous() {
        let gate = AuthGate::new(None, 3600);
        assert!(!gate.enabled());
        let identity = gate.identify(None, "10.0.0.1").unwrap();
        assert_eq!(identity, Identity::Ip("10.0.0.1".to_string()));
        assert!(!identity.is_authenticated());
    }

    #[test]
    fn test_enabled_gate_requires_token() {
        let gate = gate();
        assert_eq!(gate.identify(None, "10.0.0.1"), Err(AuthError::Missing));
        let token = gate.issue("alice").unwrap();
        let identity = gate.identify(Some(&token), "10.0.0.1").unwrap();
        assert_eq!(identity, Identity::Subject("alice".to_string()));
        assert!(identity.is_authenticated());
    }

    #[test]
    fn test_bucket_keys_distinct() {
        assert_ne!(
            Identity::Subject("x".into()).bucket_key(),
            Identity::Ip("x".into()).bucket_key()
        );
    }
}
