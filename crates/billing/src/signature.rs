//! Webhook signature and freshness validation
//!
//! The provider signs with `HMAC-SHA256(secret, signed_content)` where
//! `signed_content` is chosen by [`crate::payload::signed_content`]. The
//! signature arrives hex-encoded, optionally prefixed with `sha256=`.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use time::OffsetDateTime;

type HmacSha256 = Hmac<Sha256>;

/// Timestamps above this are treated as milliseconds
const MILLIS_THRESHOLD: u64 = 1_000_000_000_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("Missing webhook signature")]
    Missing,

    #[error("Malformed webhook signature")]
    Malformed,

    #[error("Webhook signature mismatch")]
    Mismatch,

    #[error("Invalid webhook timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("Webhook timestamp outside tolerance ({age_secs}s old)")]
    StaleTimestamp { age_secs: i64 },
}

impl SignatureError {
    /// Short machine-readable code used in 400 responses
    pub fn code(&self) -> &'static str {
        match self {
            SignatureError::Missing | SignatureError::Malformed | SignatureError::Mismatch => {
                "invalid_signature"
            }
            SignatureError::InvalidTimestamp(_) | SignatureError::StaleTimestamp { .. } => {
                "invalid_timestamp"
            }
        }
    }
}

/// Verifies webhook authenticity and freshness
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: Option<String>,
    tolerance_secs: i64,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("enforced", &self.is_enforced())
            .field("tolerance_secs", &self.tolerance_secs)
            .finish()
    }
}

impl SignatureVerifier {
    /// An empty secret disables signature enforcement
    pub fn new(secret: Option<String>, tolerance_secs: i64) -> Self {
        Self {
            secret: secret.filter(|s| !s.is_empty()),
            tolerance_secs: tolerance_secs.max(1),
        }
    }

    pub fn is_enforced(&self) -> bool {
        self.secret.is_some()
    }

    /// Verify `signature` over `signed`. A no-op when no secret is configured.
    pub fn verify(&self, signed: &[u8], signature: Option<&str>) -> Result<(), SignatureError> {
        let Some(secret) = self.secret.as_deref() else {
            return Ok(());
        };

        let signature = signature
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(SignatureError::Missing)?;
        let hex_part = signature.strip_prefix("sha256=").unwrap_or(signature);
        let expected = hex::decode(hex_part).map_err(|_| SignatureError::Malformed)?;

        let mut mac =
            HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::Malformed)?;
        mac.update(signed);
        // Constant-time comparison
        mac.verify_slice(&expected)
            .map_err(|_| SignatureError::Mismatch)
    }

    /// Reject timestamps outside the freshness window. Absence is tolerated.
    pub fn check_timestamp(
        &self,
        timestamp: Option<&str>,
        now: OffsetDateTime,
    ) -> Result<(), SignatureError> {
        let Some(raw) = timestamp.map(str::trim).filter(|s| !s.is_empty()) else {
            return Ok(());
        };

        let sent_at = parse_timestamp(raw)?;
        let age_secs = (now - sent_at).whole_seconds();
        if age_secs.unsigned_abs() > self.tolerance_secs.unsigned_abs() {
            return Err(SignatureError::StaleTimestamp { age_secs });
        }
        Ok(())
    }
}

fn parse_timestamp(raw: &str) -> Result<OffsetDateTime, SignatureError> {
    if let Ok(n) = raw.parse::<i64>() {
        let secs = if n.unsigned_abs() >= MILLIS_THRESHOLD { n / 1000 } else { n };
        return OffsetDateTime::from_unix_timestamp(secs)
            .map_err(|e| SignatureError::InvalidTimestamp(e.to_string()));
    }
    OffsetDateTime::parse(raw, &time::format_description::well_known::Rfc3339)
        .map_err(|_| SignatureError::InvalidTimestamp(raw.to_string()))
}

/// Hex-encoded HMAC-SHA256 of `content`; used by tests and tooling that sign payloads
pub fn compute_signature(secret: &str, content: &[u8]) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        // HMAC accepts keys of any length
        Err(_) => return String::new(),
    };
    mac.update(content);
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    const SECRET: &str = "whsec_test_secret";

    #[test]
    fn test_valid_signature_accepted() {
        let verifier = SignatureVerifier::new(Some(SECRET.into()), 300);
        let body = br#"{"order_id":"1"}"#;
        let sig = compute_signature(SECRET, body);
        assert!(verifier.verify(body, Some(&sig)).is_ok());
        assert!(verifier.verify(body, Some(&format!("sha256={}", sig))).is_ok());
    }

    #[test]
    fn test_single_byte_tamper_rejected() {
        let verifier = SignatureVerifier::new(Some(SECRET.into()), 300);
        let body = br#"{"order_id":"1"}"#;
        let sig = compute_signature(SECRET, body);
        let tampered = br#"{"order_id":"2"}"#;
        assert_eq!(
            verifier.verify(tampered, Some(&sig)),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let verifier = SignatureVerifier::new(Some(SECRET.into()), 300);
        let body = b"{}";
        let sig = compute_signature("another_secret", body);
        assert_eq!(verifier.verify(body, Some(&sig)), Err(SignatureError::Mismatch));
    }

    #[test]
    fn test_missing_and_malformed_signatures() {
        let verifier = SignatureVerifier::new(Some(SECRET.into()), 300);
        assert_eq!(verifier.verify(b"{}", None), Err(SignatureError::Missing));
        assert_eq!(
            verifier.verify(b"{}", Some("not-hex")),
            Err(SignatureError::Malformed)
        );
    }

    #[test]
    fn test_unenforced_when_secret_empty() {
        let verifier = SignatureVerifier::new(Some(String::new()), 300);
        assert!(!verifier.is_enforced());
        assert!(verifier.verify(b"{}", None).is_ok());
    }

    #[test]
    fn test_extreme_numeric_timestamps_are_rejected() {
        let verifier = SignatureVerifier::new(None, 300);
        let now = OffsetDateTime::now_utc();

        for raw in [i64::MIN.to_string(), i64::MAX.to_string(), "-1000000000000".to_string()] {
            assert!(
                verifier.check_timestamp(Some(&raw), now).is_err(),
                "timestamp {} was accepted",
                raw
            );
        }
    }

    #[test]
    fn test_timestamp_window() {
        let verifier = SignatureVerifier::new(None, 300);
        let now = OffsetDateTime::now_utc();

        assert!(verifier.check_timestamp(None, now).is_ok());

        let fresh = (now - Duration::seconds(10)).unix_timestamp().to_string();
        assert!(verifier.check_timestamp(Some(&fresh), now).is_ok());

        let fresh_millis = ((now - Duration::seconds(10)).unix_timestamp() * 1000).to_string();
        assert!(verifier.check_timestamp(Some(&fresh_millis), now).is_ok());

        let stale = (now - Duration::seconds(3600)).unix_timestamp().to_string();
        assert!(matches!(
            verifier.check_timestamp(Some(&stale), now),
            Err(SignatureError::StaleTimestamp { .. })
        ));

        let future = (now + Duration::seconds(3600)).unix_timestamp().to_string();
        assert!(verifier.check_timestamp(Some(&future), now).is_err());

        assert!(matches!(
            verifier.check_timestamp(Some("yesterday"), now),
            Err(SignatureError::InvalidTimestamp(_))
        ));
    }
}
