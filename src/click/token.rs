//! Bounded-lifetime click tokens
//!
//! A token binds a click to one link and an issue time. It is issued at
//! render time, sent to the browser, and posted back with the click.
//!
//! - `encoded_data`: base64url JSON `{linkId, issuedAt, nonce}`
//! - `validation`: base64url SHA-256 of `encoded_data`, or an HMAC-SHA256
//!   over it when a server secret is configured
//!
//! Without a secret the marker only detects corruption: anyone can mint a
//! token for any link within the freshness window. Configure a secret to get
//! forgery resistance.

use base64::prelude::*;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

/// Default validity window
pub const DEFAULT_TOKEN_TTL_MS: i64 = 5 * 60 * 1000;

/// Tolerated clock skew for tokens stamped in the future
const MAX_FUTURE_SKEW_MS: i64 = 30 * 1000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("click token is malformed")]
    Malformed,
    #[error("click token was issued for a different link")]
    Mismatch,
    #[error("click token has expired")]
    Expired,
    #[error("click token failed validation")]
    BadSignature,
}

/// Decoded token payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClickPayload {
    pub link_id: String,
    /// Unix milliseconds
    pub issued_at: i64,
    /// Distinguishes tokens issued for the same link in the same millisecond
    #[serde(default)]
    pub nonce: u64,
}

/// Token as handed to the client and posted back with a click
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClickToken {
    pub link_id: String,
    pub encoded_data: String,
    /// Issue time in unix milliseconds, mirrored from the payload
    pub timestamp: i64,
    pub validation: String,
}

#[derive(Clone)]
enum Marker {
    Digest,
    Hmac(Vec<u8>),
}

/// Issues and redeems click tokens
#[derive(Clone)]
pub struct ClickTokenCodec {
    marker: Marker,
    ttl_ms: i64,
}

impl ClickTokenCodec {
    /// Unsigned tokens: freshness and link binding only
    pub fn unsigned() -> Self {
        Self {
            marker: Marker::Digest,
            ttl_ms: DEFAULT_TOKEN_TTL_MS,
        }
    }

    /// HMAC-signed tokens
    pub fn signed(secret: &[u8]) -> Self {
        Self {
            marker: Marker::Hmac(secret.to_vec()),
            ttl_ms: DEFAULT_TOKEN_TTL_MS,
        }
    }

    pub fn from_secret(secret: Option<&str>) -> Self {
        match secret {
            Some(secret) => Self::signed(secret.as_bytes()),
            None => Self::unsigned(),
        }
    }

    pub fn with_ttl_ms(mut self, ttl_ms: i64) -> Self {
        self.ttl_ms = ttl_ms;
        self
    }

    pub fn ttl_ms(&self) -> i64 {
        self.ttl_ms
    }

    pub fn is_signed(&self) -> bool {
        matches!(self.marker, Marker::Hmac(_))
    }

    fn compute_marker(&self, encoded_data: &str) -> Vec<u8> {
        match &self.marker {
            Marker::Digest => Sha256::digest(encoded_data.as_bytes()).to_vec(),
            Marker::Hmac(key) => {
                // HMAC accepts keys of any length
                let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key)
                    .unwrap_or_else(|_| unreachable!("HMAC accepts any key length"));
                mac.update(encoded_data.as_bytes());
                mac.finalize().into_bytes().to_vec()
            }
        }
    }

    /// Issue a token for `link_id` stamped with the current time
    pub fn issue(&self, link_id: &str) -> ClickToken {
        self.issue_at(link_id, chrono::Utc::now().timestamp_millis())
    }

    pub fn issue_at(&self, link_id: &str, now_ms: i64) -> ClickToken {
        let payload = ClickPayload {
            link_id: link_id.to_string(),
            issued_at: now_ms,
            nonce: rand::random::<u64>(),
        };

        // Serializing a struct of strings and integers cannot fail
        let json = serde_json::to_vec(&payload).unwrap_or_default();
        let encoded_data = BASE64_URL_SAFE_NO_PAD.encode(json);
        let validation = BASE64_URL_SAFE_NO_PAD.encode(self.compute_marker(&encoded_data));

        ClickToken {
            link_id: link_id.to_string(),
            encoded_data,
            timestamp: now_ms,
            validation,
        }
    }

    /// Decode and check a token against the link it is being redeemed for.
    ///
    /// Side-effect free; one-time use is enforced by the caller.
    pub fn redeem(
        &self,
        encoded_data: &str,
        validation: &str,
        link_id: &str,
        now_ms: i64,
    ) -> Result<ClickPayload, TokenError> {
        let provided = BASE64_URL_SAFE_NO_PAD
            .decode(validation)
            .map_err(|_| TokenError::Malformed)?;
        let expected = self.compute_marker(encoded_data);

        if !bool::from(expected.ct_eq(&provided[..])) {
            return Err(TokenError::BadSignature);
        }

        let json = BASE64_URL_SAFE_NO_PAD
            .decode(encoded_data)
            .map_err(|_| TokenError::Malformed)?;
        let payload: ClickPayload =
            serde_json::from_slice(&json).map_err(|_| TokenError::Malformed)?;

        if payload.link_id.is_empty() || payload.issued_at <= 0 {
            return Err(TokenError::Malformed);
        }

        if payload.link_id != link_id {
            return Err(TokenError::Mismatch);
        }

        if payload.issued_at - now_ms > MAX_FUTURE_SKEW_MS {
            return Err(TokenError::Malformed);
        }

        if now_ms - payload.issued_at > self.ttl_ms {
            return Err(TokenError::Expired);
        }

        Ok(payload)
    }

    /// Redeem a full token object
    pub fn redeem_token(
        &self,
        token: &ClickToken,
        link_id: &str,
        now_ms: i64,
    ) -> Result<ClickPayload, TokenError> {
        self.redeem(&token.encoded_data, &token.validation, link_id, now_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: i64 = 1_700_000_000_000;
    const SECOND: i64 = 1000;

    fn encode_raw(json: &str) -> String {
        BASE64_URL_SAFE_NO_PAD.encode(json.as_bytes())
    }

    fn digest_marker(encoded: &str) -> String {
        BASE64_URL_SAFE_NO_PAD.encode(Sha256::digest(encoded.as_bytes()))
    }

    #[test]
    fn test_redeem_within_window() {
        let codec = ClickTokenCodec::unsigned();
        let token = codec.issue_at("link-a", T);

        let payload = codec
            .redeem_token(&token, "link-a", T + 4 * 60 * SECOND + 59 * SECOND)
            .unwrap();
        assert_eq!(payload.link_id, "link-a");
        assert_eq!(payload.issued_at, T);
        assert_eq!(token.timestamp, T);
    }

    #[test]
    fn test_redeem_after_window_expires() {
        let codec = ClickTokenCodec::unsigned();
        let token = codec.issue_at("link-a", T);

        let result = codec.redeem_token(&token, "link-a", T + 5 * 60 * SECOND + SECOND);
        assert_eq!(result, Err(TokenError::Expired));
    }

    #[test]
    fn test_redeem_for_other_link_mismatches() {
        let codec = ClickTokenCodec::unsigned();
        let token = codec.issue_at("link-a", T);

        for other in ["link-b", "", "LINK-A", "link-a "] {
            assert_eq!(
                codec.redeem_token(&token, other, T + SECOND),
                Err(TokenError::Mismatch)
            );
        }
    }

    #[test]
    fn test_tokens_are_distinct() {
        let codec = ClickTokenCodec::unsigned();
        let a = codec.issue_at("link-a", T);
        let b = codec.issue_at("link-a", T);
        assert_ne!(a.encoded_data, b.encoded_data);
        assert_ne!(a.validation, b.validation);
    }

    #[test]
    fn test_garbage_is_malformed() {
        let codec = ClickTokenCodec::unsigned();

        // Valid marker over an undecodable payload
        let encoded = "%%%not-base64%%%";
        assert_eq!(
            codec.redeem(encoded, &digest_marker(encoded), "link-a", T),
            Err(TokenError::Malformed)
        );

        // Decodable but missing fields
        let encoded = encode_raw(r#"{"linkId":"link-a"}"#);
        assert_eq!(
            codec.redeem(&encoded, &digest_marker(&encoded), "link-a", T),
            Err(TokenError::Malformed)
        );

        // Marker itself is not base64
        assert_eq!(
            codec.redeem(&encoded, "***", "link-a", T),
            Err(TokenError::Malformed)
        );
    }

    #[test]
    fn test_payload_without_nonce_is_accepted() {
        let codec = ClickTokenCodec::unsigned();
        let encoded = encode_raw(&format!(r#"{{"linkId":"link-a","issuedAt":{T}}}"#));

        let payload = codec
            .redeem(&encoded, &digest_marker(&encoded), "link-a", T + SECOND)
            .unwrap();
        assert_eq!(payload.nonce, 0);
    }

    #[test]
    fn test_future_token_is_rejected() {
        let codec = ClickTokenCodec::unsigned();
        let token = codec.issue_at("link-a", T + 10 * 60 * SECOND);
        assert_eq!(
            codec.redeem_token(&token, "link-a", T),
            Err(TokenError::Malformed)
        );

        // Small skew is tolerated
        let token = codec.issue_at("link-a", T + 5 * SECOND);
        assert!(codec.redeem_token(&token, "link-a", T).is_ok());
    }

    #[test]
    fn test_tampered_payload_fails_marker() {
        let codec = ClickTokenCodec::unsigned();
        let token = codec.issue_at("link-a", T);
        let forged = encode_raw(&format!(r#"{{"linkId":"link-b","issuedAt":{T}}}"#));

        assert_eq!(
            codec.redeem(&forged, &token.validation, "link-b", T),
            Err(TokenError::BadSignature)
        );
    }

    #[test]
    fn test_unsigned_tokens_can_be_minted_by_anyone() {
        // Documented weakness of unsigned mode
        let codec = ClickTokenCodec::unsigned();
        let forged = encode_raw(&format!(r#"{{"linkId":"link-z","issuedAt":{T}}}"#));
        assert!(codec
            .redeem(&forged, &digest_marker(&forged), "link-z", T)
            .is_ok());
    }

    #[test]
    fn test_signed_tokens_resist_forgery() {
        let codec = ClickTokenCodec::signed(b"server-secret");
        let token = codec.issue_at("link-a", T);
        assert!(codec.is_signed());
        assert!(codec.redeem_token(&token, "link-a", T + SECOND).is_ok());

        let forged = encode_raw(&format!(r#"{{"linkId":"link-z","issuedAt":{T}}}"#));
        assert_eq!(
            codec.redeem(&forged, &digest_marker(&forged), "link-z", T),
            Err(TokenError::BadSignature)
        );

        let other_key = ClickTokenCodec::signed(b"different-secret");
        assert_eq!(
            other_key.redeem_token(&token, "link-a", T + SECOND),
            Err(TokenError::BadSignature)
        );
    }

    #[test]
    fn test_custom_ttl() {
        let codec = ClickTokenCodec::unsigned().with_ttl_ms(10 * SECOND);
        let token = codec.issue_at("link-a", T);
        assert!(codec.redeem_token(&token, "link-a", T + 10 * SECOND).is_ok());
        assert_eq!(
            codec.redeem_token(&token, "link-a", T + 11 * SECOND),
            Err(TokenError::Expired)
        );
    }
}
