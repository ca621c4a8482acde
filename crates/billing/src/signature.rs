//! Webhook signature verification
//!
//! The gateway signs each notification with an HMAC over a canonical
//! manifest string built from the resource id, the request id (or topic),
//! and a timestamp. Integrations in the wild disagree on the manifest key
//! separators and on whether `ts` is seconds or milliseconds, so every
//! plausible candidate is tried before rejecting. Verification failures are
//! logged with redacted previews and never surfaced to the caller; the
//! webhook endpoint acknowledges receipt regardless of outcome.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{BillingError, BillingResult};

type HmacSha256 = Hmac<Sha256>;

/// Signature verification configuration (supports secret rotation:
/// up to two live secrets)
#[derive(Debug, Clone)]
pub struct SignatureConfig {
    secrets: Vec<String>,
}

impl SignatureConfig {
    pub fn new(current: String, previous: Option<String>) -> BillingResult<Self> {
        if current.len() < 32 {
            return Err(BillingError::Config(
                "webhook secret must be at least 32 characters".to_string(),
            ));
        }
        let mut secrets = vec![current];
        if let Some(prev) = previous {
            secrets.push(prev);
        }
        Ok(Self { secrets })
    }

    /// Create config from environment variables.
    /// `MP_WEBHOOK_SECRET` is required; `MP_WEBHOOK_SECRET_PREVIOUS` keeps
    /// the prior secret live during rotation.
    pub fn from_env() -> BillingResult<Self> {
        let current = std::env::var("MP_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("MP_WEBHOOK_SECRET not set".to_string()))?;
        let previous = std::env::var("MP_WEBHOOK_SECRET_PREVIOUS").ok();
        Self::new(current, previous)
    }

    /// Verify an inbound webhook request.
    ///
    /// Pure over its inputs and the configured secrets; the only side
    /// effects are log lines.
    pub fn verify(&self, request: &WebhookRequest<'_>) -> Verification {
        let Some(signature) = request.x_signature else {
            tracing::warn!("Webhook rejected: missing x-signature header");
            return Verification::Invalid(SignatureFailure::MissingFields);
        };

        // Parse "ts=<timestamp>, v1=<hex-hmac>"
        let mut ts: Option<&str> = None;
        let mut v1: Option<&str> = None;
        for part in signature.split(',') {
            let mut kv = part.trim().splitn(2, '=');
            match (kv.next(), kv.next()) {
                (Some("ts"), Some(value)) => ts = Some(value.trim()),
                (Some("v1"), Some(value)) => v1 = Some(value.trim()),
                _ => {}
            }
        }

        let correlation = request.x_request_id.or(request.topic);
        let (Some(ts), Some(v1), Some(_), Some(id)) = (ts, v1, correlation, request.resource_id)
        else {
            tracing::warn!(
                has_ts = ts.is_some(),
                has_v1 = v1.is_some(),
                has_correlation = correlation.is_some(),
                has_id = request.resource_id.is_some(),
                "Webhook rejected: incomplete signature fields"
            );
            return Verification::Invalid(SignatureFailure::MissingFields);
        };

        let provided = v1.to_lowercase();

        for candidate_ts in timestamp_candidates(ts) {
            for manifest in manifest_candidates(id, request.x_request_id, request.topic, &candidate_ts)
            {
                for secret in &self.secrets {
                    let computed = hmac_hex(secret, &manifest);
                    if constant_time_eq(&computed, &provided) {
                        tracing::debug!(
                            resource_id = %id,
                            manifest_preview = %preview(&manifest, 24),
                            "Webhook signature verified"
                        );
                        return Verification::Valid {
                            resource_id: id.to_string(),
                        };
                    }
                }
            }
        }

        tracing::warn!(
            resource_id = %id,
            ts = %ts,
            v1_preview = %preview(&provided, 8),
            "Webhook rejected: no manifest candidate matched"
        );
        Verification::Invalid(SignatureFailure::InvalidSignature)
    }
}

/// The fields of an inbound webhook the verifier looks at, extracted by
/// the HTTP layer
#[derive(Debug, Clone, Copy, Default)]
pub struct WebhookRequest<'a> {
    pub x_signature: Option<&'a str>,
    pub x_request_id: Option<&'a str>,
    pub topic: Option<&'a str>,
    pub resource_id: Option<&'a str>,
}

/// Outcome of signature verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Valid { resource_id: String },
    Invalid(SignatureFailure),
}

impl Verification {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid { .. })
    }
}

/// Why verification failed (internal diagnostics only, never surfaced
/// to the gateway)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureFailure {
    MissingFields,
    InvalidSignature,
}

/// The `ts` field may arrive in seconds or milliseconds; produce both
/// representations so a manifest signed under either convention matches
fn timestamp_candidates(ts: &str) -> Vec<String> {
    let mut out = vec![ts.to_string()];
    if let Ok(value) = ts.parse::<i64>() {
        if ts.len() >= 13 {
            // Looks like milliseconds; also try seconds
            out.push((value / 1000).to_string());
        } else {
            // Looks like seconds; also try milliseconds
            if let Some(ms) = value.checked_mul(1000) {
                out.push(ms.to_string());
            }
        }
    }
    out.dedup();
    out
}

/// Canonical manifest strings the provider has signed across integrations:
/// `request-id:`-keyed, the legacy `topic:`-keyed form, and an
/// underscore-keyed (`request_id:`) variant
fn manifest_candidates(
    id: &str,
    request_id: Option<&str>,
    topic: Option<&str>,
    ts: &str,
) -> Vec<String> {
    let mut out = Vec::with_capacity(3);
    if let Some(rid) = request_id {
        out.push(format!("id:{};request-id:{};ts:{};", id, rid, ts));
        out.push(format!("id:{};request_id:{};ts:{};", id, rid, ts));
    }
    if let Some(topic) = topic {
        out.push(format!("id:{};topic:{};ts:{};", id, topic, ts));
    }
    out
}

fn hmac_hex(secret: &str, manifest: &str) -> String {
    // HmacSha256 accepts keys of any length
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(manifest.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time string comparison; length mismatch burns a dummy compare
/// so the early return does not leak timing
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        let dummy = vec![0u8; a.len()];
        let _ = a.as_bytes().ct_eq(&dummy);
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// First `n` characters, for redacted log previews. Truncates on a char
/// boundary; resource ids can arrive from the JSON body and are not
/// guaranteed ASCII.
fn preview(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    const SECRET: &str = "test-webhook-secret-at-least-32-characters!";

    fn config() -> SignatureConfig {
        SignatureConfig::new(SECRET.to_string(), None).unwrap()
    }

    fn sign(manifest: &str, secret: &str) -> String {
        hmac_hex(secret, manifest)
    }

    #[test]
    fn test_valid_signature_seconds_timestamp() {
        let manifest = "id:pay_123;request-id:req-9;ts:1735689600;";
        let v1 = sign(manifest, SECRET);
        let header = format!("ts=1735689600, v1={}", v1);
        let outcome = config().verify(&WebhookRequest {
            x_signature: Some(&header),
            x_request_id: Some("req-9"),
            topic: None,
            resource_id: Some("pay_123"),
        });
        assert_eq!(
            outcome,
            Verification::Valid {
                resource_id: "pay_123".to_string()
            }
        );
    }

    #[test]
    fn test_millisecond_header_matches_second_signed_manifest() {
        // Provider signed over the seconds form but sent ts in millis
        let manifest = "id:pay_123;request-id:req-9;ts:1735689600;";
        let v1 = sign(manifest, SECRET);
        let header = format!("ts=1735689600000, v1={}", v1);
        let outcome = config().verify(&WebhookRequest {
            x_signature: Some(&header),
            x_request_id: Some("req-9"),
            topic: None,
            resource_id: Some("pay_123"),
        });
        assert!(outcome.is_valid());
    }

    #[test]
    fn test_topic_keyed_manifest() {
        let manifest = "id:pay_123;topic:payment;ts:1735689600;";
        let v1 = sign(manifest, SECRET);
        let header = format!("ts=1735689600, v1={}", v1);
        let outcome = config().verify(&WebhookRequest {
            x_signature: Some(&header),
            x_request_id: None,
            topic: Some("payment"),
            resource_id: Some("pay_123"),
        });
        assert!(outcome.is_valid());
    }

    #[test]
    fn test_underscore_keyed_manifest() {
        let manifest = "id:pay_123;request_id:req-9;ts:1735689600;";
        let v1 = sign(manifest, SECRET);
        let header = format!("ts=1735689600, v1={}", v1);
        let outcome = config().verify(&WebhookRequest {
            x_signature: Some(&header),
            x_request_id: Some("req-9"),
            topic: None,
            resource_id: Some("pay_123"),
        });
        assert!(outcome.is_valid());
    }

    #[test]
    fn test_rotated_secret_still_verifies() {
        let old_secret = "previous-webhook-secret-32-characters-long";
        let config = SignatureConfig::new(SECRET.to_string(), Some(old_secret.to_string())).unwrap();
        let manifest = "id:pay_123;request-id:req-9;ts:1735689600;";
        let v1 = sign(manifest, old_secret);
        let header = format!("ts=1735689600, v1={}", v1);
        let outcome = config.verify(&WebhookRequest {
            x_signature: Some(&header),
            x_request_id: Some("req-9"),
            topic: None,
            resource_id: Some("pay_123"),
        });
        assert!(outcome.is_valid());
    }

    #[test]
    fn test_preview_respects_char_boundaries() {
        assert_eq!(preview("pay_1234567890", 8), "pay_1234");
        assert_eq!(preview("short", 8), "short");
        // Multibyte ids must truncate on a char boundary, not a byte offset
        assert_eq!(preview("cobrança-outubro", 8), "cobrança");
        assert_eq!(preview("日本語のid", 3), "日本語");
    }

    #[test]
    fn test_any_flipped_hex_char_fails() {
        let manifest = "id:pay_123;request-id:req-9;ts:1735689600;";
        let v1 = sign(manifest, SECRET);
        for i in 0..v1.len() {
            let mut bytes = v1.clone().into_bytes();
            bytes[i] = if bytes[i] == b'0' { b'1' } else { b'0' };
            let flipped = String::from_utf8(bytes).unwrap();
            let header = format!("ts=1735689600, v1={}", flipped);
            let outcome = config().verify(&WebhookRequest {
                x_signature: Some(&header),
                x_request_id: Some("req-9"),
                topic: None,
                resource_id: Some("pay_123"),
            });
            assert_eq!(
                outcome,
                Verification::Invalid(SignatureFailure::InvalidSignature),
                "flip at {} unexpectedly verified",
                i
            );
        }
    }

    #[test]
    fn test_missing_fields() {
        // No resource id
        let header = format!("ts=1, v1={}", sign("x", SECRET));
        let outcome = config().verify(&WebhookRequest {
            x_signature: Some(&header),
            x_request_id: Some("req-9"),
            topic: None,
            resource_id: None,
        });
        assert_eq!(outcome, Verification::Invalid(SignatureFailure::MissingFields));

        // No signature header at all
        let outcome = config().verify(&WebhookRequest {
            x_signature: None,
            x_request_id: Some("req-9"),
            topic: None,
            resource_id: Some("pay_123"),
        });
        assert_eq!(outcome, Verification::Invalid(SignatureFailure::MissingFields));

        // Neither request id nor topic
        let outcome = config().verify(&WebhookRequest {
            x_signature: Some(&header),
            x_request_id: None,
            topic: None,
            resource_id: Some("pay_123"),
        });
        assert_eq!(outcome, Verification::Invalid(SignatureFailure::MissingFields));
    }

    #[test]
    fn test_short_secret_rejected() {
        assert!(SignatureConfig::new("short".to_string(), None).is_err());
    }
}
