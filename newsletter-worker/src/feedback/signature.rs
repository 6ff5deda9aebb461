//! Feedback webhook signature verification.
//!
//! The sender signs each request with HMAC-SHA256 over the timestamp header
//! followed by the raw request body, hex-encoded.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

pub const TIMESTAMP_HEADER: &str = "x-feedback-timestamp";
pub const SIGNATURE_HEADER: &str = "x-feedback-signature";

/// Hex HMAC-SHA256 of `timestamp + body` under `signing_key`.
pub fn sign(signing_key: &str, timestamp: &str, body: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(signing_key.as_bytes()).ok()?;
    mac.update(timestamp.as_bytes());
    mac.update(body);
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Verify a feedback webhook signature.
///
/// * `timestamp` - Unix epoch seconds from the timestamp header
/// * `signature` - hex digest from the signature header
/// * `max_age_seconds` - maximum skew between the timestamp and now
///
/// Returns `false` for missing fields, stale timestamps and mismatches.
pub fn verify_feedback_signature(
    signing_key: &str,
    timestamp: &str,
    body: &[u8],
    signature: &str,
    max_age_seconds: u64,
) -> bool {
    if signing_key.is_empty() || timestamp.is_empty() || signature.is_empty() {
        warn!(
            has_signing_key = !signing_key.is_empty(),
            has_timestamp = !timestamp.is_empty(),
            has_signature = !signature.is_empty(),
            "feedback_signature_missing_fields"
        );
        return false;
    }

    let sent_at: u64 = match timestamp.parse() {
        Ok(t) => t,
        Err(_) => {
            warn!(timestamp = %timestamp, "feedback_signature_invalid_timestamp");
            return false;
        }
    };

    let current_time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    let age = current_time.abs_diff(sent_at);
    if age > max_age_seconds {
        warn!(
            sent_at = sent_at,
            current_time = current_time,
            age_seconds = age,
            max_age_seconds = max_age_seconds,
            "feedback_signature_stale"
        );
        return false;
    }

    let expected = match sign(signing_key, timestamp, body) {
        Some(s) => s,
        None => {
            warn!("feedback_signature_invalid_key");
            return false;
        }
    };

    let valid = constant_time_compare(&expected, &signature.to_ascii_lowercase());
    if !valid {
        warn!(
            expected_length = expected.len(),
            actual_length = signature.len(),
            "feedback_signature_mismatch"
        );
    }
    valid
}

fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

/// Signature checks run only when a non-blank key is configured.
pub fn is_signature_verification_enabled(signing_key: &Option<String>) -> bool {
    signing_key
        .as_ref()
        .map(|k| !k.trim().is_empty())
        .unwrap_or(false)
}
