// Webhook authentication: shared-secret check on every push delivery.
//
// Accepted proofs, checked in this order:
//   X-Signature: sha256={hex hmac of the raw body, keyed by the secret}
//   X-Webhook-Secret: {secret}
//   ?secret={secret}
//
// Comparisons are constant-time. An empty configured secret rejects
// everything, so a misconfigured deployment fails closed.

use std::collections::HashMap;

use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-signature";
pub const SECRET_HEADER: &str = "x-webhook-secret";
pub const SECRET_QUERY: &str = "secret";

/// Why a delivery was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    NotConfigured,
    Missing,
    Mismatch,
}

impl AuthFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthFailure::NotConfigured => "webhook secret not configured",
            AuthFailure::Missing => "missing webhook secret",
            AuthFailure::Mismatch => "invalid webhook secret",
        }
    }
}

/// Hex HMAC-SHA256 of `body`, in the form senders put in `X-Signature`.
pub fn sign_body(secret: &str, body: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

/// Check a delivery against the configured secret.
pub fn verify_delivery(
    secret: &str,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
    body: &[u8],
) -> Result<(), AuthFailure> {
    if secret.is_empty() {
        return Err(AuthFailure::NotConfigured);
    }

    if let Some(signature) = header_str(headers, SIGNATURE_HEADER) {
        return if verify_signature(secret, signature, body) {
            Ok(())
        } else {
            Err(AuthFailure::Mismatch)
        };
    }

    let provided = header_str(headers, SECRET_HEADER)
        .or_else(|| query.get(SECRET_QUERY).map(String::as_str));
    match provided {
        None => Err(AuthFailure::Missing),
        Some(value) if constant_time_eq(value.trim(), secret) => Ok(()),
        Some(_) => Err(AuthFailure::Mismatch),
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn verify_signature(secret: &str, signature: &str, body: &[u8]) -> bool {
    let hex_sig = signature.trim().trim_start_matches("sha256=");
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    // verify_slice compares in constant time
    mac.verify_slice(&expected).is_ok()
}

/// Constant-time string comparison to prevent timing attacks.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}
