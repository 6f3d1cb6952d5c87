//! HMAC request signing and replay material.
//!
//! The canonical representation serializes the raw body fields in a fixed
//! order, so the signature is independent of the field order the client used
//! in its JSON. Comparison is constant time. Nonce bookkeeping lives in the
//! ledger; this module only decides whether the signature itself holds.

use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;

use crate::GenerateRequest;

type HmacSha256 = Hmac<Sha256>;

/// Timestamp, nonce and signature as supplied by the caller. Body fields win
/// over the `X-Timestamp` / `X-Nonce` / `X-Signature` headers.
#[derive(Clone, Debug)]
pub struct SignatureMaterial {
    pub timestamp: i64,
    pub nonce: String,
    pub signature: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignatureFailure {
    /// |now - timestamp| exceeded the tolerance window (stale or future).
    StaleTimestamp,
    Mismatch,
}

impl SignatureFailure {
    pub fn code(&self) -> &'static str {
        match self {
            SignatureFailure::StaleTimestamp => "stale_timestamp",
            SignatureFailure::Mismatch => "signature_mismatch",
        }
    }
}

pub fn extract_material(body: &GenerateRequest, headers: &HeaderMap) -> Option<SignatureMaterial> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    let timestamp = body
        .timestamp
        .or_else(|| header("x-timestamp").and_then(|v| v.parse::<i64>().ok()))?;
    let nonce = body.nonce.clone().or_else(|| header("x-nonce"))?;
    let signature = body.signature.clone().or_else(|| header("x-signature"))?;
    Some(SignatureMaterial {
        timestamp,
        nonce,
        signature,
    })
}

/// Canonical signing payload. Field order is fixed by this declaration;
/// absent optional fields are omitted, matching what the client signs.
#[derive(Serialize)]
struct CanonicalPayload<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    prompt: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    width: Option<&'a serde_json::Number>,
    #[serde(skip_serializing_if = "Option::is_none")]
    height: Option<&'a serde_json::Number>,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    nonce: Option<&'a str>,
}

pub fn canonical_string(body: &GenerateRequest, timestamp: i64, nonce: &str) -> String {
    let payload = CanonicalPayload {
        prompt: body.prompt.as_deref(),
        width: body.width.as_ref(),
        height: body.height.as_ref(),
        model: body.model.as_deref(),
        timestamp,
        nonce: Some(nonce),
    };
    serde_json::to_string(&payload).unwrap_or_default()
}

/// Hex HMAC-SHA256 over the canonical payload. Also used by clients and
/// tests to produce valid signatures.
pub fn sign(secret: &str, body: &GenerateRequest, timestamp: i64, nonce: &str) -> String {
    let canonical = canonical_string(body, timestamp, nonce);
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return String::new();
    };
    mac.update(canonical.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

pub fn verify(
    secret: &str,
    body: &GenerateRequest,
    material: &SignatureMaterial,
    now_ms: i64,
    tolerance_ms: i64,
) -> Result<(), SignatureFailure> {
    if (now_ms - material.timestamp).abs() > tolerance_ms {
        return Err(SignatureFailure::StaleTimestamp);
    }
    let provided = hex::decode(material.signature.trim()).map_err(|_| SignatureFailure::Mismatch)?;
    let canonical = canonical_string(body, material.timestamp, &material.nonce);
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureFailure::Mismatch)?;
    mac.update(canonical.as_bytes());
    mac.verify_slice(&provided)
        .map_err(|_| SignatureFailure::Mismatch)
}
