//! One-shot result messages carried in a signed cookie.
//!
//! The upload handler writes a [`ResultMessage`] into the flash cookie on
//! its redirect; the next `GET /` verifies it, renders it and clears the
//! cookie.  The cookie value is
//! `base64url(json payload) "." base64url(HMAC-SHA256(payload))`, and a
//! payload older than [`FLASH_MAX_AGE_SECS`] is ignored even when the
//! signature checks out.

use axum::http::header::COOKIE;
use axum::http::HeaderMap;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Cookie name.
pub const FLASH_COOKIE: &str = "blobdrop_flash";

/// How long a flash message stays readable.
pub const FLASH_MAX_AGE_SECS: i64 = 300;

/// `Set-Cookie` value that removes the flash cookie.
pub const CLEAR_FLASH_COOKIE: &str =
    "blobdrop_flash=; Path=/; Max-Age=0; HttpOnly; SameSite=Lax";

/// Whether the upload worked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Success,
    Error,
}

/// User-facing status shown once on the form page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultMessage {
    pub kind: MessageKind,
    pub text: String,
}

impl ResultMessage {
    pub fn success(text: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Success,
            text: text.into(),
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Error,
            text: text.into(),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct FlashPayload {
    #[serde(flatten)]
    message: ResultMessage,
    /// Issued-at, epoch seconds.
    iat: i64,
}

/// Signs and verifies flash cookies.
pub struct FlashSigner {
    key: Vec<u8>,
}

impl FlashSigner {
    /// Signer keyed by an externally supplied secret.
    pub fn new(secret: &str) -> Self {
        Self {
            key: secret.as_bytes().to_vec(),
        }
    }

    /// Signer with a random key that only lives as long as the process.
    pub fn ephemeral() -> Self {
        let key: [u8; 32] = rand::random();
        Self { key: key.to_vec() }
    }

    fn mac(&self, payload: &[u8]) -> Vec<u8> {
        // HMAC accepts keys of any length.
        let mut mac = match HmacSha256::new_from_slice(&self.key) {
            Ok(mac) => mac,
            Err(_) => unreachable!("HMAC-SHA256 takes keys of any size"),
        };
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }

    /// Encode `message` as a signed cookie value issued at `now`.
    pub fn encode(&self, message: &ResultMessage, now: DateTime<Utc>) -> String {
        let payload = FlashPayload {
            message: message.clone(),
            iat: now.timestamp(),
        };
        // Serializing a struct of strings and an integer cannot fail.
        let json = serde_json::to_vec(&payload).unwrap_or_default();
        let signature = self.mac(&json);
        format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&json),
            URL_SAFE_NO_PAD.encode(signature)
        )
    }

    /// Verify and decode a cookie value.  Returns `None` for anything
    /// tampered, malformed or expired.
    pub fn decode(&self, value: &str, now: DateTime<Utc>) -> Option<ResultMessage> {
        let (payload_b64, signature_b64) = value.split_once('.')?;
        let json = URL_SAFE_NO_PAD.decode(payload_b64).ok()?;
        let signature = URL_SAFE_NO_PAD.decode(signature_b64).ok()?;

        let expected = self.mac(&json);
        if !bool::from(expected.ct_eq(&signature)) {
            return None;
        }

        let payload: FlashPayload = serde_json::from_slice(&json).ok()?;
        let age = now.timestamp() - payload.iat;
        if !(0..=FLASH_MAX_AGE_SECS).contains(&age) {
            return None;
        }
        Some(payload.message)
    }

    /// Full `Set-Cookie` value carrying `message`.
    pub fn set_cookie(&self, message: &ResultMessage, now: DateTime<Utc>) -> String {
        format!(
            "{}={}; Path=/; Max-Age={}; HttpOnly; SameSite=Lax",
            FLASH_COOKIE,
            self.encode(message, now),
            FLASH_MAX_AGE_SECS
        )
    }
}

/// Find the raw flash cookie value in the request's `Cookie` headers.
pub fn read_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == FLASH_COOKIE)
        .map(|(_, value)| value.to_string())
}
