//! Webhook signature verification using HMAC-SHA256.
//!
//! GitHub signs each delivery with the shared webhook secret and sends the
//! result in `X-Hub-Signature-256` as `sha256=<hex>`. Verification runs before
//! any parsing, and comparison is constant-time.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidSecret {
    #[error("webhook secret is empty")]
    Empty,

    #[error("webhook secret rejected by HMAC")]
    Rejected,
}

/// The shared secret, keyed once at startup.
#[derive(Clone)]
pub struct WebhookSecret {
    mac: HmacSha256,
}

impl WebhookSecret {
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self, InvalidSecret> {
        let secret = secret.as_ref();
        if secret.is_empty() {
            return Err(InvalidSecret::Empty);
        }
        let mac = HmacSha256::new_from_slice(secret).map_err(|_| InvalidSecret::Rejected)?;
        Ok(WebhookSecret { mac })
    }

    /// Returns true if `signature_header` is a valid signature of `payload`.
    ///
    /// Malformed headers (missing prefix, bad hex) are simply invalid.
    pub fn verify(&self, payload: &[u8], signature_header: &str) -> bool {
        let Some(expected) = parse_signature_header(signature_header) else {
            return false;
        };
        let mut mac = self.mac.clone();
        mac.update(payload);
        mac.verify_slice(&expected).is_ok()
    }

    /// Produces the `sha256=<hex>` header value for `payload`.
    pub fn sign(&self, payload: &[u8]) -> String {
        let mut mac = self.mac.clone();
        mac.update(payload);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }
}

impl std::fmt::Debug for WebhookSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("WebhookSecret(..)")
    }
}

/// Parses `sha256=<hex>` into raw bytes.
fn parse_signature_header(header: &str) -> Option<Vec<u8>> {
    hex::decode(header.strip_prefix("sha256=")?).ok()
}
