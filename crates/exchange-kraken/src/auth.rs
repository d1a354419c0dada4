//! Request signing for the Kraken private API.
//!
//! The signature is `HMAC-SHA512(path + SHA256(nonce + postdata))` with the
//! base64-decoded API secret, sent base64-encoded in the `API-Sign` header
//! alongside `API-Key`.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use cross_arb_core::{Credentials, ExchangeError, Result};
use hmac::{Hmac, Mac};
use secrecy::ExposeSecret;
use sha2::{Digest, Sha256, Sha512};

type HmacSha512 = Hmac<Sha512>;

/// Headers attached to every private Kraken request.
#[derive(Debug, Clone)]
pub struct SignedHeaders {
    /// API-Key header.
    pub api_key: String,
    /// API-Sign header (base64).
    pub signature: String,
}

impl SignedHeaders {
    /// Returns headers as tuples for reqwest.
    #[must_use]
    pub fn as_tuples(&self) -> [(&'static str, &str); 2] {
        [("API-Key", &self.api_key), ("API-Sign", &self.signature)]
    }
}

/// HMAC-SHA512 authenticator for Kraken.
pub struct KrakenAuth {
    api_key: String,
    secret: Vec<u8>,
}

impl std::fmt::Debug for KrakenAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KrakenAuth")
            .field("api_key", &self.api_key)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl KrakenAuth {
    /// Builds an authenticator from credentials.
    ///
    /// # Errors
    /// Returns `Auth` when the secret is not valid base64.
    pub fn from_credentials(credentials: &Credentials) -> Result<Self> {
        let secret = BASE64
            .decode(credentials.api_secret.expose_secret())
            .map_err(|e| ExchangeError::Auth(format!("api secret is not valid base64: {e}")))?;

        Ok(Self {
            api_key: credentials.api_key.clone(),
            secret,
        })
    }

    /// Signs one request.
    ///
    /// `postdata` is the form-encoded body and must already contain the
    /// `nonce` field with the same value passed here.
    #[must_use]
    pub fn sign(&self, path: &str, nonce: &str, postdata: &str) -> SignedHeaders {
        let mut sha = Sha256::new();
        sha.update(nonce.as_bytes());
        sha.update(postdata.as_bytes());
        let digest = sha.finalize();

        let mut mac =
            HmacSha512::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(path.as_bytes());
        mac.update(&digest);
        let signature = BASE64.encode(mac.finalize().into_bytes());

        SignedHeaders {
            api_key: self.api_key.clone(),
            signature,
        }
    }

    /// Produces a strictly increasing nonce in milliseconds.
    #[must_use]
    pub fn nonce() -> String {
        chrono::Utc::now().timestamp_millis().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Secret and expected signature from Kraken's API documentation.
    const DOC_SECRET: &str =
        "kQH5HW/8p1uGOVjbgWA7FunAmGO8lsSUXNsu3eow76sz84Q18fWxnyRzBHCd3pd5nE9qa99HAZtuZuj6F1huXg==";

    #[test]
    fn test_sign_documentation_vector() {
        let credentials = Credentials::new("doc-key", DOC_SECRET);
        let auth = KrakenAuth::from_credentials(&credentials).unwrap();
        let headers = auth.sign(
            "/0/private/AddOrder",
            "1616492376594",
            "nonce=1616492376594&ordertype=limit&pair=XBTUSD&price=37500&type=buy&volume=1.25",
        );
        assert_eq!(
            headers.signature,
            "4/dpxb3iT4tp/ZCVEwSnEsLxx0bqyhLpdfOpc6fn7OR8+UClSV5n9E6aSS8MPtnRfp32bAb0nmbRn6H8ndwLUQ=="
        );
        assert_eq!(headers.api_key, "doc-key");
    }

    #[test]
    fn test_sign_balance_vector() {
        let credentials =
            Credentials::new("key", "a3Jha2VuLXNlY3JldC1rZXktbWF0ZXJpYWwtOTg3NjU0MzIxMA==");
        let auth = KrakenAuth::from_credentials(&credentials).unwrap();
        let headers = auth.sign("/0/private/Balance", "1616492376594", "nonce=1616492376594");
        assert_eq!(
            headers.signature,
            "g7LYGUen/q52New9o6fWvWLQTjjLrUejmGSkNiKKFvjJ0Zpmx6Qz9frMGpduB2pi9XFG/bqjf0/+4uM6/CROUw=="
        );
    }

    #[test]
    fn test_invalid_secret_is_auth_error() {
        let credentials = Credentials::new("key", "%%% not base64 %%%");
        let err = KrakenAuth::from_credentials(&credentials).unwrap_err();
        assert!(matches!(err, ExchangeError::Auth(_)));
    }

    #[test]
    fn test_nonce_is_numeric_and_millis() {
        let nonce = KrakenAuth::nonce();
        let value: i64 = nonce.parse().unwrap();
        // Milliseconds since epoch, not seconds.
        assert!(value > 1_600_000_000_000);
    }
}
