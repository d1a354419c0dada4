//! HMAC-SHA256 request signing for the Coinbase API.
//!
//! The signature is computed over `timestamp + method + path + body` with the
//! base64-decoded API secret, and sent base64-encoded alongside the key,
//! timestamp, and passphrase headers.
//!
//! # Security
//!
//! - The decoded secret never leaves this module and is never logged.
//! - A missing passphrase is a configuration error, caught at authenticate
//!   time rather than on the first signed request.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use cross_arb_core::{Credentials, ExchangeError, Result};
use hmac::{Hmac, Mac};
use secrecy::ExposeSecret;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Headers attached to every authenticated Coinbase request.
#[derive(Debug, Clone)]
pub struct SignedHeaders {
    /// CB-ACCESS-KEY header.
    pub access_key: String,
    /// CB-ACCESS-SIGN header (base64).
    pub signature: String,
    /// CB-ACCESS-TIMESTAMP header (Unix seconds).
    pub timestamp: String,
    /// CB-ACCESS-PASSPHRASE header.
    pub passphrase: String,
}

impl SignedHeaders {
    /// Returns headers as tuples for reqwest.
    #[must_use]
    pub fn as_tuples(&self) -> [(&'static str, &str); 4] {
        [
            ("CB-ACCESS-KEY", &self.access_key),
            ("CB-ACCESS-SIGN", &self.signature),
            ("CB-ACCESS-TIMESTAMP", &self.timestamp),
            ("CB-ACCESS-PASSPHRASE", &self.passphrase),
        ]
    }
}

/// HMAC-SHA256 authenticator for Coinbase.
pub struct CoinbaseAuth {
    api_key: String,
    secret: Vec<u8>,
    passphrase: String,
}

impl std::fmt::Debug for CoinbaseAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoinbaseAuth")
            .field("api_key", &self.api_key)
            .field("secret", &"[REDACTED]")
            .field("passphrase", &"[REDACTED]")
            .finish()
    }
}

impl CoinbaseAuth {
    /// Builds an authenticator from credentials.
    ///
    /// # Errors
    /// Returns `Config` when the passphrase is missing and `Auth` when the
    /// secret is not valid base64.
    pub fn from_credentials(credentials: &Credentials) -> Result<Self> {
        let passphrase = credentials
            .passphrase
            .as_ref()
            .ok_or_else(|| {
                ExchangeError::Config("coinbase credentials require a passphrase".into())
            })?
            .expose_secret()
            .to_string();

        let secret = BASE64
            .decode(credentials.api_secret.expose_secret())
            .map_err(|e| ExchangeError::Auth(format!("api secret is not valid base64: {e}")))?;

        Ok(Self {
            api_key: credentials.api_key.clone(),
            secret,
            passphrase,
        })
    }

    /// Signs one request, producing the full header set.
    ///
    /// `path` must include the query string when present; `body` is the raw
    /// JSON payload or empty for GET/DELETE.
    #[must_use]
    pub fn sign(&self, timestamp: &str, method: &str, path: &str, body: &str) -> SignedHeaders {
        let prehash = format!("{timestamp}{method}{path}{body}");
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(prehash.as_bytes());
        let signature = BASE64.encode(mac.finalize().into_bytes());

        SignedHeaders {
            access_key: self.api_key.clone(),
            signature,
            timestamp: timestamp.to_string(),
            passphrase: self.passphrase.clone(),
        }
    }

    /// Signs with the current wall-clock timestamp.
    #[must_use]
    pub fn sign_now(&self, method: &str, path: &str, body: &str) -> SignedHeaders {
        let timestamp = chrono::Utc::now().timestamp().to_string();
        self.sign(&timestamp, method, path, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET_B64: &str = "c3VwZXItc2VjcmV0LWtleS1tYXRlcmlhbC0wMTIzNDU2Nzg5";

    fn auth() -> CoinbaseAuth {
        let credentials = Credentials::new("key-id", SECRET_B64).with_passphrase("phrase");
        CoinbaseAuth::from_credentials(&credentials).unwrap()
    }

    #[test]
    fn test_sign_get_known_vector() {
        let headers = auth().sign("1700000000", "GET", "/accounts", "");
        assert_eq!(headers.signature, "ncHha36/JoHKujYSjQRq9/XU7XrSYtyHJI1Q/wmL5HI=");
        assert_eq!(headers.access_key, "key-id");
        assert_eq!(headers.timestamp, "1700000000");
        assert_eq!(headers.passphrase, "phrase");
    }

    #[test]
    fn test_sign_post_includes_body() {
        let headers = auth().sign("1700000000", "POST", "/orders", r#"{"size":"1"}"#);
        assert_eq!(headers.signature, "gUls7UD1TnppNwMrn8O5H7SKOK4/AZKrc5uI2bGYmGU=");
    }

    #[test]
    fn test_missing_passphrase_is_config_error() {
        let credentials = Credentials::new("key-id", SECRET_B64);
        let err = CoinbaseAuth::from_credentials(&credentials).unwrap_err();
        assert!(matches!(err, ExchangeError::Config(_)));
    }

    #[test]
    fn test_invalid_secret_is_auth_error() {
        let credentials = Credentials::new("key-id", "not base64 !!!").with_passphrase("phrase");
        let err = CoinbaseAuth::from_credentials(&credentials).unwrap_err();
        assert!(matches!(err, ExchangeError::Auth(_)));
    }

    #[test]
    fn test_header_tuples() {
        let headers = auth().sign("1700000000", "GET", "/accounts", "");
        let tuples = headers.as_tuples();
        assert_eq!(tuples[0].0, "CB-ACCESS-KEY");
        assert_eq!(tuples[1].0, "CB-ACCESS-SIGN");
        assert_eq!(tuples[2].0, "CB-ACCESS-TIMESTAMP");
        assert_eq!(tuples[3].0, "CB-ACCESS-PASSPHRASE");
    }
}
