//! Request authentication: HMAC-signature-over-body, or shared-token
//! equality. Neither reads cluster state; the caller resolves the secret
//! value and passes it in.

use hmac::{Hmac, Mac};
use http::HeaderMap;
use sha2::Sha256;

use crate::error::Error;

type HmacSha256 = Hmac<Sha256>;

/// Verifies the configured header against `body` using `secret`.
/// `header_value` is the full header value, e.g. `sha256=<hex>` or a bare token.
pub fn verify_hmac(secret: &[u8], header_value: &str, body: &[u8]) -> Result<(), Error> {
    let signature_hex = header_value.strip_prefix("sha256=").unwrap_or(header_value);
    let provided =
        hex::decode(signature_hex).map_err(|_| Error::Auth("malformed signature header".into()))?;

    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|_| Error::Auth("invalid HMAC key".into()))?;
    mac.update(body);
    mac.verify_slice(&provided)
        .map_err(|_| Error::Auth("signature mismatch".into()))
}

pub fn verify_token(expected: &str, header_value: &str) -> Result<(), Error> {
    // Constant-time compare via the same primitive used for signatures; a
    // plain `==` would leak timing information about the shared secret.
    let expected_bytes = expected.as_bytes();
    let provided_bytes = header_value.as_bytes();
    if expected_bytes.len() == provided_bytes.len()
        && subtle_eq(expected_bytes, provided_bytes)
    {
        Ok(())
    } else {
        Err(Error::Auth("token mismatch".into()))
    }
}

fn subtle_eq(a: &[u8], b: &[u8]) -> bool {
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

pub fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, Error> {
    headers
        .get(name)
        .ok_or_else(|| Error::Auth(format!("missing {name} header")))?
        .to_str()
        .map_err(|_| Error::Auth(format!("{name} header is not valid UTF-8")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_roundtrip_verifies() {
        let secret = b"topsecret";
        let body = b"{\"ref\":\"refs/heads/main\"}";
        let mut mac = HmacSha256::new_from_slice(secret).unwrap();
        mac.update(body);
        let sig = hex::encode(mac.finalize().into_bytes());
        let header = format!("sha256={sig}");
        assert!(verify_hmac(secret, &header, body).is_ok());
    }

    #[test]
    fn hmac_rejects_tampered_body() {
        let secret = b"topsecret";
        let mut mac = HmacSha256::new_from_slice(secret).unwrap();
        mac.update(b"original");
        let sig = hex::encode(mac.finalize().into_bytes());
        let header = format!("sha256={sig}");
        assert!(verify_hmac(secret, &header, b"tampered").is_err());
    }

    #[test]
    fn token_equality_is_exact() {
        assert!(verify_token("abc123", "abc123").is_ok());
        assert!(verify_token("abc123", "abc124").is_err());
        assert!(verify_token("abc123", "abc12").is_err());
    }
}
