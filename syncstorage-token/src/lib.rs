//! Bearer token minting and verification for the Sync 1.5 tokenserver
//! protocol: an HMAC-signed, HKDF-keyed envelope carrying `(uid, node,
//! expires)`.
//!
//! Grounded on `tokenserver-auth`'s `crypto`/`token::native` modules, which
//! only mint tokens (the HTTP-facing tokenserver hands tokens *out*, it
//! never has to check one it didn't just make). This crate adds the
//! symmetric verification half those modules never needed: parsing an
//! inbound token, trying it against a rotating secret list, and deriving
//! the same per-request MAC key the client derived.

mod crypto;

pub use crypto::{Crypto, CryptoImpl};

use hex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const HKDF_SIGNING_INFO: &[u8] = b"services.mozilla.com/tokenlib/v1/signing";
const HKDF_DERIVE_INFO_PREFIX: &[u8] = b"services.mozilla.com/tokenlib/v1/derive/";
const SALT_BYTES: usize = 3;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("token signature did not match any configured secret")]
    InvalidSignature,
    #[error("token payload was malformed")]
    MalformedPayload,
    #[error("token has expired")]
    Expired,
}

/// The information a token asserts about its holder. `expires` is seconds
/// since the epoch, matching the fractional-second convention the rest of
/// the storage server uses for timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenPayload {
    pub uid: i64,
    pub node: String,
    pub expires: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    payload: TokenPayload,
    salt: String,
}

/// Result of a successful verification: the asserted payload plus the
/// per-request MAC key the caller must use to validate the request's Hawk
/// signature.
#[derive(Debug, PartialEq)]
pub struct VerifiedToken {
    pub payload: TokenPayload,
    pub derived_secret: String,
}

/// Mints a new token for `payload`, signed with `shared_secret`. Returns
/// the base64url token string and its derived secret. Not on the
/// request-serving path: used to build test fixtures and by any offline
/// token-minting tool.
pub fn make_token(
    crypto: &dyn Crypto,
    payload: TokenPayload,
    shared_secret: &str,
) -> Result<(String, String), TokenError> {
    let salt_bytes = crypto.rand_bytes(SALT_BYTES)?;
    let salt = hex::encode(&salt_bytes);

    let envelope = Envelope { payload, salt };
    let envelope_json =
        serde_json::to_vec(&envelope).map_err(|_| TokenError::MalformedPayload)?;

    let signing_key = crypto.hkdf(HKDF_SIGNING_INFO, b"", shared_secret.as_bytes())?;
    let signature = crypto.hmac_sign(&signing_key, &envelope_json)?;

    let mut token_bytes = envelope_json;
    token_bytes.extend_from_slice(&signature);
    let token = base64::encode_config(&token_bytes, base64::URL_SAFE);

    let derived_secret = derive_secret(crypto, shared_secret, &envelope.salt, &token)?;

    Ok((token, derived_secret))
}

/// Parses and verifies `token` against the ordered `secrets` list (most
/// recent first), returning the asserted payload and the per-request MAC
/// key on success. `now` is compared against the payload's `expires`.
pub fn verify_token(
    crypto: &dyn Crypto,
    token: &str,
    secrets: &[String],
    now: f64,
) -> Result<VerifiedToken, TokenError> {
    let token_bytes = base64::decode_config(token, base64::URL_SAFE)
        .map_err(|_| TokenError::MalformedPayload)?;
    if token_bytes.len() <= crypto::SHA256_OUTPUT_LEN {
        return Err(TokenError::MalformedPayload);
    }
    let split_at = token_bytes.len() - crypto::SHA256_OUTPUT_LEN;
    let (envelope_json, signature) = token_bytes.split_at(split_at);

    let envelope: Envelope =
        serde_json::from_slice(envelope_json).map_err(|_| TokenError::MalformedPayload)?;

    let mut verified = false;
    for secret in secrets {
        let signing_key = crypto.hkdf(HKDF_SIGNING_INFO, b"", secret.as_bytes())?;
        if crypto
            .hmac_verify(&signing_key, envelope_json, signature)
            .is_ok()
        {
            verified = true;

            if envelope.payload.expires <= now {
                return Err(TokenError::Expired);
            }

            let derived_secret = derive_secret(crypto, secret, &envelope.salt, token)?;
            return Ok(VerifiedToken {
                payload: envelope.payload,
                derived_secret,
            });
        }
    }

    if verified {
        unreachable!("loop returns on the first verified match");
    }
    Err(TokenError::InvalidSignature)
}

fn derive_secret(
    crypto: &dyn Crypto,
    shared_secret: &str,
    salt_hex: &str,
    token: &str,
) -> Result<String, TokenError> {
    let salt_bytes = hex::decode(salt_hex).map_err(|_| TokenError::MalformedPayload)?;
    let mut info = HKDF_DERIVE_INFO_PREFIX.to_vec();
    info.extend_from_slice(token.as_bytes());

    let derived = crypto.hkdf(&info, &salt_bytes, shared_secret.as_bytes())?;
    Ok(base64::encode_config(&derived, base64::URL_SAFE))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crypto::MockCrypto;

    fn payload() -> TokenPayload {
        TokenPayload {
            uid: 1234,
            node: "http://example-node.example.com".to_string(),
            expires: 1_452_807_004.454294,
        }
    }

    #[test]
    fn round_trip_with_matching_secret() {
        let crypto = MockCrypto;
        let (token, derived_secret) = make_token(&crypto, payload(), "shared-secret").unwrap();
        let verified = verify_token(&crypto, &token, &["shared-secret".to_string()], 0.0).unwrap();
        assert_eq!(verified.payload, payload());
        assert_eq!(verified.derived_secret, derived_secret);
    }

    #[test]
    fn secret_rotation_tries_in_order() {
        let crypto = MockCrypto;
        let (token, _) = make_token(&crypto, payload(), "new-secret").unwrap();
        let secrets = vec!["old-secret".to_string(), "new-secret".to_string()];
        let verified = verify_token(&crypto, &token, &secrets, 0.0).unwrap();
        assert_eq!(verified.payload, payload());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let crypto = MockCrypto;
        let (token, _) = make_token(&crypto, payload(), "shared-secret").unwrap();
        let err = verify_token(&crypto, &token, &["other-secret".to_string()], 0.0).unwrap_err();
        assert_eq!(err, TokenError::InvalidSignature);
    }

    #[test]
    fn expired_token_is_rejected() {
        let crypto = MockCrypto;
        let (token, _) = make_token(&crypto, payload(), "shared-secret").unwrap();
        let err = verify_token(
            &crypto,
            &token,
            &["shared-secret".to_string()],
            payload().expires + 10.0,
        )
        .unwrap_err();
        assert_eq!(err, TokenError::Expired);
    }

    #[test]
    fn malformed_token_is_rejected() {
        let crypto = MockCrypto;
        let err = verify_token(&crypto, "not-a-token", &["shared-secret".to_string()], 0.0)
            .unwrap_err();
        assert_eq!(err, TokenError::MalformedPayload);
    }
}
