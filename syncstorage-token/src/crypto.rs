use hkdf::Hkdf;
use hmac::{Hmac, Mac, NewMac};
use ring::rand::{SecureRandom, SystemRandom};
use sha2::Sha256;

use crate::TokenError;

pub const SHA256_OUTPUT_LEN: usize = 32;

/// Abstracts the primitive operations the token verifier needs, the way
/// `tokenserver-auth::crypto::Crypto` does, so tests can swap in a fake
/// without touching call sites.
pub trait Crypto: Send + Sync {
    fn hkdf(&self, info: &[u8], salt: &[u8], key: &[u8]) -> Result<[u8; SHA256_OUTPUT_LEN], TokenError>;
    fn hmac_sign(&self, key: &[u8], message: &[u8]) -> Result<Vec<u8>, TokenError>;
    fn hmac_verify(&self, key: &[u8], message: &[u8], signature: &[u8]) -> Result<(), TokenError>;
    fn rand_bytes(&self, len: usize) -> Result<Vec<u8>, TokenError>;
}

#[derive(Default)]
pub struct CryptoImpl;

impl Crypto for CryptoImpl {
    fn hkdf(&self, info: &[u8], salt: &[u8], key: &[u8]) -> Result<[u8; SHA256_OUTPUT_LEN], TokenError> {
        let mut result = [0u8; SHA256_OUTPUT_LEN];
        let salt = if salt.is_empty() { None } else { Some(salt) };
        let hkdf = Hkdf::<Sha256>::new(salt, key);
        hkdf.expand(info, &mut result)
            .map_err(|_| TokenError::MalformedPayload)?;
        Ok(result)
    }

    fn hmac_sign(&self, key: &[u8], message: &[u8]) -> Result<Vec<u8>, TokenError> {
        let mut mac =
            Hmac::<Sha256>::new_from_slice(key).map_err(|_| TokenError::MalformedPayload)?;
        mac.update(message);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    fn hmac_verify(&self, key: &[u8], message: &[u8], signature: &[u8]) -> Result<(), TokenError> {
        let mut mac =
            Hmac::<Sha256>::new_from_slice(key).map_err(|_| TokenError::MalformedPayload)?;
        mac.update(message);
        mac.verify(signature).map_err(|_| TokenError::InvalidSignature)
    }

    fn rand_bytes(&self, len: usize) -> Result<Vec<u8>, TokenError> {
        let mut bytes = vec![0u8; len];
        SystemRandom::new()
            .fill(&mut bytes)
            .map_err(|_| TokenError::MalformedPayload)?;
        Ok(bytes)
    }
}

#[cfg(test)]
pub struct MockCrypto;

#[cfg(test)]
impl Crypto for MockCrypto {
    fn hkdf(&self, info: &[u8], salt: &[u8], key: &[u8]) -> Result<[u8; SHA256_OUTPUT_LEN], TokenError> {
        CryptoImpl.hkdf(info, salt, key)
    }

    fn hmac_sign(&self, key: &[u8], message: &[u8]) -> Result<Vec<u8>, TokenError> {
        CryptoImpl.hmac_sign(key, message)
    }

    fn hmac_verify(&self, key: &[u8], message: &[u8], signature: &[u8]) -> Result<(), TokenError> {
        CryptoImpl.hmac_verify(key, message, signature)
    }

    fn rand_bytes(&self, _len: usize) -> Result<Vec<u8>, TokenError> {
        // Deterministic salt keeps token fixtures reproducible in tests.
        Ok(vec![0xAB, 0xCD, 0xEF])
    }
}
