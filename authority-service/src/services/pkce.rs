//! PKCE (RFC 7636), `S256` only.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::models::PkceChallengeMethod;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PkceError {
    #[error("code_verifier must be 43-128 unreserved characters")]
    InvalidVerifier,
    #[error("code_challenge is not a base64url SHA-256 digest")]
    InvalidChallenge,
    #[error("code_verifier does not match code_challenge")]
    Mismatch,
}

fn is_unreserved(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~')
}

pub fn validate_verifier(verifier: &str) -> Result<(), PkceError> {
    if !(43..=128).contains(&verifier.len()) || !verifier.chars().all(is_unreserved) {
        return Err(PkceError::InvalidVerifier);
    }
    Ok(())
}

/// A S256 challenge is the unpadded base64url encoding of 32 bytes.
pub fn validate_challenge(challenge: &str) -> Result<(), PkceError> {
    match URL_SAFE_NO_PAD.decode(challenge) {
        Ok(bytes) if bytes.len() == 32 => Ok(()),
        _ => Err(PkceError::InvalidChallenge),
    }
}

/// `BASE64URL(SHA256(verifier))`.
pub fn s256_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Verify `verifier` against the stored challenge in constant time.
pub fn verify(
    verifier: &str,
    challenge: &str,
    method: PkceChallengeMethod,
) -> Result<(), PkceError> {
    validate_verifier(verifier)?;
    let computed = match method {
        PkceChallengeMethod::S256 => s256_challenge(verifier),
    };
    let (a, b) = (computed.as_bytes(), challenge.as_bytes());
    if a.len() != b.len() || !bool::from(a.ct_eq(b)) {
        return Err(PkceError::Mismatch);
    }
    Ok(())
}
