//! Deterministic keyed hashing of bearer secrets, and credential hashing.
//!
//! Refresh tokens, authorization codes and device metadata are looked up by
//! `HMAC-SHA256(server secret, domain || value)`. Each kind of value gets its
//! own domain tag so a digest of one kind never matches another.
//!
//! Passwords, API-key secrets and client secrets go through a slow salted
//! [`CredentialHasher`] instead.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use hmac::{Hmac, Mac};
use rand::Rng;
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

const REFRESH_TOKEN_DOMAIN: &[u8] = b"refresh_token";
const AUTH_CODE_DOMAIN: &[u8] = b"authorization_code";
const USER_AGENT_DOMAIN: &[u8] = b"user_agent";
const IP_DOMAIN: &[u8] = b"ip_address";
const DEVICE_DOMAIN: &[u8] = b"device";

/// Keyed hasher over the server-held secret. Immutable after construction.
#[derive(Clone)]
pub struct TokenHasher {
    mac: HmacSha256,
}

impl TokenHasher {
    pub fn new(secret: &SecretString) -> Result<Self, anyhow::Error> {
        let mac = HmacSha256::new_from_slice(secret.expose_secret().as_bytes())
            .map_err(|e| anyhow::anyhow!("Invalid key length: {}", e))?;
        Ok(Self { mac })
    }

    fn digest(&self, domain: &[u8], value: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(domain);
        mac.update(&[0]);
        mac.update(value.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    pub fn hash_refresh_token(&self, raw: &str) -> String {
        self.digest(REFRESH_TOKEN_DOMAIN, raw)
    }

    pub fn hash_authorization_code(&self, raw: &str) -> String {
        self.digest(AUTH_CODE_DOMAIN, raw)
    }

    pub fn hash_user_agent(&self, user_agent: &str) -> String {
        self.digest(USER_AGENT_DOMAIN, user_agent)
    }

    pub fn hash_ip(&self, ip_address: &str) -> String {
        self.digest(IP_DOMAIN, ip_address)
    }

    pub fn hash_device(&self, fingerprint: &str) -> String {
        self.digest(DEVICE_DOMAIN, fingerprint)
    }
}

/// 256 bits from the thread RNG, hex encoded.
pub fn generate_random_token() -> String {
    let mut rng = rand::thread_rng();
    let token_bytes: [u8; 32] = rng.gen();
    hex::encode(token_bytes)
}

/// Constant-time string comparison.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Salted, slow hashing of long-lived credentials.
pub trait CredentialHasher: Send + Sync {
    fn hash(&self, secret: &str) -> Result<String, anyhow::Error>;
    /// Never errors: a malformed digest simply does not verify.
    fn verify(&self, secret: &str, digest: &str) -> bool;
}

/// Argon2id with the crate's default parameters.
#[derive(Debug, Default, Clone, Copy)]
pub struct Argon2Hasher;

impl CredentialHasher for Argon2Hasher {
    fn hash(&self, secret: &str) -> Result<String, anyhow::Error> {
        let salt = SaltString::generate(&mut OsRng);
        let digest = Argon2::default()
            .hash_password(secret.as_bytes(), &salt)
            .map_err(|e| anyhow::anyhow!("Failed to hash credential: {}", e))?
            .to_string();
        Ok(digest)
    }

    fn verify(&self, secret: &str, digest: &str) -> bool {
        let Ok(parsed) = PasswordHash::new(digest) else {
            tracing::error!("Stored credential digest is malformed");
            return false;
        };
        Argon2::default()
            .verify_password(secret.as_bytes(), &parsed)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hasher() -> TokenHasher {
        TokenHasher::new(&SecretString::new("k".repeat(32))).unwrap()
    }

    #[test]
    fn test_digest_is_deterministic_and_keyed() {
        let a = hasher();
        assert_eq!(a.hash_refresh_token("tok"), a.hash_refresh_token("tok"));

        let other = TokenHasher::new(&SecretString::new("x".repeat(32))).unwrap();
        assert_ne!(a.hash_refresh_token("tok"), other.hash_refresh_token("tok"));
    }

    #[test]
    fn test_domains_are_separated() {
        let h = hasher();
        assert_ne!(h.hash_refresh_token("v"), h.hash_authorization_code("v"));
        assert_ne!(h.hash_user_agent("v"), h.hash_ip("v"));
    }

    #[test]
    fn test_random_tokens_are_unique() {
        let a = generate_random_token();
        assert_eq!(a.len(), 64);
        assert_ne!(a, generate_random_token());
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "abcd"));
    }

    #[test]
    fn test_argon2_round_trip() {
        let hasher = Argon2Hasher;
        let digest = hasher.hash("correct horse").unwrap();
        assert!(digest.starts_with("$argon2"));
        assert!(hasher.verify("correct horse", &digest));
        assert!(!hasher.verify("wrong horse", &digest));
        assert!(!hasher.verify("correct horse", "not-a-digest"));
    }
}
