//! Access-token key material and claims.
//!
//! [`SigningKeys`] is built once at startup and shared by `Arc`. Verification
//! is a pure function of the token and the key; it never touches storage.

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use std::fs;
use uuid::Uuid;

use crate::config::{SigningAlgorithm, TokenConfig};

/// Claims carried by an access token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    /// Principal id
    pub sub: Uuid,
    pub org_id: Uuid,
    /// Role held in `org_id`; absent for superadmins without a membership.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_id: Option<Uuid>,
    /// Resolved permission names, sorted.
    pub permissions: Vec<String>,
    pub is_superadmin: bool,
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
    /// Login session; absent for OAuth-issued tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Space-delimited OAuth scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl AccessTokenClaims {
    pub fn has_permission(&self, name: &str) -> bool {
        self.permissions.iter().any(|p| p == name)
    }
}

/// Signing and verification keys for access tokens.
pub struct SigningKeys {
    algorithm: Algorithm,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl SigningKeys {
    /// Symmetric keys from a shared secret.
    pub fn hs256(secret: &[u8]) -> Self {
        Self {
            algorithm: Algorithm::HS256,
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
        }
    }

    /// Asymmetric keys from PEM files.
    pub fn rs256_from_files(
        private_key_path: &str,
        public_key_path: &str,
    ) -> Result<Self, anyhow::Error> {
        let private_key_pem = fs::read_to_string(private_key_path).map_err(|e| {
            anyhow::anyhow!(
                "Failed to read private key from {}: {}",
                private_key_path,
                e
            )
        })?;
        let encoding_key = EncodingKey::from_rsa_pem(private_key_pem.as_bytes())
            .map_err(|e| anyhow::anyhow!("Failed to parse private key: {}", e))?;

        let public_key_pem = fs::read_to_string(public_key_path).map_err(|e| {
            anyhow::anyhow!("Failed to read public key from {}: {}", public_key_path, e)
        })?;
        let decoding_key = DecodingKey::from_rsa_pem(public_key_pem.as_bytes())
            .map_err(|e| anyhow::anyhow!("Failed to parse public key: {}", e))?;

        Ok(Self {
            algorithm: Algorithm::RS256,
            encoding_key,
            decoding_key,
        })
    }

    pub fn from_config(config: &TokenConfig) -> Result<Self, anyhow::Error> {
        let keys = match config.algorithm {
            SigningAlgorithm::Hs256 => {
                let secret = config
                    .signing_secret
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("TOKEN_SIGNING_SECRET is not set"))?;
                Self::hs256(secret.expose_secret().as_bytes())
            }
            SigningAlgorithm::Rs256 => {
                let (Some(private), Some(public)) =
                    (&config.private_key_path, &config.public_key_path)
                else {
                    return Err(anyhow::anyhow!("RS256 key paths are not set"));
                };
                Self::rs256_from_files(private, public)?
            }
        };
        tracing::info!(algorithm = ?keys.algorithm, "Access token keys loaded");
        Ok(keys)
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn sign(&self, claims: &AccessTokenClaims) -> Result<String, anyhow::Error> {
        encode(&Header::new(self.algorithm), claims, &self.encoding_key)
            .map_err(|e| anyhow::anyhow!("Failed to encode access token: {}", e))
    }

    /// Check signature, expiry, issuer and audience.
    pub fn verify(
        &self,
        token: &str,
        issuer: &str,
        audience: &str,
    ) -> Result<AccessTokenClaims, jsonwebtoken::errors::Error> {
        let mut validation = Validation::new(self.algorithm);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_issuer(&[issuer]);
        validation.set_audience(&[audience]);

        decode::<AccessTokenClaims>(token, &self.decoding_key, &validation).map(|data| data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn claims(exp_offset: Duration) -> AccessTokenClaims {
        let now = Utc::now();
        AccessTokenClaims {
            sub: Uuid::new_v4(),
            org_id: Uuid::new_v4(),
            role_id: Some(Uuid::new_v4()),
            permissions: vec!["doc:read".to_string()],
            is_superadmin: false,
            iss: "authority".to_string(),
            aud: "clients".to_string(),
            iat: now.timestamp(),
            exp: (now + exp_offset).timestamp(),
            jti: Uuid::new_v4().to_string(),
            sid: None,
            client_id: None,
            scope: None,
        }
    }

    #[test]
    fn test_hs256_sign_and_verify() {
        let keys = SigningKeys::hs256(b"0123456789abcdef0123456789abcdef");
        let original = claims(Duration::minutes(15));
        let token = keys.sign(&original).unwrap();

        let verified = keys.verify(&token, "authority", "clients").unwrap();
        assert_eq!(verified, original);
        assert!(verified.has_permission("doc:read"));
        assert!(!verified.has_permission("doc:write"));
    }

    #[test]
    fn test_wrong_audience_or_key_is_rejected() {
        let keys = SigningKeys::hs256(b"0123456789abcdef0123456789abcdef");
        let token = keys.sign(&claims(Duration::minutes(15))).unwrap();

        assert!(keys.verify(&token, "authority", "someone-else").is_err());
        assert!(keys.verify(&token, "impostor", "clients").is_err());

        let other = SigningKeys::hs256(b"fedcba9876543210fedcba9876543210");
        assert!(other.verify(&token, "authority", "clients").is_err());
    }

    #[test]
    fn test_rs256_from_pem_files() {
        use std::io::Write;
        use tempfile::NamedTempFile;

        let mut private_file = NamedTempFile::new().unwrap();
        private_file
            .write_all(include_str!("../../tests/fixtures/rs256_private.pem").as_bytes())
            .unwrap();
        let mut public_file = NamedTempFile::new().unwrap();
        public_file
            .write_all(include_str!("../../tests/fixtures/rs256_public.pem").as_bytes())
            .unwrap();

        let keys = SigningKeys::rs256_from_files(
            private_file.path().to_str().unwrap(),
            public_file.path().to_str().unwrap(),
        )
        .unwrap();
        assert_eq!(keys.algorithm(), Algorithm::RS256);

        let original = claims(Duration::minutes(5));
        let token = keys.sign(&original).unwrap();
        assert_eq!(keys.verify(&token, "authority", "clients").unwrap(), original);
    }

    #[test]
    fn test_missing_key_file_is_an_error() {
        assert!(SigningKeys::rs256_from_files("/nonexistent/private.pem", "/nonexistent/public.pem").is_err());
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let keys = SigningKeys::hs256(b"0123456789abcdef0123456789abcdef");
        let token = keys.sign(&claims(Duration::minutes(-1))).unwrap();
        let err = keys.verify(&token, "authority", "clients").unwrap_err();
        assert_eq!(
            err.kind(),
            &jsonwebtoken::errors::ErrorKind::ExpiredSignature
        );
    }
}
