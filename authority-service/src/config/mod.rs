use secrecy::{ExposeSecret, SecretString};
use service_core::config::{self as core_config, get_env, get_env_parsed, get_optional_env, Environment};
use service_core::error::AppError;
use service_core::rate_limit::ScopedRateLimiter;

use crate::services::oauth::OAuthSettings;
use crate::services::sessions::SessionSettings;
use crate::services::tokens::TokenSettings;

/// Rate-gate scope names.
pub const LOGIN_SCOPE: &str = "login";
pub const REFRESH_SCOPE: &str = "refresh";
pub const TOKEN_EXCHANGE_SCOPE: &str = "token_exchange";

#[derive(Debug, Clone)]
pub struct AuthorityConfig {
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub log_level: String,
    pub database: DatabaseConfig,
    pub tokens: TokenConfig,
    pub sessions: SessionConfig,
    pub oauth: OAuthConfig,
    pub rate_limit: RateLimitConfig,
    pub bootstrap: BootstrapConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: SecretString,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningAlgorithm {
    Hs256,
    Rs256,
}

impl std::str::FromStr for SigningAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "HS256" => Ok(SigningAlgorithm::Hs256),
            "RS256" => Ok(SigningAlgorithm::Rs256),
            _ => Err(format!("Unsupported signing algorithm: {}", s)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub algorithm: SigningAlgorithm,
    /// HS256 shared secret.
    pub signing_secret: Option<SecretString>,
    /// RS256 PEM key files.
    pub private_key_path: Option<String>,
    pub public_key_path: Option<String>,
    pub issuer: String,
    pub audience: String,
    pub access_token_ttl_minutes: i64,
    pub refresh_token_ttl_days: i64,
    /// HMAC key for refresh tokens, codes and device metadata.
    pub hash_secret: SecretString,
    pub enforce_ip_binding: bool,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub idle_timeout_minutes: i64,
    pub max_lifetime_hours: i64,
}

#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub code_ttl_minutes: i64,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub login_attempts: u32,
    pub login_window_seconds: u64,
    pub refresh_attempts: u32,
    pub refresh_window_seconds: u64,
    pub exchange_attempts: u32,
    pub exchange_window_seconds: u64,
}

impl RateLimitConfig {
    /// Build the in-process gate for the login, refresh and exchange scopes.
    pub fn build_gate(&self) -> ScopedRateLimiter {
        ScopedRateLimiter::new()
            .with_scope(LOGIN_SCOPE, self.login_attempts, self.login_window_seconds)
            .with_scope(REFRESH_SCOPE, self.refresh_attempts, self.refresh_window_seconds)
            .with_scope(
                TOKEN_EXCHANGE_SCOPE,
                self.exchange_attempts,
                self.exchange_window_seconds,
            )
    }
}

#[derive(Debug, Clone, Default)]
pub struct BootstrapConfig {
    pub superadmin_email: Option<String>,
    pub superadmin_password: Option<SecretString>,
}

impl AuthorityConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;
        let environment = Environment::from_env()?;
        let is_prod = environment.is_prod();

        let config = AuthorityConfig {
            environment: environment.clone(),
            service_name: get_env("SERVICE_NAME", Some(&common_config.service_name), is_prod)?,
            log_level: get_env("LOG_LEVEL", Some(&common_config.log_level), is_prod)?,
            common: common_config,
            database: DatabaseConfig {
                url: SecretString::new(get_env("DATABASE_URL", None, is_prod)?),
                max_connections: get_env_parsed("DATABASE_MAX_CONNECTIONS", Some("10"), is_prod)?,
                min_connections: get_env_parsed("DATABASE_MIN_CONNECTIONS", Some("1"), is_prod)?,
            },
            tokens: TokenConfig {
                algorithm: get_env("TOKEN_SIGNING_ALGORITHM", Some("HS256"), is_prod)?
                    .parse()
                    .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?,
                signing_secret: get_optional_env("TOKEN_SIGNING_SECRET").map(SecretString::new),
                private_key_path: get_optional_env("TOKEN_PRIVATE_KEY_PATH"),
                public_key_path: get_optional_env("TOKEN_PUBLIC_KEY_PATH"),
                issuer: get_env("TOKEN_ISSUER", Some("authority-service"), is_prod)?,
                audience: get_env("TOKEN_AUDIENCE", Some("authority-clients"), is_prod)?,
                access_token_ttl_minutes: get_env_parsed(
                    "ACCESS_TOKEN_TTL_MINUTES",
                    Some("15"),
                    is_prod,
                )?,
                refresh_token_ttl_days: get_env_parsed("REFRESH_TOKEN_TTL_DAYS", Some("30"), is_prod)?,
                hash_secret: SecretString::new(get_env("TOKEN_HASH_SECRET", None, is_prod)?),
                enforce_ip_binding: get_env_parsed("ENFORCE_IP_BINDING", Some("true"), is_prod)?,
            },
            sessions: SessionConfig {
                idle_timeout_minutes: get_env_parsed(
                    "SESSION_IDLE_TIMEOUT_MINUTES",
                    Some("1440"),
                    is_prod,
                )?,
                max_lifetime_hours: get_env_parsed(
                    "SESSION_MAX_LIFETIME_HOURS",
                    Some("720"),
                    is_prod,
                )?,
            },
            oauth: OAuthConfig {
                code_ttl_minutes: get_env_parsed("AUTH_CODE_TTL_MINUTES", Some("5"), is_prod)?,
            },
            rate_limit: RateLimitConfig {
                login_attempts: get_env_parsed("RATE_LIMIT_LOGIN_ATTEMPTS", Some("5"), is_prod)?,
                login_window_seconds: get_env_parsed(
                    "RATE_LIMIT_LOGIN_WINDOW_SECONDS",
                    Some("900"),
                    is_prod,
                )?,
                refresh_attempts: get_env_parsed(
                    "RATE_LIMIT_REFRESH_ATTEMPTS",
                    Some("30"),
                    is_prod,
                )?,
                refresh_window_seconds: get_env_parsed(
                    "RATE_LIMIT_REFRESH_WINDOW_SECONDS",
                    Some("60"),
                    is_prod,
                )?,
                exchange_attempts: get_env_parsed(
                    "RATE_LIMIT_EXCHANGE_ATTEMPTS",
                    Some("10"),
                    is_prod,
                )?,
                exchange_window_seconds: get_env_parsed(
                    "RATE_LIMIT_EXCHANGE_WINDOW_SECONDS",
                    Some("60"),
                    is_prod,
                )?,
            },
            bootstrap: BootstrapConfig {
                superadmin_email: get_optional_env("BOOTSTRAP_SUPERADMIN_EMAIL"),
                superadmin_password: get_optional_env("BOOTSTRAP_SUPERADMIN_PASSWORD")
                    .map(SecretString::new),
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        fn invalid(msg: &str) -> Result<(), AppError> {
            Err(AppError::ConfigError(anyhow::anyhow!(msg.to_string())))
        }

        if self.tokens.access_token_ttl_minutes <= 0 {
            return invalid("ACCESS_TOKEN_TTL_MINUTES must be positive");
        }
        if self.tokens.refresh_token_ttl_days <= 0 {
            return invalid("REFRESH_TOKEN_TTL_DAYS must be positive");
        }
        if self.sessions.idle_timeout_minutes <= 0 || self.sessions.max_lifetime_hours <= 0 {
            return invalid("Session timeouts must be positive");
        }
        if self.sessions.idle_timeout_minutes > self.sessions.max_lifetime_hours * 60 {
            return invalid("SESSION_IDLE_TIMEOUT_MINUTES exceeds SESSION_MAX_LIFETIME_HOURS");
        }
        if !(1..=10).contains(&self.oauth.code_ttl_minutes) {
            return invalid("AUTH_CODE_TTL_MINUTES must be between 1 and 10");
        }
        if self.database.min_connections > self.database.max_connections {
            return invalid("DATABASE_MIN_CONNECTIONS exceeds DATABASE_MAX_CONNECTIONS");
        }

        match self.tokens.algorithm {
            SigningAlgorithm::Hs256 => match &self.tokens.signing_secret {
                None => return invalid("TOKEN_SIGNING_SECRET is required for HS256"),
                Some(secret) if secret.expose_secret().len() < 32 => {
                    return invalid("TOKEN_SIGNING_SECRET must be at least 32 bytes");
                }
                Some(_) => {}
            },
            SigningAlgorithm::Rs256 => {
                if self.tokens.private_key_path.is_none() || self.tokens.public_key_path.is_none() {
                    return invalid(
                        "TOKEN_PRIVATE_KEY_PATH and TOKEN_PUBLIC_KEY_PATH are required for RS256",
                    );
                }
            }
        }

        if self.tokens.hash_secret.expose_secret().len() < 32 {
            return invalid("TOKEN_HASH_SECRET must be at least 32 bytes");
        }

        if self.environment.is_prod() && !self.tokens.enforce_ip_binding {
            tracing::warn!("IP binding of refresh tokens is disabled in production");
        }

        if self.bootstrap.superadmin_email.is_some() != self.bootstrap.superadmin_password.is_some() {
            return invalid(
                "BOOTSTRAP_SUPERADMIN_EMAIL and BOOTSTRAP_SUPERADMIN_PASSWORD must be set together",
            );
        }

        Ok(())
    }

    pub fn token_settings(&self) -> TokenSettings {
        TokenSettings {
            issuer: self.tokens.issuer.clone(),
            audience: self.tokens.audience.clone(),
            access_token_ttl: chrono::Duration::minutes(self.tokens.access_token_ttl_minutes),
            refresh_token_ttl: chrono::Duration::days(self.tokens.refresh_token_ttl_days),
            enforce_ip_binding: self.tokens.enforce_ip_binding,
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            idle_timeout: chrono::Duration::minutes(self.sessions.idle_timeout_minutes),
            max_lifetime: chrono::Duration::hours(self.sessions.max_lifetime_hours),
        }
    }

    pub fn oauth_settings(&self) -> OAuthSettings {
        OAuthSettings {
            code_ttl: chrono::Duration::minutes(self.oauth.code_ttl_minutes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AuthorityConfig {
        AuthorityConfig {
            common: core_config::Config {
                service_name: "authority-service".to_string(),
                log_level: "info".to_string(),
            },
            environment: Environment::Dev,
            service_name: "authority-service".to_string(),
            log_level: "info".to_string(),
            database: DatabaseConfig {
                url: SecretString::new("postgres://localhost/authority".to_string()),
                max_connections: 10,
                min_connections: 1,
            },
            tokens: TokenConfig {
                algorithm: SigningAlgorithm::Hs256,
                signing_secret: Some(SecretString::new("s".repeat(32))),
                private_key_path: None,
                public_key_path: None,
                issuer: "authority-service".to_string(),
                audience: "authority-clients".to_string(),
                access_token_ttl_minutes: 15,
                refresh_token_ttl_days: 30,
                hash_secret: SecretString::new("h".repeat(32)),
                enforce_ip_binding: true,
            },
            sessions: SessionConfig {
                idle_timeout_minutes: 60,
                max_lifetime_hours: 24,
            },
            oauth: OAuthConfig {
                code_ttl_minutes: 5,
            },
            rate_limit: RateLimitConfig {
                login_attempts: 5,
                login_window_seconds: 900,
                refresh_attempts: 30,
                refresh_window_seconds: 60,
                exchange_attempts: 10,
                exchange_window_seconds: 60,
            },
            bootstrap: BootstrapConfig::default(),
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn test_hs256_requires_long_secret() {
        let mut cfg = config();
        cfg.tokens.signing_secret = Some(SecretString::new("short".to_string()));
        assert!(cfg.validate().is_err());

        cfg.tokens.signing_secret = None;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rs256_requires_key_paths() {
        let mut cfg = config();
        cfg.tokens.algorithm = SigningAlgorithm::Rs256;
        assert!(cfg.validate().is_err());

        cfg.tokens.private_key_path = Some("private.pem".to_string());
        cfg.tokens.public_key_path = Some("public.pem".to_string());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_code_ttl_is_minutes_scale() {
        let mut cfg = config();
        cfg.oauth.code_ttl_minutes = 60;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_settings_conversion() {
        let cfg = config();
        assert_eq!(
            cfg.token_settings().access_token_ttl,
            chrono::Duration::minutes(15)
        );
        assert_eq!(
            cfg.session_settings().max_lifetime,
            chrono::Duration::hours(24)
        );
    }

    #[test]
    fn test_algorithm_parse() {
        assert_eq!("hs256".parse(), Ok(SigningAlgorithm::Hs256));
        assert_eq!("RS256".parse(), Ok(SigningAlgorithm::Rs256));
        assert!("none".parse::<SigningAlgorithm>().is_err());
    }
}
