use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClientType {
    /// Holds a client secret (server-side application).
    Confidential,
    /// Cannot keep a secret (SPA, mobile, CLI).
    Public,
}

impl ClientType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientType::Confidential => "confidential",
            ClientType::Public => "public",
        }
    }
}

impl fmt::Display for ClientType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ClientType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "confidential" => Ok(ClientType::Confidential),
            "public" => Ok(ClientType::Public),
            _ => Err(format!("Invalid client type: {}", s)),
        }
    }
}

/// Third-party application allowed to request authorization codes.
#[derive(Debug, Clone)]
pub struct ClientApplication {
    pub client_id: String,
    /// Credential-hasher digest of the client secret (confidential only).
    pub client_secret_hash: Option<String>,
    pub client_type: ClientType,
    pub display_name: String,
    pub redirect_uris: Vec<String>,
    pub allowed_scopes: Vec<String>,
    pub enabled: bool,
    pub created_utc: DateTime<Utc>,
}

impl ClientApplication {
    pub fn confidential(
        client_id: &str,
        client_secret_hash: String,
        display_name: &str,
        redirect_uris: Vec<String>,
        allowed_scopes: Vec<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            client_id: client_id.to_string(),
            client_secret_hash: Some(client_secret_hash),
            client_type: ClientType::Confidential,
            display_name: display_name.to_string(),
            redirect_uris,
            allowed_scopes,
            enabled: true,
            created_utc: now,
        }
    }

    pub fn public(
        client_id: &str,
        display_name: &str,
        redirect_uris: Vec<String>,
        allowed_scopes: Vec<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            client_id: client_id.to_string(),
            client_secret_hash: None,
            client_type: ClientType::Public,
            display_name: display_name.to_string(),
            redirect_uris,
            allowed_scopes,
            enabled: true,
            created_utc: now,
        }
    }

    pub fn is_confidential(&self) -> bool {
        self.client_type == ClientType::Confidential
    }

    /// Exact string comparison; no prefix, path, or query matching.
    pub fn has_redirect_uri(&self, redirect_uri: &str) -> bool {
        self.redirect_uris.iter().any(|uri| uri == redirect_uri)
    }

    pub fn allows_scopes(&self, scopes: &[String]) -> bool {
        scopes.iter().all(|s| self.allowed_scopes.contains(s))
    }
}
