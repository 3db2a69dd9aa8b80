use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// Authorization request, after the principal has authenticated and consented.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AuthorizeRequest {
    #[validate(length(min = 1, max = 128, message = "client_id is required"))]
    pub client_id: String,
    pub org_id: Uuid,
    #[validate(length(min = 1, max = 2048, message = "redirect_uri is required"))]
    pub redirect_uri: String,
    /// Space-delimited permission names.
    #[serde(default)]
    pub scope: String,
    #[validate(length(min = 43, max = 128, message = "code_challenge is malformed"))]
    pub code_challenge: String,
    pub code_challenge_method: String,
}

impl AuthorizeRequest {
    /// Requested scopes, deduplicated, in request order.
    pub fn scopes(&self) -> Vec<String> {
        let mut scopes: Vec<String> = Vec::new();
        for s in self.scope.split_whitespace() {
            if !scopes.iter().any(|existing| existing == s) {
                scopes.push(s.to_string());
            }
        }
        scopes
    }
}

#[derive(Serialize)]
pub struct AuthorizationGrant {
    /// Raw code, returned exactly once.
    pub code: String,
    pub redirect_uri: String,
    pub expires_in: i64,
}

impl std::fmt::Debug for AuthorizationGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationGrant")
            .field("code", &"[REDACTED]")
            .field("redirect_uri", &self.redirect_uri)
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeRequest {
    pub code: SecretString,
    pub redirect_uri: String,
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<SecretString>,
    pub code_verifier: SecretString,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scopes_are_split_and_deduplicated() {
        let req = AuthorizeRequest {
            client_id: "app".to_string(),
            org_id: Uuid::new_v4(),
            redirect_uri: "https://app.example.com/cb".to_string(),
            scope: "doc:read  doc:write doc:read".to_string(),
            code_challenge: "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM".to_string(),
            code_challenge_method: "S256".to_string(),
        };
        assert_eq!(req.scopes(), vec!["doc:read", "doc:write"]);
        assert!(req.validate().is_ok());
    }
}
