mod common;

use authority_service::{
    dtos::admin::{CreatePermissionRequest, CreateRoleRequest},
    dtos::auth::{RefreshRequest, TokenPair},
    dtos::oauth::{AuthorizationGrant, AuthorizeRequest, ExchangeRequest},
    error::{ProtocolFailure, TokenFailure},
    models::{AuditEventType, ClientType, MembershipState, Organization, Principal, PrincipalState},
    services::pkce,
    AuthorityError,
};
use chrono::Duration;
use common::{ctx, TestAuthority};
use futures::future::join_all;
use secrecy::SecretString;

const CLIENT_ID: &str = "docs-web";
const REDIRECT_URI: &str = "https://docs.example.com/callback";
// Appendix B of RFC 7636
const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
const CHALLENGE: &str = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";

fn secret(raw: &str) -> SecretString {
    SecretString::new(raw.to_string())
}

fn protocol_failure(err: &AuthorityError) -> Option<ProtocolFailure> {
    match err {
        AuthorityError::Protocol(f) => Some(*f),
        _ => None,
    }
}

/// Org with `doc:read`/`doc:write`, and a principal holding both plus `org:read`.
async fn setup(t: &TestAuthority) -> (Organization, Principal) {
    let org = t.org("acme").await;
    for name in ["doc:read", "doc:write"] {
        t.authority
            .permissions()
            .create_permission(
                org.org_id,
                CreatePermissionRequest {
                    name: name.to_string(),
                    category: "documents".to_string(),
                },
            )
            .await
            .unwrap();
    }
    let editor = t
        .authority
        .permissions()
        .create_role(
            org.org_id,
            CreateRoleRequest {
                name: "editor".to_string(),
                display_name: "Editor".to_string(),
                permissions: vec![
                    "doc:read".to_string(),
                    "doc:write".to_string(),
                    "org:read".to_string(),
                ],
            },
        )
        .await
        .unwrap();
    let alice = t.principal("alice@example.com").await;
    t.member(org.org_id, alice.principal_id, editor.role_id).await;
    (org, alice)
}

fn authorize_req(org: &Organization, scope: &str) -> AuthorizeRequest {
    AuthorizeRequest {
        client_id: CLIENT_ID.to_string(),
        org_id: org.org_id,
        redirect_uri: REDIRECT_URI.to_string(),
        scope: scope.to_string(),
        code_challenge: CHALLENGE.to_string(),
        code_challenge_method: "S256".to_string(),
    }
}

fn exchange_req(grant: &AuthorizationGrant) -> ExchangeRequest {
    ExchangeRequest {
        code: secret(&grant.code),
        redirect_uri: REDIRECT_URI.to_string(),
        client_id: CLIENT_ID.to_string(),
        client_secret: None,
        code_verifier: secret(VERIFIER),
    }
}

async fn public_client(t: &TestAuthority) {
    t.client(CLIENT_ID, ClientType::Public, REDIRECT_URI, &["doc:read", "doc:write"])
        .await;
}

#[tokio::test]
async fn test_pkce_code_flow_issues_scoped_tokens() {
    let t = TestAuthority::new().await;
    let (org, alice) = setup(&t).await;
    public_client(&t).await;

    let grant = t
        .authority
        .authorize(alice.principal_id, authorize_req(&org, "doc:read"))
        .await
        .unwrap();
    assert_eq!(grant.redirect_uri, REDIRECT_URI);
    assert_eq!(grant.expires_in, 300);

    let pair = t
        .authority
        .exchange_code(exchange_req(&grant), &ctx())
        .await
        .unwrap();
    assert_eq!(pair.session_id, None);
    assert_eq!(pair.scope.as_deref(), Some("doc:read"));

    let claims = t.authority.verify_access_token(&pair.access_token).unwrap();
    assert_eq!(claims.sub, alice.principal_id);
    assert_eq!(claims.org_id, org.org_id);
    assert_eq!(claims.permissions, vec!["doc:read"]);
    assert_eq!(claims.client_id.as_deref(), Some(CLIENT_ID));
    assert_eq!(claims.scope.as_deref(), Some("doc:read"));
    assert_eq!(claims.sid, None);
    assert_eq!(t.audit.count(AuditEventType::CodeExchanged), 1);

    // Refreshing keeps the granted scope.
    let rotated = t
        .authority
        .refresh(
            RefreshRequest {
                refresh_token: secret(&pair.refresh_token),
            },
            &ctx(),
        )
        .await
        .unwrap();
    let claims = t.authority.verify_access_token(&rotated.access_token).unwrap();
    assert_eq!(claims.permissions, vec!["doc:read"]);
    assert_eq!(rotated.scope.as_deref(), Some("doc:read"));
}

#[tokio::test]
async fn test_code_reuse_revokes_issued_family() {
    let t = TestAuthority::new().await;
    let (org, alice) = setup(&t).await;
    public_client(&t).await;

    let grant = t
        .authority
        .authorize(alice.principal_id, authorize_req(&org, "doc:read doc:write"))
        .await
        .unwrap();
    let pair = t
        .authority
        .exchange_code(exchange_req(&grant), &ctx())
        .await
        .unwrap();

    let err = t
        .authority
        .exchange_code(exchange_req(&grant), &ctx())
        .await
        .unwrap_err();
    assert_eq!(protocol_failure(&err), Some(ProtocolFailure::CodeReused));
    assert_eq!(t.audit.count(AuditEventType::CodeReused), 1);

    let err = t
        .authority
        .refresh(
            RefreshRequest {
                refresh_token: secret(&pair.refresh_token),
            },
            &ctx(),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AuthorityError::Token(TokenFailure::InvalidRefreshToken)
    ));
}

#[tokio::test]
async fn test_wrong_verifier_burns_code() {
    let t = TestAuthority::new().await;
    let (org, alice) = setup(&t).await;
    public_client(&t).await;
    let grant = t
        .authority
        .authorize(alice.principal_id, authorize_req(&org, "doc:read"))
        .await
        .unwrap();

    let mut req = exchange_req(&grant);
    req.code_verifier = secret(&"a".repeat(43));
    let err = t.authority.exchange_code(req, &ctx()).await.unwrap_err();
    assert_eq!(protocol_failure(&err), Some(ProtocolFailure::PkceMismatch));
    assert_eq!(t.audit.count(AuditEventType::CodeDenied), 1);

    // The right verifier is too late now.
    let err = t
        .authority
        .exchange_code(exchange_req(&grant), &ctx())
        .await
        .unwrap_err();
    assert_eq!(protocol_failure(&err), Some(ProtocolFailure::InvalidCode));
}

#[tokio::test]
async fn test_redirect_uri_must_match_exactly() {
    let t = TestAuthority::new().await;
    let (org, alice) = setup(&t).await;
    public_client(&t).await;

    let mut req = authorize_req(&org, "doc:read");
    req.redirect_uri = format!("{}/", REDIRECT_URI);
    let err = t
        .authority
        .authorize(alice.principal_id, req)
        .await
        .unwrap_err();
    assert_eq!(protocol_failure(&err), Some(ProtocolFailure::RedirectMismatch));

    let grant = t
        .authority
        .authorize(alice.principal_id, authorize_req(&org, "doc:read"))
        .await
        .unwrap();
    let mut req = exchange_req(&grant);
    req.redirect_uri = "https://docs.example.com/callback?next=/admin".to_string();
    let err = t.authority.exchange_code(req, &ctx()).await.unwrap_err();
    assert_eq!(protocol_failure(&err), Some(ProtocolFailure::RedirectMismatch));

    let err = t
        .authority
        .exchange_code(exchange_req(&grant), &ctx())
        .await
        .unwrap_err();
    assert_eq!(protocol_failure(&err), Some(ProtocolFailure::InvalidCode));
}

#[tokio::test]
async fn test_plain_challenge_method_is_rejected() {
    let t = TestAuthority::new().await;
    let (org, alice) = setup(&t).await;
    public_client(&t).await;

    let mut req = authorize_req(&org, "doc:read");
    req.code_challenge_method = "plain".to_string();
    req.code_challenge = VERIFIER.to_string();
    let err = t
        .authority
        .authorize(alice.principal_id, req)
        .await
        .unwrap_err();
    assert_eq!(
        protocol_failure(&err),
        Some(ProtocolFailure::UnsupportedChallengeMethod)
    );
    assert_eq!(pkce::s256_challenge(VERIFIER), CHALLENGE);
}

#[tokio::test]
async fn test_scope_must_be_allowed_for_client() {
    let t = TestAuthority::new().await;
    let (org, alice) = setup(&t).await;
    public_client(&t).await;

    let err = t
        .authority
        .authorize(alice.principal_id, authorize_req(&org, "doc:read org:read"))
        .await
        .unwrap_err();
    assert_eq!(protocol_failure(&err), Some(ProtocolFailure::ScopeNotAllowed));
}

#[tokio::test]
async fn test_expired_code_is_rejected() {
    let t = TestAuthority::new().await;
    let (org, alice) = setup(&t).await;
    public_client(&t).await;
    let grant = t
        .authority
        .authorize(alice.principal_id, authorize_req(&org, "doc:read"))
        .await
        .unwrap();

    t.clock.advance(Duration::minutes(6));
    let err = t
        .authority
        .exchange_code(exchange_req(&grant), &ctx())
        .await
        .unwrap_err();
    assert_eq!(protocol_failure(&err), Some(ProtocolFailure::CodeExpired));
}

#[tokio::test]
async fn test_unknown_code_is_invalid() {
    let t = TestAuthority::new().await;
    setup(&t).await;
    public_client(&t).await;
    let grant = AuthorizationGrant {
        code: "f".repeat(64),
        redirect_uri: REDIRECT_URI.to_string(),
        expires_in: 300,
    };
    let err = t
        .authority
        .exchange_code(exchange_req(&grant), &ctx())
        .await
        .unwrap_err();
    assert_eq!(protocol_failure(&err), Some(ProtocolFailure::InvalidCode));
}

#[tokio::test]
async fn test_code_is_bound_to_its_client() {
    let t = TestAuthority::new().await;
    let (org, alice) = setup(&t).await;
    public_client(&t).await;
    t.client("other-app", ClientType::Public, REDIRECT_URI, &["doc:read"])
        .await;
    let grant = t
        .authority
        .authorize(alice.principal_id, authorize_req(&org, "doc:read"))
        .await
        .unwrap();

    let mut req = exchange_req(&grant);
    req.client_id = "other-app".to_string();
    let err = t.authority.exchange_code(req, &ctx()).await.unwrap_err();
    assert_eq!(protocol_failure(&err), Some(ProtocolFailure::ClientMismatch));

    // A foreign client cannot burn someone else's code.
    assert!(t
        .authority
        .exchange_code(exchange_req(&grant), &ctx())
        .await
        .is_ok());
}

#[tokio::test]
async fn test_confidential_client_must_authenticate() {
    let t = TestAuthority::new().await;
    let (org, alice) = setup(&t).await;
    let client_secret = t
        .client(CLIENT_ID, ClientType::Confidential, REDIRECT_URI, &["doc:read"])
        .await
        .unwrap();
    let grant = t
        .authority
        .authorize(alice.principal_id, authorize_req(&org, "doc:read"))
        .await
        .unwrap();

    let err = t
        .authority
        .exchange_code(exchange_req(&grant), &ctx())
        .await
        .unwrap_err();
    assert_eq!(protocol_failure(&err), Some(ProtocolFailure::InvalidClient));

    let mut req = exchange_req(&grant);
    req.client_secret = Some(secret("not-the-secret"));
    let err = t.authority.exchange_code(req, &ctx()).await.unwrap_err();
    assert_eq!(protocol_failure(&err), Some(ProtocolFailure::InvalidClient));

    let mut req = exchange_req(&grant);
    req.client_secret = Some(secret(&client_secret));
    assert!(t.authority.exchange_code(req, &ctx()).await.is_ok());
}

#[tokio::test]
async fn test_non_member_cannot_authorize() {
    let t = TestAuthority::new().await;
    let (org, _alice) = setup(&t).await;
    public_client(&t).await;
    let mallory = t.principal("mallory@example.com").await;

    let err = t
        .authority
        .authorize(mallory.principal_id, authorize_req(&org, "doc:read"))
        .await
        .unwrap_err();
    assert_eq!(protocol_failure(&err), Some(ProtocolFailure::AccessDenied));
    assert_eq!(t.audit.count(AuditEventType::CodeDenied), 1);
    assert_eq!(t.audit.count(AuditEventType::CodeIssued), 0);
}

#[tokio::test]
async fn test_membership_removed_before_exchange_denies_code() {
    let t = TestAuthority::new().await;
    let (org, alice) = setup(&t).await;
    public_client(&t).await;
    let grant = t
        .authority
        .authorize(alice.principal_id, authorize_req(&org, "doc:read"))
        .await
        .unwrap();

    t.authority
        .remove_member(org.org_id, alice.principal_id)
        .await
        .unwrap();
    let err = t
        .authority
        .exchange_code(exchange_req(&grant), &ctx())
        .await
        .unwrap_err();
    assert_eq!(protocol_failure(&err), Some(ProtocolFailure::AccessDenied));
}

#[tokio::test]
async fn test_logout_revokes_oauth_family() {
    let t = TestAuthority::new().await;
    let (org, alice) = setup(&t).await;
    public_client(&t).await;
    let grant = t
        .authority
        .authorize(alice.principal_id, authorize_req(&org, "doc:read"))
        .await
        .unwrap();
    let pair = t
        .authority
        .exchange_code(exchange_req(&grant), &ctx())
        .await
        .unwrap();

    t.authority.logout(&secret(&pair.refresh_token)).await.unwrap();
    let err = t
        .authority
        .refresh(
            RefreshRequest {
                refresh_token: secret(&pair.refresh_token),
            },
            &ctx(),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AuthorityError::Token(TokenFailure::InvalidRefreshToken)
    ));
}

#[tokio::test]
async fn test_client_registration_rejects_bad_redirects() {
    let t = TestAuthority::new().await;
    let err = t
        .authority
        .oauth()
        .register_client(authority_service::dtos::admin::RegisterClientRequest {
            client_id: "bad-app".to_string(),
            display_name: "Bad".to_string(),
            client_type: ClientType::Public,
            redirect_uris: vec!["https://bad.example.com/cb#token".to_string()],
            allowed_scopes: vec![],
        })
        .await
        .unwrap_err();
    assert!(matches!(err, AuthorityError::Validation(_)));
}

async fn oauth_pair(t: &TestAuthority, org: &Organization, alice: &Principal) -> TokenPair {
    let grant = t
        .authority
        .authorize(alice.principal_id, authorize_req(org, "doc:read"))
        .await
        .unwrap();
    t.authority
        .exchange_code(exchange_req(&grant), &ctx())
        .await
        .unwrap()
}

async fn refresh_err(t: &TestAuthority, pair: &TokenPair) -> AuthorityError {
    t.authority
        .refresh(
            RefreshRequest {
                refresh_token: secret(&pair.refresh_token),
            },
            &ctx(),
        )
        .await
        .unwrap_err()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_exchange_has_single_winner() {
    let t = TestAuthority::new().await;
    let (org, alice) = setup(&t).await;
    public_client(&t).await;
    let grant = t
        .authority
        .authorize(alice.principal_id, authorize_req(&org, "doc:read"))
        .await
        .unwrap();

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let authority = t.authority.clone();
            let req = exchange_req(&grant);
            tokio::spawn(async move { authority.exchange_code(req, &ctx()).await })
        })
        .collect();
    let results: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        assert_eq!(protocol_failure(err), Some(ProtocolFailure::CodeReused));
    }
    assert_eq!(t.audit.count(AuditEventType::CodeExchanged), 1);
}

#[tokio::test]
async fn test_disable_principal_revokes_oauth_family() {
    let t = TestAuthority::new().await;
    let (org, alice) = setup(&t).await;
    public_client(&t).await;
    let pair = oauth_pair(&t, &org, &alice).await;

    t.authority.disable_principal(alice.principal_id).await.unwrap();
    t.store
        .set_principal_state(alice.principal_id, PrincipalState::Active)
        .await
        .unwrap();

    let err = refresh_err(&t, &pair).await;
    assert!(matches!(
        err,
        AuthorityError::Token(TokenFailure::InvalidRefreshToken)
    ));
}

#[tokio::test]
async fn test_remove_member_revokes_oauth_family() {
    let t = TestAuthority::new().await;
    let (org, alice) = setup(&t).await;
    public_client(&t).await;
    let pair = oauth_pair(&t, &org, &alice).await;

    t.authority
        .remove_member(org.org_id, alice.principal_id)
        .await
        .unwrap();
    let membership = t
        .store
        .find_membership(alice.principal_id, org.org_id)
        .await
        .unwrap()
        .unwrap();
    t.store
        .set_membership_state(membership.membership_id, MembershipState::Active)
        .await
        .unwrap();

    let err = refresh_err(&t, &pair).await;
    assert!(matches!(
        err,
        AuthorityError::Token(TokenFailure::InvalidRefreshToken)
    ));
}

#[tokio::test]
async fn test_logout_all_revokes_oauth_family_in_that_org() {
    let t = TestAuthority::new().await;
    let (org, alice) = setup(&t).await;
    public_client(&t).await;
    let pair = oauth_pair(&t, &org, &alice).await;

    let other = t.org("globex").await;
    let sessions = t
        .authority
        .logout_all(alice.principal_id, Some(other.org_id))
        .await
        .unwrap();
    assert_eq!(sessions, 0);
    assert!(t
        .authority
        .refresh(
            RefreshRequest {
                refresh_token: secret(&pair.refresh_token),
            },
            &ctx(),
        )
        .await
        .is_ok());

    let pair = oauth_pair(&t, &org, &alice).await;
    t.authority
        .logout_all(alice.principal_id, Some(org.org_id))
        .await
        .unwrap();
    let err = refresh_err(&t, &pair).await;
    assert!(matches!(
        err,
        AuthorityError::Token(TokenFailure::InvalidRefreshToken)
    ));
}
