mod common;

use std::sync::Arc;

use authority_service::{
    config::{LOGIN_SCOPE, REFRESH_SCOPE},
    dtos::auth::{LoginRequest, Proof, RefreshRequest, RegisterPrincipalRequest},
    error::AuthFailure,
    models::{split_api_key, AuditEventType, PrincipalState, API_KEY_SCHEME},
    services::AuthoritySettings,
    AuthorityError,
};
use chrono::Duration;
use common::{ctx, TestAuthority, TEST_PASSWORD};
use secrecy::SecretString;
use service_core::rate_limit::ScopedRateLimiter;

fn password(raw: &str) -> Proof {
    Proof::Password(SecretString::new(raw.to_string()))
}

fn api_key(raw: &str) -> Proof {
    Proof::ApiKey(SecretString::new(raw.to_string()))
}

fn auth_failure(err: &AuthorityError) -> Option<AuthFailure> {
    match err {
        AuthorityError::Auth(f) => Some(*f),
        _ => None,
    }
}

#[tokio::test]
async fn test_password_verification() {
    let t = TestAuthority::new().await;
    let alice = t.principal("alice@example.com").await;
    let verifier = t.authority.credentials();

    let found = verifier
        .verify("  Alice@Example.com ", &password(TEST_PASSWORD))
        .await
        .unwrap();
    assert_eq!(found.principal_id, alice.principal_id);

    let err = verifier
        .verify("alice@example.com", &password("wrong horse battery"))
        .await
        .unwrap_err();
    assert_eq!(auth_failure(&err), Some(AuthFailure::InvalidCredential));

    // Unknown identifiers look exactly like wrong passwords.
    let err = verifier
        .verify("nobody@example.com", &password(TEST_PASSWORD))
        .await
        .unwrap_err();
    assert_eq!(auth_failure(&err), Some(AuthFailure::InvalidCredential));
}

#[tokio::test]
async fn test_account_state_is_checked_after_proof() {
    let t = TestAuthority::new().await;
    let verifier = t.authority.credentials();

    let unverified = verifier
        .register(RegisterPrincipalRequest {
            identifier: "new@example.com".to_string(),
            password: TEST_PASSWORD.to_string(),
        })
        .await
        .unwrap();
    let err = verifier
        .verify("new@example.com", &password(TEST_PASSWORD))
        .await
        .unwrap_err();
    assert_eq!(auth_failure(&err), Some(AuthFailure::EmailUnverified));

    t.store
        .set_email_verified(unverified.principal_id, true)
        .await
        .unwrap();
    t.store
        .set_principal_state(unverified.principal_id, PrincipalState::Suspended)
        .await
        .unwrap();
    let err = verifier
        .verify("new@example.com", &password(TEST_PASSWORD))
        .await
        .unwrap_err();
    assert_eq!(auth_failure(&err), Some(AuthFailure::AccountDisabled));

    // A wrong password never reveals the account state.
    let err = verifier
        .verify("new@example.com", &password("not the password"))
        .await
        .unwrap_err();
    assert_eq!(auth_failure(&err), Some(AuthFailure::InvalidCredential));
}

#[tokio::test]
async fn test_duplicate_registration_is_rejected() {
    let t = TestAuthority::new().await;
    t.principal("alice@example.com").await;
    let err = t
        .authority
        .credentials()
        .register(RegisterPrincipalRequest {
            identifier: "ALICE@example.com".to_string(),
            password: TEST_PASSWORD.to_string(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, AuthorityError::Validation(_)));

    let err = t
        .authority
        .credentials()
        .register(RegisterPrincipalRequest {
            identifier: "not-an-email".to_string(),
            password: TEST_PASSWORD.to_string(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, AuthorityError::Validation(_)));
}

#[tokio::test]
async fn test_api_key_lifecycle() {
    let t = TestAuthority::new().await;
    let alice = t.principal("alice@example.com").await;
    let verifier = t.authority.credentials();

    let (raw, key) = verifier
        .generate_api_key(alice.principal_id, "ci", None)
        .await
        .unwrap();
    assert!(raw.starts_with(&format!("{}_{}_", API_KEY_SCHEME, key.key_prefix)));
    let (prefix, _) = split_api_key(&raw).unwrap();
    assert_eq!(prefix, key.key_prefix);

    let found = verifier
        .verify("alice@example.com", &api_key(&raw))
        .await
        .unwrap();
    assert_eq!(found.principal_id, alice.principal_id);

    // A key only proves the identity it was issued to.
    t.principal("bob@example.com").await;
    let err = verifier
        .verify("bob@example.com", &api_key(&raw))
        .await
        .unwrap_err();
    assert_eq!(auth_failure(&err), Some(AuthFailure::InvalidCredential));

    let mut tampered = raw.clone();
    tampered.pop();
    tampered.push(if raw.ends_with('0') { '1' } else { '0' });
    let err = verifier
        .verify("alice@example.com", &api_key(&tampered))
        .await
        .unwrap_err();
    assert_eq!(auth_failure(&err), Some(AuthFailure::InvalidCredential));

    verifier.revoke_api_key(key.key_id).await.unwrap();
    let err = verifier
        .verify("alice@example.com", &api_key(&raw))
        .await
        .unwrap_err();
    assert_eq!(auth_failure(&err), Some(AuthFailure::InvalidCredential));
}

#[tokio::test]
async fn test_expired_api_key_is_rejected() {
    let t = TestAuthority::new().await;
    let alice = t.principal("alice@example.com").await;
    let verifier = t.authority.credentials();

    let expires = t.clock_now() + Duration::days(1);
    let (raw, _) = verifier
        .generate_api_key(alice.principal_id, "short-lived", Some(expires))
        .await
        .unwrap();
    assert!(verifier
        .verify("alice@example.com", &api_key(&raw))
        .await
        .is_ok());

    t.clock.advance(Duration::days(2));
    let err = verifier
        .verify("alice@example.com", &api_key(&raw))
        .await
        .unwrap_err();
    assert_eq!(auth_failure(&err), Some(AuthFailure::InvalidCredential));
}

#[tokio::test]
async fn test_login_with_api_key() {
    let t = TestAuthority::new().await;
    let org = t.org("acme").await;
    let alice = t.member_principal("alice@example.com", org.org_id).await;
    let (raw, _) = t
        .authority
        .credentials()
        .generate_api_key(alice.principal_id, "ci", None)
        .await
        .unwrap();

    let pair = t
        .authority
        .login(
            LoginRequest {
                identifier: "alice@example.com".to_string(),
                proof: api_key(&raw),
                org_id: org.org_id,
            },
            &ctx(),
        )
        .await
        .unwrap();
    let claims = t.authority.verify_access_token(&pair.access_token).unwrap();
    assert_eq!(claims.sub, alice.principal_id);
}

#[tokio::test]
async fn test_failed_login_is_audited() {
    let t = TestAuthority::new().await;
    let org = t.org("acme").await;
    t.member_principal("alice@example.com", org.org_id).await;

    let err = t
        .authority
        .login(
            LoginRequest {
                identifier: "alice@example.com".to_string(),
                proof: password("guess"),
                org_id: org.org_id,
            },
            &ctx(),
        )
        .await
        .unwrap_err();
    assert_eq!(auth_failure(&err), Some(AuthFailure::InvalidCredential));
    assert_eq!(t.audit.count(AuditEventType::LoginFailed), 1);
    assert_eq!(t.audit.count(AuditEventType::LoginSucceeded), 0);
    assert_eq!(t.audit.count(AuditEventType::SessionCreated), 0);

    t.login("alice@example.com", org.org_id, &ctx()).await.unwrap();
    assert_eq!(t.audit.count(AuditEventType::LoginSucceeded), 1);
}

#[tokio::test]
async fn test_login_to_foreign_org_opens_no_session() {
    let t = TestAuthority::new().await;
    let acme = t.org("acme").await;
    let globex = t.org("globex").await;
    let alice = t.member_principal("alice@example.com", acme.org_id).await;

    let err = t
        .login("alice@example.com", globex.org_id, &ctx())
        .await
        .unwrap_err();
    assert_eq!(auth_failure(&err), Some(AuthFailure::NotMember));
    assert!(t
        .authority
        .sessions()
        .list_active(alice.principal_id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_rate_gate_runs_before_credential_checks() {
    let gate = ScopedRateLimiter::new()
        .with_scope(LOGIN_SCOPE, 2, 60)
        .with_scope(REFRESH_SCOPE, 1, 60);
    let t = TestAuthority::with(AuthoritySettings::default(), Arc::new(gate)).await;
    let org = t.org("acme").await;
    t.member_principal("alice@example.com", org.org_id).await;

    let pair = t.login("alice@example.com", org.org_id, &ctx()).await.unwrap();
    assert!(t
        .login("Alice@Example.com", org.org_id, &ctx())
        .await
        .is_ok());
    let err = t
        .login("alice@example.com", org.org_id, &ctx())
        .await
        .unwrap_err();
    assert!(matches!(err, AuthorityError::RateLimited(ref s) if s == LOGIN_SCOPE));
    // Throttled attempts never reach the verifier.
    assert_eq!(t.audit.count(AuditEventType::LoginFailed), 0);

    // Other identifiers have their own budget.
    t.member_principal("bob@example.com", org.org_id).await;
    assert!(t.login("bob@example.com", org.org_id, &ctx()).await.is_ok());

    // Refresh is limited per client address. The first pair's session was
    // superseded, so only the budget matters here.
    let _ = t
        .authority
        .refresh(
            RefreshRequest {
                refresh_token: SecretString::new(pair.refresh_token.clone()),
            },
            &ctx(),
        )
        .await;
    let err = t
        .authority
        .refresh(
            RefreshRequest {
                refresh_token: SecretString::new(pair.refresh_token),
            },
            &ctx(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AuthorityError::RateLimited(ref s) if s == REFRESH_SCOPE));
}
