//! Postgres-backed implementation of the authority store.
//!
//! Row structs mirror the schema in `migrations/` and are converted into
//! domain models at the edge, so string status codes are parsed in one place.
//!
//! Atomic primitives are either a single conditional statement
//! (`UPDATE ... WHERE status_code = 'active'`) or a transaction. Under READ
//! COMMITTED a second concurrent conditional update blocks on the row lock,
//! re-evaluates its predicate against the committed row, and matches nothing;
//! that is what makes rotation and code redemption single-winner.
//!
//! The role-grant scope rule is enforced twice: by the store's callers and by
//! the `role_grants_scope` trigger, which no code path can bypass.

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgConnection, PgPool};
use uuid::Uuid;

use super::{
    AuthorityStore, RedemptionOutcome, RoleDeletion, RotationOutcome, StoreError, StoreResult,
};
use crate::models::{
    ApiKey, AuthorizationCode, AuthorizationCodeStatus, ClientApplication, DeviceBinding,
    Membership, MembershipState, Organization, Permission, Principal, PrincipalState,
    RefreshToken, RefreshTokenStatus, Revocation, RevocationReason, Role, Scope, Session,
};

const GRANT_SCOPE_CONSTRAINT: &str = "role_grants_scope";

fn map_err(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.constraint() == Some(GRANT_SCOPE_CONSTRAINT) {
            let name = db
                .message()
                .strip_prefix("cross-tenant grant: ")
                .unwrap_or_else(|| db.message())
                .to_string();
            return StoreError::CrossTenantGrant(name);
        }
        if db.is_unique_violation() {
            return StoreError::Conflict(db.constraint().unwrap_or("unique").to_string());
        }
        if db.is_foreign_key_violation() {
            return StoreError::NotFound(db.constraint().unwrap_or("reference").to_string());
        }
    }
    StoreError::Unexpected(anyhow!(err))
}

fn corrupt(what: &str, detail: impl std::fmt::Display) -> StoreError {
    StoreError::Unexpected(anyhow!("corrupt {} row: {}", what, detail))
}

fn parse_code<T>(what: &str, raw: &str) -> StoreResult<T>
where
    T: std::str::FromStr<Err = String>,
{
    raw.parse().map_err(|e: String| corrupt(what, e))
}

fn scope_of(what: &str, is_system: bool, org_id: Option<Uuid>) -> StoreResult<Scope> {
    Scope::from_parts(is_system, org_id).ok_or_else(|| corrupt(what, "system flag and org_id disagree"))
}

fn revocation_of(
    what: &str,
    revoked_utc: Option<DateTime<Utc>>,
    reason: Option<&str>,
) -> StoreResult<Option<Revocation>> {
    match (revoked_utc, reason) {
        (None, None) => Ok(None),
        (Some(revoked_utc), Some(reason)) => Ok(Some(Revocation {
            revoked_utc,
            reason: parse_code::<RevocationReason>(what, reason)?,
        })),
        _ => Err(corrupt(what, "partial revocation")),
    }
}

#[derive(Debug, FromRow)]
struct DbPrincipal {
    principal_id: Uuid,
    identifier: String,
    credential_hash: Option<String>,
    email_verified: bool,
    is_superadmin: bool,
    state_code: String,
    created_utc: DateTime<Utc>,
}

impl DbPrincipal {
    fn into_domain(self) -> StoreResult<Principal> {
        Ok(Principal {
            principal_id: self.principal_id,
            identifier: self.identifier,
            credential_hash: self.credential_hash,
            email_verified: self.email_verified,
            is_superadmin: self.is_superadmin,
            state: parse_code::<PrincipalState>("principal", &self.state_code)?,
            created_utc: self.created_utc,
        })
    }
}

#[derive(Debug, FromRow)]
struct DbApiKey {
    key_id: Uuid,
    principal_id: Uuid,
    key_prefix: String,
    key_hash: String,
    label: String,
    created_utc: DateTime<Utc>,
    expires_utc: Option<DateTime<Utc>>,
    revoked_utc: Option<DateTime<Utc>>,
}

impl From<DbApiKey> for ApiKey {
    fn from(row: DbApiKey) -> Self {
        ApiKey {
            key_id: row.key_id,
            principal_id: row.principal_id,
            key_prefix: row.key_prefix,
            key_hash: row.key_hash,
            label: row.label,
            created_utc: row.created_utc,
            expires_utc: row.expires_utc,
            revoked_utc: row.revoked_utc,
        }
    }
}

#[derive(Debug, FromRow)]
struct DbOrganization {
    org_id: Uuid,
    slug: String,
    state_code: String,
    created_utc: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct DbMembership {
    membership_id: Uuid,
    principal_id: Uuid,
    org_id: Uuid,
    role_id: Uuid,
    state_code: String,
    created_utc: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct DbPermission {
    perm_id: Uuid,
    org_id: Option<Uuid>,
    is_system: bool,
    perm_name: String,
    category: String,
    created_utc: DateTime<Utc>,
}

impl DbPermission {
    fn into_domain(self) -> StoreResult<Permission> {
        Ok(Permission {
            perm_id: self.perm_id,
            scope: scope_of("permission", self.is_system, self.org_id)?,
            name: self.perm_name,
            category: self.category,
            created_utc: self.created_utc,
        })
    }
}

#[derive(Debug, FromRow)]
struct DbRole {
    role_id: Uuid,
    org_id: Option<Uuid>,
    is_system: bool,
    role_name: String,
    display_name: String,
    created_utc: DateTime<Utc>,
}

impl DbRole {
    fn into_domain(self) -> StoreResult<Role> {
        Ok(Role {
            role_id: self.role_id,
            scope: scope_of("role", self.is_system, self.org_id)?,
            name: self.role_name,
            display_name: self.display_name,
            created_utc: self.created_utc,
        })
    }
}

#[derive(Debug, FromRow)]
struct DbSession {
    session_id: Uuid,
    principal_id: Uuid,
    org_id: Uuid,
    device_binding_hash: String,
    created_utc: DateTime<Utc>,
    last_activity_utc: DateTime<Utc>,
    expires_utc: DateTime<Utc>,
    absolute_expires_utc: DateTime<Utc>,
    revoked_utc: Option<DateTime<Utc>>,
    revoked_reason: Option<String>,
}

impl DbSession {
    fn into_domain(self) -> StoreResult<Session> {
        Ok(Session {
            session_id: self.session_id,
            principal_id: self.principal_id,
            org_id: self.org_id,
            device_binding_hash: self.device_binding_hash,
            created_utc: self.created_utc,
            last_activity_utc: self.last_activity_utc,
            expires_utc: self.expires_utc,
            absolute_expires_utc: self.absolute_expires_utc,
            revocation: revocation_of("session", self.revoked_utc, self.revoked_reason.as_deref())?,
        })
    }
}

#[derive(Debug, FromRow)]
struct DbRefreshToken {
    token_id: Uuid,
    principal_id: Uuid,
    org_id: Uuid,
    session_id: Option<Uuid>,
    client_id: Option<String>,
    scope: Vec<String>,
    token_hash: String,
    family_id: Uuid,
    user_agent_hash: String,
    ip_hash: String,
    issued_utc: DateTime<Utc>,
    expires_utc: DateTime<Utc>,
    status_code: String,
    used_utc: Option<DateTime<Utc>>,
    replaced_by_id: Option<Uuid>,
    revoked_utc: Option<DateTime<Utc>>,
    revoked_reason: Option<String>,
}

impl DbRefreshToken {
    fn into_domain(self) -> StoreResult<RefreshToken> {
        let status = match (self.status_code.as_str(), self.used_utc, self.replaced_by_id) {
            ("active", _, _) => RefreshTokenStatus::Active,
            ("used", Some(used_utc), Some(replaced_by_id)) => RefreshTokenStatus::Used {
                used_utc,
                replaced_by_id,
            },
            ("revoked", _, _) => {
                let revocation = revocation_of(
                    "refresh token",
                    self.revoked_utc,
                    self.revoked_reason.as_deref(),
                )?
                .ok_or_else(|| corrupt("refresh token", "revoked without reason"))?;
                RefreshTokenStatus::Revoked(revocation)
            }
            (other, _, _) => return Err(corrupt("refresh token", other)),
        };
        Ok(RefreshToken {
            token_id: self.token_id,
            principal_id: self.principal_id,
            org_id: self.org_id,
            session_id: self.session_id,
            client_id: self.client_id,
            scope: self.scope,
            token_hash: self.token_hash,
            family_id: self.family_id,
            binding: DeviceBinding {
                user_agent_hash: self.user_agent_hash,
                ip_hash: self.ip_hash,
            },
            issued_utc: self.issued_utc,
            expires_utc: self.expires_utc,
            status,
        })
    }
}

#[derive(Debug, FromRow)]
struct DbClient {
    client_id: String,
    client_secret_hash: Option<String>,
    client_type: String,
    display_name: String,
    redirect_uris: Vec<String>,
    allowed_scopes: Vec<String>,
    enabled: bool,
    created_utc: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct DbAuthorizationCode {
    code_id: Uuid,
    code_hash: String,
    client_id: String,
    principal_id: Uuid,
    org_id: Uuid,
    redirect_uri: String,
    scope: Vec<String>,
    code_challenge: String,
    code_challenge_method: String,
    issued_utc: DateTime<Utc>,
    expires_utc: DateTime<Utc>,
    status_code: String,
    used_utc: Option<DateTime<Utc>>,
    issued_family_id: Option<Uuid>,
}

impl DbAuthorizationCode {
    fn into_domain(self) -> StoreResult<AuthorizationCode> {
        let status = match (self.status_code.as_str(), self.used_utc, self.issued_family_id) {
            ("issued", _, _) => AuthorizationCodeStatus::Issued,
            ("exchanged", Some(exchanged_utc), Some(issued_family_id)) => {
                AuthorizationCodeStatus::Exchanged {
                    exchanged_utc,
                    issued_family_id,
                }
            }
            ("denied", Some(denied_utc), _) => AuthorizationCodeStatus::Denied { denied_utc },
            (other, _, _) => return Err(corrupt("authorization code", other)),
        };
        Ok(AuthorizationCode {
            code_id: self.code_id,
            code_hash: self.code_hash,
            client_id: self.client_id,
            principal_id: self.principal_id,
            org_id: self.org_id,
            redirect_uri: self.redirect_uri,
            scope: self.scope,
            code_challenge: self.code_challenge,
            code_challenge_method: parse_code("authorization code", &self.code_challenge_method)?,
            issued_utc: self.issued_utc,
            expires_utc: self.expires_utc,
            status,
        })
    }
}

/// Durable authority store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Revoke one session and its refresh tokens inside the caller's transaction.
async fn revoke_session_in(
    conn: &mut PgConnection,
    session_id: Uuid,
    revocation: Revocation,
) -> Result<bool, sqlx::Error> {
    let updated = sqlx::query(
        r#"
        UPDATE sessions SET revoked_utc = $2, revoked_reason = $3
        WHERE session_id = $1 AND revoked_utc IS NULL
        "#,
    )
    .bind(session_id)
    .bind(revocation.revoked_utc)
    .bind(revocation.reason.as_str())
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if updated == 0 {
        return Ok(false);
    }

    sqlx::query(
        r#"
        UPDATE refresh_tokens
        SET status_code = 'revoked', revoked_utc = $2, revoked_reason = $3
        WHERE session_id = $1 AND status_code <> 'revoked'
        "#,
    )
    .bind(session_id)
    .bind(revocation.revoked_utc)
    .bind(revocation.reason.as_str())
    .execute(&mut *conn)
    .await?;

    Ok(true)
}

async fn insert_refresh_token_in(
    conn: &mut PgConnection,
    token: &RefreshToken,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO refresh_tokens (
            token_id, principal_id, org_id, session_id, client_id, scope, token_hash,
            family_id, user_agent_hash, ip_hash, issued_utc, expires_utc, status_code
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        "#,
    )
    .bind(token.token_id)
    .bind(token.principal_id)
    .bind(token.org_id)
    .bind(token.session_id)
    .bind(&token.client_id)
    .bind(&token.scope)
    .bind(&token.token_hash)
    .bind(token.family_id)
    .bind(&token.binding.user_agent_hash)
    .bind(&token.binding.ip_hash)
    .bind(token.issued_utc)
    .bind(token.expires_utc)
    .bind(token.status.code())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_grants_in(
    conn: &mut PgConnection,
    role_id: Uuid,
    perm_ids: &[Uuid],
) -> Result<(), sqlx::Error> {
    for perm_id in perm_ids {
        sqlx::query(
            "INSERT INTO role_grants (role_id, perm_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(role_id)
        .bind(perm_id)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

#[async_trait]
impl AuthorityStore for PgStore {
    async fn now(&self) -> StoreResult<DateTime<Utc>> {
        sqlx::query_scalar::<_, DateTime<Utc>>("SELECT now()")
            .fetch_one(&self.pool)
            .await
            .map_err(map_err)
    }

    // ==================== Principals ====================

    async fn insert_principal(&self, principal: &Principal) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO principals (principal_id, identifier, credential_hash, email_verified, is_superadmin, state_code, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(principal.principal_id)
        .bind(&principal.identifier)
        .bind(&principal.credential_hash)
        .bind(principal.email_verified)
        .bind(principal.is_superadmin)
        .bind(principal.state.as_str())
        .bind(principal.created_utc)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn get_principal(&self, principal_id: Uuid) -> StoreResult<Option<Principal>> {
        sqlx::query_as::<_, DbPrincipal>("SELECT * FROM principals WHERE principal_id = $1")
            .bind(principal_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?
            .map(DbPrincipal::into_domain)
            .transpose()
    }

    async fn find_principal_by_identifier(
        &self,
        identifier: &str,
    ) -> StoreResult<Option<Principal>> {
        sqlx::query_as::<_, DbPrincipal>("SELECT * FROM principals WHERE identifier = $1")
            .bind(identifier)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?
            .map(DbPrincipal::into_domain)
            .transpose()
    }

    async fn set_principal_state(
        &self,
        principal_id: Uuid,
        state: PrincipalState,
    ) -> StoreResult<()> {
        let updated = sqlx::query("UPDATE principals SET state_code = $2 WHERE principal_id = $1")
            .bind(principal_id)
            .bind(state.as_str())
            .execute(&self.pool)
            .await
            .map_err(map_err)?
            .rows_affected();
        if updated == 0 {
            return Err(StoreError::NotFound(format!("principal {}", principal_id)));
        }
        Ok(())
    }

    async fn set_email_verified(&self, principal_id: Uuid, verified: bool) -> StoreResult<()> {
        let updated =
            sqlx::query("UPDATE principals SET email_verified = $2 WHERE principal_id = $1")
                .bind(principal_id)
                .bind(verified)
                .execute(&self.pool)
                .await
                .map_err(map_err)?
                .rows_affected();
        if updated == 0 {
            return Err(StoreError::NotFound(format!("principal {}", principal_id)));
        }
        Ok(())
    }

    // ==================== API keys ====================

    async fn insert_api_key(&self, key: &ApiKey) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO api_keys (key_id, principal_id, key_prefix, key_hash, label, created_utc, expires_utc, revoked_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(key.key_id)
        .bind(key.principal_id)
        .bind(&key.key_prefix)
        .bind(&key.key_hash)
        .bind(&key.label)
        .bind(key.created_utc)
        .bind(key.expires_utc)
        .bind(key.revoked_utc)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn find_api_key_by_prefix(&self, key_prefix: &str) -> StoreResult<Option<ApiKey>> {
        let row = sqlx::query_as::<_, DbApiKey>("SELECT * FROM api_keys WHERE key_prefix = $1")
            .bind(key_prefix)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(row.map(ApiKey::from))
    }

    async fn revoke_api_key(&self, key_id: Uuid, revoked_utc: DateTime<Utc>) -> StoreResult<()> {
        let updated = sqlx::query(
            "UPDATE api_keys SET revoked_utc = COALESCE(revoked_utc, $2) WHERE key_id = $1",
        )
        .bind(key_id)
        .bind(revoked_utc)
        .execute(&self.pool)
        .await
        .map_err(map_err)?
        .rows_affected();
        if updated == 0 {
            return Err(StoreError::NotFound(format!("api key {}", key_id)));
        }
        Ok(())
    }

    // ==================== Organizations ====================

    async fn insert_organization(&self, org: &Organization) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO organizations (org_id, slug, state_code, created_utc) VALUES ($1, $2, $3, $4)",
        )
        .bind(org.org_id)
        .bind(&org.slug)
        .bind(org.state.as_str())
        .bind(org.created_utc)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn get_organization(&self, org_id: Uuid) -> StoreResult<Option<Organization>> {
        let row = sqlx::query_as::<_, DbOrganization>("SELECT * FROM organizations WHERE org_id = $1")
            .bind(org_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?;
        row.map(|r| {
            Ok(Organization {
                org_id: r.org_id,
                slug: r.slug,
                state: parse_code("organization", &r.state_code)?,
                created_utc: r.created_utc,
            })
        })
        .transpose()
    }

    // ==================== Memberships ====================

    async fn insert_membership(&self, membership: &Membership) -> StoreResult<()> {
        // The role must be a system role or belong to the membership's organization.
        let inserted = sqlx::query(
            r#"
            INSERT INTO memberships (membership_id, principal_id, org_id, role_id, state_code, created_utc)
            SELECT $1, $2, $3, $4, $5, $6
            WHERE EXISTS (
                SELECT 1 FROM roles WHERE role_id = $4 AND (org_id IS NULL OR org_id = $3)
            )
            "#,
        )
        .bind(membership.membership_id)
        .bind(membership.principal_id)
        .bind(membership.org_id)
        .bind(membership.role_id)
        .bind(membership.state.as_str())
        .bind(membership.created_utc)
        .execute(&self.pool)
        .await
        .map_err(map_err)?
        .rows_affected();

        if inserted == 0 {
            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM roles WHERE role_id = $1)")
                    .bind(membership.role_id)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(map_err)?;
            return Err(if exists {
                StoreError::CrossTenantGrant(format!("role {}", membership.role_id))
            } else {
                StoreError::NotFound(format!("role {}", membership.role_id))
            });
        }
        Ok(())
    }

    async fn find_membership(
        &self,
        principal_id: Uuid,
        org_id: Uuid,
    ) -> StoreResult<Option<Membership>> {
        let row = sqlx::query_as::<_, DbMembership>(
            "SELECT * FROM memberships WHERE principal_id = $1 AND org_id = $2",
        )
        .bind(principal_id)
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_err)?;
        row.map(|r| {
            Ok(Membership {
                membership_id: r.membership_id,
                principal_id: r.principal_id,
                org_id: r.org_id,
                role_id: r.role_id,
                state: parse_code("membership", &r.state_code)?,
                created_utc: r.created_utc,
            })
        })
        .transpose()
    }

    async fn set_membership_state(
        &self,
        membership_id: Uuid,
        state: MembershipState,
    ) -> StoreResult<()> {
        let updated =
            sqlx::query("UPDATE memberships SET state_code = $2 WHERE membership_id = $1")
                .bind(membership_id)
                .bind(state.as_str())
                .execute(&self.pool)
                .await
                .map_err(map_err)?
                .rows_affected();
        if updated == 0 {
            return Err(StoreError::NotFound(format!("membership {}", membership_id)));
        }
        Ok(())
    }

    // ==================== Permissions ====================

    async fn insert_permission(&self, permission: &Permission) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO permissions (perm_id, org_id, is_system, perm_name, category, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(permission.perm_id)
        .bind(permission.org_id())
        .bind(permission.is_system())
        .bind(&permission.name)
        .bind(&permission.category)
        .bind(permission.created_utc)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn find_permissions_by_names(&self, names: &[String]) -> StoreResult<Vec<Permission>> {
        sqlx::query_as::<_, DbPermission>("SELECT * FROM permissions WHERE perm_name = ANY($1)")
            .bind(names)
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?
            .into_iter()
            .map(DbPermission::into_domain)
            .collect()
    }

    async fn list_system_permissions(&self) -> StoreResult<Vec<Permission>> {
        sqlx::query_as::<_, DbPermission>(
            "SELECT * FROM permissions WHERE org_id IS NULL ORDER BY perm_name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?
        .into_iter()
        .map(DbPermission::into_domain)
        .collect()
    }

    async fn list_org_permissions(&self, org_id: Uuid) -> StoreResult<Vec<Permission>> {
        sqlx::query_as::<_, DbPermission>(
            "SELECT * FROM permissions WHERE org_id = $1 ORDER BY perm_name",
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?
        .into_iter()
        .map(DbPermission::into_domain)
        .collect()
    }

    // ==================== Roles and grants ====================

    async fn insert_role(&self, role: &Role, perm_ids: &[Uuid]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;

        sqlx::query(
            r#"
            INSERT INTO roles (role_id, org_id, is_system, role_name, display_name, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(role.role_id)
        .bind(role.org_id())
        .bind(role.is_system())
        .bind(&role.name)
        .bind(&role.display_name)
        .bind(role.created_utc)
        .execute(&mut *tx)
        .await
        .map_err(map_err)?;

        insert_grants_in(&mut *tx, role.role_id, perm_ids)
            .await
            .map_err(map_err)?;

        tx.commit().await.map_err(map_err)?;
        Ok(())
    }

    async fn get_role(&self, role_id: Uuid) -> StoreResult<Option<Role>> {
        sqlx::query_as::<_, DbRole>("SELECT * FROM roles WHERE role_id = $1")
            .bind(role_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?
            .map(DbRole::into_domain)
            .transpose()
    }

    async fn list_system_roles(&self) -> StoreResult<Vec<Role>> {
        sqlx::query_as::<_, DbRole>("SELECT * FROM roles WHERE org_id IS NULL ORDER BY role_name")
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?
            .into_iter()
            .map(DbRole::into_domain)
            .collect()
    }

    async fn find_system_role_by_name(&self, name: &str) -> StoreResult<Option<Role>> {
        sqlx::query_as::<_, DbRole>("SELECT * FROM roles WHERE org_id IS NULL AND role_name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?
            .map(DbRole::into_domain)
            .transpose()
    }

    async fn update_role(&self, role: &Role) -> StoreResult<()> {
        let updated = sqlx::query(
            "UPDATE roles SET role_name = $2, display_name = $3 WHERE role_id = $1",
        )
        .bind(role.role_id)
        .bind(&role.name)
        .bind(&role.display_name)
        .execute(&self.pool)
        .await
        .map_err(map_err)?
        .rows_affected();
        if updated == 0 {
            return Err(StoreError::NotFound(format!("role {}", role.role_id)));
        }
        Ok(())
    }

    async fn delete_role(&self, role_id: Uuid) -> StoreResult<RoleDeletion> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;

        // Row lock conflicts with the key-share lock a concurrent membership insert takes.
        let is_system: Option<bool> =
            sqlx::query_scalar("SELECT is_system FROM roles WHERE role_id = $1 FOR UPDATE")
                .bind(role_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_err)?;

        let outcome = match is_system {
            None => return Err(StoreError::NotFound(format!("role {}", role_id))),
            Some(true) => RoleDeletion::SystemRole,
            Some(false) => {
                let in_use: bool = sqlx::query_scalar(
                    r#"
                    SELECT EXISTS (
                        SELECT 1 FROM memberships WHERE role_id = $1 AND state_code <> 'removed'
                    )
                    "#,
                )
                .bind(role_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(map_err)?;

                if in_use {
                    RoleDeletion::InUse
                } else {
                    sqlx::query("DELETE FROM memberships WHERE role_id = $1")
                        .bind(role_id)
                        .execute(&mut *tx)
                        .await
                        .map_err(map_err)?;
                    sqlx::query("DELETE FROM roles WHERE role_id = $1")
                        .bind(role_id)
                        .execute(&mut *tx)
                        .await
                        .map_err(map_err)?;
                    RoleDeletion::Deleted
                }
            }
        };

        tx.commit().await.map_err(map_err)?;
        Ok(outcome)
    }

    async fn insert_role_grants(&self, role_id: Uuid, perm_ids: &[Uuid]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        insert_grants_in(&mut *tx, role_id, perm_ids)
            .await
            .map_err(map_err)?;
        tx.commit().await.map_err(map_err)?;
        Ok(())
    }

    async fn delete_role_grants(&self, role_id: Uuid, perm_ids: &[Uuid]) -> StoreResult<u64> {
        let deleted =
            sqlx::query("DELETE FROM role_grants WHERE role_id = $1 AND perm_id = ANY($2)")
                .bind(role_id)
                .bind(perm_ids)
                .execute(&self.pool)
                .await
                .map_err(map_err)?
                .rows_affected();
        Ok(deleted)
    }

    async fn list_role_permissions(&self, role_id: Uuid) -> StoreResult<Vec<Permission>> {
        sqlx::query_as::<_, DbPermission>(
            r#"
            SELECT p.* FROM permissions p
            JOIN role_grants g ON g.perm_id = p.perm_id
            WHERE g.role_id = $1
            ORDER BY p.perm_name
            "#,
        )
        .bind(role_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?
        .into_iter()
        .map(DbPermission::into_domain)
        .collect()
    }

    // ==================== Sessions ====================

    async fn insert_session(&self, session: &Session) -> StoreResult<Vec<Uuid>> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        let revocation = Revocation {
            revoked_utc: session.created_utc,
            reason: RevocationReason::SessionSuperseded,
        };

        // The partial unique index `sessions_unrevoked_device` keeps at most
        // one unrevoked row per device; a concurrent insert fails as Conflict.
        let superseded: Vec<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE sessions SET revoked_utc = $4, revoked_reason = $5
            WHERE principal_id = $1 AND org_id = $2 AND device_binding_hash = $3
              AND revoked_utc IS NULL
            RETURNING session_id
            "#,
        )
        .bind(session.principal_id)
        .bind(session.org_id)
        .bind(&session.device_binding_hash)
        .bind(revocation.revoked_utc)
        .bind(revocation.reason.as_str())
        .fetch_all(&mut *tx)
        .await
        .map_err(map_err)?;

        if !superseded.is_empty() {
            sqlx::query(
                r#"
                UPDATE refresh_tokens
                SET status_code = 'revoked', revoked_utc = $2, revoked_reason = $3
                WHERE session_id = ANY($1) AND status_code <> 'revoked'
                "#,
            )
            .bind(&superseded[..])
            .bind(revocation.revoked_utc)
            .bind(revocation.reason.as_str())
            .execute(&mut *tx)
            .await
            .map_err(map_err)?;
        }

        sqlx::query(
            r#"
            INSERT INTO sessions (
                session_id, principal_id, org_id, device_binding_hash, created_utc,
                last_activity_utc, expires_utc, absolute_expires_utc
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(session.session_id)
        .bind(session.principal_id)
        .bind(session.org_id)
        .bind(&session.device_binding_hash)
        .bind(session.created_utc)
        .bind(session.last_activity_utc)
        .bind(session.expires_utc)
        .bind(session.absolute_expires_utc)
        .execute(&mut *tx)
        .await
        .map_err(map_err)?;

        tx.commit().await.map_err(map_err)?;
        Ok(superseded)
    }

    async fn get_session(&self, session_id: Uuid) -> StoreResult<Option<Session>> {
        sqlx::query_as::<_, DbSession>("SELECT * FROM sessions WHERE session_id = $1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?
            .map(DbSession::into_domain)
            .transpose()
    }

    async fn touch_session(
        &self,
        session_id: Uuid,
        last_activity_utc: DateTime<Utc>,
        expires_utc: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE sessions
            SET last_activity_utc = $2, expires_utc = LEAST($3, absolute_expires_utc)
            WHERE session_id = $1 AND revoked_utc IS NULL
            "#,
        )
        .bind(session_id)
        .bind(last_activity_utc)
        .bind(expires_utc)
        .execute(&self.pool)
        .await
        .map_err(map_err)?
        .rows_affected();

        if updated == 0 && self.get_session(session_id).await?.is_none() {
            return Err(StoreError::NotFound(format!("session {}", session_id)));
        }
        Ok(updated == 1)
    }

    async fn revoke_session(&self, session_id: Uuid, revocation: Revocation) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        let revoked = revoke_session_in(&mut *tx, session_id, revocation)
            .await
            .map_err(map_err)?;
        tx.commit().await.map_err(map_err)?;

        if !revoked && self.get_session(session_id).await?.is_none() {
            return Err(StoreError::NotFound(format!("session {}", session_id)));
        }
        Ok(revoked)
    }

    async fn revoke_sessions_for_principal(
        &self,
        principal_id: Uuid,
        org_id: Option<Uuid>,
        revocation: Revocation,
    ) -> StoreResult<u64> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;

        let targets: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT session_id FROM sessions
            WHERE principal_id = $1 AND ($2::uuid IS NULL OR org_id = $2) AND revoked_utc IS NULL
            FOR UPDATE
            "#,
        )
        .bind(principal_id)
        .bind(org_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(map_err)?;

        let mut count = 0;
        for session_id in targets {
            if revoke_session_in(&mut *tx, session_id, revocation)
                .await
                .map_err(map_err)?
            {
                count += 1;
            }
        }

        tx.commit().await.map_err(map_err)?;
        Ok(count)
    }

    async fn list_sessions_for_principal(&self, principal_id: Uuid) -> StoreResult<Vec<Session>> {
        sqlx::query_as::<_, DbSession>(
            "SELECT * FROM sessions WHERE principal_id = $1 ORDER BY created_utc",
        )
        .bind(principal_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?
        .into_iter()
        .map(DbSession::into_domain)
        .collect()
    }

    // ==================== Refresh tokens ====================

    async fn insert_refresh_token(&self, token: &RefreshToken) -> StoreResult<()> {
        let mut conn = self.pool.acquire().await.map_err(map_err)?;
        insert_refresh_token_in(&mut *conn, token)
            .await
            .map_err(map_err)
    }

    async fn find_refresh_token_by_hash(
        &self,
        token_hash: &str,
    ) -> StoreResult<Option<RefreshToken>> {
        sqlx::query_as::<_, DbRefreshToken>("SELECT * FROM refresh_tokens WHERE token_hash = $1")
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?
            .map(DbRefreshToken::into_domain)
            .transpose()
    }

    async fn rotate_refresh_token(
        &self,
        presented_id: Uuid,
        successor: &RefreshToken,
    ) -> StoreResult<RotationOutcome> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;

        let consumed = sqlx::query(
            r#"
            UPDATE refresh_tokens
            SET status_code = 'used', used_utc = $2, replaced_by_id = $3
            WHERE token_id = $1 AND status_code = 'active'
            "#,
        )
        .bind(presented_id)
        .bind(successor.issued_utc)
        .bind(successor.token_id)
        .execute(&mut *tx)
        .await
        .map_err(map_err)?
        .rows_affected();

        if consumed == 0 {
            let status: Option<String> =
                sqlx::query_scalar("SELECT status_code FROM refresh_tokens WHERE token_id = $1")
                    .bind(presented_id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(map_err)?;
            tx.rollback().await.map_err(map_err)?;
            return match status.as_deref() {
                None => Err(StoreError::NotFound(format!("refresh token {}", presented_id))),
                Some("revoked") => Ok(RotationOutcome::Revoked),
                Some(_) => Ok(RotationOutcome::AlreadyConsumed),
            };
        }

        insert_refresh_token_in(&mut *tx, successor)
            .await
            .map_err(map_err)?;
        tx.commit().await.map_err(map_err)?;
        Ok(RotationOutcome::Rotated)
    }

    async fn revoke_token_family(
        &self,
        family_id: Uuid,
        revocation: Revocation,
    ) -> StoreResult<u64> {
        let revoked = sqlx::query(
            r#"
            UPDATE refresh_tokens
            SET status_code = 'revoked', revoked_utc = $2, revoked_reason = $3
            WHERE family_id = $1 AND status_code <> 'revoked'
            "#,
        )
        .bind(family_id)
        .bind(revocation.revoked_utc)
        .bind(revocation.reason.as_str())
        .execute(&self.pool)
        .await
        .map_err(map_err)?
        .rows_affected();
        Ok(revoked)
    }

    async fn revoke_refresh_tokens_for_principal(
        &self,
        principal_id: Uuid,
        org_id: Option<Uuid>,
        revocation: Revocation,
    ) -> StoreResult<u64> {
        let revoked = sqlx::query(
            r#"
            UPDATE refresh_tokens
            SET status_code = 'revoked', revoked_utc = $3, revoked_reason = $4
            WHERE principal_id = $1 AND ($2::uuid IS NULL OR org_id = $2)
              AND status_code <> 'revoked'
            "#,
        )
        .bind(principal_id)
        .bind(org_id)
        .bind(revocation.revoked_utc)
        .bind(revocation.reason.as_str())
        .execute(&self.pool)
        .await
        .map_err(map_err)?
        .rows_affected();
        Ok(revoked)
    }

    // ==================== Clients ====================

    async fn insert_client(&self, client: &ClientApplication) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO client_applications (
                client_id, client_secret_hash, client_type, display_name, redirect_uris,
                allowed_scopes, enabled, created_utc
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&client.client_id)
        .bind(&client.client_secret_hash)
        .bind(client.client_type.as_str())
        .bind(&client.display_name)
        .bind(&client.redirect_uris)
        .bind(&client.allowed_scopes)
        .bind(client.enabled)
        .bind(client.created_utc)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn get_client(&self, client_id: &str) -> StoreResult<Option<ClientApplication>> {
        let row = sqlx::query_as::<_, DbClient>(
            "SELECT * FROM client_applications WHERE client_id = $1",
        )
        .bind(client_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_err)?;
        row.map(|r| {
            Ok(ClientApplication {
                client_id: r.client_id,
                client_secret_hash: r.client_secret_hash,
                client_type: parse_code("client", &r.client_type)?,
                display_name: r.display_name,
                redirect_uris: r.redirect_uris,
                allowed_scopes: r.allowed_scopes,
                enabled: r.enabled,
                created_utc: r.created_utc,
            })
        })
        .transpose()
    }

    // ==================== Authorization codes ====================

    async fn insert_authorization_code(&self, code: &AuthorizationCode) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO authorization_codes (
                code_id, code_hash, client_id, principal_id, org_id, redirect_uri, scope,
                code_challenge, code_challenge_method, issued_utc, expires_utc, status_code
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(code.code_id)
        .bind(&code.code_hash)
        .bind(&code.client_id)
        .bind(code.principal_id)
        .bind(code.org_id)
        .bind(&code.redirect_uri)
        .bind(&code.scope)
        .bind(&code.code_challenge)
        .bind(code.code_challenge_method.as_str())
        .bind(code.issued_utc)
        .bind(code.expires_utc)
        .bind(code.status.code())
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn find_authorization_code_by_hash(
        &self,
        code_hash: &str,
    ) -> StoreResult<Option<AuthorizationCode>> {
        sqlx::query_as::<_, DbAuthorizationCode>(
            "SELECT * FROM authorization_codes WHERE code_hash = $1",
        )
        .bind(code_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_err)?
        .map(DbAuthorizationCode::into_domain)
        .transpose()
    }

    async fn redeem_authorization_code(
        &self,
        code_id: Uuid,
        exchanged_utc: DateTime<Utc>,
        refresh_token: &RefreshToken,
    ) -> StoreResult<RedemptionOutcome> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;

        let redeemed = sqlx::query(
            r#"
            UPDATE authorization_codes
            SET status_code = 'exchanged', used_utc = $2, issued_family_id = $3
            WHERE code_id = $1 AND status_code = 'issued'
            "#,
        )
        .bind(code_id)
        .bind(exchanged_utc)
        .bind(refresh_token.family_id)
        .execute(&mut *tx)
        .await
        .map_err(map_err)?
        .rows_affected();

        if redeemed == 0 {
            let prior: Option<Option<Uuid>> = sqlx::query_scalar(
                "SELECT issued_family_id FROM authorization_codes WHERE code_id = $1",
            )
            .bind(code_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_err)?;
            tx.rollback().await.map_err(map_err)?;
            return match prior {
                None => Err(StoreError::NotFound(format!("authorization code {}", code_id))),
                Some(issued_family_id) => Ok(RedemptionOutcome::AlreadyRedeemed { issued_family_id }),
            };
        }

        insert_refresh_token_in(&mut *tx, refresh_token)
            .await
            .map_err(map_err)?;
        tx.commit().await.map_err(map_err)?;
        Ok(RedemptionOutcome::Redeemed)
    }

    async fn deny_authorization_code(
        &self,
        code_id: Uuid,
        denied_utc: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let denied = sqlx::query(
            r#"
            UPDATE authorization_codes SET status_code = 'denied', used_utc = $2
            WHERE code_id = $1 AND status_code = 'issued'
            "#,
        )
        .bind(code_id)
        .bind(denied_utc)
        .execute(&self.pool)
        .await
        .map_err(map_err)?
        .rows_affected();
        Ok(denied == 1)
    }

    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}
