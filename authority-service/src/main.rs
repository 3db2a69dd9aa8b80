use authority_service::{
    config::AuthorityConfig,
    db,
    services::{bootstrap, Authority, PgAuditSink},
    store::{postgres::PgStore, AuthorityStore},
};
use service_core::error::AppError;
use service_core::observability::logging::init_tracing;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // Load configuration - fail fast if invalid
    let config = AuthorityConfig::from_env()?;

    init_tracing(&config.service_name, &config.log_level);

    tracing::info!(
        service = %config.service_name,
        environment = ?config.environment,
        "Starting authority service"
    );

    let pool = db::create_pool(&config.database)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!(e)))?;
    db::run_migrations(&pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!(e)))?;

    let store: Arc<dyn AuthorityStore> = Arc::new(PgStore::new(pool.clone()));
    let audit = Arc::new(PgAuditSink::new(pool));
    let authority =
        Authority::from_config(&config, store.clone(), audit).map_err(AppError::ConfigError)?;
    tracing::info!(backend = store.backend_name(), "Authority initialized");

    let report = bootstrap::run(&store, authority.credentials(), &config.bootstrap).await?;
    tracing::info!(
        permissions_created = report.permissions_created,
        roles_created = report.roles_created,
        superadmin = ?report.superadmin_id,
        "Bootstrap complete"
    );

    // Let spawned audit writes finish before the runtime shuts down.
    tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;
    Ok(())
}
