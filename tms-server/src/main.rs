mod settings;

use std::sync::Arc;

use anyhow::Result;
use tms_auth::{TenantIdentityResolver, TokenService};
use tms_axum::{TmsApp, TmsState};
use tms_core::PartitionKey;
use tms_tenancy::{MigrationSet, PartitionProvisioner, PgSessionPool, SessionPool, TenantRegistrar};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::settings::{LogFormat, ServerSettings};

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Finish provisioning for tenants a previous run left behind.
async fn resume_unfinished_tenants(registrar: &TenantRegistrar) -> Result<()> {
    for tenant_id in registrar.unfinished_tenants().await? {
        match registrar.resume_provisioning(tenant_id).await {
            Ok(report) => info!(tenant = %tenant_id, applied = ?report.applied, "tenant provisioning resumed"),
            Err(err) => warn!(tenant = %tenant_id, error = %err, "tenant provisioning still failing"),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let settings = ServerSettings::from_env()?;
    init_tracing(settings.log_format);

    if settings.using_development_secret {
        warn!("auth.jwt.secret is not set, using the development secret");
    }

    let pool: Arc<dyn SessionPool> = Arc::new(PgSessionPool::connect(&settings.database).await?);

    let report = PartitionProvisioner::new(Arc::clone(&pool), MigrationSet::shared())
        .migrate(&PartitionKey::public())
        .await?;
    info!(applied = ?report.applied, current = report.already_applied, "shared partition migrated");

    let tokens = TokenService::new(settings.auth.jwt.clone());
    let registrar = TenantRegistrar::new(
        Arc::clone(&pool),
        PartitionProvisioner::for_tenants(Arc::clone(&pool)),
        tokens.clone(),
        settings.auth.password.clone(),
    );
    resume_unfinished_tenants(&registrar).await?;

    let state = TmsState::new(pool, TenantIdentityResolver::new(tokens), registrar)
        .expose_errors(settings.expose_errors);

    TmsApp::new(state).listen(settings.addr()).await
}
