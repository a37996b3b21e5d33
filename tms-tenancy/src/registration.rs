//! Tenant registration and login against the shared partition.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tms_auth::{hash_password, verify_password, AccessTokenSubject, PasswordOptions, TokenService};
use tms_core::{PartitionKey, RequestTenantContext, Role};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::{TenancyError, TenancyResult};
use crate::manager::TenantSessionManager;
use crate::migrate::MigrationReport;
use crate::provision::PartitionProvisioner;
use crate::session::{Row, SessionPool, SqlValue};

const FIND_USER_BY_EMAIL: &str = "SELECT \"id\" FROM \"user\" WHERE \"email\" = $1";

const INSERT_TENANT: &str = "INSERT INTO \"tenant\" (\"id\", \"name\", \"schema\", \"status\") \
     VALUES ($1, $2, $3, 'provisioning')";

const INSERT_ADMIN: &str = "INSERT INTO \"user\" \
     (\"id\", \"email\", \"passwordHash\", \"name\", \"tenantId\", \"role\") \
     VALUES ($1, $2, $3, $4, $5, 'admin')";

const UPDATE_TENANT_STATUS: &str = "UPDATE \"tenant\" SET \"status\" = $1 WHERE \"id\" = $2";

const FIND_TENANT: &str = "SELECT \"schema\", \"status\" FROM \"tenant\" WHERE \"id\" = $1";

const FIND_UNFINISHED_TENANTS: &str =
    "SELECT \"id\" FROM \"tenant\" WHERE \"status\" <> 'active' ORDER BY \"createdAt\"";

const FIND_CREDENTIALS: &str = "SELECT u.\"id\", u.\"email\", u.\"name\", u.\"passwordHash\", \
     u.\"role\"::text AS \"role\", t.\"id\" AS \"tenantUuid\", t.\"schema\", t.\"status\" \
     FROM \"user\" u JOIN \"tenant\" t ON t.\"id\" = u.\"tenantId\" \
     WHERE u.\"email\" = $1";

/// Health of a tenant's partition, stored on the tenant row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
    Provisioning,
    Active,
    Failed,
}

impl TenantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TenantStatus::Provisioning => "provisioning",
            TenantStatus::Active => "active",
            TenantStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "provisioning" => Some(TenantStatus::Provisioning),
            "active" => Some(TenantStatus::Active),
            "failed" => Some(TenantStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterTenant {
    pub company_name: String,
    pub user_name: String,
    pub email: String,
    pub password: String,
}

impl RegisterTenant {
    fn validate(&self) -> TenancyResult<()> {
        let company = self.company_name.trim().chars().count();
        if !(2..=100).contains(&company) {
            return Err(TenancyError::InvalidInput(
                "companyName must be between 2 and 100 characters".to_string(),
            ));
        }
        let user = self.user_name.trim().chars().count();
        if !(2..=100).contains(&user) {
            return Err(TenancyError::InvalidInput(
                "userName must be between 2 and 100 characters".to_string(),
            ));
        }
        validate_credentials(&self.email, &self.password)
    }
}

fn validate_credentials(email: &str, password: &str) -> TenancyResult<()> {
    let email = email.trim();
    let valid_email = email
        .split_once('@')
        .map(|(local, domain)| !local.is_empty() && domain.contains('.') && !domain.starts_with('.'))
        .unwrap_or(false);
    if !valid_email {
        return Err(TenancyError::InvalidInput("email must be a valid address".to_string()));
    }

    let len = password.chars().count();
    if !(8..=50).contains(&len) {
        return Err(TenancyError::InvalidInput(
            "password must be between 8 and 50 characters".to_string(),
        ));
    }
    Ok(())
}

fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredTenant {
    pub tenant_id: Uuid,
    pub partition_key: PartitionKey,
    pub migrations: MigrationReport,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatedUser {
    pub id: String,
    pub email: String,
    pub name: String,
    pub role: Role,
    pub tenant_id: PartitionKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub access_token: String,
    pub user: AuthenticatedUser,
}

/// Creates tenants (shared rows plus a provisioned partition) and logs users in.
#[derive(Clone)]
pub struct TenantRegistrar {
    pool: Arc<dyn SessionPool>,
    provisioner: PartitionProvisioner,
    tokens: TokenService,
    password: PasswordOptions,
}

impl TenantRegistrar {
    pub fn new(
        pool: Arc<dyn SessionPool>,
        provisioner: PartitionProvisioner,
        tokens: TokenService,
        password: PasswordOptions,
    ) -> Self {
        Self {
            pool,
            provisioner,
            tokens,
            password,
        }
    }

    pub fn provisioner(&self) -> &PartitionProvisioner {
        &self.provisioner
    }

    #[instrument(skip_all, fields(company = %request.company_name))]
    pub async fn register(&self, request: RegisterTenant) -> TenancyResult<RegisteredTenant> {
        request.validate()?;

        let email = normalize_email(&request.email);
        let company_name = request.company_name.trim().to_string();
        let partition_key =
            PartitionKey::from_display_name(&company_name, Utc::now().timestamp_millis())?;
        let tenant_id = Uuid::new_v4();

        let password = request.password;
        let options = self.password.clone();
        let password_hash = tokio::task::spawn_blocking(move || hash_password(&password, &options))
            .await
            .map_err(|e| TenancyError::Internal(e.to_string()))?
            .map_err(|e| TenancyError::Internal(e.to_string()))?;

        let session = self.shared_session();
        let inserted = async {
            if !session
                .raw_query(FIND_USER_BY_EMAIL, &[SqlValue::Text(email.clone())])
                .await?
                .is_empty()
            {
                return Err(TenancyError::Conflict("Email already exists".to_string()));
            }

            session.batch("BEGIN").await?;
            let writes = async {
                session
                    .execute(
                        INSERT_TENANT,
                        &[
                            tenant_id.into(),
                            company_name.clone().into(),
                            partition_key.to_string().into(),
                        ],
                    )
                    .await?;
                session
                    .execute(
                        INSERT_ADMIN,
                        &[
                            Uuid::new_v4().into(),
                            email.clone().into(),
                            password_hash.into(),
                            request.user_name.trim().into(),
                            tenant_id.into(),
                        ],
                    )
                    .await
                    .map_err(|err| match err {
                        // Lost a race with a concurrent registration of the same email.
                        TenancyError::Conflict(_) => TenancyError::Conflict("Email already exists".to_string()),
                        other => other,
                    })?;
                session.batch("COMMIT").await
            }
            .await;

            if writes.is_err() {
                if let Err(err) = session.batch("ROLLBACK").await {
                    warn!(error = %err, "rollback of tenant registration failed");
                }
            }
            writes
        }
        .await;
        session.release().await;
        inserted?;

        info!(partition = %partition_key, tenant = %tenant_id, "tenant created, provisioning partition");

        let migrations = self.finish_provisioning(tenant_id, &partition_key).await?;
        Ok(RegisteredTenant {
            tenant_id,
            partition_key,
            migrations,
        })
    }

    /// Provision a tenant's partition again, picking up where an earlier run
    /// stopped, and mark the tenant active once it succeeds.
    #[instrument(skip(self), fields(tenant = %tenant_id))]
    pub async fn resume_provisioning(&self, tenant_id: Uuid) -> TenancyResult<MigrationReport> {
        let session = self.shared_session();
        let rows = session.raw_query(FIND_TENANT, &[tenant_id.into()]).await;
        session.release().await;

        let row = rows?
            .into_iter()
            .next()
            .ok_or_else(|| TenancyError::NotFound(format!("No tenant with id {tenant_id}")))?;
        let schema = row
            .get("schema")
            .and_then(|v| v.as_str())
            .ok_or_else(|| TenancyError::Internal("tenant row is missing schema".to_string()))?;
        let partition_key = PartitionKey::parse(schema)?;

        self.finish_provisioning(tenant_id, &partition_key).await
    }

    /// Tenants whose partition never finished provisioning, oldest first.
    pub async fn unfinished_tenants(&self) -> TenancyResult<Vec<Uuid>> {
        let session = self.shared_session();
        let rows = session.raw_query(FIND_UNFINISHED_TENANTS, &[]).await;
        session.release().await;

        rows?
            .iter()
            .map(|row| {
                row.get("id")
                    .and_then(|v| v.as_str())
                    .and_then(|raw| Uuid::parse_str(raw).ok())
                    .ok_or_else(|| TenancyError::Internal("tenant row has no usable id".to_string()))
            })
            .collect()
    }

    async fn finish_provisioning(
        &self,
        tenant_id: Uuid,
        partition_key: &PartitionKey,
    ) -> TenancyResult<MigrationReport> {
        match self.provisioner.provision_partition(partition_key).await {
            Ok(report) => {
                self.set_status(tenant_id, TenantStatus::Active).await?;
                Ok(report)
            }
            Err(err) => {
                if let Err(status_err) = self.set_status(tenant_id, TenantStatus::Failed).await {
                    warn!(error = %status_err, tenant = %tenant_id, "could not mark tenant as failed");
                }
                Err(err)
            }
        }
    }

    #[instrument(skip_all)]
    pub async fn login(&self, email: &str, password: &str) -> TenancyResult<LoginResponse> {
        let invalid = || TenancyError::NotAuthenticated("Please check your login credentials".to_string());

        if validate_credentials(email, password).is_err() {
            return Err(invalid());
        }

        let email = normalize_email(email);
        let session = self.shared_session();
        let rows = session
            .raw_query(FIND_CREDENTIALS, &[SqlValue::Text(email)])
            .await;
        session.release().await;

        let Some(row) = rows?.into_iter().next() else {
            return Err(invalid());
        };
        let credentials = Credentials::from_row(&row)?;

        let candidate = password.to_string();
        let stored = credentials.password_hash.clone();
        let verified = tokio::task::spawn_blocking(move || verify_password(&candidate, &stored))
            .await
            .map_err(|e| TenancyError::Internal(e.to_string()))?
            .map_err(|e| TenancyError::Internal(e.to_string()))?;
        if !verified {
            return Err(invalid());
        }

        if credentials.status != TenantStatus::Active {
            warn!(partition = %credentials.partition_key, status = credentials.status.as_str(), "login refused for inactive tenant");
            return Err(TenancyError::Forbidden("Tenant is not active".to_string()));
        }

        let access_token = self
            .tokens
            .create_access_token(&AccessTokenSubject {
                user_id: credentials.id.clone(),
                email: credentials.email.clone(),
                partition_key: credentials.partition_key.clone(),
                tenant_uuid: credentials.tenant_uuid.clone(),
                role: credentials.role,
            })
            .map_err(|e| TenancyError::Internal(e.to_string()))?;

        Ok(LoginResponse {
            access_token,
            user: AuthenticatedUser {
                id: credentials.id,
                email: credentials.email,
                name: credentials.name,
                role: credentials.role,
                tenant_id: credentials.partition_key,
            },
        })
    }

    async fn set_status(&self, tenant_id: Uuid, status: TenantStatus) -> TenancyResult<()> {
        let session = self.shared_session();
        let result = session
            .execute(UPDATE_TENANT_STATUS, &[status.as_str().into(), tenant_id.into()])
            .await;
        session.release().await;
        result.map(|_| ())
    }

    fn shared_session(&self) -> Arc<TenantSessionManager> {
        TenantSessionManager::new(RequestTenantContext::public(), Arc::clone(&self.pool))
    }
}

struct Credentials {
    id: String,
    email: String,
    name: String,
    password_hash: String,
    role: Role,
    tenant_uuid: String,
    partition_key: PartitionKey,
    status: TenantStatus,
}

impl Credentials {
    fn from_row(row: &Row) -> TenancyResult<Self> {
        let text = |column: &str| -> TenancyResult<String> {
            row.get(column)
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| TenancyError::Internal(format!("user row is missing {column}")))
        };

        let role = Role::parse(&text("role")?)
            .ok_or_else(|| TenancyError::Internal("user row has an unknown role".to_string()))?;
        let status = TenantStatus::parse(&text("status")?)
            .ok_or_else(|| TenancyError::Internal("tenant row has an unknown status".to_string()))?;

        Ok(Self {
            id: text("id")?,
            email: text("email")?,
            name: text("name")?,
            password_hash: text("passwordHash")?,
            role,
            tenant_uuid: text("tenantUuid")?,
            partition_key: PartitionKey::parse(text("schema")?)?,
            status,
        })
    }
}
