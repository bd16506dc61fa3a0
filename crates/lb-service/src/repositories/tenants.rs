//! Tenants repository.

use crate::errors::LbError;
use crate::models::Tenant;
use crate::observability::metrics;
use sqlx::types::Json;
use sqlx::PgPool;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::instrument;

#[derive(sqlx::FromRow)]
struct TenantRow {
    id: i64,
    name: String,
    realm: String,
    secret: String,
    enabled: bool,
    overrides: Json<BTreeMap<String, String>>,
}

impl From<TenantRow> for Tenant {
    fn from(row: TenantRow) -> Self {
        Tenant {
            id: row.id,
            name: row.name,
            realm: row.realm,
            secret: row.secret,
            enabled: row.enabled,
            overrides: row.overrides.0,
        }
    }
}

const TENANT_COLUMNS: &str = "id, name, realm, secret, enabled, overrides";

/// Repository for tenant lookups.
pub struct TenantsRepository;

impl TenantsRepository {
    /// Look up an enabled tenant by its routing realm.
    ///
    /// Disabled tenants are invisible here on purpose: they must fail the
    /// checksum step exactly like unknown ones.
    ///
    /// # Errors
    ///
    /// Returns `LbError::Database` on database failures.
    #[instrument(skip_all, fields(realm = %realm))]
    pub async fn find_enabled_by_realm(
        pool: &PgPool,
        realm: &str,
    ) -> Result<Option<Tenant>, LbError> {
        let start = Instant::now();

        let query = format!(
            "SELECT {TENANT_COLUMNS} FROM tenants WHERE realm = $1 AND enabled"
        );
        let row: Result<Option<TenantRow>, sqlx::Error> = sqlx::query_as(&query)
            .bind(realm)
            .fetch_optional(pool)
            .await;

        let status = if row.is_ok() { "success" } else { "error" };
        metrics::record_db_query("find_tenant_by_realm", status, start.elapsed());

        Ok(row?.map(Tenant::from))
    }

    /// Look up a tenant by name (recording import, admin paths).
    ///
    /// # Errors
    ///
    /// Returns `LbError::Database` on database failures.
    #[instrument(skip_all, fields(name = %name))]
    pub async fn find_by_name(pool: &PgPool, name: &str) -> Result<Option<Tenant>, LbError> {
        let query = format!("SELECT {TENANT_COLUMNS} FROM tenants WHERE name = $1");
        let row: Option<TenantRow> = sqlx::query_as(&query).bind(name).fetch_optional(pool).await?;
        Ok(row.map(Tenant::from))
    }

    /// Look up a tenant by primary key.
    ///
    /// # Errors
    ///
    /// Returns `LbError::Database` on database failures.
    #[instrument(skip_all, fields(tenant_id = id))]
    pub async fn get(pool: &PgPool, id: i64) -> Result<Option<Tenant>, LbError> {
        let query = format!("SELECT {TENANT_COLUMNS} FROM tenants WHERE id = $1");
        let row: Option<TenantRow> = sqlx::query_as(&query).bind(id).fetch_optional(pool).await?;
        Ok(row.map(Tenant::from))
    }
}
