//! Servers repository.
//!
//! Load updates are expression-level (`load = load + $delta`) so concurrent
//! creates stay correct without read-modify-write races.

use crate::errors::LbError;
use crate::models::{Server, ServerHealth};
use crate::observability::metrics;
use sqlx::{PgConnection, PgPool};
use std::time::Instant;
use tracing::instrument;

#[derive(sqlx::FromRow)]
struct ServerRow {
    id: i64,
    domain: String,
    secret: String,
    enabled: bool,
    health: String,
    errors: i32,
    recover: i32,
    load: f64,
}

impl From<ServerRow> for Server {
    fn from(row: ServerRow) -> Self {
        Server {
            id: row.id,
            domain: row.domain,
            secret: row.secret,
            enabled: row.enabled,
            health: ServerHealth::from_db_str(&row.health),
            errors: row.errors,
            recover: row.recover,
            load: row.load,
        }
    }
}

const SERVER_COLUMNS: &str = "id, domain, secret, enabled, health, errors, recover, load";

/// Repository for server operations.
pub struct ServersRepository;

impl ServersRepository {
    /// All servers, ordered by domain for stable poll ordering.
    ///
    /// # Errors
    ///
    /// Returns `LbError::Database` on database failures.
    #[instrument(skip_all)]
    pub async fn list_all(pool: &PgPool) -> Result<Vec<Server>, LbError> {
        let query = format!("SELECT {SERVER_COLUMNS} FROM servers ORDER BY domain");
        let rows: Vec<ServerRow> = sqlx::query_as(&query).fetch_all(pool).await?;
        Ok(rows.into_iter().map(Server::from).collect())
    }

    /// Look up a server by primary key. Works on the pool or inside a
    /// transaction.
    ///
    /// # Errors
    ///
    /// Returns `LbError::Database` on database failures.
    #[instrument(skip_all, fields(server_id = id))]
    pub async fn get<'e, E>(executor: E, id: i64) -> Result<Option<Server>, LbError>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let query = format!("SELECT {SERVER_COLUMNS} FROM servers WHERE id = $1");
        let row: Option<ServerRow> = sqlx::query_as(&query)
            .bind(id)
            .fetch_optional(executor)
            .await?;
        Ok(row.map(Server::from))
    }

    /// Look up a server by domain (upload token `kid` resolution).
    ///
    /// # Errors
    ///
    /// Returns `LbError::Database` on database failures.
    #[instrument(skip_all, fields(domain = %domain))]
    pub async fn find_by_domain(pool: &PgPool, domain: &str) -> Result<Option<Server>, LbError> {
        let query = format!("SELECT {SERVER_COLUMNS} FROM servers WHERE domain = $1");
        let row: Option<ServerRow> = sqlx::query_as(&query)
            .bind(domain)
            .fetch_optional(pool)
            .await?;
        Ok(row.map(Server::from))
    }

    /// Select the best server for a new meeting, with a row lock.
    ///
    /// Eligible servers are enabled AND healthy; the least loaded wins.
    /// Must run inside the caller's create transaction.
    ///
    /// # Errors
    ///
    /// Returns `LbError::Database` on database failures.
    #[instrument(skip_all)]
    pub async fn select_best_for_update(
        conn: &mut PgConnection,
    ) -> Result<Option<Server>, LbError> {
        let start = Instant::now();

        let query = format!(
            "SELECT {SERVER_COLUMNS} FROM servers \
             WHERE enabled AND health = 'available' \
             ORDER BY load ASC LIMIT 1 \
             FOR UPDATE"
        );
        let row: Result<Option<ServerRow>, sqlx::Error> =
            sqlx::query_as(&query).fetch_optional(&mut *conn).await;

        let status = if row.is_ok() { "success" } else { "error" };
        metrics::record_db_query("select_best_server", status, start.elapsed());

        Ok(row?.map(Server::from))
    }

    /// Atomically bump a server's load estimate. Expression-level so
    /// concurrent creates see each other's increments.
    ///
    /// # Errors
    ///
    /// Returns `LbError::Database` on database failures.
    #[instrument(skip_all, fields(server_id = id, delta = delta))]
    pub async fn bump_load<'e, E>(executor: E, id: i64, delta: f64) -> Result<(), LbError>
    where
        E: sqlx::PgExecutor<'e>,
    {
        sqlx::query("UPDATE servers SET load = load + $2 WHERE id = $1")
            .bind(id)
            .bind(delta)
            .execute(executor)
            .await?;
        Ok(())
    }

    /// Persist the poll outcome: load estimate, health and counters.
    ///
    /// # Errors
    ///
    /// Returns `LbError::Database` on database failures.
    #[instrument(skip_all, fields(server_id = server.id, health = server.health.as_db_str()))]
    pub async fn update_poll_result(
        conn: &mut PgConnection,
        server: &Server,
    ) -> Result<(), LbError> {
        let start = Instant::now();

        let result = sqlx::query(
            "UPDATE servers SET load = $2, health = $3, errors = $4, recover = $5 WHERE id = $1",
        )
        .bind(server.id)
        .bind(server.load)
        .bind(server.health.as_db_str())
        .bind(server.errors)
        .bind(server.recover)
        .execute(&mut *conn)
        .await;

        let status = if result.is_ok() { "success" } else { "error" };
        metrics::record_db_query("update_poll_result", status, start.elapsed());

        result?;
        Ok(())
    }

    /// Servers that currently host at least one meeting of the tenant.
    ///
    /// Used by getMeetings fan-out, so only servers with something to report
    /// are contacted.
    ///
    /// # Errors
    ///
    /// Returns `LbError::Database` on database failures.
    #[instrument(skip_all, fields(tenant_id = tenant_fk))]
    pub async fn with_meetings_for_tenant(
        pool: &PgPool,
        tenant_fk: i64,
    ) -> Result<Vec<Server>, LbError> {
        let query = "SELECT DISTINCT s.id, s.domain, s.secret, s.enabled, s.health, \
                            s.errors, s.recover, s.load \
             FROM servers s JOIN meetings m ON m.server_fk = s.id \
             WHERE m.tenant_fk = $1";
        let rows: Vec<ServerRow> = sqlx::query_as(query).bind(tenant_fk).fetch_all(pool).await?;
        Ok(rows.into_iter().map(Server::from).collect())
    }
}
