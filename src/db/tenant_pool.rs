// Tenant-Aware Pool
// The single enforcement point for tenant isolation at query time.
//
// Physical connections are shared by every tenant, so a connection last used
// with tenant A's search path can be handed to tenant B. Every standalone
// statement therefore re-asserts the search path on the connection it actually
// got, as a separate statement, right before running. Transactions pin one
// connection and set the path once with SET LOCAL.

use crate::context::Context;
use crate::db::health::HealthStatus;
use crate::db::metrics::PoolStats;
use crate::db::pool::{Params, PgConnection, Pool};
use crate::db::schema::{generate_schema_name, search_path_sql, validate_identifier};
use crate::error::{DatabaseError, Result};
use crate::tenant::TenantId;
use async_trait::async_trait;
use tokio_postgres::Row;
use tracing::{debug, warn};

/// Statement execution shared by the pool and transactions, so repository code
/// can run either inside or outside a transaction
#[async_trait]
pub trait Executor: Send + Sync {
    async fn query(&self, ctx: &Context, sql: &str, params: Params<'_>) -> Result<Vec<Row>>;

    async fn query_one(&self, ctx: &Context, sql: &str, params: Params<'_>) -> Result<Row>;

    async fn query_opt(&self, ctx: &Context, sql: &str, params: Params<'_>)
        -> Result<Option<Row>>;

    async fn execute(&self, ctx: &Context, sql: &str, params: Params<'_>) -> Result<u64>;
}

/// Pool wrapper that refuses to run anything without a tenant in the context
#[derive(Debug, Clone)]
pub struct TenantPool {
    pool: Pool,
}

impl TenantPool {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// The wrapped pool, for provisioning and health endpoints
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Resolve the tenant's schema or reject the operation outright
    fn require_tenant(ctx: &Context, operation: &'static str) -> Result<(TenantId, String)> {
        if !ctx.has_tenant() {
            warn!(operation, "database operation attempted without a tenant context");
            return Err(DatabaseError::SecurityViolation(format!(
                "{} attempted without a tenant context",
                operation
            )));
        }

        let tenant_id = ctx.tenant_id()?;
        let schema = generate_schema_name(&tenant_id);
        validate_identifier(&schema)?;
        Ok((tenant_id, schema))
    }

    /// Check out a connection and point it at `schema`, whatever it was used for before
    async fn scoped_connection(&self, ctx: &Context, schema: &str) -> Result<PgConnection> {
        let conn = self.pool.acquire(ctx).await?;
        self.pool
            .run_statement(ctx, &conn, async {
                conn.batch_execute(&search_path_sql(schema, false))
                    .await
                    .map_err(|e| DatabaseError::query("set search_path", e))
            })
            .await?;
        debug!(schema, "search path asserted");
        Ok(conn)
    }

    pub async fn query(&self, ctx: &Context, sql: &str, params: Params<'_>) -> Result<Vec<Row>> {
        let (_, schema) = Self::require_tenant(ctx, "query")?;
        let conn = self.scoped_connection(ctx, &schema).await?;
        let result = self
            .pool
            .run_statement(ctx, &conn, async {
                conn.query(sql, params)
                    .await
                    .map_err(|e| DatabaseError::query("query", e))
            })
            .await;
        self.pool.metrics().record_query(result.is_ok());
        result
    }

    /// Exactly one row, or an error
    pub async fn query_one(&self, ctx: &Context, sql: &str, params: Params<'_>) -> Result<Row> {
        let (_, schema) = Self::require_tenant(ctx, "query_row")?;
        let conn = self.scoped_connection(ctx, &schema).await?;
        let result = self
            .pool
            .run_statement(ctx, &conn, async {
                conn.query_one(sql, params)
                    .await
                    .map_err(|e| DatabaseError::query("query_row", e))
            })
            .await;
        self.pool.metrics().record_query(result.is_ok());
        result
    }

    pub async fn query_opt(
        &self,
        ctx: &Context,
        sql: &str,
        params: Params<'_>,
    ) -> Result<Option<Row>> {
        let (_, schema) = Self::require_tenant(ctx, "query_opt")?;
        let conn = self.scoped_connection(ctx, &schema).await?;
        let result = self
            .pool
            .run_statement(ctx, &conn, async {
                conn.query_opt(sql, params)
                    .await
                    .map_err(|e| DatabaseError::query("query_opt", e))
            })
            .await;
        self.pool.metrics().record_query(result.is_ok());
        result
    }

    /// Returns the number of rows affected
    pub async fn execute(&self, ctx: &Context, sql: &str, params: Params<'_>) -> Result<u64> {
        let (_, schema) = Self::require_tenant(ctx, "exec")?;
        let conn = self.scoped_connection(ctx, &schema).await?;
        let result = self
            .pool
            .run_statement(ctx, &conn, async {
                conn.execute(sql, params)
                    .await
                    .map_err(|e| DatabaseError::query("exec", e))
            })
            .await;
        self.pool.metrics().record_query(result.is_ok());
        result
    }

    /// Open a transaction pinned to one connection, scoped to the tenant's schema
    pub async fn begin(&self, ctx: &Context) -> Result<TenantTransaction> {
        let (tenant_id, schema) = Self::require_tenant(ctx, "begin")?;
        let conn = self.pool.acquire(ctx).await?;

        let tx = TenantTransaction {
            conn: Some(conn),
            pool: self.pool.clone(),
            schema,
            tenant_id,
        };
        // On failure tx is dropped here, which rolls back before the connection is reused
        ctx.run(tx.start()).await?;
        Ok(tx)
    }

    pub fn close(&self) {
        self.pool.close();
    }

    pub async fn health_check(&self, ctx: &Context) -> HealthStatus {
        self.pool.health_check(ctx).await
    }

    pub async fn is_healthy(&self, ctx: &Context) -> bool {
        self.pool.is_healthy(ctx).await
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }
}

#[async_trait]
impl Executor for TenantPool {
    async fn query(&self, ctx: &Context, sql: &str, params: Params<'_>) -> Result<Vec<Row>> {
        TenantPool::query(self, ctx, sql, params).await
    }

    async fn query_one(&self, ctx: &Context, sql: &str, params: Params<'_>) -> Result<Row> {
        TenantPool::query_one(self, ctx, sql, params).await
    }

    async fn query_opt(
        &self,
        ctx: &Context,
        sql: &str,
        params: Params<'_>,
    ) -> Result<Option<Row>> {
        TenantPool::query_opt(self, ctx, sql, params).await
    }

    async fn execute(&self, ctx: &Context, sql: &str, params: Params<'_>) -> Result<u64> {
        TenantPool::execute(self, ctx, sql, params).await
    }
}

// ============================================================================
// Transactions
// ============================================================================

/// Transaction on a pinned connection. Finish it with `commit` or `rollback`;
/// dropping it unfinished rolls back on a background task, or inline when the
/// dropping thread has no runtime.
///
/// If that rollback fails while the server connection is still open, the
/// connection returns to the pool inside the abandoned transaction. A failing
/// rollback on a live connection normally means the connection is broken, and
/// bb8 then discards it.
pub struct TenantTransaction {
    conn: Option<PgConnection>,
    pool: Pool,
    schema: String,
    tenant_id: TenantId,
}

impl TenantTransaction {
    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    fn conn(&self) -> Result<&PgConnection> {
        self.conn
            .as_ref()
            .ok_or_else(|| DatabaseError::query("transaction", "transaction already finished"))
    }

    async fn start(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.batch_execute("BEGIN")
            .await
            .map_err(|e| DatabaseError::query("begin", e))?;
        conn.batch_execute(&search_path_sql(&self.schema, true))
            .await
            .map_err(|e| DatabaseError::query("set search_path", e))?;
        debug!(schema = %self.schema, "transaction started");
        Ok(())
    }

    pub async fn query(&self, ctx: &Context, sql: &str, params: Params<'_>) -> Result<Vec<Row>> {
        let conn = self.conn()?;
        let result = self
            .pool
            .run_statement(ctx, conn, async {
                conn.query(sql, params)
                    .await
                    .map_err(|e| DatabaseError::query("query", e))
            })
            .await;
        self.pool.metrics().record_query(result.is_ok());
        result
    }

    pub async fn query_one(&self, ctx: &Context, sql: &str, params: Params<'_>) -> Result<Row> {
        let conn = self.conn()?;
        let result = self
            .pool
            .run_statement(ctx, conn, async {
                conn.query_one(sql, params)
                    .await
                    .map_err(|e| DatabaseError::query("query_row", e))
            })
            .await;
        self.pool.metrics().record_query(result.is_ok());
        result
    }

    pub async fn query_opt(
        &self,
        ctx: &Context,
        sql: &str,
        params: Params<'_>,
    ) -> Result<Option<Row>> {
        let conn = self.conn()?;
        let result = self
            .pool
            .run_statement(ctx, conn, async {
                conn.query_opt(sql, params)
                    .await
                    .map_err(|e| DatabaseError::query("query_opt", e))
            })
            .await;
        self.pool.metrics().record_query(result.is_ok());
        result
    }

    pub async fn execute(&self, ctx: &Context, sql: &str, params: Params<'_>) -> Result<u64> {
        let conn = self.conn()?;
        let result = self
            .pool
            .run_statement(ctx, conn, async {
                conn.execute(sql, params)
                    .await
                    .map_err(|e| DatabaseError::query("exec", e))
            })
            .await;
        self.pool.metrics().record_query(result.is_ok());
        result
    }

    pub async fn commit(mut self, ctx: &Context) -> Result<()> {
        self.finish(ctx, "COMMIT", "commit").await
    }

    pub async fn rollback(mut self, ctx: &Context) -> Result<()> {
        self.finish(ctx, "ROLLBACK", "rollback").await
    }

    async fn finish(
        &mut self,
        ctx: &Context,
        statement: &str,
        operation: &'static str,
    ) -> Result<()> {
        let conn = self.conn()?;
        let result = self
            .pool
            .run_statement(ctx, conn, async {
                conn.batch_execute(statement)
                    .await
                    .map_err(|e| DatabaseError::query(operation, e))
            })
            .await;

        // Only a clean finish releases the connection directly; otherwise Drop rolls back
        if result.is_ok() {
            self.conn.take();
            debug!(schema = %self.schema, operation, "transaction finished");
        }
        result
    }
}

impl std::fmt::Debug for TenantTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantTransaction")
            .field("schema", &self.schema)
            .field("finished", &self.conn.is_none())
            .finish()
    }
}

impl Drop for TenantTransaction {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };

        let schema = std::mem::take(&mut self.schema);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    match conn.batch_execute("ROLLBACK").await {
                        Ok(()) => debug!(schema = %schema, "unfinished transaction rolled back"),
                        Err(e) => warn!(
                            schema = %schema,
                            error = %e,
                            "rollback of unfinished transaction failed"
                        ),
                    }
                });
            }
            // No runtime on this thread: roll back on a throwaway one before the
            // connection goes back to the pool
            Err(_) => match rollback_blocking(&conn) {
                Ok(()) => debug!(schema = %schema, "unfinished transaction rolled back"),
                Err(message) => warn!(
                    schema = %schema,
                    error = %message,
                    "rollback of unfinished transaction failed outside a runtime"
                ),
            },
        }
    }
}

/// Upper bound on a rollback issued from a thread without a runtime
const BLOCKING_ROLLBACK_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

fn rollback_blocking(conn: &PgConnection) -> std::result::Result<(), String> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .map_err(|e| e.to_string())?;
    runtime.block_on(async {
        let rollback = conn.batch_execute("ROLLBACK");
        match tokio::time::timeout(BLOCKING_ROLLBACK_TIMEOUT, rollback).await {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(_) => Err("timed out".to_string()),
        }
    })
}

#[async_trait]
impl Executor for TenantTransaction {
    async fn query(&self, ctx: &Context, sql: &str, params: Params<'_>) -> Result<Vec<Row>> {
        TenantTransaction::query(self, ctx, sql, params).await
    }

    async fn query_one(&self, ctx: &Context, sql: &str, params: Params<'_>) -> Result<Row> {
        TenantTransaction::query_one(self, ctx, sql, params).await
    }

    async fn query_opt(
        &self,
        ctx: &Context,
        sql: &str,
        params: Params<'_>,
    ) -> Result<Option<Row>> {
        TenantTransaction::query_opt(self, ctx, sql, params).await
    }

    async fn execute(&self, ctx: &Context, sql: &str, params: Params<'_>) -> Result<u64> {
        TenantTransaction::execute(self, ctx, sql, params).await
    }
}
