// PostgreSQL Connection Pool
// Wraps a bb8 pool of tokio-postgres connections shared by every tenant.
// Construction retries at a fixed interval and probes liveness before
// handing the pool out; every checkout is recorded in the embedded metrics.

use crate::context::Context;
use crate::db::config::{ConnectionSettings, SslMode};
use crate::db::metrics::{PoolMetrics, PoolStats};
use crate::error::{DatabaseError, Result};
use bb8::{ErrorSink, ManageConnection};
use bb8_postgres::PostgresConnectionManager;
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tokio_postgres::types::ToSql;
use tokio_postgres::{CancelToken, Row};
use tracing::{debug, info, warn};

pub type PgManager = PostgresConnectionManager<MakeTlsConnector>;
pub type PgPool = bb8::Pool<PgManager>;
/// A checked-out connection; returned to the pool on drop
pub type PgConnection = bb8::PooledConnection<'static, PgManager>;

/// Statement parameters as accepted by tokio-postgres
pub type Params<'a> = &'a [&'a (dyn ToSql + Sync)];

// ============================================================================
// Retry
// ============================================================================

/// Run `attempt` up to `max_retries + 1` times, sleeping a fixed `interval`
/// between failures. The closure receives the 1-based attempt number.
pub async fn retry_with_interval<T, E, F, Fut>(
    max_retries: u32,
    interval: Duration,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: fmt::Display,
{
    let max_attempts = max_retries.saturating_add(1);
    let mut last_error = String::new();

    for n in 1..=max_attempts {
        match attempt(n).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                last_error = err.to_string();
                if n < max_attempts {
                    warn!(
                        attempt = n,
                        max_attempts,
                        retry_in_ms = interval.as_millis() as u64,
                        error = %last_error,
                        "database connection attempt failed, retrying"
                    );
                    tokio::time::sleep(interval).await;
                } else {
                    warn!(
                        attempt = n,
                        max_attempts,
                        error = %last_error,
                        "database connection attempt failed, giving up"
                    );
                }
            }
        }
    }

    Err(DatabaseError::Connection {
        attempts: max_attempts,
        message: last_error,
    })
}

// ============================================================================
// Pool
// ============================================================================

struct Shared {
    inner: RwLock<Option<PgPool>>,
    metrics: PoolMetrics,
    settings: ConnectionSettings,
    tls: MakeTlsConnector,
    connect_errors: LastConnectError,
}

/// Most recent failure of a connect bb8 ran in the background. bb8 itself only
/// reports "timed out" to the waiting caller.
#[derive(Debug, Clone, Default)]
struct LastConnectError(Arc<Mutex<Option<String>>>);

impl LastConnectError {
    fn take(&self) -> Option<String> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

impl ErrorSink<tokio_postgres::Error> for LastConnectError {
    fn sink(&self, error: tokio_postgres::Error) {
        debug!(error = %error, "background connect failed");
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(error.to_string());
    }

    fn boxed_clone(&self) -> Box<dyn ErrorSink<tokio_postgres::Error>> {
        Box::new(self.clone())
    }
}

/// Shared connection pool. Cloning is cheap and every clone sees the same connections.
#[derive(Clone)]
pub struct Pool {
    shared: Arc<Shared>,
}

impl Pool {
    /// Build the pool and probe it, retrying transient failures.
    /// Never returns a pool that failed its liveness probe.
    pub async fn connect(settings: ConnectionSettings) -> Result<Self> {
        settings.validate()?;
        // Bad settings are not transient; fail before the retry loop
        let tls = tls_connector(settings.ssl_mode)?;
        let manager = build_manager(&settings, tls.clone())?;
        let connect_errors = LastConnectError::default();

        let pool = retry_with_interval(settings.max_retries, settings.retry_interval, |attempt| {
            let manager = manager.clone();
            let settings = &settings;
            let connect_errors = &connect_errors;
            async move {
                let pool = establish(manager, settings, connect_errors).await?;
                info!(
                    target_db = %settings.target(),
                    attempt,
                    max_conns = settings.max_conns,
                    min_conns = settings.min_conns,
                    "database pool established"
                );
                Ok::<_, DatabaseError>(pool)
            }
        })
        .await?;

        Ok(Self::from_parts(pool, settings, tls, connect_errors))
    }

    /// Pool without any established connection; connections open on first use
    #[cfg(test)]
    pub(crate) fn unconnected(settings: ConnectionSettings) -> Result<Self> {
        let tls = tls_connector(settings.ssl_mode)?;
        let manager = build_manager(&settings, tls.clone())?;
        let connect_errors = LastConnectError::default();
        let pool = pool_builder(&settings, &connect_errors).build_unchecked(manager);
        Ok(Self::from_parts(pool, settings, tls, connect_errors))
    }

    fn from_parts(
        pool: PgPool,
        settings: ConnectionSettings,
        tls: MakeTlsConnector,
        connect_errors: LastConnectError,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: RwLock::new(Some(pool)),
                metrics: PoolMetrics::new(),
                settings,
                tls,
                connect_errors,
            }),
        }
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.shared.settings
    }

    pub fn metrics(&self) -> &PoolMetrics {
        &self.shared.metrics
    }

    pub fn is_closed(&self) -> bool {
        self.shared
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Release the pool. Idle connections close once in-flight checkouts are returned;
    /// afterwards every acquire fails with `PoolClosed`.
    pub fn close(&self) {
        let pool = self
            .shared
            .inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if pool.is_some() {
            info!(target_db = %self.shared.settings.target(), "database pool closed");
        }
    }

    /// Point-in-time statistics; only copies counters
    pub fn stats(&self) -> PoolStats {
        let (total, idle) = match self.handle() {
            Ok(pool) => {
                let state = pool.state();
                (state.connections, state.idle_connections)
            }
            Err(_) => (0, 0),
        };
        self.shared
            .metrics
            .snapshot(total, idle, self.shared.settings.max_conns)
    }

    fn handle(&self) -> Result<PgPool> {
        self.shared
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .cloned()
            .ok_or(DatabaseError::PoolClosed)
    }

    /// Check out a connection, honoring the context's deadline and cancellation
    pub async fn acquire(&self, ctx: &Context) -> Result<PgConnection> {
        let pool = self.handle()?;
        let waited = pool.state().idle_connections == 0;
        let started = Instant::now();

        let result = ctx
            .run(async {
                pool.get_owned().await.map_err(|e| match e {
                    bb8::RunError::TimedOut => self.acquire_timed_out(),
                    other => DatabaseError::from(other),
                })
            })
            .await;

        let metrics = &self.shared.metrics;
        match result {
            Ok(conn) => {
                self.shared.connect_errors.take();
                metrics.record_acquire(started.elapsed(), waited);
                Ok(conn)
            }
            Err(err @ (DatabaseError::Cancelled | DatabaseError::DeadlineExceeded)) => {
                metrics.record_canceled_acquire();
                Err(err)
            }
            Err(err) => {
                metrics.record_acquire_error();
                Err(err)
            }
        }
    }

    /// A checkout timeout names the connect failure behind it, when there was one
    fn acquire_timed_out(&self) -> DatabaseError {
        match self.shared.connect_errors.take() {
            Some(cause) => DatabaseError::query(
                "acquire",
                format!("timed out waiting for a connection, last connect error: {}", cause),
            ),
            None => DatabaseError::from(bb8::RunError::<tokio_postgres::Error>::TimedOut),
        }
    }

    /// Run one statement on `conn` under the context. A statement the context
    /// abandons is cancelled on the server before `conn` can go back to the pool.
    pub(crate) async fn run_statement<T, F>(
        &self,
        ctx: &Context,
        conn: &PgConnection,
        statement: F,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        // A context that is already done never sends the statement
        let sent = !ctx.is_done();
        let cancel_token = conn.cancel_token();
        let result = ctx.run(statement).await;
        let abandoned = matches!(
            result,
            Err(DatabaseError::Cancelled | DatabaseError::DeadlineExceeded)
        );
        if sent && abandoned {
            self.cancel_abandoned(conn, cancel_token).await;
        }
        result
    }

    async fn cancel_abandoned(&self, conn: &PgConnection, cancel_token: CancelToken) {
        let budget = self.shared.settings.connect_timeout;
        let cleanup = async {
            cancel_token.cancel_query(self.shared.tls.clone()).await?;
            // Round trip so the cancelled statement has finished before the connection is reused
            conn.simple_query("").await.map(|_| ())
        };
        match tokio::time::timeout(budget, cleanup).await {
            Ok(Ok(())) => debug!("abandoned statement cancelled"),
            // The cancelled statement's own error can surface here; the connection is idle
            Ok(Err(e)) => debug!(error = %e, "cancel of abandoned statement reported an error"),
            Err(_) => warn!(
                timeout_ms = budget.as_millis() as u64,
                "cancel of abandoned statement did not finish in time"
            ),
        }
    }

    // ------------------------------------------------------------------------
    // Unscoped statements, for provisioning against explicit schema names only.
    // The session search path is reset first so no tenant's path lingers.
    // ------------------------------------------------------------------------

    /// Execute a statement that names every schema explicitly
    pub async fn execute_unscoped(
        &self,
        ctx: &Context,
        sql: &str,
        params: Params<'_>,
    ) -> Result<u64> {
        let conn = self.acquire(ctx).await?;
        let result = self
            .run_statement(ctx, &conn, async {
                conn.batch_execute("RESET search_path")
                    .await
                    .map_err(|e| DatabaseError::query("reset search_path", e))?;
                conn.execute(sql, params)
                    .await
                    .map_err(|e| DatabaseError::query("exec", e))
            })
            .await;
        self.shared.metrics.record_query(result.is_ok());
        result
    }

    /// Query with statements that name every schema explicitly
    pub async fn query_unscoped(
        &self,
        ctx: &Context,
        sql: &str,
        params: Params<'_>,
    ) -> Result<Vec<Row>> {
        let conn = self.acquire(ctx).await?;
        let result = self
            .run_statement(ctx, &conn, async {
                conn.batch_execute("RESET search_path")
                    .await
                    .map_err(|e| DatabaseError::query("reset search_path", e))?;
                conn.query(sql, params)
                    .await
                    .map_err(|e| DatabaseError::query("query", e))
            })
            .await;
        self.shared.metrics.record_query(result.is_ok());
        result
    }

    /// Single-row variant of `query_unscoped`
    pub async fn query_one_unscoped(
        &self,
        ctx: &Context,
        sql: &str,
        params: Params<'_>,
    ) -> Result<Row> {
        let conn = self.acquire(ctx).await?;
        let result = self
            .run_statement(ctx, &conn, async {
                conn.batch_execute("RESET search_path")
                    .await
                    .map_err(|e| DatabaseError::query("reset search_path", e))?;
                conn.query_one(sql, params)
                    .await
                    .map_err(|e| DatabaseError::query("query_row", e))
            })
            .await;
        self.shared.metrics.record_query(result.is_ok());
        result
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("target", &self.shared.settings.target())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Certificate checks applied once TLS is negotiated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TlsOptions {
    pub accept_invalid_certs: bool,
    pub accept_invalid_hostnames: bool,
}

impl TlsOptions {
    /// prefer and require encrypt without verifying the server, as libpq does.
    /// disable never negotiates TLS, so its options are never consulted.
    pub(crate) fn for_mode(mode: SslMode) -> Self {
        let unverified = matches!(mode, SslMode::Prefer | SslMode::Require);
        Self {
            accept_invalid_certs: unverified,
            accept_invalid_hostnames: unverified,
        }
    }
}

fn tls_connector(mode: SslMode) -> Result<MakeTlsConnector> {
    let options = TlsOptions::for_mode(mode);
    let connector = TlsConnector::builder()
        .danger_accept_invalid_certs(options.accept_invalid_certs)
        .danger_accept_invalid_hostnames(options.accept_invalid_hostnames)
        .build()
        .map_err(|e| DatabaseError::Config(format!("failed to initialise TLS: {}", e)))?;
    Ok(MakeTlsConnector::new(connector))
}

fn build_manager(settings: &ConnectionSettings, tls: MakeTlsConnector) -> Result<PgManager> {
    PostgresConnectionManager::new_from_stringlike(settings.connection_string(), tls)
        .map_err(|e| DatabaseError::Config(e.to_string()))
}

fn pool_builder(
    settings: &ConnectionSettings,
    connect_errors: &LastConnectError,
) -> bb8::Builder<PgManager> {
    bb8::Pool::builder()
        .max_size(settings.max_conns)
        .min_idle(Some(settings.min_conns))
        .max_lifetime(Some(settings.max_conn_lifetime))
        .idle_timeout(Some(settings.max_conn_idle_time))
        .connection_timeout(settings.connect_timeout)
        // Pool::connect owns retries; a failed connect must not be retried again inside bb8
        .retry_connection(false)
        .error_sink(Box::new(connect_errors.clone()))
}

/// One construction attempt: probe a direct connection with SELECT 1, then build
/// the pool. Both steps report the driver's own error.
async fn establish(
    manager: PgManager,
    settings: &ConnectionSettings,
    connect_errors: &LastConnectError,
) -> Result<PgPool> {
    {
        let client = manager
            .connect()
            .await
            .map_err(|e| DatabaseError::query("connect", e))?;
        let row = client
            .query_one("SELECT 1", &[])
            .await
            .map_err(|e| DatabaseError::query("probe", e))?;
        let value: i32 = row
            .try_get(0)
            .map_err(|e| DatabaseError::query("probe", e))?;
        if value != 1 {
            return Err(DatabaseError::query(
                "probe",
                format!("SELECT 1 returned {}", value),
            ));
        }
    }
    debug!(target_db = %settings.target(), "liveness probe passed");

    pool_builder(settings, connect_errors)
        .build(manager)
        .await
        .map_err(|e| DatabaseError::query("connect", e))
}
