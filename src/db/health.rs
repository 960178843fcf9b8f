// Health Monitor
// Active probe of the pool: a ping plus a trivial round-trip query, bounded by
// a fixed timeout that ignores whatever deadline the caller carries

use crate::context::Context;
use crate::db::metrics::PoolStats;
use crate::db::pool::Pool;
use crate::error::{DatabaseError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Upper bound for a single health check
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of one health check. Every field is populated whether or not the
/// probe succeeded.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub response_time_ms: u64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
    pub stats: PoolStats,
    pub checked_at: DateTime<Utc>,
}

impl Pool {
    /// Ping the pool and run `SELECT 1`
    pub async fn health_check(&self, ctx: &Context) -> HealthStatus {
        let probe_ctx = ctx.detached_with_timeout(HEALTH_CHECK_TIMEOUT);
        let started = Instant::now();

        let result = probe_ctx.run(self.probe(&probe_ctx)).await;
        let response_time_ms = started.elapsed().as_millis() as u64;

        let error = match result {
            Ok(()) => {
                debug!(response_time_ms, "database health check passed");
                String::new()
            }
            Err(err) => {
                let message = match err {
                    DatabaseError::DeadlineExceeded => format!(
                        "health check timed out after {}s",
                        HEALTH_CHECK_TIMEOUT.as_secs()
                    ),
                    other => other.to_string(),
                };
                warn!(response_time_ms, error = %message, "database health check failed");
                message
            }
        };

        HealthStatus {
            healthy: error.is_empty(),
            response_time_ms,
            error,
            stats: self.stats(),
            checked_at: Utc::now(),
        }
    }

    /// Convenience wrapper over `health_check`
    pub async fn is_healthy(&self, ctx: &Context) -> bool {
        self.health_check(ctx).await.healthy
    }

    async fn probe(&self, ctx: &Context) -> Result<()> {
        let conn = self.acquire(ctx).await?;

        conn.simple_query("")
            .await
            .map_err(|e| DatabaseError::query("ping", e))?;

        let row = conn
            .query_one("SELECT 1", &[])
            .await
            .map_err(|e| DatabaseError::query("health query", e))?;
        let value: i32 = row
            .try_get(0)
            .map_err(|e| DatabaseError::query("health query", e))?;
        if value != 1 {
            return Err(DatabaseError::query(
                "health query",
                format!("unexpected result {}", value),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::pool::tests::unreachable_settings;

    #[tokio::test]
    async fn test_failed_check_is_fully_populated() {
        let pool = Pool::unconnected(unreachable_settings()).unwrap();
        let status = pool.health_check(&Context::background()).await;

        assert!(!status.healthy);
        // The refused connect is reported, not just bb8's timeout
        assert!(status.error.contains("error connecting to server"), "{}", status.error);
        assert!(status.response_time_ms < HEALTH_CHECK_TIMEOUT.as_millis() as u64 + 1000);
        assert_eq!(status.stats.max_conns, 2);
        assert!(!pool.is_healthy(&Context::background()).await);
    }

    #[tokio::test]
    async fn test_expired_caller_deadline_still_gets_an_attempt() {
        let pool = Pool::unconnected(unreachable_settings()).unwrap();
        let expired = Context::background().with_timeout(Duration::ZERO);

        let status = pool.health_check(&expired).await;

        // The probe ran (and failed on the network), rather than being cut
        // short by the caller's deadline
        assert!(!status.healthy);
        assert!(!status.error.contains("Deadline"));
        assert_eq!(status.stats.acquire_error_count, 1);
    }

    #[tokio::test]
    async fn test_closed_pool_reports_unhealthy() {
        let pool = Pool::unconnected(unreachable_settings()).unwrap();
        pool.close();
        let status = pool.health_check(&Context::background()).await;
        assert!(!status.healthy);
        assert_eq!(status.error, "Pool is closed");
        assert_eq!(status.stats.total_conns, 0);
    }

    #[test]
    fn test_json_shape() {
        let healthy = HealthStatus {
            healthy: true,
            response_time_ms: 3,
            error: String::new(),
            stats: PoolStats::default(),
            checked_at: Utc::now(),
        };
        let json = serde_json::to_value(&healthy).unwrap();
        assert_eq!(json["healthy"], true);
        assert_eq!(json["response_time_ms"], 3);
        assert!(json.get("error").is_none());
        assert!(json["stats"].is_object());

        let failed = HealthStatus {
            healthy: false,
            error: "connection refused".to_string(),
            ..healthy
        };
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["error"], "connection refused");
    }
}
