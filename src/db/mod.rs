// Database Module
// Connection settings, the shared pool, health checks, schema provisioning
// and the tenant-scoped query layer

pub mod config;
pub mod health;
pub mod metrics;
pub mod pool;
pub mod schema;
pub mod tenant_pool;

// ============================================================================
// Re-exports
// ============================================================================

pub use config::{ConnectionSettings, Environment, SslMode};
pub use health::{HealthStatus, HEALTH_CHECK_TIMEOUT};
pub use metrics::{PoolMetrics, PoolStats};
pub use pool::{retry_with_interval, Params, PgConnection, Pool};
pub use schema::{
    generate_schema_name, validate_identifier, CopyReport, SchemaManager, DEFAULT_SEED_TABLES,
    DEFAULT_TEMPLATE_SCHEMA,
};
pub use tenant_pool::{Executor, TenantPool, TenantTransaction};
