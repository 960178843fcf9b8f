// Schema-per-tenant PostgreSQL access
//
// Startup: ConnectionSettings -> Pool (retried, probed) -> TenantPool.
// Provisioning: SchemaManager creates tenant_<id> and copies the template.
// Per request: tenant::new_context at the edge, then every query goes through
// TenantPool, which rejects contexts without a tenant and scopes each
// statement to the tenant's schema.

pub mod context;
pub mod db;
pub mod error;
pub mod tenant;

pub use context::Context;
pub use db::{
    ConnectionSettings, Environment, Executor, HealthStatus, Pool, PoolStats, SchemaManager,
    SslMode, TenantPool, TenantTransaction,
};
pub use error::{DatabaseError, ErrorKind, Result, SchemaError, TenantIdError};
pub use tenant::TenantId;
