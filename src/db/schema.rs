// Tenant Schema Management
// Derives schema names from tenant ids, creates schemas and clones the
// template schema's tables into new tenants. Schema names cannot be bound as
// parameters, so every identifier passes validate_identifier before it is
// interpolated into SQL.

use crate::context::Context;
use crate::db::pool::Pool;
use crate::error::{DatabaseError, Result, SchemaError};
use crate::tenant::TenantId;
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Prefix of every tenant schema
pub const SCHEMA_PREFIX: &str = "tenant_";
/// Schema holding the canonical table definitions
pub const DEFAULT_TEMPLATE_SCHEMA: &str = "tenant_template";
/// Lookup tables whose rows are copied into new tenants
pub const DEFAULT_SEED_TABLES: &[&str] = &["pipeline_stages", "activity_types", "lead_sources"];
/// PostgreSQL truncates identifiers beyond NAMEDATALEN - 1 bytes
pub const MAX_IDENTIFIER_LEN: usize = 63;

// ============================================================================
// Naming and SQL text
// ============================================================================

/// `tenant_<id>`; pure, no I/O
pub fn generate_schema_name(tenant_id: &TenantId) -> String {
    format!("{}{}", SCHEMA_PREFIX, tenant_id.as_str())
}

/// Allowlist check applied to every identifier before it reaches dynamic SQL:
/// `^[A-Za-z_][A-Za-z0-9_-]*$`, at most 63 bytes
pub fn validate_identifier(name: &str) -> std::result::Result<(), SchemaError> {
    if name.is_empty() {
        return Err(SchemaError::BlankName);
    }
    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(SchemaError::InvalidIdentifier(name.to_string()));
    }

    let mut chars = name.chars();
    let first_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');

    if first_ok && rest_ok {
        Ok(())
    } else {
        Err(SchemaError::InvalidIdentifier(name.to_string()))
    }
}

/// Double-quote an identifier that already passed validation
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name)
}

pub(crate) fn create_schema_sql(schema: &str) -> String {
    format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(schema))
}

pub(crate) fn drop_schema_sql(schema: &str) -> String {
    format!("DROP SCHEMA IF EXISTS {} CASCADE", quote_ident(schema))
}

pub(crate) fn copy_table_sql(template: &str, target: &str, table: &str) -> String {
    format!(
        "CREATE TABLE {}.{} (LIKE {}.{} \
         INCLUDING DEFAULTS INCLUDING CONSTRAINTS INCLUDING INDEXES)",
        quote_ident(target),
        quote_ident(table),
        quote_ident(template),
        quote_ident(table)
    )
}

pub(crate) fn seed_table_sql(template: &str, target: &str, table: &str) -> String {
    format!(
        "INSERT INTO {}.{} SELECT * FROM {}.{} ON CONFLICT DO NOTHING",
        quote_ident(target),
        quote_ident(table),
        quote_ident(template),
        quote_ident(table)
    )
}

/// Session-wide path for standalone statements, or `SET LOCAL` inside a transaction
pub(crate) fn search_path_sql(schema: &str, local: bool) -> String {
    let scope = if local { "SET LOCAL" } else { "SET" };
    format!("{} search_path TO {}, public", scope, quote_ident(schema))
}

const SCHEMA_EXISTS_SQL: &str =
    "SELECT EXISTS (SELECT 1 FROM information_schema.schemata WHERE schema_name = $1)";

const LIST_TABLES_SQL: &str = "SELECT table_name::text FROM information_schema.tables \
     WHERE table_schema = $1 AND table_type = 'BASE TABLE' ORDER BY table_name";

const LIST_TENANT_SCHEMAS_SQL: &str = "SELECT schema_name::text FROM information_schema.schemata \
     WHERE schema_name LIKE 'tenant\\_%' AND schema_name <> $1 ORDER BY schema_name";

/// Re-label driver failures as schema failures; cancellation and pool errors pass through
fn schema_failure(err: DatabaseError, wrap: impl FnOnce(String) -> SchemaError) -> DatabaseError {
    match err {
        DatabaseError::Query { .. } => DatabaseError::Schema(wrap(err.to_string())),
        other => other,
    }
}

// ============================================================================
// Schema manager
// ============================================================================

/// What a template copy did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CopyReport {
    pub created: Vec<String>,
    pub skipped: Vec<String>,
    pub seeded: Vec<String>,
    pub seed_failures: Vec<String>,
}

/// Provisioning operations. These run against explicit schema names and do not
/// go through tenant-scoped queries.
#[derive(Debug, Clone)]
pub struct SchemaManager {
    pool: Pool,
    template: String,
    seed_tables: Vec<String>,
}

impl SchemaManager {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            template: DEFAULT_TEMPLATE_SCHEMA.to_string(),
            seed_tables: DEFAULT_SEED_TABLES.iter().map(|t| t.to_string()).collect(),
        }
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = template.into();
        self
    }

    pub fn with_seed_tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.seed_tables = tables.into_iter().map(Into::into).collect();
        self
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn seed_tables(&self) -> &[String] {
        &self.seed_tables
    }

    /// Whether `name` exists in the catalog
    pub async fn schema_exists(&self, ctx: &Context, name: &str) -> Result<bool> {
        validate_identifier(name)?;
        let row = self
            .pool
            .query_one_unscoped(ctx, SCHEMA_EXISTS_SQL, &[&name])
            .await
            .map_err(|e| schema_failure(e, SchemaError::Catalog))?;
        row.try_get::<_, bool>(0)
            .map_err(|e| DatabaseError::from(SchemaError::Catalog(e.to_string())))
    }

    /// `CREATE SCHEMA IF NOT EXISTS`; safe to call repeatedly
    pub async fn create_schema(&self, ctx: &Context, name: &str) -> Result<()> {
        validate_identifier(name)?;
        self.pool
            .execute_unscoped(ctx, &create_schema_sql(name), &[])
            .await
            .map_err(|e| {
                schema_failure(e, |message| SchemaError::CreateFailed {
                    schema: name.to_string(),
                    message,
                })
            })?;
        info!(schema = name, "schema ensured");
        Ok(())
    }

    /// Base tables of `schema`, sorted by name
    pub async fn list_tables(&self, ctx: &Context, schema: &str) -> Result<Vec<String>> {
        validate_identifier(schema)?;
        let rows = self
            .pool
            .query_unscoped(ctx, LIST_TABLES_SQL, &[&schema])
            .await
            .map_err(|e| schema_failure(e, SchemaError::Catalog))?;

        rows.iter()
            .map(|row| {
                row.try_get::<_, String>(0)
                    .map_err(|e| DatabaseError::from(SchemaError::Catalog(e.to_string())))
            })
            .collect()
    }

    /// Every tenant schema except the template
    pub async fn list_tenant_schemas(&self, ctx: &Context) -> Result<Vec<String>> {
        let rows = self
            .pool
            .query_unscoped(ctx, LIST_TENANT_SCHEMAS_SQL, &[&self.template])
            .await
            .map_err(|e| schema_failure(e, SchemaError::Catalog))?;

        rows.iter()
            .map(|row| {
                row.try_get::<_, String>(0)
                    .map_err(|e| DatabaseError::from(SchemaError::Catalog(e.to_string())))
            })
            .collect()
    }

    /// Clone the template's table structure into `target`, then best-effort copy
    /// seed rows. Tables already present in `target` are left alone, so a re-run
    /// after a partial failure picks up where it stopped.
    pub async fn copy_template_schema(
        &self,
        ctx: &Context,
        template: &str,
        target: &str,
    ) -> Result<CopyReport> {
        validate_identifier(template)?;
        validate_identifier(target)?;

        if !self.schema_exists(ctx, template).await? {
            return Err(SchemaError::TemplateNotFound(template.to_string()).into());
        }

        let template_tables = self.list_tables(ctx, template).await?;
        let existing: HashSet<String> = self.list_tables(ctx, target).await?.into_iter().collect();
        let mut report = CopyReport::default();

        for table in &template_tables {
            // Catalog names go through the same allowlist as everything else
            validate_identifier(table)?;

            if existing.contains(table) {
                debug!(schema = target, table = %table, "table already present, skipping");
                report.skipped.push(table.clone());
                continue;
            }

            self.pool
                .execute_unscoped(ctx, &copy_table_sql(template, target, table), &[])
                .await
                .map_err(|e| {
                    schema_failure(e, |message| SchemaError::TableCopyFailed {
                        schema: target.to_string(),
                        table: table.clone(),
                        message,
                    })
                })?;
            report.created.push(table.clone());
        }

        for table in &self.seed_tables {
            if !template_tables.contains(table) {
                continue;
            }
            if let Err(err) = validate_identifier(table) {
                warn!(table = %table, error = %err, "skipping seed table with unsafe name");
                report.seed_failures.push(table.clone());
                continue;
            }

            match self
                .pool
                .execute_unscoped(ctx, &seed_table_sql(template, target, table), &[])
                .await
            {
                Ok(rows) => {
                    debug!(schema = target, table = %table, rows, "seed rows copied");
                    report.seeded.push(table.clone());
                }
                Err(err) => {
                    warn!(
                        schema = target,
                        table = %table,
                        error = %err,
                        "seed copy failed, continuing"
                    );
                    report.seed_failures.push(table.clone());
                }
            }
        }

        info!(
            template,
            schema = target,
            created = report.created.len(),
            skipped = report.skipped.len(),
            seeded = report.seeded.len(),
            seed_failures = report.seed_failures.len(),
            "template schema copied"
        );
        Ok(report)
    }

    /// Create the tenant's schema and copy the template into it. Returns the schema name.
    /// Safe to re-run after a partial failure.
    pub async fn provision_tenant(&self, ctx: &Context, tenant_id: &TenantId) -> Result<String> {
        let schema = generate_schema_name(tenant_id);
        self.create_schema(ctx, &schema).await?;
        self.copy_template_schema(ctx, &self.template, &schema).await?;
        Ok(schema)
    }

    /// Drop a schema and everything in it, for rolling back a failed provisioning.
    /// Refuses to touch the template.
    pub async fn drop_schema(&self, ctx: &Context, name: &str) -> Result<()> {
        validate_identifier(name)?;
        if name == self.template {
            return Err(SchemaError::DropFailed {
                schema: name.to_string(),
                message: "refusing to drop the template schema".to_string(),
            }
            .into());
        }

        self.pool
            .execute_unscoped(ctx, &drop_schema_sql(name), &[])
            .await
            .map_err(|e| {
                schema_failure(e, |message| SchemaError::DropFailed {
                    schema: name.to_string(),
                    message,
                })
            })?;
        info!(schema = name, "schema dropped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::pool::tests::unreachable_settings;
    use crate::error::ErrorKind;

    #[test]
    fn test_generate_schema_name() {
        let id = TenantId::parse("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let name = generate_schema_name(&id);
        assert_eq!(name, "tenant_550e8400-e29b-41d4-a716-446655440000");
        assert_eq!(generate_schema_name(&id), name);
        assert!(validate_identifier(&name).is_ok());
    }

    #[test]
    fn test_validate_identifier_accepts_safe_names() {
        for name in ["tenant_template", "_private", "Contacts", "tenant_abc-123", "a"] {
            assert!(validate_identifier(name).is_ok(), "{}", name);
        }
    }

    #[test]
    fn test_validate_identifier_rejects_unsafe_names() {
        assert_eq!(validate_identifier(""), Err(SchemaError::BlankName));
        for name in [
            "1tenant",
            "-tenant",
            "tenant\"; DROP SCHEMA public CASCADE; --",
            "tenant name",
            "tenant.contacts",
            "tenant'",
            "tenänt",
        ] {
            assert!(
                matches!(validate_identifier(name), Err(SchemaError::InvalidIdentifier(_))),
                "{}",
                name
            );
        }
        assert!(validate_identifier(&"a".repeat(MAX_IDENTIFIER_LEN)).is_ok());
        assert!(validate_identifier(&"a".repeat(MAX_IDENTIFIER_LEN + 1)).is_err());
    }

    #[test]
    fn test_sql_text() {
        assert_eq!(
            create_schema_sql("tenant_a"),
            r#"CREATE SCHEMA IF NOT EXISTS "tenant_a""#
        );
        assert_eq!(
            copy_table_sql("tenant_template", "tenant_a", "contacts"),
            concat!(
                r#"CREATE TABLE "tenant_a"."contacts" (LIKE "tenant_template"."contacts" "#,
                "INCLUDING DEFAULTS INCLUDING CONSTRAINTS INCLUDING INDEXES)"
            )
        );
        assert_eq!(
            seed_table_sql("tenant_template", "tenant_a", "pipeline_stages"),
            concat!(
                r#"INSERT INTO "tenant_a"."pipeline_stages" "#,
                r#"SELECT * FROM "tenant_template"."pipeline_stages" ON CONFLICT DO NOTHING"#
            )
        );
        assert_eq!(
            search_path_sql("tenant_a", false),
            r#"SET search_path TO "tenant_a", public"#
        );
        assert_eq!(
            search_path_sql("tenant_a", true),
            r#"SET LOCAL search_path TO "tenant_a", public"#
        );
        assert_eq!(
            drop_schema_sql("tenant_a"),
            r#"DROP SCHEMA IF EXISTS "tenant_a" CASCADE"#
        );
    }

    #[tokio::test]
    async fn test_builder_defaults() {
        let manager = SchemaManager::new(Pool::unconnected(unreachable_settings()).unwrap());
        assert_eq!(manager.template(), DEFAULT_TEMPLATE_SCHEMA);
        assert_eq!(manager.seed_tables().len(), DEFAULT_SEED_TABLES.len());

        let manager = manager
            .with_template("crm_template")
            .with_seed_tables(["deal_stages"]);
        assert_eq!(manager.template(), "crm_template");
        assert_eq!(manager.seed_tables(), ["deal_stages".to_string()]);
    }

    #[tokio::test]
    async fn test_invalid_names_never_reach_the_database() {
        let pool = Pool::unconnected(unreachable_settings()).unwrap();
        let manager = SchemaManager::new(pool.clone());
        let ctx = Context::background();

        let err = manager.create_schema(&ctx, "x\"; DROP TABLE t; --").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Schema);
        let err = manager.schema_exists(&ctx, "").await.unwrap_err();
        assert!(matches!(err, DatabaseError::Schema(SchemaError::BlankName)));
        let err = manager
            .copy_template_schema(&ctx, "tenant_template", "bad name")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Schema);

        let stats = pool.stats();
        assert_eq!(stats.acquire_count + stats.acquire_error_count, 0);
    }

    #[tokio::test]
    async fn test_template_cannot_be_dropped() {
        let pool = Pool::unconnected(unreachable_settings()).unwrap();
        let manager = SchemaManager::new(pool.clone());

        let err = manager
            .drop_schema(&Context::background(), DEFAULT_TEMPLATE_SCHEMA)
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Schema(SchemaError::DropFailed { .. })));
        assert_eq!(pool.stats().acquire_error_count, 0);
    }

    #[tokio::test]
    async fn test_catalog_failure_is_a_schema_error() {
        let manager = SchemaManager::new(Pool::unconnected(unreachable_settings()).unwrap());
        let err = manager
            .schema_exists(&Context::background(), "tenant_template")
            .await
            .unwrap_err();
        // Acquire failures are driver failures, relabelled for the operator
        assert_eq!(err.kind(), ErrorKind::Schema);
    }
}
