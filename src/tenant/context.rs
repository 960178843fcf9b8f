// Tenant Context
// The only way a tenant identity enters a call chain. Inbound middleware calls
// new_context once; everything downstream reads it back with from_context.

use super::id::TenantId;
use crate::context::Context;
use crate::error::{DatabaseError, Result};

/// Key under which the validated tenant id is stored in a Context
pub const TENANT_KEY: &str = "tenant_id";

/// Validate `tenant_id` and derive a context carrying it.
/// On error nothing is derived and `parent` is left as it was.
pub fn new_context(parent: &Context, tenant_id: &str) -> Result<(Context, TenantId)> {
    let id = TenantId::parse(tenant_id)?;
    let ctx = parent.with_value(TENANT_KEY, id.clone());
    Ok((ctx, id))
}

/// Derive a context from an already validated id
pub fn with_tenant(parent: &Context, tenant_id: &TenantId) -> Context {
    parent.with_value(TENANT_KEY, tenant_id.clone())
}

/// Read the tenant id back. `None` stands for a missing (nil) context.
pub fn from_context(ctx: Option<&Context>) -> Result<TenantId> {
    let ctx = ctx.ok_or(DatabaseError::TenantNotFound)?;
    let value = ctx.raw_value(TENANT_KEY).ok_or(DatabaseError::TenantNotFound)?;
    value
        .downcast_ref::<TenantId>()
        .cloned()
        .ok_or(DatabaseError::TenantType)
}

/// Boolean probe; never errors
pub fn has_tenant(ctx: Option<&Context>) -> bool {
    from_context(ctx).is_ok()
}

/// Read the tenant id, panicking if absent.
///
/// Only for code that runs strictly after tenant middleware has accepted the
/// request, where a missing tenant is a programming error.
pub fn must_from_context(ctx: &Context) -> TenantId {
    match from_context(Some(ctx)) {
        Ok(id) => id,
        Err(err) => panic!("tenant context required: {}", err),
    }
}

impl Context {
    /// Shorthand for `from_context(Some(self))`
    pub fn tenant_id(&self) -> Result<TenantId> {
        from_context(Some(self))
    }

    pub fn has_tenant(&self) -> bool {
        has_tenant(Some(self))
    }
}
