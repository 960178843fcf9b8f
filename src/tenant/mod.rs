// Tenant identity
// Validated tenant ids and the context plumbing that carries them

pub mod context;
pub mod id;

pub use context::{
    from_context, has_tenant, must_from_context, new_context, with_tenant, TENANT_KEY,
};
pub use id::{validate_id, TenantId, TENANT_ID_LEN};
