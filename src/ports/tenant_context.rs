//! TenantContext port - Supplies the tenant for events published without one.

/// Resolves the tenant of the current caller.
///
/// The bus consults this only when an event's metadata has no tenant;
/// an explicit tenant is never overridden.
pub trait TenantContext: Send + Sync {
    fn current_tenant(&self) -> Option<String>;
}

/// A context that always answers with the same tenant.
#[derive(Debug, Clone)]
pub struct FixedTenantContext {
    tenant_id: String,
}

impl FixedTenantContext {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
        }
    }
}

impl TenantContext for FixedTenantContext {
    fn current_tenant(&self) -> Option<String> {
        Some(self.tenant_id.clone())
    }
}
