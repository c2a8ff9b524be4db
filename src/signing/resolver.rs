use tracing::debug;

use crate::store::models::SigningBackend;

/// Picks the account that pays for a tenant's next payment.
///
/// Pool channel accounts are not resolved here: the submitter locks one per
/// attempt, while the row stays bound to the distribution account.
pub struct DistributionAccountResolver {
    backend: SigningBackend,
    account: String,
}

impl DistributionAccountResolver {
    pub fn fixed(backend: SigningBackend, account: impl Into<String>) -> Self {
        Self {
            backend,
            account: account.into(),
        }
    }

    pub fn backend(&self) -> SigningBackend {
        self.backend
    }

    pub fn resolve(&self, tenant_id: &str) -> &str {
        debug!(%tenant_id, account = %self.account, backend = %self.backend, "resolved distribution account");
        &self.account
    }
}
