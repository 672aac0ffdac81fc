//! [`AuthorizationService`]: consulted by the hub before property and
//! action calls; the core has no opinion on authentication.

use crate::naming::Address;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthorizationDecision {
    Allow,
    Deny,
}

impl AuthorizationDecision {
    pub fn is_allowed(self) -> bool {
        matches!(self, AuthorizationDecision::Allow)
    }
}

#[async_trait::async_trait]
pub trait AuthorizationService: Send + Sync {
    async fn authorize(
        &self,
        principal: Option<&str>,
        device: &Address,
        operation: &str,
    ) -> AuthorizationDecision;
}

/// Allows everything. Suitable for single-tenant deployments and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAllAuthorization;

#[async_trait::async_trait]
impl AuthorizationService for AllowAllAuthorization {
    async fn authorize(&self, _principal: Option<&str>, _device: &Address, _operation: &str) -> AuthorizationDecision {
        AuthorizationDecision::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::Name;

    #[tokio::test]
    async fn allow_all_always_allows() {
        let authz = AllowAllAuthorization;
        let addr = Address::new("hub", Name::single("dev"));
        assert_eq!(
            authz.authorize(None, &addr, "write").await,
            AuthorizationDecision::Allow
        );
    }
}
