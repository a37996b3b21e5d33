//! Tenant identity resolution.
//!
//! Turns the raw `Authorization` header of an inbound request into a
//! [`RequestTenantContext`]. Resolution is **fail-open**: a missing, malformed,
//! expired or wrongly signed token yields the anonymous `public` context and a
//! warning, never an error. Routes that need a caller must check for one
//! themselves; this resolver is not an authentication boundary.

use tms_core::{PartitionKey, RequestTenantContext, Role};
use tracing::{debug, warn};

use crate::jwt::{extract_bearer_token, TokenClaims, TokenService};

#[derive(Clone)]
pub struct TenantIdentityResolver {
    tokens: TokenService,
}

impl TenantIdentityResolver {
    pub fn new(tokens: TokenService) -> Self {
        Self { tokens }
    }

    pub fn resolve(&self, authorization: Option<&str>) -> RequestTenantContext {
        let Some(header) = authorization else {
            return RequestTenantContext::public();
        };

        let Some(token) = extract_bearer_token(header) else {
            debug!("authorization header without a usable bearer token");
            return RequestTenantContext::public();
        };

        match self.tokens.verify(token) {
            Ok(claims) => Self::context_from_claims(claims),
            Err(err) => {
                warn!(error = %err, "invalid token, falling back to public partition");
                RequestTenantContext::public()
            }
        }
    }

    fn context_from_claims(claims: TokenClaims) -> RequestTenantContext {
        let partition_key = match claims.tenant_id.filter(|t| !t.is_empty()) {
            None => PartitionKey::public(),
            Some(raw) => match PartitionKey::parse(raw) {
                Ok(key) => key,
                Err(err) => {
                    warn!(error = %err, "token carries an unusable tenantId, falling back to public partition");
                    return RequestTenantContext::public();
                }
            },
        };

        let caller_role = claims.role.as_deref().and_then(|raw| {
            let role = Role::parse(raw);
            if role.is_none() {
                debug!(role = raw, "ignoring unknown role claim");
            }
            role
        });

        RequestTenantContext {
            partition_key,
            caller_id: claims.sub.filter(|s| !s.is_empty()),
            caller_role,
            tenant_uuid: claims.tenant_uuid.filter(|s| !s.is_empty()),
        }
    }
}
