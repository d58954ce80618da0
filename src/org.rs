use crate::config::OrgBinding;
use crate::db::{self, DbKind};
use crate::error::ResolveError;
use crate::phone::{normalize_e164, sanitize_digits};
use async_trait::async_trait;
use sqlx::AnyPool;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

#[async_trait]
pub trait OrgResolver: Send + Sync {
    async fn resolve_org_id(&self, to_number: &str) -> Result<String, ResolveError>;
}

/// Number-to-org table built once from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticOrgResolver {
    by_digits: HashMap<String, String>,
}

impl StaticOrgResolver {
    pub fn new(mapping: HashMap<String, String>) -> Self {
        let by_digits = mapping
            .into_iter()
            .map(|(number, org)| (sanitize_digits(&number), org))
            .filter(|(digits, _)| !digits.is_empty())
            .collect();
        Self { by_digits }
    }

    pub fn from_bindings(bindings: &[OrgBinding]) -> Self {
        let mut mapping = HashMap::new();
        for binding in bindings {
            for number in &binding.numbers {
                mapping.insert(number.clone(), binding.org_id.clone());
            }
        }
        Self::new(mapping)
    }

    pub fn is_empty(&self) -> bool {
        self.by_digits.is_empty()
    }
}

#[async_trait]
impl OrgResolver for StaticOrgResolver {
    async fn resolve_org_id(&self, to_number: &str) -> Result<String, ResolveError> {
        self.by_digits
            .get(&sanitize_digits(to_number))
            .cloned()
            .ok_or_else(|| ResolveError::UnknownNumber(to_number.to_string()))
    }
}

/// Resolves through activated hosted-number orders.
#[derive(Clone)]
pub struct StoreOrgResolver {
    pool: AnyPool,
    kind: DbKind,
}

impl StoreOrgResolver {
    pub fn new(pool: AnyPool, kind: DbKind) -> Self {
        Self { pool, kind }
    }
}

#[async_trait]
impl OrgResolver for StoreOrgResolver {
    async fn resolve_org_id(&self, to_number: &str) -> Result<String, ResolveError> {
        let number = normalize_e164(to_number);
        db::lookup_activated_clinic(&self.pool, self.kind, &number)
            .await?
            .ok_or_else(|| ResolveError::UnknownNumber(to_number.to_string()))
    }
}

/// Tries each resolver in order. Lookup failures fall through to the next one.
pub struct ChainedOrgResolver {
    resolvers: Vec<Arc<dyn OrgResolver>>,
}

impl ChainedOrgResolver {
    pub fn new(resolvers: Vec<Arc<dyn OrgResolver>>) -> Self {
        Self { resolvers }
    }
}

#[async_trait]
impl OrgResolver for ChainedOrgResolver {
    async fn resolve_org_id(&self, to_number: &str) -> Result<String, ResolveError> {
        let mut last_lookup_err = None;
        for resolver in &self.resolvers {
            match resolver.resolve_org_id(to_number).await {
                Ok(org) => return Ok(org),
                Err(ResolveError::UnknownNumber(_)) => {}
                Err(err) => {
                    warn!(to = to_number, "org lookup failed: {err}");
                    last_lookup_err = Some(err);
                }
            }
        }
        Err(last_lookup_err.unwrap_or_else(|| ResolveError::UnknownNumber(to_number.to_string())))
    }
}
