//! Read-only view of the external resource repository.
//!
//! The repository owns the records; the core only fetches them by reference
//! and asks for blocking-criteria lookups. Implementations are expected to
//! bound their own latency and report failures as
//! [`MdmError::RepositoryUnavailable`].

use crate::error::{MdmError, Result};
use crate::types::{Resource, ResourceId, ResourceRef, ResourceType};
use std::collections::HashMap;
use std::sync::RwLock;

/// Blocking criteria for a candidate lookup.
///
/// A resource matches when it has the given type and shares at least one
/// `(attribute, value)` pair exactly.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchCriteria {
    pub resource_type: ResourceType,
    pub any_of: Vec<(String, String)>,
    pub exclude: Option<ResourceId>,
    pub limit: Option<usize>,
}

impl SearchCriteria {
    pub fn new(resource_type: ResourceType) -> Self {
        Self {
            resource_type,
            any_of: Vec::new(),
            exclude: None,
            limit: None,
        }
    }

    pub fn with_value(mut self, attribute: &str, value: &str) -> Self {
        self.any_of.push((attribute.to_string(), value.to_string()));
        self
    }

    /// Leave this resource out of the results (the target itself)
    pub fn excluding(mut self, id: ResourceId) -> Self {
        self.exclude = Some(id);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, resource: &Resource) -> bool {
        if resource.reference.resource_type != self.resource_type {
            return false;
        }
        if self.exclude == Some(resource.id()) {
            return false;
        }
        self.any_of
            .iter()
            .any(|(attr, value)| resource.attribute(attr) == Some(value.as_str()))
    }
}

/// Resource repository contract consumed by the core
pub trait ResourceRepository: Send + Sync {
    /// Fetch one record. `ResourceNotFound` if the reference is dangling.
    fn get(&self, reference: &ResourceRef) -> Result<Resource>;

    /// All records matching the criteria, in a stable order
    fn find(&self, criteria: &SearchCriteria) -> Result<Vec<Resource>>;
}

/// Map-backed repository for batch jobs and tests
#[derive(Default)]
pub struct InMemoryRepository {
    resources: RwLock<HashMap<ResourceId, Resource>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record
    pub fn put(&self, resource: Resource) -> Result<()> {
        let mut resources = self
            .resources
            .write()
            .map_err(|_| MdmError::RepositoryUnavailable("Repository lock poisoned".into()))?;
        resources.insert(resource.id(), resource);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.resources.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResourceRepository for InMemoryRepository {
    fn get(&self, reference: &ResourceRef) -> Result<Resource> {
        let resources = self
            .resources
            .read()
            .map_err(|_| MdmError::RepositoryUnavailable("Repository lock poisoned".into()))?;
        resources
            .get(&reference.id)
            .filter(|r| r.reference.resource_type == reference.resource_type)
            .cloned()
            .ok_or_else(|| MdmError::ResourceNotFound(reference.clone()))
    }

    fn find(&self, criteria: &SearchCriteria) -> Result<Vec<Resource>> {
        let resources = self
            .resources
            .read()
            .map_err(|_| MdmError::RepositoryUnavailable("Repository lock poisoned".into()))?;

        let mut found: Vec<Resource> = resources
            .values()
            .filter(|r| criteria.matches(r))
            .cloned()
            .collect();

        // HashMap order is arbitrary; UUIDv7 ids give insertion order
        found.sort_by_key(|r| r.id());

        if let Some(limit) = criteria.limit {
            found.truncate(limit);
        }
        Ok(found)
    }
}
