use mdm_core::{MdmError, Resource, ResourceRef, ResourceRepository, Result, SearchCriteria};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::path::Path;

const RESOURCES_TABLE: TableDefinition<&[u8; 16], &[u8]> = TableDefinition::new("resources");

/// Resource repository persisted next to the link database.
///
/// The CLI runs one command per process, so ingested resources have to
/// outlive the process for later blocking lookups to find them. `find`
/// scans the whole table; fine at operator scale.
pub struct RedbRepository {
    db: Database,
}

impl RedbRepository {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::create(path.as_ref())?;
        let txn = db.begin_write()?;
        txn.open_table(RESOURCES_TABLE)?;
        txn.commit()?;
        Ok(Self { db })
    }

    pub fn put(&self, resource: &Resource) -> Result<()> {
        let value = serde_json::to_vec(resource)
            .map_err(|e| MdmError::Validation(format!("Resource serialise: {}", e)))?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(RESOURCES_TABLE)?;
            table.insert(resource.id().as_bytes(), value.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn len(&self) -> Result<u64> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(RESOURCES_TABLE)?;
        Ok(table.len()?)
    }

    fn decode(bytes: &[u8]) -> Result<Resource> {
        serde_json::from_slice(bytes)
            .map_err(|e| MdmError::Validation(format!("Corrupt resource record: {}", e)))
    }
}

impl ResourceRepository for RedbRepository {
    fn get(&self, reference: &ResourceRef) -> Result<Resource> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(RESOURCES_TABLE)?;
        let stored = table
            .get(reference.id.as_bytes())?
            .ok_or_else(|| MdmError::ResourceNotFound(reference.clone()))?;
        let resource = Self::decode(stored.value())?;
        if resource.reference.resource_type != reference.resource_type {
            return Err(MdmError::ResourceNotFound(reference.clone()));
        }
        Ok(resource)
    }

    fn find(&self, criteria: &SearchCriteria) -> Result<Vec<Resource>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(RESOURCES_TABLE)?;

        let mut found = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let resource = Self::decode(value.value())?;
            if criteria.matches(&resource) {
                found.push(resource);
            }
        }

        found.sort_by_key(|r| r.id());
        if let Some(limit) = criteria.limit {
            found.truncate(limit);
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdm_core::ResourceType;
    use tempfile::TempDir;

    fn patient() -> Resource {
        Resource::new(ResourceType::new("patient").unwrap())
    }

    #[test]
    fn test_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("resources.redb");
        let resource = patient().with_attribute("ssn", "1");
        {
            let repo = RedbRepository::open(&path).unwrap();
            repo.put(&resource).unwrap();
        }
        let repo = RedbRepository::open(&path).unwrap();
        assert_eq!(repo.get(&resource.reference).unwrap(), resource);
        assert_eq!(repo.len().unwrap(), 1);
    }

    #[test]
    fn test_find_uses_criteria() {
        let dir = TempDir::new().unwrap();
        let repo = RedbRepository::open(dir.path().join("r.redb")).unwrap();
        let a = patient().with_attribute("ssn", "1");
        let b = patient().with_attribute("ssn", "2");
        repo.put(&a).unwrap();
        repo.put(&b).unwrap();

        let criteria = SearchCriteria::new(ResourceType::new("patient").unwrap()).with_value("ssn", "2");
        let found = repo.find(&criteria).unwrap();
        assert_eq!(found, vec![b]);
    }
}
