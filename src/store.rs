use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::StoreError;
use crate::types::{Affiliation, GlobalId, NativeId, RelationType, TypeTag};

/// How long a freshly written local record stays valid, in seconds (14 days).
pub const DEFAULT_VALIDITY_SECS: i64 = 14 * 24 * 60 * 60;

/// Raw source-side record as the warehouse tracks it. Field names follow the
/// warehouse schema, so serialized records match what the catalog API serves.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocalRecord {
    #[serde(rename = "ID")]
    pub id: GlobalId,
    #[serde(rename = "CreationTime")]
    pub creation_time: DateTime<Utc>,
    /// Validity window in seconds from `creation_time`.
    #[serde(rename = "Validity")]
    pub validity_secs: i64,
    #[serde(rename = "Affiliation")]
    pub affiliation: Affiliation,
    #[serde(rename = "LocalID")]
    pub local_id: NativeId,
    #[serde(rename = "LocalType")]
    pub local_type: TypeTag,
    #[serde(rename = "LocalURL")]
    pub local_url: String,
    #[serde(rename = "CatalogMetaURL")]
    pub catalog_meta_url: String,
    /// Unmodified source record.
    #[serde(rename = "EntityJSON")]
    pub entity_json: Value,
}

/// Published, consumer-facing resource derived from a [`LocalRecord`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PublishedResource {
    #[serde(rename = "ID")]
    pub id: GlobalId,
    #[serde(rename = "Affiliation")]
    pub affiliation: Affiliation,
    #[serde(rename = "LocalID")]
    pub local_id: NativeId,
    #[serde(rename = "QualityLevel")]
    pub quality_level: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "ResourceGroup")]
    pub resource_group: String,
    #[serde(rename = "Type")]
    pub resource_type: String,
    #[serde(rename = "ShortDescription")]
    pub short_description: String,
    #[serde(rename = "ProviderID")]
    pub provider_id: Option<GlobalId>,
    #[serde(rename = "Description")]
    pub description: String,
    #[serde(rename = "Keywords")]
    pub keywords: String,
    #[serde(rename = "Audience")]
    pub audience: String,
}

/// Directed edge between two published resources.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelationRecord {
    #[serde(rename = "ID")]
    pub id: GlobalId,
    #[serde(rename = "FirstResourceID")]
    pub first_resource_id: GlobalId,
    #[serde(rename = "SecondResourceID")]
    pub second_resource_id: GlobalId,
    #[serde(rename = "RelationType")]
    pub relation_type: RelationType,
}

/// Warehouse persistence boundary. Reconciliation talks to this trait only,
/// so store backends and test fixtures are interchangeable.
pub trait RecordStore {
    /// Local records scoped to one affiliation whose IDs start with
    /// `urn_prefix`, in stored order.
    fn local_records(&self, affiliation: &str, urn_prefix: &str) -> Vec<LocalRecord>;

    /// Create or overwrite a local record.
    fn save_local(&mut self, record: LocalRecord) -> Result<(), StoreError>;

    /// Create or overwrite a published resource.
    fn save_resource(&mut self, resource: PublishedResource) -> Result<(), StoreError>;

    /// Create or overwrite a relation.
    fn save_relation(&mut self, relation: RelationRecord) -> Result<(), StoreError>;

    /// All relations whose first endpoint is `first_id`, in stored order.
    fn relations_from(&self, first_id: &str) -> Vec<RelationRecord>;

    fn delete_local(&mut self, id: &str) -> Result<(), StoreError>;

    fn delete_resource(&mut self, id: &str) -> Result<(), StoreError>;

    fn delete_relation(&mut self, id: &str) -> Result<(), StoreError>;
}

/// Optional search-index sidecar. Absent when no index hosts are configured;
/// index failures never abort warehouse reconciliation.
pub trait SearchIndex {
    /// Index or re-index one published resource.
    fn index_resource(&mut self, resource: &PublishedResource) -> Result<(), StoreError>;

    /// Remove one resource from the index.
    fn remove_resource(&mut self, id: &str) -> Result<(), StoreError>;
}

/// In-process warehouse backing the `memory:` destination and the test
/// fixtures. Insertion order is preserved so sweeps are deterministic.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    locals: IndexMap<GlobalId, LocalRecord>,
    resources: IndexMap<GlobalId, PublishedResource>,
    relations: IndexMap<GlobalId, RelationRecord>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of local records held.
    pub fn local_count(&self) -> usize {
        self.locals.len()
    }

    /// Number of published resources held.
    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    /// Number of relations held.
    pub fn relation_count(&self) -> usize {
        self.relations.len()
    }

    /// Look up one local record.
    pub fn local(&self, id: &str) -> Option<&LocalRecord> {
        self.locals.get(id)
    }

    /// Look up one published resource.
    pub fn resource(&self, id: &str) -> Option<&PublishedResource> {
        self.resources.get(id)
    }

    /// Look up one relation.
    pub fn relation(&self, id: &str) -> Option<&RelationRecord> {
        self.relations.get(id)
    }
}

impl RecordStore for MemoryStore {
    fn local_records(&self, affiliation: &str, urn_prefix: &str) -> Vec<LocalRecord> {
        self.locals
            .values()
            .filter(|record| {
                record.affiliation == affiliation && record.id.starts_with(urn_prefix)
            })
            .cloned()
            .collect()
    }

    fn save_local(&mut self, record: LocalRecord) -> Result<(), StoreError> {
        self.locals.insert(record.id.clone(), record);
        Ok(())
    }

    fn save_resource(&mut self, resource: PublishedResource) -> Result<(), StoreError> {
        self.resources.insert(resource.id.clone(), resource);
        Ok(())
    }

    fn save_relation(&mut self, relation: RelationRecord) -> Result<(), StoreError> {
        self.relations.insert(relation.id.clone(), relation);
        Ok(())
    }

    fn relations_from(&self, first_id: &str) -> Vec<RelationRecord> {
        self.relations
            .values()
            .filter(|relation| relation.first_resource_id == first_id)
            .cloned()
            .collect()
    }

    fn delete_local(&mut self, id: &str) -> Result<(), StoreError> {
        self.locals.shift_remove(id).map(|_| ()).ok_or_else(|| {
            StoreError::new(format!("no local record with ID={id}"))
        })
    }

    fn delete_resource(&mut self, id: &str) -> Result<(), StoreError> {
        self.resources.shift_remove(id).map(|_| ()).ok_or_else(|| {
            StoreError::new(format!("no resource with ID={id}"))
        })
    }

    fn delete_relation(&mut self, id: &str) -> Result<(), StoreError> {
        self.relations.shift_remove(id).map(|_| ()).ok_or_else(|| {
            StoreError::new(format!("no relation with ID={id}"))
        })
    }
}
