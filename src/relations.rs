use indexmap::IndexMap;
use tracing::error;

use crate::errors::StepError;
use crate::store::{RecordStore, RelationRecord};
use crate::types::{GlobalId, RelationType};

/// Deterministic relation identifier: the owning resource ID joined with the
/// md5 of `related:type`. Stable across runs so re-derived edges land on the
/// same row instead of accumulating duplicates.
pub fn relation_id(first_id: &str, related_id: &str, relation_type: &str) -> GlobalId {
    let digest = md5::compute(format!("{related_id}:{relation_type}").as_bytes());
    format!("{first_id}:{digest:x}")
}

/// Make the stored relation set for `first_id` exactly match `desired`
/// (related identifier mapped to relation type).
///
/// Every desired edge is saved first; a save failure aborts immediately and
/// leaves the stale entries untouched, so a flaky pass never deletes edges it
/// could not replace. The trailing sweep then removes edges absent from the
/// new set; sweep failures are logged per edge and do not fail the pass.
pub fn replace_relations(
    store: &mut dyn RecordStore,
    first_id: &str,
    desired: &IndexMap<GlobalId, RelationType>,
) -> Result<Vec<GlobalId>, StepError> {
    let mut kept = Vec::with_capacity(desired.len());
    for (related_id, relation_type) in desired {
        let id = relation_id(first_id, related_id, relation_type);
        let relation = RelationRecord {
            id: id.clone(),
            first_resource_id: first_id.to_string(),
            second_resource_id: related_id.clone(),
            relation_type: relation_type.clone(),
        };
        store
            .save_relation(relation)
            .map_err(|err| StepError::Persistence {
                id: id.clone(),
                reason: err.to_string(),
            })?;
        kept.push(id);
    }

    for stale in store.relations_from(first_id) {
        if kept.contains(&stale.id) {
            continue;
        }
        if let Err(err) = store.delete_relation(&stale.id) {
            error!(
                "[relations] deleting relation ID={} for resource ID={}: {}",
                stale.id, first_id, err
            );
        }
    }
    Ok(kept)
}
