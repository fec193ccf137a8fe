use std::time::Instant;

use indexmap::{IndexMap, IndexSet};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use chrono::Utc;

use crate::config::{ReconcileHandler, StepConfig};
use crate::content::ContentEnvelope;
use crate::describe::DescriptionBuilder;
use crate::errors::StepError;
use crate::metrics::{Action, RunCounters};
use crate::relations::replace_relations;
use crate::store::{
    DEFAULT_VALIDITY_SECS, LocalRecord, PublishedResource, RecordStore, SearchIndex,
};
use crate::types::{GlobalId, RelationType};

/// Warehouse catalog every reconciled resource lands in.
const WAREHOUSE_CATALOG: &str = "ResourceV3";
/// Warehouse API version segment used in catalog metadata URLs.
const WAREHOUSE_API_VERSION: &str = "v3";
/// Resource group assigned to reconciled collections.
const RESOURCE_GROUP: &str = "Software";
/// Resource type assigned to reconciled collections.
const RESOURCE_TYPE: &str = "Online Service";
/// Quality level assigned to reconciled collections.
const QUALITY_LEVEL: &str = "Production";
/// Namespace token between the URN prefix and the native ID.
const URN_NAMESPACE_TOKEN: &str = "globusuuid";
/// Keywords always attached to reconciled collections.
const BASE_KEYWORDS: &str = "Globus,File Transfer";
/// Fixed usage-documentation bullet appended to every description.
const USAGE_BULLET: &str = "- Usage documentation: https://www.globus.org/data-transfer";

/// Counter/summary label for the collection reconciliation step.
pub fn globus_step_label() -> String {
    format!(
        "{} to {WAREHOUSE_CATALOG}({RESOURCE_GROUP}:{RESOURCE_TYPE})",
        ReconcileHandler::GlobusCollections.name()
    )
}

/// Deterministic warehouse identifier for one native record:
/// `prefix:namespaceToken:nativeID`, tolerating a trailing `:` on the prefix.
pub fn format_global_urn(prefix: &str, namespace_token: &str, native_id: &str) -> GlobalId {
    format!(
        "{}:{namespace_token}:{native_id}",
        prefix.trim_end_matches(':')
    )
}

/// Reconciliation engine: converges the warehouse onto the most recently
/// observed record set for one affiliation/prefix scope.
pub struct ReconcileEngine<'a> {
    /// Warehouse store, the single writer for this process.
    pub store: &'a mut dyn RecordStore,
    /// Optional search-index sidecar; `None` when unconfigured.
    pub index: Option<&'a mut (dyn SearchIndex + 'static)>,
    /// Affiliation scope records are filed under.
    pub affiliation: &'a str,
    /// Base URL of the warehouse API, used for catalog metadata links.
    pub warehouse_api_prefix: &'a str,
}

impl ReconcileEngine<'_> {
    /// Upsert every observed collection and sweep records that disappeared
    /// from the source.
    ///
    /// A persistence failure abandons only the failing record: remaining
    /// records still process, and the failed identifier is excluded from the
    /// stale sweep so a transient error never cascades into a deletion. The
    /// first failure is returned after the pass completes so the step is
    /// marked failed.
    pub fn write_globus_collections(
        &mut self,
        envelope: &ContentEnvelope,
        step: &StepConfig,
        counters: &mut RunCounters,
    ) -> Result<(), StepError> {
        let started = Instant::now();
        let me = globus_step_label();
        let urn_prefix = step.urn_prefix();
        let catalog_meta_url = format!(
            "{}/resource-api/{WAREHOUSE_API_VERSION}/catalog/id/{}/",
            self.warehouse_api_prefix, step.catalog_urn
        );

        let current: IndexSet<GlobalId> = self
            .store
            .local_records(self.affiliation, urn_prefix)
            .into_iter()
            .map(|record| record.id)
            .collect();

        let mut new_ids: IndexSet<GlobalId> = IndexSet::new();
        let mut failed_ids: IndexSet<GlobalId> = IndexSet::new();
        let mut first_error: Option<StepError> = None;

        for item in envelope.records() {
            let Some(native_id) = item.get("id").and_then(Value::as_str) else {
                warn!("[reconcile] skipping record without an 'id' field");
                counters.tally(&me, Action::Skip);
                continue;
            };
            let global_id = format_global_urn(urn_prefix, URN_NAMESPACE_TOKEN, native_id);

            match self.upsert_collection(item, native_id, &global_id, step, &catalog_meta_url) {
                Ok(()) => {
                    new_ids.insert(global_id.clone());
                    counters.tally(&me, Action::Update);
                    debug!(
                        "[reconcile] {} updated resource ID={}",
                        envelope.type_tag(),
                        global_id
                    );
                }
                Err(err) => {
                    error!("[reconcile] {err}");
                    failed_ids.insert(global_id);
                    counters.tally(&me, Action::Skip);
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }

        let stale: Vec<GlobalId> = current
            .into_iter()
            .filter(|id| !new_ids.contains(id) && !failed_ids.contains(id))
            .collect();
        self.delete_stale(&me, &stale, counters);

        counters.add_seconds(&me, started.elapsed().as_secs_f64());
        counters.log_step(&me);

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn upsert_collection(
        &mut self,
        item: &Value,
        native_id: &str,
        global_id: &GlobalId,
        step: &StepConfig,
        catalog_meta_url: &str,
    ) -> Result<(), StepError> {
        let local = LocalRecord {
            id: global_id.clone(),
            creation_time: Utc::now(),
            validity_secs: DEFAULT_VALIDITY_SECS,
            affiliation: self.affiliation.to_string(),
            local_id: native_id.to_string(),
            local_type: step.local_type.clone(),
            local_url: format!("https://app.globus.org/file-manager?origin_id={native_id}"),
            catalog_meta_url: catalog_meta_url.to_string(),
            entity_json: item.clone(),
        };
        self.store
            .save_local(local)
            .map_err(|err| StepError::Persistence {
                id: global_id.clone(),
                reason: format!("saving local: {err}"),
            })?;

        let resource = build_resource(item, native_id, global_id, self.affiliation);
        for warning in &resource.render_warnings {
            warn!(
                "[reconcile] description for ID={}: {}",
                global_id, warning
            );
        }
        self.store
            .save_resource(resource.record.clone())
            .map_err(|err| StepError::Persistence {
                id: global_id.clone(),
                reason: format!("saving resource: {err}"),
            })?;
        if let Some(index) = self.index.as_deref_mut() {
            index
                .index_resource(&resource.record)
                .map_err(|err| StepError::Persistence {
                    id: global_id.clone(),
                    reason: format!("indexing resource: {err}"),
                })?;
        }

        replace_relations(self.store, global_id, &relations_for(item))?;
        Ok(())
    }

    fn delete_stale(&mut self, me: &str, stale: &[GlobalId], counters: &mut RunCounters) {
        for id in stale {
            if let Some(index) = self.index.as_deref_mut()
                && let Err(err) = index.remove_resource(id)
            {
                error!("[reconcile] deleting search index id={id}: {err}");
            }

            let mut clean = true;
            for relation in self.store.relations_from(id) {
                if let Err(err) = self.store.delete_relation(&relation.id) {
                    clean = false;
                    error!(
                        "[reconcile] {}",
                        StepError::PartialDelete {
                            kind: "relation",
                            id: relation.id.clone(),
                            reason: err.to_string(),
                        }
                    );
                }
            }
            if let Err(err) = self.store.delete_resource(id) {
                clean = false;
                error!(
                    "[reconcile] {}",
                    StepError::PartialDelete {
                        kind: "resource",
                        id: id.clone(),
                        reason: err.to_string(),
                    }
                );
            }
            if let Err(err) = self.store.delete_local(id) {
                clean = false;
                error!(
                    "[reconcile] {}",
                    StepError::PartialDelete {
                        kind: "local record",
                        id: id.clone(),
                        reason: err.to_string(),
                    }
                );
            }

            if clean {
                info!("{me} deleted ID={id}");
                counters.tally(me, Action::Delete);
            }
        }
    }
}

struct BuiltResource {
    record: PublishedResource,
    render_warnings: Vec<String>,
}

/// Assemble the published resource for one collection record.
fn build_resource(
    item: &Value,
    native_id: &str,
    global_id: &GlobalId,
    affiliation: &str,
) -> BuiltResource {
    let display_name = item
        .get("display_name")
        .and_then(Value::as_str)
        .or_else(|| item.get("name").and_then(Value::as_str))
        .unwrap_or_default();
    let resource_name = format!("XSEDE Globus Connect Server {display_name}");

    let description = item
        .get("description")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty());

    let mut builder = DescriptionBuilder::with_initial(description.unwrap_or(&resource_name));
    for (label, key) in [
        ("Organization", "organization"),
        ("Contact Email", "contact_email"),
        ("Info Link", "info_link"),
    ] {
        if let Some(value) = item.get(key).and_then(Value::as_str)
            && !value.is_empty()
        {
            builder.append(&format!("- {label}: {value}"));
        }
    }
    builder.append(USAGE_BULLET);
    builder.append(&format!(
        "- Globus link: https://app.globus.org/file-manager/collections{native_id}"
    ));
    let rendered = builder.render();

    let keywords = match item
        .get("keywords")
        .and_then(Value::as_str)
        .filter(|list| !list.is_empty())
    {
        Some(list) => format!("{list},{BASE_KEYWORDS}"),
        None => BASE_KEYWORDS.to_string(),
    };

    BuiltResource {
        record: PublishedResource {
            id: global_id.clone(),
            affiliation: affiliation.to_string(),
            local_id: native_id.to_string(),
            quality_level: QUALITY_LEVEL.to_string(),
            name: resource_name.clone(),
            resource_group: RESOURCE_GROUP.to_string(),
            resource_type: RESOURCE_TYPE.to_string(),
            short_description: description.unwrap_or(&resource_name).to_string(),
            provider_id: None,
            description: rendered.text,
            keywords,
            audience: affiliation.to_string(),
        },
        render_warnings: rendered.warnings,
    }
}

/// Edges derived from one collection record. None are emitted today; the
/// hook keeps relation maintenance wired for catalogs that carry them.
fn relations_for(_item: &Value) -> IndexMap<GlobalId, RelationType> {
    IndexMap::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Destination, SourceDescriptor};
    use crate::errors::StoreError;
    use crate::store::{MemoryStore, RelationRecord};
    use serde_json::{Map, json};

    const AFFILIATION: &str = "xsede.org";
    const PREFIX: &str = "urn:glue2:globusendpoint";
    const API_PREFIX: &str = "https://info.example.org/wh1";

    fn build_step() -> StepConfig {
        StepConfig {
            catalog_urn: PREFIX.to_string(),
            source: SourceDescriptor::Listing {
                url: "https://transfer.example.org/list".to_string(),
            },
            destination: Destination::Reconcile(ReconcileHandler::GlobusCollections),
            local_type: "GlobusEndpoint".to_string(),
            urn_prefix: Some(PREFIX.to_string()),
            metadata: Map::new(),
        }
    }

    fn collection(native_id: &str) -> Value {
        json!({
            "id": native_id,
            "display_name": format!("Collection {native_id}"),
            "organization": "Example University",
            "contact_email": "help@example.org",
            "keywords": "storage,research",
        })
    }

    fn run_engine(
        store: &mut MemoryStore,
        records: Vec<Value>,
        counters: &mut RunCounters,
    ) -> Result<(), StepError> {
        let envelope = ContentEnvelope::from_records("GlobusEndpoint", records);
        let mut engine = ReconcileEngine {
            store,
            index: None,
            affiliation: AFFILIATION,
            warehouse_api_prefix: API_PREFIX,
        };
        engine.write_globus_collections(&envelope, &build_step(), counters)
    }

    #[test]
    fn global_urns_tolerate_trailing_prefix_colons() {
        assert_eq!(
            format_global_urn("urn:glue2:globusendpoint:", "globusuuid", "abc"),
            "urn:glue2:globusendpoint:globusuuid:abc"
        );
        assert_eq!(
            format_global_urn("urn:glue2:globusendpoint", "globusuuid", "abc"),
            "urn:glue2:globusendpoint:globusuuid:abc"
        );
    }

    #[test]
    fn reconciliation_converges_and_counts_transitions() {
        let mut store = MemoryStore::new();
        let mut seed = RunCounters::new();
        run_engine(
            &mut store,
            vec![collection("a"), collection("b")],
            &mut seed,
        )
        .expect("seed run");
        assert_eq!(store.local_count(), 2);

        let mut counters = RunCounters::new();
        run_engine(
            &mut store,
            vec![collection("b"), collection("c")],
            &mut counters,
        )
        .expect("second run");

        let me = globus_step_label();
        assert_eq!(counters.action_count(&me, Action::Update), 2);
        assert_eq!(counters.action_count(&me, Action::Delete), 1);
        assert_eq!(store.local_count(), 2);
        let id_a = format_global_urn(PREFIX, "globusuuid", "a");
        let id_b = format_global_urn(PREFIX, "globusuuid", "b");
        let id_c = format_global_urn(PREFIX, "globusuuid", "c");
        assert!(store.local(&id_a).is_none());
        assert!(store.local(&id_b).is_some());
        assert!(store.local(&id_c).is_some());
        assert!(store.resource(&id_a).is_none());
        assert!(store.resource(&id_c).is_some());
    }

    #[test]
    fn repeated_runs_are_idempotent_on_stored_payloads() {
        let mut store = MemoryStore::new();
        let mut counters = RunCounters::new();
        run_engine(&mut store, vec![collection("a")], &mut counters).expect("first");
        let id = format_global_urn(PREFIX, "globusuuid", "a");
        let first_resource = store.resource(&id).expect("resource").clone();
        let first_entity = store.local(&id).expect("local").entity_json.clone();

        run_engine(&mut store, vec![collection("a")], &mut counters).expect("second");
        assert_eq!(store.resource(&id).expect("resource"), &first_resource);
        assert_eq!(store.local(&id).expect("local").entity_json, first_entity);
        assert_eq!(
            counters.action_count(&globus_step_label(), Action::Update),
            2
        );
    }

    #[test]
    fn descriptions_assemble_in_presentation_order() {
        let mut store = MemoryStore::new();
        let mut counters = RunCounters::new();
        let record = json!({
            "id": "a1",
            "display_name": "Research Store",
            "description": "Campus research storage.",
            "organization": "Example University",
            "contact_email": "help@example.org",
            "info_link": "https://example.org/storage",
        });
        run_engine(&mut store, vec![record], &mut counters).expect("run");

        let id = format_global_urn(PREFIX, "globusuuid", "a1");
        let resource = store.resource(&id).expect("resource");
        assert_eq!(
            resource.description,
            "Campus research storage.\n\n\
             - Organization: Example University\n\n\
             - Contact Email: help@example.org\n\n\
             - Info Link: https://example.org/storage\n\n\
             - Usage documentation: https://www.globus.org/data-transfer\n\n\
             - Globus link: https://app.globus.org/file-manager/collectionsa1"
        );
        assert_eq!(resource.short_description, "Campus research storage.");
        assert_eq!(resource.name, "XSEDE Globus Connect Server Research Store");
        assert_eq!(resource.keywords, "Globus,File Transfer");
        assert_eq!(resource.provider_id, None);
        assert_eq!(resource.quality_level, "Production");

        let local = store.local(&id).expect("local");
        assert_eq!(
            local.local_url,
            "https://app.globus.org/file-manager?origin_id=a1"
        );
        assert_eq!(
            local.catalog_meta_url,
            format!("{API_PREFIX}/resource-api/v3/catalog/id/{PREFIX}/")
        );
    }

    #[test]
    fn missing_description_falls_back_to_the_resource_name() {
        let mut store = MemoryStore::new();
        let mut counters = RunCounters::new();
        run_engine(
            &mut store,
            vec![json!({"id": "bare", "name": "plainname"})],
            &mut counters,
        )
        .expect("run");
        let id = format_global_urn(PREFIX, "globusuuid", "bare");
        let resource = store.resource(&id).expect("resource");
        assert_eq!(resource.name, "XSEDE Globus Connect Server plainname");
        assert!(
            resource
                .description
                .starts_with("XSEDE Globus Connect Server plainname")
        );
        assert_eq!(resource.short_description, resource.name);
    }

    #[test]
    fn source_keywords_are_prepended_to_the_fixed_set() {
        let mut store = MemoryStore::new();
        let mut counters = RunCounters::new();
        run_engine(&mut store, vec![collection("kw")], &mut counters).expect("run");
        let id = format_global_urn(PREFIX, "globusuuid", "kw");
        assert_eq!(
            store.resource(&id).expect("resource").keywords,
            "storage,research,Globus,File Transfer"
        );
    }

    #[test]
    fn records_without_native_ids_are_skipped() {
        let mut store = MemoryStore::new();
        let mut counters = RunCounters::new();
        run_engine(
            &mut store,
            vec![json!({"display_name": "nameless"}), collection("ok")],
            &mut counters,
        )
        .expect("run");
        let me = globus_step_label();
        assert_eq!(counters.action_count(&me, Action::Skip), 1);
        assert_eq!(counters.action_count(&me, Action::Update), 1);
        assert_eq!(store.local_count(), 1);
    }

    #[test]
    fn stale_sweep_removes_owned_relations() {
        let mut store = MemoryStore::new();
        let mut counters = RunCounters::new();
        run_engine(
            &mut store,
            vec![collection("a"), collection("b")],
            &mut counters,
        )
        .expect("seed");
        let id_a = format_global_urn(PREFIX, "globusuuid", "a");
        store
            .save_relation(RelationRecord {
                id: format!("{id_a}:feedcafe"),
                first_resource_id: id_a.clone(),
                second_resource_id: "urn:other".to_string(),
                relation_type: "supports".to_string(),
            })
            .expect("seed relation");

        run_engine(&mut store, vec![collection("b")], &mut counters).expect("sweep");
        assert_eq!(store.relation_count(), 0);
        assert!(store.local(&id_a).is_none());
    }

    struct FlakyStore {
        inner: MemoryStore,
        fail_resource_ids: Vec<GlobalId>,
    }

    impl RecordStore for FlakyStore {
        fn local_records(&self, affiliation: &str, urn_prefix: &str) -> Vec<LocalRecord> {
            self.inner.local_records(affiliation, urn_prefix)
        }

        fn save_local(&mut self, record: LocalRecord) -> Result<(), StoreError> {
            self.inner.save_local(record)
        }

        fn save_resource(&mut self, resource: PublishedResource) -> Result<(), StoreError> {
            if self.fail_resource_ids.contains(&resource.id) {
                return Err(StoreError::new("injected resource failure"));
            }
            self.inner.save_resource(resource)
        }

        fn save_relation(&mut self, relation: RelationRecord) -> Result<(), StoreError> {
            self.inner.save_relation(relation)
        }

        fn relations_from(&self, first_id: &str) -> Vec<RelationRecord> {
            self.inner.relations_from(first_id)
        }

        fn delete_local(&mut self, id: &str) -> Result<(), StoreError> {
            self.inner.delete_local(id)
        }

        fn delete_resource(&mut self, id: &str) -> Result<(), StoreError> {
            self.inner.delete_resource(id)
        }

        fn delete_relation(&mut self, id: &str) -> Result<(), StoreError> {
            self.inner.delete_relation(id)
        }
    }

    #[test]
    fn failed_records_are_abandoned_but_never_swept() {
        let mut seed_store = MemoryStore::new();
        let mut counters = RunCounters::new();
        run_engine(
            &mut seed_store,
            vec![collection("a"), collection("b")],
            &mut counters,
        )
        .expect("seed");

        let failing_id = format_global_urn(PREFIX, "globusuuid", "a");
        let mut store = FlakyStore {
            inner: seed_store,
            fail_resource_ids: vec![failing_id.clone()],
        };
        let envelope = ContentEnvelope::from_records(
            "GlobusEndpoint",
            vec![collection("a"), collection("b")],
        );
        let mut engine = ReconcileEngine {
            store: &mut store,
            index: None,
            affiliation: AFFILIATION,
            warehouse_api_prefix: API_PREFIX,
        };
        let mut counters = RunCounters::new();
        let err = engine
            .write_globus_collections(&envelope, &build_step(), &mut counters)
            .expect_err("step must be marked failed");
        assert!(matches!(err, StepError::Persistence { .. }));

        let me = globus_step_label();
        assert_eq!(counters.action_count(&me, Action::Update), 1);
        assert_eq!(counters.action_count(&me, Action::Skip), 1);
        assert_eq!(counters.action_count(&me, Action::Delete), 0);
        assert!(store.inner.local(&failing_id).is_some());
    }

    struct RecordingIndex {
        indexed: Vec<GlobalId>,
        removed: Vec<GlobalId>,
        fail_removals: bool,
    }

    impl SearchIndex for RecordingIndex {
        fn index_resource(&mut self, resource: &PublishedResource) -> Result<(), StoreError> {
            self.indexed.push(resource.id.clone());
            Ok(())
        }

        fn remove_resource(&mut self, id: &str) -> Result<(), StoreError> {
            self.removed.push(id.to_string());
            if self.fail_removals {
                return Err(StoreError::new("injected index failure"));
            }
            Ok(())
        }
    }

    #[test]
    fn configured_index_tracks_upserts_and_sweeps() {
        let mut store = MemoryStore::new();
        let mut index = RecordingIndex {
            indexed: Vec::new(),
            removed: Vec::new(),
            fail_removals: false,
        };
        let mut counters = RunCounters::new();
        let step = build_step();

        let seed = ContentEnvelope::from_records(
            "GlobusEndpoint",
            vec![collection("a"), collection("b")],
        );
        ReconcileEngine {
            store: &mut store,
            index: Some(&mut index),
            affiliation: AFFILIATION,
            warehouse_api_prefix: API_PREFIX,
        }
        .write_globus_collections(&seed, &step, &mut counters)
        .expect("seed");
        assert_eq!(index.indexed.len(), 2);

        let shrunk = ContentEnvelope::from_records("GlobusEndpoint", vec![collection("b")]);
        ReconcileEngine {
            store: &mut store,
            index: Some(&mut index),
            affiliation: AFFILIATION,
            warehouse_api_prefix: API_PREFIX,
        }
        .write_globus_collections(&shrunk, &step, &mut counters)
        .expect("sweep");
        assert_eq!(
            index.removed,
            vec![format_global_urn(PREFIX, "globusuuid", "a")]
        );
    }

    #[test]
    fn index_removal_failure_does_not_block_deletion() {
        let mut store = MemoryStore::new();
        let mut counters = RunCounters::new();
        run_engine(
            &mut store,
            vec![collection("a"), collection("b")],
            &mut counters,
        )
        .expect("seed");

        let mut index = RecordingIndex {
            indexed: Vec::new(),
            removed: Vec::new(),
            fail_removals: true,
        };
        let shrunk = ContentEnvelope::from_records("GlobusEndpoint", vec![collection("b")]);
        let mut counters = RunCounters::new();
        ReconcileEngine {
            store: &mut store,
            index: Some(&mut index),
            affiliation: AFFILIATION,
            warehouse_api_prefix: API_PREFIX,
        }
        .write_globus_collections(&shrunk, &build_step(), &mut counters)
        .expect("sweep");

        let id_a = format_global_urn(PREFIX, "globusuuid", "a");
        assert!(store.local(&id_a).is_none());
        assert!(store.resource(&id_a).is_none());
        assert_eq!(
            counters.action_count(&globus_step_label(), Action::Delete),
            1
        );
    }
}
