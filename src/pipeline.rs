use std::path::{Path, PathBuf};
use std::time::Instant;
use std::{fs, io};

use indexmap::IndexMap;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::config::{Destination, ReconcileHandler, SourceDescriptor, StepConfig};
use crate::content::ContentEnvelope;
use crate::errors::{ConfigError, StepError};
use crate::fetch::{Fetcher, envelope_from_value};
use crate::metrics::{Action, RunCounters};
use crate::reconcile::ReconcileEngine;
use crate::store::{MemoryStore, RecordStore, SearchIndex};
use crate::transfer::{TransferClient, list_collections};
use crate::types::TypeTag;

/// Production warehouse API base.
pub const WAREHOUSE_API_PROD: &str = "https://info.xsede.org/wh1";
/// Development warehouse API base, selected by `--dev`.
pub const WAREHOUSE_API_DEV: &str = "http://localhost:8000";
/// Affiliation scope all reconciled records are filed under.
pub const DEFAULT_AFFILIATION: &str = "xsede.org";

/// Identity and environment for one pipeline process.
#[derive(Clone, Debug)]
pub struct PipelineOptions {
    /// Program name embedded in activity identifiers.
    pub app_name: String,
    /// Affiliation scope for stored records.
    pub affiliation: String,
    /// Warehouse API base used in catalog metadata URLs.
    pub warehouse_api_prefix: String,
    /// Optional file of supplemental endpoint IDs for listing steps.
    pub extra_endpoints_file: Option<PathBuf>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            app_name: "route_collections".to_string(),
            affiliation: DEFAULT_AFFILIATION.to_string(),
            warehouse_api_prefix: WAREHOUSE_API_PROD.to_string(),
            extra_endpoints_file: None,
        }
    }
}

/// All state one pipeline process owns, created at startup and torn down at
/// exit. There are no process-level globals; everything the run loop touches
/// lives here.
pub struct PipelineState {
    /// Resolved steps, executed in configured order.
    pub steps: Vec<StepConfig>,
    /// Caching source fetcher.
    pub fetcher: Fetcher,
    /// Warehouse store backend.
    pub store: Box<dyn RecordStore>,
    /// Optional search-index sidecar.
    pub index: Option<Box<dyn SearchIndex>>,
    /// Optional transfer-service client for listing sources.
    pub transfer: Option<Box<dyn TransferClient>>,
    /// In-process table for `memory:` destinations, keyed by type tag then
    /// by the step's key field.
    pub memory: IndexMap<TypeTag, IndexMap<String, Value>>,
    /// Per-iteration counters, reset at the top of each iteration.
    pub counters: RunCounters,
    /// Process identity and environment.
    pub options: PipelineOptions,
}

impl PipelineState {
    /// State with an empty in-process store and no optional collaborators.
    pub fn new(steps: Vec<StepConfig>, fetcher: Fetcher, options: PipelineOptions) -> Self {
        Self {
            steps,
            fetcher,
            store: Box::new(MemoryStore::new()),
            index: None,
            transfer: None,
            memory: IndexMap::new(),
            counters: RunCounters::new(),
            options,
        }
    }

    /// Records stored under one type tag by `memory:` steps.
    pub fn memory_table(&self, type_tag: &str) -> Option<&IndexMap<String, Value>> {
        self.memory.get(type_tag)
    }
}

/// Result of one step execution, emitted as an audit event and kept for the
/// iteration report.
#[derive(Clone, Debug)]
pub struct StepOutcome {
    /// Unique identifier encoding application, function, type tag, and
    /// source/destination schemes.
    pub activity_id: String,
    /// Destination function or target label.
    pub function: String,
    /// Affiliation scope the step ran under.
    pub about: String,
    /// False when the step was marked failed.
    pub success: bool,
    /// Success/failure description for the audit event.
    pub message: String,
    /// Wall-clock seconds the step took.
    pub seconds: f64,
}

enum FetchFailure {
    /// Aborts the whole run (missing or unparseable cache file).
    Fatal(ConfigError),
    /// Marks only this step failed.
    Step(StepError),
}

/// Execute every step once, in configured order. A step failure never stops
/// the remaining steps; a fatal source failure aborts the iteration.
pub fn run_iteration(state: &mut PipelineState) -> Result<Vec<StepOutcome>, ConfigError> {
    state.counters = RunCounters::new();
    let steps = state.steps.clone();
    let mut outcomes = Vec::with_capacity(steps.len());
    for step in &steps {
        outcomes.push(execute_step(state, step)?);
    }
    Ok(outcomes)
}

fn execute_step(state: &mut PipelineState, step: &StepConfig) -> Result<StepOutcome, ConfigError> {
    let started = Instant::now();
    let function = step.destination.label();
    let activity_id = format!(
        "{}:{}:{}:{}->{}",
        state.options.app_name,
        function,
        step.local_type,
        step.source.scheme(),
        step.destination.scheme()
    );

    let step_result = match fetch_envelope(state, step) {
        Ok(envelope) => dispatch(state, step, &envelope, &activity_id),
        Err(FetchFailure::Fatal(err)) => return Err(err),
        Err(FetchFailure::Step(err)) => Err(err),
    };
    let elapsed = started.elapsed().as_secs_f64();

    let outcome = match step_result {
        Ok(()) => StepOutcome {
            activity_id,
            about: state.options.affiliation.clone(),
            success: true,
            message: format!("Executed {function} in {elapsed:.3}/seconds"),
            function,
            seconds: elapsed,
        },
        Err(err) => {
            error!("[pipeline] {activity_id}: {err}");
            StepOutcome {
                activity_id,
                about: state.options.affiliation.clone(),
                success: false,
                message: err.to_string(),
                function,
                seconds: elapsed,
            }
        }
    };
    info!(
        "[pipeline] finished {}: {}",
        outcome.activity_id, outcome.message
    );
    Ok(outcome)
}

fn fetch_envelope(
    state: &mut PipelineState,
    step: &StepConfig,
) -> Result<ContentEnvelope, FetchFailure> {
    match &step.source {
        SourceDescriptor::File { path } => {
            let document = state
                .fetcher
                .read_document(path)
                .map_err(FetchFailure::Fatal)?;
            let source = format!("file:{}", path.display());
            envelope_from_value(document, &step.local_type, &source).map_err(FetchFailure::Step)
        }
        SourceDescriptor::Document { url } => state
            .fetcher
            .fetch_document(url, &step.local_type)
            .map_err(FetchFailure::Step),
        SourceDescriptor::Listing { .. } => match &state.transfer {
            Some(client) => list_collections(
                client.as_ref(),
                state.options.extra_endpoints_file.as_deref(),
                &step.local_type,
            )
            .map_err(FetchFailure::Step),
            None => Err(FetchFailure::Step(StepError::Transfer(
                "no transfer client configured for a listing source".to_string(),
            ))),
        },
    }
}

fn dispatch(
    state: &mut PipelineState,
    step: &StepConfig,
    envelope: &ContentEnvelope,
    activity_id: &str,
) -> Result<(), StepError> {
    match &step.destination {
        Destination::WriteFile { path } => write_envelope_atomic(path, envelope),
        Destination::WriteMemory { key_field } => {
            store_in_memory(state, envelope, key_field, activity_id);
            Ok(())
        }
        Destination::Analyze { .. } => analyze_content(envelope),
        Destination::Reconcile(ReconcileHandler::GlobusCollections) => {
            let mut engine = ReconcileEngine {
                store: state.store.as_mut(),
                index: state.index.as_deref_mut(),
                affiliation: &state.options.affiliation,
                warehouse_api_prefix: &state.options.warehouse_api_prefix,
            };
            engine.write_globus_collections(envelope, step, &mut state.counters)
        }
    }
}

/// Analysis hook for `analyze:` destinations. Reserved for content
/// validation; currently accepts everything.
fn analyze_content(_envelope: &ContentEnvelope) -> Result<(), StepError> {
    Ok(())
}

fn store_in_memory(
    state: &mut PipelineState,
    envelope: &ContentEnvelope,
    key_field: &str,
    label: &str,
) {
    let mut stored = 0usize;
    let mut skipped = 0u64;
    {
        let table = state
            .memory
            .entry(envelope.type_tag().to_string())
            .or_default();
        for record in envelope.records() {
            match record.get(key_field).and_then(Value::as_str) {
                Some(key) => {
                    table.insert(key.to_string(), record.clone());
                    stored += 1;
                }
                None => skipped += 1,
            }
        }
    }
    if skipped > 0 {
        state.counters.tally_many(label, Action::Skip, skipped);
        warn!("[pipeline] {label}: skipped {skipped} records missing key field '{key_field}'");
    }
    info!(
        "[pipeline] stored {} records in memory under tag {}",
        stored,
        envelope.type_tag()
    );
}

/// Serialize the envelope document and move it into place in one rename, so
/// a reader never observes a half-written cache file.
fn write_envelope_atomic(path: &Path, envelope: &ContentEnvelope) -> Result<(), StepError> {
    let payload = serde_json::to_vec(&envelope.as_document()).map_err(io::Error::other)?;
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    let staging = path.with_extension("part");
    fs::write(&staging, &payload)?;
    fs::rename(&staging, path)?;
    info!(
        "[pipeline] serialized and wrote {} bytes to file={}",
        payload.len(),
        path.display()
    );
    Ok(())
}
