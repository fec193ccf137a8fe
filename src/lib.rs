#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

/// CLI entry points shared by the two binaries.
pub mod app;
/// Run configuration, catalog merge, and step resolution.
pub mod config;
/// Content envelopes carried between fetch and dispatch.
pub mod content;
/// Ordered-block description builder.
pub mod describe;
/// Endpoint diff reconciler.
pub mod diff;
/// Caching JSON fetcher for step sources.
pub mod fetch;
/// Exclusive pid/lock file.
pub mod lock;
/// Per-iteration counters and step summaries.
pub mod metrics;
/// Step execution and dispatch.
pub mod pipeline;
/// Collection reconciliation engine.
pub mod reconcile;
/// Relation edge derivation and replacement.
pub mod relations;
/// Run loop, peak-aware sleep, and signal handling.
pub mod schedule;
/// Warehouse record types and the store/search-index seams.
pub mod store;
/// Transfer-service client trait and HTTP implementation.
pub mod transfer;
/// Shared type aliases.
pub mod types;

mod errors;

pub use config::{
    Destination, ReconcileHandler, RouterConfig, SourceDescriptor, StepConfig, resolve_steps,
    source_use_counts,
};
pub use content::ContentEnvelope;
pub use diff::{DiffReport, FieldDiff};
pub use errors::{ConfigError, StepError, StoreError};
pub use metrics::{Action, RunCounters};
pub use pipeline::{PipelineOptions, PipelineState, StepOutcome, run_iteration};
pub use reconcile::ReconcileEngine;
pub use schedule::{RunEnd, ShutdownFlag, run_loop};
pub use store::{
    LocalRecord, MemoryStore, PublishedResource, RecordStore, RelationRecord, SearchIndex,
};
pub use transfer::{GlobusTransferClient, TransferClient};
