use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::errors::ConfigError;
use crate::types::{CatalogUrn, TypeTag};

/// Host that requires partner request headers on fetches.
pub const RDR_HOST: &str = "rdr.xsede.org";

/// Default per-call HTTP timeout in seconds.
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Top-level run configuration, loaded once at startup from a JSON file.
/// Key names match the deployed config convention (uppercase).
#[derive(Clone, Debug, Deserialize)]
pub struct RouterConfig {
    /// Ordered pipeline steps.
    #[serde(rename = "STEPS", default)]
    pub steps: Vec<RawStepConfig>,
    /// Catalog table embedded directly in the config.
    #[serde(rename = "CATALOGS", default)]
    pub catalogs: IndexMap<CatalogUrn, CatalogRecord>,
    /// Optional path to a JSON file carrying additional catalog records.
    /// Embedded `CATALOGS` entries win on key collision.
    #[serde(rename = "CATALOG_FILE", default)]
    pub catalog_file: Option<PathBuf>,
    /// Log destination used by `--daemon` mode.
    #[serde(rename = "LOG_FILE", default)]
    pub log_file: Option<PathBuf>,
    /// Log level when the CLI does not override it.
    #[serde(rename = "LOG_LEVEL", default)]
    pub log_level: Option<String>,
    /// Exclusive lock/pid file path.
    #[serde(rename = "PID_FILE", default)]
    pub pid_file: Option<PathBuf>,
    /// Search-index hosts; empty means indexing is disabled.
    #[serde(rename = "ELASTIC_HOSTS", default)]
    pub elastic_hosts: Vec<String>,
    /// Transfer-service client identity.
    #[serde(rename = "GLOBUS_CLIENT_ID", default)]
    pub globus_client_id: Option<String>,
    /// Transfer-service refresh token.
    #[serde(rename = "GLOBUS_REFRESH_TOKEN", default)]
    pub globus_refresh_token: Option<String>,
    /// Optional file listing supplemental endpoint IDs, one per line.
    #[serde(rename = "EXTRA_ENDPOINTS_FILE", default)]
    pub extra_endpoints_file: Option<PathBuf>,
    /// Subscription applied to endpoint-creation payloads by the diff tool.
    #[serde(rename = "XSEDE_SUBSCRIPTION_ID", default)]
    pub subscription_id: Option<String>,
    /// Per-call HTTP timeout override in seconds.
    #[serde(rename = "HTTP_TIMEOUT_SECS", default)]
    pub http_timeout_secs: Option<u64>,
    /// Disable TLS certificate validation when explicitly set to false.
    #[serde(rename = "TLS_VERIFY", default)]
    pub tls_verify: Option<bool>,
    /// Unknown keys are preserved for forward compatibility but unused.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RouterConfig {
    /// Load and validate the router config file. Any failure here is fatal.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::load_lenient(path)?;
        if config.steps.is_empty() {
            return Err(ConfigError::Invalid("missing config STEPS".to_string()));
        }
        Ok(config)
    }

    /// Load without requiring `STEPS`. The diff tool shares the config file
    /// format but runs no pipeline steps.
    pub fn load_lenient(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|err| ConfigError::Read {
            path: path.display().to_string(),
            source: err,
        })?;
        serde_json::from_str(&raw).map_err(|err| ConfigError::Parse {
            path: path.display().to_string(),
            source: err,
        })
    }

    /// Full catalog table: `CATALOG_FILE` entries first, embedded `CATALOGS`
    /// overlaid on top.
    pub fn catalog_table(&self) -> Result<IndexMap<CatalogUrn, CatalogRecord>, ConfigError> {
        let mut table = IndexMap::new();
        if let Some(path) = &self.catalog_file {
            let raw = fs::read_to_string(path).map_err(|err| ConfigError::Read {
                path: path.display().to_string(),
                source: err,
            })?;
            let loaded: IndexMap<CatalogUrn, CatalogRecord> = serde_json::from_str(&raw)
                .map_err(|err| ConfigError::Parse {
                    path: path.display().to_string(),
                    source: err,
                })?;
            table.extend(loaded);
        }
        for (urn, record) in &self.catalogs {
            table.insert(urn.clone(), record.clone());
        }
        Ok(table)
    }

    /// Effective per-call HTTP timeout.
    pub fn http_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.http_timeout_secs.unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS))
    }

    /// TLS certificate validation setting (on unless explicitly disabled).
    pub fn tls_verify(&self) -> bool {
        self.tls_verify.unwrap_or(true)
    }

    /// Lock/pid file path, with the conventional `/var/run` default.
    pub fn pid_file_path(&self, program: &str) -> PathBuf {
        match &self.pid_file {
            Some(path) => path.clone(),
            None => PathBuf::from(format!("/var/run/{program}/{program}.pid")),
        }
    }
}

/// One catalog definition: per-namespace defaults merged under every step
/// that references it.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct CatalogRecord {
    /// Default source URL for steps in this catalog.
    #[serde(rename = "CatalogAPIURL", default)]
    pub api_url: Option<String>,
    /// Default local record type tag.
    #[serde(rename = "LOCALTYPE", default)]
    pub local_type: Option<TypeTag>,
    /// Default URN prefix for derived identifiers.
    #[serde(rename = "URNPREFIX", default)]
    pub urn_prefix: Option<String>,
    /// How non-file sources are fetched: plain HTTP GET (`http`, default) or
    /// the transfer-service listing adapter (`listing`).
    #[serde(rename = "SOURCEMETHOD", default)]
    pub source_method: Option<String>,
    /// Remaining catalog fields, carried into the merged step metadata.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One step as written in the config file, before catalog merge.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RawStepConfig {
    /// Catalog this step belongs to. Required.
    #[serde(rename = "CATALOGURN", default)]
    pub catalog_urn: Option<CatalogUrn>,
    /// Source override; falls back to the catalog's `CatalogAPIURL`.
    #[serde(rename = "SOURCEURL", default)]
    pub source_url: Option<String>,
    /// Destination descriptor, e.g. `file:/tmp/cache.json`,
    /// `memory:id`, `analyze:content`, `function:Write_Globus_Collections`.
    #[serde(rename = "DESTINATION", default)]
    pub destination: Option<String>,
    /// Local type tag override.
    #[serde(rename = "LOCALTYPE", default)]
    pub local_type: Option<TypeTag>,
    /// URN prefix override.
    #[serde(rename = "URNPREFIX", default)]
    pub urn_prefix: Option<String>,
    /// Source method override (`http` or `listing`).
    #[serde(rename = "SOURCEMETHOD", default)]
    pub source_method: Option<String>,
    /// Step-specific metadata; wins over catalog fields on collision.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Where a step's content comes from.
#[derive(Clone, Debug, PartialEq)]
pub enum SourceDescriptor {
    /// Read a local JSON document.
    File {
        /// Filesystem path of the document.
        path: PathBuf,
    },
    /// GET a remote JSON document through the caching fetcher.
    Document {
        /// Full source URL.
        url: String,
    },
    /// List collections through the transfer-service adapter.
    Listing {
        /// Transfer-service API URL (informational; the adapter owns the call).
        url: String,
    },
}

impl SourceDescriptor {
    /// The raw source string as configured, used for multiplicity counting.
    pub fn raw(&self) -> String {
        match self {
            Self::File { path } => format!("file:{}", path.display()),
            Self::Document { url } | Self::Listing { url } => url.clone(),
        }
    }

    /// Scheme token, used in activity identifiers.
    pub fn scheme(&self) -> &str {
        match self {
            Self::File { .. } => "file",
            Self::Document { url } | Self::Listing { url } => split_scheme(url)
                .map(|(scheme, _)| scheme)
                .unwrap_or("http"),
        }
    }
}

/// Closed destination dispatch; never resolved by name at run time.
#[derive(Clone, Debug, PartialEq)]
pub enum Destination {
    /// Serialize the envelope to a JSON file (atomic write).
    WriteFile {
        /// Target file path.
        path: PathBuf,
    },
    /// Index each record by `key_field` into the in-process memory table.
    WriteMemory {
        /// Record field used as the table key.
        key_field: String,
    },
    /// Run the pluggable analysis hook.
    Analyze {
        /// Analysis target label (currently informational).
        target: String,
    },
    /// Run a named reconciliation handler.
    Reconcile(ReconcileHandler),
}

impl Destination {
    /// Scheme token, used in activity identifiers.
    pub fn scheme(&self) -> &'static str {
        match self {
            Self::WriteFile { .. } => "file",
            Self::WriteMemory { .. } => "memory",
            Self::Analyze { .. } => "analyze",
            Self::Reconcile(_) => "function",
        }
    }

    /// Handler/target label, used in activity identifiers.
    pub fn label(&self) -> String {
        match self {
            Self::WriteFile { path } => path.display().to_string(),
            Self::WriteMemory { key_field } => key_field.clone(),
            Self::Analyze { target } => target.clone(),
            Self::Reconcile(handler) => handler.name().to_string(),
        }
    }
}

/// The closed set of reconciliation handlers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileHandler {
    /// Upsert/sweep Globus collections into the warehouse.
    GlobusCollections,
}

impl ReconcileHandler {
    /// Resolve a configured handler name, or `None` for unknown names.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "Write_Globus_Collections" => Some(Self::GlobusCollections),
            _ => None,
        }
    }

    /// Configured name of this handler.
    pub fn name(&self) -> &'static str {
        match self {
            Self::GlobusCollections => "Write_Globus_Collections",
        }
    }
}

/// One fully resolved, immutable pipeline step.
#[derive(Clone, Debug)]
pub struct StepConfig {
    /// Owning catalog namespace.
    pub catalog_urn: CatalogUrn,
    /// Resolved content source.
    pub source: SourceDescriptor,
    /// Resolved destination dispatch.
    pub destination: Destination,
    /// Content-type tag this step expects and stores under.
    pub local_type: TypeTag,
    /// URN prefix for derived identifiers (required for reconcile steps).
    pub urn_prefix: Option<String>,
    /// Merged catalog+step metadata; step fields win.
    pub metadata: Map<String, Value>,
}

impl StepConfig {
    /// URN prefix, present only on steps validated to carry one.
    pub fn urn_prefix(&self) -> &str {
        self.urn_prefix.as_deref().unwrap_or_default()
    }
}

/// Resolve raw steps against the catalog table, failing fast on any
/// incoherent step. Merge starts from the catalog record; step fields win.
pub fn resolve_steps(
    raw_steps: &[RawStepConfig],
    catalogs: &IndexMap<CatalogUrn, CatalogRecord>,
) -> Result<Vec<StepConfig>, ConfigError> {
    let mut steps = Vec::with_capacity(raw_steps.len());
    for (index, raw) in raw_steps.iter().enumerate() {
        let step_label = format!("STEPS[{index}]");
        let catalog_urn = raw.catalog_urn.clone().ok_or(ConfigError::MissingKey {
            step: step_label.clone(),
            key: "CATALOGURN".to_string(),
        })?;
        let catalog = catalogs
            .get(&catalog_urn)
            .ok_or_else(|| ConfigError::UnknownCatalog {
                step: step_label.clone(),
                catalog: catalog_urn.clone(),
            })?;

        let source_url = raw
            .source_url
            .clone()
            .or_else(|| catalog.api_url.clone())
            .ok_or(ConfigError::MissingKey {
                step: step_label.clone(),
                key: "SOURCEURL".to_string(),
            })?;
        let source_method = raw
            .source_method
            .as_deref()
            .or(catalog.source_method.as_deref())
            .unwrap_or("http");
        let source = parse_source(&step_label, &source_url, source_method)?;

        let destination_raw = raw.destination.clone().ok_or(ConfigError::MissingKey {
            step: step_label.clone(),
            key: "DESTINATION".to_string(),
        })?;
        let destination = parse_destination(&step_label, &destination_raw)?;

        if matches!(source, SourceDescriptor::File { .. })
            && matches!(destination, Destination::WriteFile { .. })
        {
            return Err(ConfigError::FileToFile { step: step_label });
        }

        let local_type = raw
            .local_type
            .clone()
            .or_else(|| catalog.local_type.clone())
            .ok_or(ConfigError::MissingKey {
                step: step_label.clone(),
                key: "LOCALTYPE".to_string(),
            })?;
        let urn_prefix = raw
            .urn_prefix
            .clone()
            .or_else(|| catalog.urn_prefix.clone());
        if matches!(destination, Destination::Reconcile(_)) && urn_prefix.is_none() {
            return Err(ConfigError::MissingKey {
                step: step_label,
                key: "URNPREFIX".to_string(),
            });
        }

        let mut metadata = catalog.extra.clone();
        for (key, value) in &raw.extra {
            metadata.insert(key.clone(), value.clone());
        }

        steps.push(StepConfig {
            catalog_urn,
            source,
            destination,
            local_type,
            urn_prefix,
            metadata,
        });
    }
    Ok(steps)
}

fn parse_source(
    step: &str,
    source_url: &str,
    source_method: &str,
) -> Result<SourceDescriptor, ConfigError> {
    let (scheme, rest) = split_scheme(source_url).ok_or_else(|| ConfigError::BadUrl {
        step: step.to_string(),
        role: "source",
        url: source_url.to_string(),
    })?;
    match scheme {
        "file" => Ok(SourceDescriptor::File {
            path: PathBuf::from(strip_authority(rest)),
        }),
        "http" | "https" => {
            if source_method == "listing" {
                Ok(SourceDescriptor::Listing {
                    url: source_url.to_string(),
                })
            } else {
                Ok(SourceDescriptor::Document {
                    url: source_url.to_string(),
                })
            }
        }
        other => Err(ConfigError::BadScheme {
            step: step.to_string(),
            role: "source",
            scheme: other.to_string(),
        }),
    }
}

fn parse_destination(step: &str, destination: &str) -> Result<Destination, ConfigError> {
    let (scheme, rest) = split_scheme(destination).ok_or_else(|| ConfigError::BadUrl {
        step: step.to_string(),
        role: "destination",
        url: destination.to_string(),
    })?;
    let target = strip_authority(rest).to_string();
    match scheme {
        "file" => Ok(Destination::WriteFile {
            path: PathBuf::from(target),
        }),
        "memory" => Ok(Destination::WriteMemory { key_field: target }),
        "analyze" => Ok(Destination::Analyze { target }),
        "function" => {
            let handler =
                ReconcileHandler::from_name(&target).ok_or_else(|| ConfigError::BadUrl {
                    step: step.to_string(),
                    role: "destination function",
                    url: destination.to_string(),
                })?;
            Ok(Destination::Reconcile(handler))
        }
        other => Err(ConfigError::BadScheme {
            step: step.to_string(),
            role: "destination",
            scheme: other.to_string(),
        }),
    }
}

/// Split `scheme:rest`, accepting only plausible scheme tokens.
pub fn split_scheme(raw: &str) -> Option<(&str, &str)> {
    let (scheme, rest) = raw.split_once(':')?;
    if scheme.is_empty()
        || !scheme
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '+' | '-' | '.'))
    {
        return None;
    }
    Some((scheme, rest))
}

/// Drop a `//authority` segment, keeping the path for non-host descriptors.
fn strip_authority(rest: &str) -> &str {
    match rest.strip_prefix("//") {
        Some(after) => after.find('/').map(|idx| &after[idx..]).unwrap_or(""),
        None => rest,
    }
}

/// Lowercased host portion of an `http(s)://host[:port]/...` URL.
pub fn http_host(url: &str) -> Option<String> {
    let (_, rest) = split_scheme(url)?;
    let after = rest.strip_prefix("//")?;
    let end = after.find(['/', '?', '#']).unwrap_or(after.len());
    let authority = &after[..end];
    let host = authority.split('@').next_back().unwrap_or(authority);
    let host = host.split(':').next().unwrap_or(host);
    if host.is_empty() {
        None
    } else {
        Some(host.to_ascii_lowercase())
    }
}

/// Count how many steps reference each raw source string. The fetcher caches
/// only sources used by more than one step.
pub fn source_use_counts(steps: &[StepConfig]) -> IndexMap<String, usize> {
    let mut counts = IndexMap::new();
    for step in steps {
        *counts.entry(step.source.raw()).or_insert(0) += 1;
    }
    counts
}
