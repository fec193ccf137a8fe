use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::errors::StepError;
use crate::fetch::Fetcher;
use crate::transfer::TransferClient;
use crate::types::EndpointKey;

/// Published endpoint registry queried when the CLI gives no override.
pub const REGISTRY_URL: &str = "https://info.xsede.org/wh1/goendpoint-api/v1/goservices/";
/// Content tag the registry's record list is carried under.
pub const REGISTRY_TYPE_TAG: &str = "goservices";
/// Account prefix of every canonical endpoint name.
pub const CANONICAL_OWNER: &str = "xsede";
/// Contact address stamped into every creation payload.
pub const CONTACT_EMAIL: &str = "help@xsede.org";
/// OAuth server stamped into every creation payload.
pub const OAUTH_SERVER: &str = "oa4mp.xsede.org";
/// Server scheme stamped into every creation payload.
pub const SERVER_SCHEME: &str = "gsiftp";
/// Port assumed when a registered URL does not carry one.
pub const DEFAULT_SERVER_PORT: u16 = 2811;
/// Upper bound on the registered-endpoint search.
pub const REGISTERED_SEARCH_LIMIT: usize = 120;
/// Report file name prefix; the UTC timestamp follows.
pub const REPORT_PREFIX: &str = "EndpointDiff-";
/// Alias file repointed at the newest report after every run.
pub const LATEST_ALIAS: &str = "Newest.json";

const REPORT_TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H:%M:%S";

/// One field of one endpoint in the report. `Registered` is absent for
/// endpoints flagged for creation (there is no stored value to compare).
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FieldDiff {
    /// Value built from the published registry record.
    #[serde(rename = "Published")]
    pub published: Value,
    /// Value currently registered with the transfer service.
    #[serde(rename = "Registered", skip_serializing_if = "Option::is_none")]
    pub registered: Option<Value>,
}

/// Endpoint composite key to per-field differences. An entry whose every
/// field lacks `Registered` is an endpoint flagged for creation.
pub type DiffReport = IndexMap<EndpointKey, IndexMap<String, FieldDiff>>;

/// Fetch the published endpoint registry as a record list.
pub fn fetch_registry(fetcher: &mut Fetcher, url: &str) -> Result<Vec<Value>, StepError> {
    let envelope = fetcher.fetch_document(url, REGISTRY_TYPE_TAG)?;
    Ok(envelope.records().to_vec())
}

/// Endpoint name derived from a dotted resource identifier. Most resources
/// use the first label alone; HPSS archives and the IU Wrangler deployment
/// carry the site label too.
pub fn derive_endpoint_name(resource_id: &str) -> String {
    let mut parts = resource_id.splitn(3, '.');
    let first = parts.next().unwrap_or_default();
    let second = parts.next().unwrap_or_default();
    if first == "hpss" && !second.is_empty() {
        return format!("{first}-{second}");
    }
    if first == "wrangler" && second == "iu" {
        return format!("{first}-{second}");
    }
    first.to_string()
}

/// Host and port of a `scheme://host:port/` URL. A URL without a port gets
/// [`DEFAULT_SERVER_PORT`]; an unparseable port is `None`.
pub fn split_host_port(url: &str) -> Option<(String, u16)> {
    let rest = url.split_once("://").map_or(url, |(_, after)| after);
    let rest = rest.trim_end_matches('/');
    match rest.split_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port.parse().ok()?;
            Some((host.to_string(), port))
        }
        Some(_) => None,
        None if rest.is_empty() => None,
        None => Some((rest.to_string(), DEFAULT_SERVER_PORT)),
    }
}

/// Key the registry records by `owner#derivedName` plus the URL stripped of
/// trailing slashes. Records missing the key fields are logged and skipped.
pub fn published_endpoints(registry: &[Value]) -> IndexMap<String, Value> {
    let mut published = IndexMap::new();
    for record in registry {
        let Some(url) = record.get("URL").and_then(Value::as_str) else {
            warn!("[diff] skipping published record without URL: {record}");
            continue;
        };
        let Some(resource_id) = record.get("ResourceID").and_then(Value::as_str) else {
            warn!("[diff] skipping published record without ResourceID: url={url}");
            continue;
        };
        let key = format!(
            "{CANONICAL_OWNER}#{}{}",
            derive_endpoint_name(resource_id),
            url.trim_end_matches('/')
        );
        published.insert(key, record.clone());
    }
    published
}

/// Key the account's registered endpoints by canonical name plus each
/// server URI. One endpoint's server-list failure skips that endpoint only.
pub fn registered_endpoints(
    client: &dyn TransferClient,
) -> Result<IndexMap<String, Value>, StepError> {
    let listing = client.search_my_endpoints(REGISTERED_SEARCH_LIMIT)?;
    let mut existing = IndexMap::new();
    for endpoint in &listing {
        let Some(id) = endpoint.get("id").and_then(Value::as_str) else {
            warn!("[diff] skipping registered endpoint without id: {endpoint}");
            continue;
        };
        let Some(canonical) = endpoint.get("canonical_name").and_then(Value::as_str) else {
            warn!("[diff] skipping registered endpoint without canonical_name: id={id}");
            continue;
        };
        let servers = match client.endpoint_servers(id) {
            Ok(servers) => servers,
            Err(err) => {
                warn!("[diff] skipping registered endpoint {id}: {err}");
                continue;
            }
        };
        for server in servers {
            if let Some(uri) = server.get("uri").and_then(Value::as_str)
                && !uri.is_empty()
            {
                existing.insert(format!("{canonical}{uri}"), endpoint.clone());
            }
        }
    }
    Ok(existing)
}

/// Full endpoint-creation payload for one published registry record.
///
/// Description falls through the record's own description to the registry
/// description to a derived default. Display name and keywords fall back to
/// forms built from the organization abbreviation and the derived name.
pub fn creation_payload(
    record: &Value,
    subscription_id: &str,
) -> Result<IndexMap<String, Value>, StepError> {
    let url = record.get("URL").and_then(Value::as_str).unwrap_or_default();
    let resource_id = record
        .get("ResourceID")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if resource_id.is_empty() {
        return Err(StepError::MalformedResponse {
            url: url.to_string(),
            reason: "published record carries no ResourceID".to_string(),
        });
    }
    let (hostname, port) = split_host_port(url).ok_or_else(|| StepError::MalformedResponse {
        url: url.to_string(),
        reason: "endpoint URL does not parse as scheme://host:port/".to_string(),
    })?;
    let name = derive_endpoint_name(resource_id);

    let rdr = record.get("RDR_Fields");
    let rdr_description = rdr
        .and_then(|fields| fields.get("RDR_Description"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    let organization = rdr
        .and_then(|fields| fields.get("Organization_Name"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    let abbreviation = rdr
        .and_then(|fields| fields.get("Organization_Abbreviation"))
        .and_then(Value::as_str)
        .unwrap_or_default();

    let own_description = record
        .get("Description")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let description = if !own_description.is_empty() {
        own_description.to_string()
    } else if !rdr_description.is_empty() {
        rdr_description.to_string()
    } else {
        format!("{name} GridFTP endpoint")
    };

    let own_display = record
        .get("DisplayName")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let display_name = if !own_display.is_empty() {
        own_display.to_string()
    } else if abbreviation.is_empty() {
        format!("XSEDE {name}")
    } else {
        format!("XSEDE {abbreviation} {name}")
    };
    let keywords = if abbreviation.is_empty() {
        format!("XSEDE, {name}")
    } else {
        format!("XSEDE, {abbreviation}, {name}")
    };

    let mut payload = IndexMap::new();
    payload.insert("DATA_TYPE".to_string(), json!("endpoint"));
    payload.insert("description".to_string(), json!(description));
    payload.insert(
        "canonical_name".to_string(),
        json!(format!("{CANONICAL_OWNER}#{name}")),
    );
    payload.insert("display_name".to_string(), json!(display_name));
    payload.insert("organization".to_string(), json!(organization));
    payload.insert("keywords".to_string(), json!(keywords));
    payload.insert("contact_email".to_string(), json!(CONTACT_EMAIL));
    payload.insert("public".to_string(), json!(true));
    payload.insert("is_globus_connect".to_string(), json!(false));
    payload.insert("default_directory".to_string(), Value::Null);
    payload.insert("oauth_server".to_string(), json!(OAUTH_SERVER));
    payload.insert("subscription_id".to_string(), json!(subscription_id));
    payload.insert(
        "DATA".to_string(),
        json!([{
            "DATA_TYPE": "server",
            "hostname": hostname,
            "scheme": SERVER_SCHEME,
            "port": port,
            "subject": null,
        }]),
    );
    Ok(payload)
}

/// Compare every published endpoint against the registered set.
///
/// An endpoint absent from the registered set enters the report with its
/// whole creation payload, `Published` side only. An endpoint present in
/// both enters only if at least one payload field differs from its stored
/// value; the server-list `DATA` field is never compared.
pub fn diff_endpoints(
    published: &IndexMap<String, Value>,
    existing: &IndexMap<String, Value>,
    subscription_id: &str,
) -> DiffReport {
    let mut report = DiffReport::new();
    for (key, record) in published {
        let payload = match creation_payload(record, subscription_id) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("[diff] skipping {key}: {err}");
                continue;
            }
        };
        match existing.get(key) {
            None => {
                info!("[diff] {key} is not registered, needs creation");
                let entry = payload
                    .into_iter()
                    .map(|(field, value)| {
                        (
                            field,
                            FieldDiff {
                                published: value,
                                registered: None,
                            },
                        )
                    })
                    .collect();
                report.insert(key.clone(), entry);
            }
            Some(registered) => {
                debug!("[diff] comparing registered endpoint {key}");
                let mut fields = IndexMap::new();
                for (field, value) in &payload {
                    if field == "DATA" {
                        continue;
                    }
                    let stored = registered.get(field).cloned().unwrap_or(Value::Null);
                    if !values_match(value, &stored) {
                        info!(
                            "[diff] {key}: field {field} published as {value} but registered as {stored}"
                        );
                        fields.insert(
                            field.clone(),
                            FieldDiff {
                                published: value.clone(),
                                registered: Some(stored),
                            },
                        );
                    }
                }
                if !fields.is_empty() {
                    report.insert(key.clone(), fields);
                }
            }
        }
    }
    report
}

/// Stored string values may carry literal surrounding quotes; unwrap one
/// layer before comparing string against string.
fn values_match(published: &Value, registered: &Value) -> bool {
    if let (Value::String(published), Value::String(registered)) = (published, registered) {
        return published == unwrap_quoted(registered);
    }
    published == registered
}

fn unwrap_quoted(raw: &str) -> &str {
    let bytes = raw.as_bytes();
    if bytes.len() >= 2
        && matches!(bytes[0], b'\'' | b'"')
        && matches!(bytes[bytes.len() - 1], b'\'' | b'"')
    {
        &raw[1..raw.len() - 1]
    } else {
        raw
    }
}

/// Serialize the report under `report_dir` with a UTC timestamp in the file
/// name, then repoint the [`LATEST_ALIAS`] at it (symlink where supported,
/// copy otherwise).
pub fn write_report(
    report_dir: &Path,
    report: &DiffReport,
    now: DateTime<Utc>,
) -> Result<PathBuf, StepError> {
    fs::create_dir_all(report_dir)?;
    let file_name = format!(
        "{REPORT_PREFIX}{}.json",
        now.format(REPORT_TIMESTAMP_FORMAT)
    );
    let path = report_dir.join(&file_name);
    let body = serde_json::to_vec_pretty(report).map_err(|err| StepError::Persistence {
        id: path.display().to_string(),
        reason: format!("serializing report: {err}"),
    })?;
    let part = path.with_extension("json.part");
    fs::write(&part, &body)?;
    fs::rename(&part, &path)?;

    let alias = report_dir.join(LATEST_ALIAS);
    if fs::symlink_metadata(&alias).is_ok() {
        fs::remove_file(&alias)?;
    }
    #[cfg(unix)]
    let linked = std::os::unix::fs::symlink(&file_name, &alias).is_ok();
    #[cfg(not(unix))]
    let linked = false;
    if !linked {
        fs::copy(&path, &alias)?;
    }
    info!(
        "[diff] wrote {} endpoint entries to {}",
        report.len(),
        path.display()
    );
    Ok(path)
}

/// One-shot diff run: compare the published registry against the account's
/// registered endpoints and persist a timestamped report.
pub fn run_endpoint_diff(
    registry: &[Value],
    client: &dyn TransferClient,
    subscription_id: &str,
    report_dir: &Path,
) -> Result<PathBuf, StepError> {
    let published = published_endpoints(registry);
    let existing = registered_endpoints(client)?;
    info!(
        "[diff] comparing {} published against {} registered endpoints",
        published.len(),
        existing.len()
    );
    let report = diff_endpoints(&published, &existing, subscription_id);
    write_report(report_dir, &report, Utc::now())
}
