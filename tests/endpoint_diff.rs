use std::fs;

use indexmap::IndexMap;
use serde_json::{Value, json};

use collection_router::StepError;
use collection_router::diff::{LATEST_ALIAS, REPORT_PREFIX, run_endpoint_diff};
use collection_router::transfer::TransferClient;

const SUBSCRIPTION: &str = "sub-1234";

struct StubTransferClient {
    listing: Vec<Value>,
    servers: IndexMap<String, Vec<Value>>,
    failing: Vec<String>,
}

impl TransferClient for StubTransferClient {
    fn search_my_endpoints(&self, _limit: usize) -> Result<Vec<Value>, StepError> {
        Ok(self.listing.clone())
    }

    fn endpoint_by_id(&self, id: &str) -> Result<Value, StepError> {
        Err(StepError::Transfer(format!("no endpoint {id}")))
    }

    fn endpoint_servers(&self, id: &str) -> Result<Vec<Value>, StepError> {
        if self.failing.iter().any(|failing| failing == id) {
            return Err(StepError::Transfer(format!("server list failed for {id}")));
        }
        Ok(self.servers.get(id).cloned().unwrap_or_default())
    }
}

fn published_record(resource_id: &str, url: &str, org: &str, abbr: &str) -> Value {
    json!({
        "ResourceID": resource_id,
        "URL": url,
        "Description": format!("{abbr} GridFTP service"),
        "RDR_Fields": {
            "Organization_Name": org,
            "Organization_Abbreviation": abbr,
        },
    })
}

fn registered_endpoint(id: &str, name: &str, abbr: &str, keywords: &str) -> Value {
    json!({
        "id": id,
        "canonical_name": format!("xsede#{name}"),
        "DATA_TYPE": "endpoint",
        "description": format!("{abbr} GridFTP service"),
        // Stored display names come back quoted; they must still compare
        // equal to the unquoted published form.
        "display_name": format!("'XSEDE {abbr} {name}'"),
        "organization": format!("{abbr} organization"),
        "keywords": keywords,
        "contact_email": "help@xsede.org",
        "public": true,
        "is_globus_connect": false,
        "default_directory": null,
        "oauth_server": "oa4mp.xsede.org",
        "subscription_id": SUBSCRIPTION,
    })
}

fn report_document(path: &std::path::Path) -> Value {
    serde_json::from_slice(&fs::read(path).expect("read report")).expect("parse report")
}

#[test]
fn full_run_reports_drift_and_missing_endpoints() {
    let registry = vec![
        published_record(
            "comet.sdsc.xsede.org",
            "gsiftp://gridftp.comet.sdsc.xsede.org:2811/",
            "SDSC organization",
            "SDSC",
        ),
        published_record(
            "stampede2.tacc.xsede.org",
            "gsiftp://gridftp.stampede2.tacc.xsede.org:2811/",
            "TACC organization",
            "TACC",
        ),
        published_record(
            "bridges2.psc.xsede.org",
            "gsiftp://gridftp.bridges2.psc.xsede.org:2811/",
            "PSC organization",
            "PSC",
        ),
    ];
    let mut servers = IndexMap::new();
    servers.insert(
        "ep-comet".to_string(),
        vec![json!({"uri": "gsiftp://gridftp.comet.sdsc.xsede.org:2811"})],
    );
    servers.insert(
        "ep-stampede".to_string(),
        vec![json!({"uri": "gsiftp://gridftp.stampede2.tacc.xsede.org:2811"})],
    );
    let client = StubTransferClient {
        listing: vec![
            registered_endpoint("ep-comet", "comet", "SDSC", "XSEDE, SDSC, comet"),
            registered_endpoint("ep-stampede", "stampede2", "TACC", "XSEDE, stampede2"),
        ],
        servers,
        failing: Vec::new(),
    };

    let dir = tempfile::tempdir().expect("tempdir");
    let report_path =
        run_endpoint_diff(&registry, &client, SUBSCRIPTION, dir.path()).expect("diff run");

    let file_name = report_path.file_name().unwrap().to_str().unwrap();
    assert!(file_name.starts_with(REPORT_PREFIX));
    assert!(file_name.ends_with(".json"));

    let report = report_document(&report_path);
    let entries = report.as_object().expect("report object");
    // Comet matches its stored copy, so only stampede2 (keyword drift) and
    // bridges2 (never registered) are reported.
    assert_eq!(entries.len(), 2);

    let drift_key = "xsede#stampede2gsiftp://gridftp.stampede2.tacc.xsede.org:2811";
    let drift = entries[drift_key].as_object().expect("drift entry");
    assert_eq!(drift.len(), 1);
    assert_eq!(
        drift["keywords"],
        json!({"Published": "XSEDE, TACC, stampede2", "Registered": "XSEDE, stampede2"})
    );

    let creation_key = "xsede#bridges2gsiftp://gridftp.bridges2.psc.xsede.org:2811";
    let creation = entries[creation_key].as_object().expect("creation entry");
    assert_eq!(creation.len(), 13);
    assert_eq!(creation["DATA_TYPE"], json!({"Published": "endpoint"}));
    assert_eq!(
        creation["canonical_name"],
        json!({"Published": "xsede#bridges2"})
    );
    assert_eq!(
        creation["subscription_id"],
        json!({"Published": SUBSCRIPTION})
    );
    assert_eq!(
        creation["DATA"]["Published"][0],
        json!({
            "DATA_TYPE": "server",
            "hostname": "gridftp.bridges2.psc.xsede.org",
            "scheme": "gsiftp",
            "port": 2811,
            "subject": null,
        })
    );

    let alias = fs::read(dir.path().join(LATEST_ALIAS)).expect("read alias");
    assert_eq!(alias, fs::read(&report_path).expect("read report"));
}

#[test]
fn unreadable_server_lists_make_an_endpoint_look_unregistered() {
    let registry = vec![published_record(
        "comet.sdsc.xsede.org",
        "gsiftp://gridftp.comet.sdsc.xsede.org:2811/",
        "SDSC organization",
        "SDSC",
    )];
    let client = StubTransferClient {
        listing: vec![registered_endpoint(
            "ep-comet",
            "comet",
            "SDSC",
            "XSEDE, SDSC, comet",
        )],
        servers: IndexMap::new(),
        failing: vec!["ep-comet".to_string()],
    };

    let dir = tempfile::tempdir().expect("tempdir");
    let report_path =
        run_endpoint_diff(&registry, &client, SUBSCRIPTION, dir.path()).expect("diff run");

    let report = report_document(&report_path);
    let entries = report.as_object().expect("report object");
    assert_eq!(entries.len(), 1);
    let entry = entries["xsede#cometgsiftp://gridftp.comet.sdsc.xsede.org:2811"]
        .as_object()
        .expect("creation entry");
    assert_eq!(entry.len(), 13);
    assert!(entry.values().all(|diff| diff.get("Registered").is_none()));
}

#[test]
fn malformed_registry_records_are_skipped_without_failing_the_run() {
    let registry = vec![
        published_record(
            "bridges2.psc.xsede.org",
            "gsiftp://gridftp.bridges2.psc.xsede.org:2811/",
            "PSC organization",
            "PSC",
        ),
        json!({"URL": "gsiftp://orphan.example.org:2811/"}),
        json!({"ResourceID": "unreachable.example.org"}),
    ];
    let client = StubTransferClient {
        listing: Vec::new(),
        servers: IndexMap::new(),
        failing: Vec::new(),
    };

    let dir = tempfile::tempdir().expect("tempdir");
    let report_path =
        run_endpoint_diff(&registry, &client, SUBSCRIPTION, dir.path()).expect("diff run");

    let report = report_document(&report_path);
    let entries = report.as_object().expect("report object");
    assert_eq!(entries.len(), 1);
    assert!(
        entries.contains_key("xsede#bridges2gsiftp://gridftp.bridges2.psc.xsede.org:2811")
    );
}
