use std::fs;
use std::path::Path;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info};
use ureq::Agent;

use crate::content::ContentEnvelope;
use crate::errors::StepError;

/// Upper bound on one account-scoped collection search.
pub const MY_ENDPOINTS_LIMIT: usize = 1000;

/// Transfer-service boundary: the minimal surface the pipeline and the diff
/// tool need. Production uses [`GlobusTransferClient`]; tests substitute
/// fixtures.
pub trait TransferClient {
    /// Collections/endpoints owned by the authenticated account, raw JSON
    /// documents as served, at most `limit` entries.
    fn search_my_endpoints(&self, limit: usize) -> Result<Vec<Value>, StepError>;

    /// One endpoint document by its native ID.
    fn endpoint_by_id(&self, id: &str) -> Result<Value, StepError>;

    /// Server/URI documents registered under one endpoint ID.
    fn endpoint_servers(&self, id: &str) -> Result<Vec<Value>, StepError>;
}

/// List the account's collections, extended with any statically configured
/// extra endpoint IDs (one per line; the file being absent is not an error).
pub fn list_collections(
    client: &dyn TransferClient,
    extra_endpoints_file: Option<&Path>,
    type_tag: &str,
) -> Result<ContentEnvelope, StepError> {
    let mut records = client.search_my_endpoints(MY_ENDPOINTS_LIMIT)?;

    if let Some(path) = extra_endpoints_file {
        match fs::read_to_string(path) {
            Ok(listing) => {
                for id in listing.lines().map(str::trim).filter(|id| !id.is_empty()) {
                    records.push(client.endpoint_by_id(id)?);
                }
            }
            Err(err) => {
                debug!(
                    "[transfer] skipping extra endpoints file {}: {}",
                    path.display(),
                    err
                );
            }
        }
    }

    info!("[transfer] listed {} collections", records.len());
    Ok(ContentEnvelope::from_records(type_tag, records))
}

/// Bearer-token client for the transfer service. Exchanges the configured
/// refresh token once at connect time; all calls then reuse the same token
/// for the process lifetime.
pub struct GlobusTransferClient {
    agent: Agent,
    access_token: String,
}

impl GlobusTransferClient {
    /// Exchange `refresh_token` for an access token and return a ready
    /// client.
    pub fn connect(
        timeout: Duration,
        tls_verify: bool,
        client_id: &str,
        refresh_token: &str,
    ) -> Result<Self, StepError> {
        let mut builder = Agent::config_builder().timeout_global(Some(timeout));
        if !tls_verify {
            builder = builder.tls_config(
                ureq::tls::TlsConfig::builder()
                    .disable_verification(true)
                    .build(),
            );
        }
        let agent: Agent = builder.build().new_agent();

        let endpoint = Self::auth_token_endpoint();
        let response = agent
            .post(&endpoint)
            .send_form([
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", client_id),
            ])
            .map_err(|err| {
                StepError::Transfer(format!("failed exchanging refresh token: {err}"))
            })?;
        let body = response.into_body().read_to_string().map_err(|err| {
            StepError::Transfer(format!("failed reading token response body: {err}"))
        })?;
        let token_doc: Value = serde_json::from_str(&body).map_err(|err| {
            StepError::Transfer(format!("token response is not valid JSON: {err}"))
        })?;
        let access_token = token_doc
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                StepError::Transfer("token response carries no access_token".to_string())
            })?
            .to_string();

        Ok(Self {
            agent,
            access_token,
        })
    }

    fn auth_token_endpoint() -> String {
        #[cfg(test)]
        if let Ok(value) = std::env::var("COLLECTION_ROUTER_AUTH_ENDPOINT")
            && !value.trim().is_empty()
        {
            return value;
        }
        "https://auth.globus.org/v2/oauth2/token".to_string()
    }

    fn transfer_api_base() -> String {
        #[cfg(test)]
        if let Ok(value) = std::env::var("COLLECTION_ROUTER_TRANSFER_ENDPOINT")
            && !value.trim().is_empty()
        {
            return value;
        }
        "https://transfer.api.globus.org/v0.10".to_string()
    }

    fn get_json(&self, url: &str, context: &str) -> Result<Value, StepError> {
        let response = self
            .agent
            .get(url)
            .header("Authorization", &format!("Bearer {}", self.access_token))
            .call()
            .map_err(|err| StepError::Transfer(format!("{context} failed: {err}")))?;
        let body = response.into_body().read_to_string().map_err(|err| {
            StepError::Transfer(format!("{context} body read failed: {err}"))
        })?;
        serde_json::from_str(&body)
            .map_err(|err| StepError::Transfer(format!("{context} returned invalid JSON: {err}")))
    }

    fn data_array(document: Value, context: &str) -> Result<Vec<Value>, StepError> {
        match document.get("DATA").and_then(Value::as_array) {
            Some(entries) => Ok(entries.clone()),
            None => Err(StepError::Transfer(format!(
                "{context} response carries no DATA array"
            ))),
        }
    }
}

impl TransferClient for GlobusTransferClient {
    fn search_my_endpoints(&self, limit: usize) -> Result<Vec<Value>, StepError> {
        let url = format!(
            "{}/endpoint_search?filter_scope=my-endpoints&limit={limit}",
            Self::transfer_api_base()
        );
        let document = self.get_json(&url, "endpoint search")?;
        Self::data_array(document, "endpoint search")
    }

    fn endpoint_by_id(&self, id: &str) -> Result<Value, StepError> {
        let url = format!("{}/endpoint/{id}", Self::transfer_api_base());
        self.get_json(&url, "endpoint lookup")
    }

    fn endpoint_servers(&self, id: &str) -> Result<Vec<Value>, StepError> {
        let url = format!("{}/endpoint/{id}/server_list", Self::transfer_api_base());
        let document = self.get_json(&url, "server list")?;
        Self::data_array(document, "server list")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::{Read as _, Write as _};
    use std::net::TcpListener;
    use std::sync::{Mutex, OnceLock};
    use std::{env, thread};

    struct FixtureTransferClient {
        listing: Vec<Value>,
        endpoints: Vec<(String, Value)>,
    }

    impl TransferClient for FixtureTransferClient {
        fn search_my_endpoints(&self, _limit: usize) -> Result<Vec<Value>, StepError> {
            Ok(self.listing.clone())
        }

        fn endpoint_by_id(&self, id: &str) -> Result<Value, StepError> {
            self.endpoints
                .iter()
                .find(|(known, _)| known == id)
                .map(|(_, doc)| doc.clone())
                .ok_or_else(|| StepError::Transfer(format!("no endpoint {id}")))
        }

        fn endpoint_servers(&self, _id: &str) -> Result<Vec<Value>, StepError> {
            Ok(Vec::new())
        }
    }

    fn spawn_one_shot_http(payload: Vec<u8>) -> (String, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request_buf = [0u8; 2048];
            let _ = stream.read(&mut request_buf);
            let headers = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                payload.len()
            );
            stream.write_all(headers.as_bytes()).unwrap();
            stream.write_all(&payload).unwrap();
            let _ = stream.flush();
        });
        (format!("http://{addr}"), handle)
    }

    fn with_env_var<R>(key: &str, value: &str, run: impl FnOnce() -> R) -> R {
        static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        let guard = ENV_LOCK
            .get_or_init(|| Mutex::new(()))
            .lock()
            .expect("env lock poisoned");
        let previous = env::var(key).ok();
        unsafe { env::set_var(key, value) };
        let result = run();
        if let Some(old) = previous {
            unsafe { env::set_var(key, old) };
        } else {
            unsafe { env::remove_var(key) };
        }
        drop(guard);
        result
    }

    #[test]
    fn listing_includes_extra_endpoints_in_file_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let extras = dir.path().join("extra_endpoints.txt");
        std::fs::write(&extras, "ep-extra-1\n\n  ep-extra-2  \n").expect("write extras");
        let client = FixtureTransferClient {
            listing: vec![json!({"id": "ep-main"})],
            endpoints: vec![
                ("ep-extra-1".to_string(), json!({"id": "ep-extra-1"})),
                ("ep-extra-2".to_string(), json!({"id": "ep-extra-2"})),
            ],
        };
        let envelope =
            list_collections(&client, Some(&extras), "GlobusEndpoint").expect("envelope");
        let ids: Vec<_> = envelope
            .records()
            .iter()
            .map(|record| record["id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["ep-main", "ep-extra-1", "ep-extra-2"]);
    }

    #[test]
    fn missing_extras_file_is_tolerated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let absent = dir.path().join("no_such_file.txt");
        let client = FixtureTransferClient {
            listing: vec![json!({"id": "ep-main"})],
            endpoints: Vec::new(),
        };
        let envelope =
            list_collections(&client, Some(&absent), "GlobusEndpoint").expect("envelope");
        assert_eq!(envelope.len(), 1);
    }

    #[test]
    fn unknown_extra_endpoint_fails_the_listing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let extras = dir.path().join("extra_endpoints.txt");
        std::fs::write(&extras, "ep-ghost\n").expect("write extras");
        let client = FixtureTransferClient {
            listing: Vec::new(),
            endpoints: Vec::new(),
        };
        let err = list_collections(&client, Some(&extras), "GlobusEndpoint").expect_err("fail");
        assert!(matches!(err, StepError::Transfer(_)));
    }

    #[test]
    fn connect_exchanges_the_refresh_token() {
        let token_body = serde_json::to_vec(&json!({"access_token": "tok-123"})).unwrap();
        let (auth_base, auth_server) = spawn_one_shot_http(token_body);
        let client = with_env_var("COLLECTION_ROUTER_AUTH_ENDPOINT", &auth_base, || {
            GlobusTransferClient::connect(
                Duration::from_secs(5),
                true,
                "client-id",
                "refresh-token",
            )
        })
        .expect("connect");
        auth_server.join().unwrap();
        assert_eq!(client.access_token, "tok-123");
    }

    #[test]
    fn search_unwraps_the_data_array() {
        let token_body = serde_json::to_vec(&json!({"access_token": "tok"})).unwrap();
        let (auth_base, auth_server) = spawn_one_shot_http(token_body);
        let client = with_env_var("COLLECTION_ROUTER_AUTH_ENDPOINT", &auth_base, || {
            GlobusTransferClient::connect(Duration::from_secs(5), true, "id", "rt")
        })
        .expect("connect");
        auth_server.join().unwrap();

        let search_body =
            serde_json::to_vec(&json!({"DATA_TYPE": "endpoint_list", "DATA": [{"id": "a"}]}))
                .unwrap();
        let (transfer_base, transfer_server) = spawn_one_shot_http(search_body);
        let listing = with_env_var("COLLECTION_ROUTER_TRANSFER_ENDPOINT", &transfer_base, || {
            client.search_my_endpoints(10)
        })
        .expect("search");
        transfer_server.join().unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0]["id"], "a");
    }
}
