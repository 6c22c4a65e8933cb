//! HTTP client for the remote data API.
//!
//! Endpoints:
//! - `GET /data/{key}` returns a [`WireEntry`] or 404
//! - `PUT /data/{key}` stores a [`WireEntry`]
//! - `GET /data` returns an object mapping keys to [`WireEntry`]

use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::{header, Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;
use url::Url;

use draftsync_common::{validate_key, Error, Record, Result};

use crate::connectivity::ConnectivityMonitor;
use crate::remote::{RemoteStore, WireEntry};

/// Header carrying the user scope.
pub const USER_SCOPE_HEADER: &str = "X-User-Id";

/// Characters left unescaped in a key path segment.
const KEY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Connection settings supplied by the embedding application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteConfig {
    /// Base URL of the data API.
    pub api_url: String,
    /// Bearer token.
    pub api_key: String,
    /// User whose data set is addressed.
    pub user_id: String,
}

impl RemoteConfig {
    /// Check that every field is usable.
    ///
    /// # Errors
    /// - Malformed URL
    /// - Empty credentials or user id
    pub fn validate(&self) -> Result<Url> {
        let url = Url::parse(&self.api_url)
            .map_err(|e| Error::Config(format!("Invalid api_url {}: {}", self.api_url, e)))?;
        if self.api_key.is_empty() {
            return Err(Error::Config("api_key cannot be empty".to_string()));
        }
        if self.user_id.is_empty() {
            return Err(Error::Config("user_id cannot be empty".to_string()));
        }
        Ok(url)
    }
}

/// Remote store speaking the data API over HTTP.
pub struct HttpRemoteStore {
    http: Client,
    base_url: String,
    config: RemoteConfig,
    connectivity: ConnectivityMonitor,
}

impl HttpRemoteStore {
    /// Create a new client.
    ///
    /// # Errors
    /// - Invalid configuration
    /// - HTTP client construction failure
    pub fn new(config: RemoteConfig, connectivity: ConnectivityMonitor) -> Result<Self> {
        config.validate()?;

        let http = Client::builder()
            .user_agent(concat!("DraftSync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            config,
            connectivity,
        })
    }

    fn collection_url(&self) -> String {
        format!("{}/data", self.base_url)
    }

    fn key_url(&self, key: &str) -> String {
        format!(
            "{}/data/{}",
            self.base_url,
            utf8_percent_encode(key, KEY_ENCODE_SET)
        )
    }

    fn ensure_online(&self) -> Result<()> {
        if self.connectivity.is_online() {
            Ok(())
        } else {
            Err(Error::Network("offline".to_string()))
        }
    }

    /// Attach credentials and user scope.
    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header(header::AUTHORIZATION, format!("Bearer {}", self.config.api_key))
            .header(USER_SCOPE_HEADER, &self.config.user_id)
    }

    /// Map a non-success response to the error taxonomy.
    async fn error_for(response: Response) -> Error {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Error::Auth(format!("{} - {}", status, body))
            }
            _ => Error::Remote {
                status: status.as_u16(),
                message: body,
            },
        }
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    fn name(&self) -> &str {
        "http"
    }

    async fn get(&self, key: &str) -> Result<Option<Record>> {
        validate_key(key)?;
        self.ensure_online()?;

        let response = self
            .authorize(self.http.get(self.key_url(key)))
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to get {}: {}", key, e)))?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!("Remote has no record for {}", key);
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }

        let entry: WireEntry = response
            .json()
            .await
            .map_err(|e| Error::Serialization(format!("Invalid entry for {}: {}", key, e)))?;
        Ok(Some(entry.into_record(key)))
    }

    async fn put(&self, record: &Record) -> Result<()> {
        validate_key(&record.key)?;
        self.ensure_online()?;

        let response = self
            .authorize(self.http.put(self.key_url(&record.key)))
            .json(&WireEntry::from_record(record))
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to put {}: {}", record.key, e)))?;

        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }

        debug!("Pushed {} @ {}", record.key, record.last_modified);
        Ok(())
    }

    async fn list_all(&self) -> Result<BTreeMap<String, Record>> {
        self.ensure_online()?;

        let response = self
            .authorize(self.http.get(self.collection_url()))
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to list records: {}", e)))?;

        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }

        let entries: BTreeMap<String, WireEntry> = response
            .json()
            .await
            .map_err(|e| Error::Serialization(format!("Invalid listing: {}", e)))?;

        Ok(entries
            .into_iter()
            .map(|(key, entry)| {
                let record = entry.into_record(key.clone());
                (key, record)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, State};
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    type Shared = Arc<Mutex<BTreeMap<String, WireEntry>>>;

    fn authorized(headers: &HeaderMap) -> bool {
        headers.get("authorization").and_then(|v| v.to_str().ok()) == Some("Bearer secret")
            && headers.get("x-user-id").and_then(|v| v.to_str().ok()) == Some("user-1")
    }

    async fn get_one(
        State(db): State<Shared>,
        headers: HeaderMap,
        Path(key): Path<String>,
    ) -> std::result::Result<Json<WireEntry>, AxumStatus> {
        if !authorized(&headers) {
            return Err(AxumStatus::UNAUTHORIZED);
        }
        if key == "explode" {
            return Err(AxumStatus::INTERNAL_SERVER_ERROR);
        }
        db.lock()
            .unwrap()
            .get(&key)
            .cloned()
            .map(Json)
            .ok_or(AxumStatus::NOT_FOUND)
    }

    async fn put_one(
        State(db): State<Shared>,
        headers: HeaderMap,
        Path(key): Path<String>,
        Json(entry): Json<WireEntry>,
    ) -> AxumStatus {
        if !authorized(&headers) {
            return AxumStatus::UNAUTHORIZED;
        }
        db.lock().unwrap().insert(key, entry);
        AxumStatus::NO_CONTENT
    }

    async fn list(
        State(db): State<Shared>,
        headers: HeaderMap,
    ) -> std::result::Result<Json<BTreeMap<String, WireEntry>>, AxumStatus> {
        if !authorized(&headers) {
            return Err(AxumStatus::FORBIDDEN);
        }
        Ok(Json(db.lock().unwrap().clone()))
    }

    async fn spawn_server() -> (String, Shared) {
        let db: Shared = Arc::new(Mutex::new(BTreeMap::new()));
        let app = Router::new()
            .route("/data", get(list))
            .route("/data/{key}", get(get_one).put(put_one))
            .with_state(db.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{}", addr), db)
    }

    fn client(api_url: &str, api_key: &str, online: bool) -> HttpRemoteStore {
        HttpRemoteStore::new(
            RemoteConfig {
                api_url: api_url.to_string(),
                api_key: api_key.to_string(),
                user_id: "user-1".to_string(),
            },
            ConnectivityMonitor::new(online),
        )
        .unwrap()
    }

    #[test]
    fn test_config_validation() {
        let mut config = RemoteConfig {
            api_url: "not a url".to_string(),
            api_key: "k".to_string(),
            user_id: "u".to_string(),
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.api_url = "https://api.example.com".to_string();
        assert!(config.validate().is_ok());

        config.api_key.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_key_is_percent_encoded() {
        let store = client("https://api.example.com/", "k", true);
        assert_eq!(
            store.key_url("drafts/launch copy"),
            "https://api.example.com/data/drafts%2Flaunch%20copy"
        );
    }

    #[tokio::test]
    async fn test_put_get_list_roundtrip() {
        let (url, db) = spawn_server().await;
        let store = client(&url, "secret", true);

        let record = Record::new("k1", json!({"headline": "Hello"}), 100);
        store.put(&record).await.unwrap();

        assert_eq!(db.lock().unwrap().get("k1").unwrap().timestamp, 100);
        assert_eq!(store.get("k1").await.unwrap(), Some(record.clone()));

        let all = store.list_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all["k1"], record);
    }

    #[tokio::test]
    async fn test_missing_key_is_not_an_error() {
        let (url, _db) = spawn_server().await;
        let store = client(&url, "secret", true);
        assert_eq!(store.get("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_rejected_credentials() {
        let (url, _db) = spawn_server().await;
        let store = client(&url, "wrong", true);

        assert!(matches!(store.get("k1").await, Err(Error::Auth(_))));
        assert!(matches!(store.list_all().await, Err(Error::Auth(_))));
    }

    #[tokio::test]
    async fn test_server_error_maps_to_remote_error() {
        let (url, _db) = spawn_server().await;
        let store = client(&url, "secret", true);

        match store.get("explode").await {
            Err(Error::Remote { status, .. }) => assert_eq!(status, 500),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_offline_fails_fast() {
        let store = client("http://127.0.0.1:9", "secret", false);
        let record = Record::new("k1", json!("A"), 1);
        assert!(matches!(store.put(&record).await, Err(Error::Network(_))));
        assert!(matches!(store.list_all().await, Err(Error::Network(_))));
    }
}
