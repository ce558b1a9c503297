//! Staging file storage and search API fetch utilities for docpipe.
//!
//! The raw store is a single JSON array per window. It is rewritten in full on
//! every append, so it only suits page sizes that fit comfortably in memory;
//! larger harvests would need a line-delimited format with the same logical
//! content.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use docpipe_core::{ApiSettings, QueryWindow};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error on {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{} does not hold a JSON array", path.display())]
    NotAnArray {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("serializing JSON for {}", path.display())]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

async fn ensure_parent(path: &Path) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await.map_err(io_error(parent))?;
    }
    Ok(())
}

/// Replace `path` with `bytes` via a temp file in the same directory and a rename.
async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    ensure_parent(path).await?;
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(io_error(&temp_path))?;
    file.write_all(bytes).await.map_err(io_error(&temp_path))?;
    file.flush().await.map_err(io_error(&temp_path))?;
    drop(file);

    if let Err(source) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StoreError::Io {
            path: path.to_path_buf(),
            source,
        });
    }
    Ok(())
}

fn to_pretty_json(path: &Path, items: &[JsonValue]) -> Result<Vec<u8>, StoreError> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    items
        .serialize(&mut serializer)
        .map_err(|source| StoreError::Serialize {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(buf)
}

/// Create (or reset) the raw store for a window as an empty JSON array.
pub async fn init_raw_store(path: &Path) -> Result<(), StoreError> {
    write_atomically(path, b"[]").await
}

/// Create (or truncate) the output table for a window.
pub async fn init_output_table(path: &Path) -> Result<(), StoreError> {
    write_atomically(path, b"").await
}

pub async fn read_json_array(path: &Path) -> Result<Vec<JsonValue>, StoreError> {
    let bytes = fs::read(path).await.map_err(io_error(path))?;
    serde_json::from_slice(&bytes).map_err(|source| StoreError::NotAnArray {
        path: path.to_path_buf(),
        source,
    })
}

/// Overwrite `path` with `items` as a pretty printed JSON array.
pub async fn write_json_array(items: &[JsonValue], path: &Path) -> Result<(), StoreError> {
    let bytes = to_pretty_json(path, items)?;
    write_atomically(path, &bytes).await
}

/// Read the JSON array at `path`, extend it with `items` and rewrite it.
///
/// Single writer only: concurrent appends to the same file lose pages.
pub async fn append_json(items: &[JsonValue], path: &Path) -> Result<usize, StoreError> {
    let mut stored = read_json_array(path).await?;
    stored.extend(items.iter().cloned());
    write_json_array(&stored, path).await?;
    Ok(stored.len())
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

/// A single page request against the search endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub base_url: String,
    pub headers: BTreeMap<String, String>,
    pub query: Vec<(String, String)>,
}

impl SearchRequest {
    pub fn for_page(settings: &ApiSettings, window: &QueryWindow, offset: u64) -> Self {
        Self {
            base_url: settings.base_url.clone(),
            headers: settings.headers.clone(),
            query: settings.query_pairs(window, offset),
        }
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Decoded `message` envelope of one search response.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SearchPage {
    pub items: Vec<JsonValue>,
    pub total_results: Option<u64>,
}

impl SearchPage {
    pub fn new(items: Vec<JsonValue>, total_results: u64) -> Self {
        Self {
            items,
            total_results: Some(total_results),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response from {url} is not valid JSON")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("response from {url} has no `message` object")]
    MissingMessage { url: String },
    #[error("response from {url} is malformed: {reason}")]
    MalformedEnvelope { url: String, reason: String },
}

pub fn decode_envelope(url: &str, body: &[u8]) -> Result<SearchPage, FetchError> {
    let mut value: JsonValue =
        serde_json::from_slice(body).map_err(|source| FetchError::Decode {
            url: url.to_string(),
            source,
        })?;
    let mut message = value
        .get_mut("message")
        .filter(|m| m.is_object())
        .map(JsonValue::take)
        .ok_or_else(|| FetchError::MissingMessage {
            url: url.to_string(),
        })?;

    let items = match message.get_mut("items").map(JsonValue::take) {
        None | Some(JsonValue::Null) => Vec::new(),
        Some(JsonValue::Array(items)) => items,
        Some(other) => {
            return Err(FetchError::MalformedEnvelope {
                url: url.to_string(),
                reason: format!("`items` is not a list: {other}"),
            })
        }
    };
    let total_results = message.get("total-results").and_then(JsonValue::as_u64);

    Ok(SearchPage {
        items,
        total_results,
    })
}

#[derive(Debug, Clone)]
pub struct SearchClient {
    client: reqwest::Client,
}

impl SearchClient {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
        })
    }

    pub async fn fetch_page(&self, request: &SearchRequest) -> Result<SearchPage, FetchError> {
        let span = info_span!(
            "search_fetch",
            url = %request.base_url,
            offset = request.param("offset").unwrap_or_default()
        );
        async {
            let mut builder = self.client.get(&request.base_url).query(&request.query);
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }

            let resp = builder.send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await?;
            let page = decode_envelope(&final_url, &body)?;
            debug!(
                items = page.items.len(),
                total_results = ?page.total_results,
                "fetched search page"
            );
            Ok::<_, FetchError>(page)
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use axum::extract::Query;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn init_raw_store_creates_directories_and_empty_array() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("data_lake/terms/20240201_20240301.json");

        init_raw_store(&path).await.expect("init");

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "[]");
        assert!(read_json_array(&path).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn init_output_table_truncates_existing_content() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("out.csv");
        std::fs::write(&path, "stale,rows\n").unwrap();

        init_output_table(&path).await.expect("init");

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }

    #[tokio::test]
    async fn append_extends_in_order_with_four_space_indent() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("raw.json");
        write_json_array(&[json!({"DOI": "a"})], &path).await.unwrap();

        let total = append_json(&[json!({"DOI": "b"}), json!({"DOI": "c"})], &path)
            .await
            .unwrap();

        assert_eq!(total, 3);
        let stored = read_json_array(&path).await.unwrap();
        assert_eq!(
            stored,
            vec![json!({"DOI": "a"}), json!({"DOI": "b"}), json!({"DOI": "c"})]
        );
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("[\n    {\n        \"DOI\": \"a\""));
    }

    #[tokio::test]
    async fn write_overwrites_previous_content() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("raw.json");
        write_json_array(&[json!(1), json!(2)], &path).await.unwrap();
        write_json_array(&[json!(3)], &path).await.unwrap();

        assert_eq!(read_json_array(&path).await.unwrap(), vec![json!(3)]);
    }

    #[tokio::test]
    async fn append_rejects_non_array_content() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("raw.json");
        std::fs::write(&path, r#"{"items": []}"#).unwrap();

        let err = append_json(&[json!(1)], &path).await.unwrap_err();

        assert!(matches!(err, StoreError::NotAnArray { .. }));
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            r#"{"items": []}"#
        );
    }

    #[tokio::test]
    async fn append_to_missing_file_is_an_io_error() {
        let dir = tempdir().expect("tempdir");
        let err = append_json(&[json!(1)], &dir.path().join("nope.json"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }));
    }

    #[test]
    fn envelope_without_message_fails_fast() {
        let err = decode_envelope("u", br#"{"status": "ok"}"#).unwrap_err();
        assert!(matches!(err, FetchError::MissingMessage { .. }));
    }

    #[test]
    fn envelope_without_items_decodes_as_empty_page() {
        let page = decode_envelope("u", br#"{"message": {"total-results": 0}}"#).unwrap();
        assert!(page.items.is_empty());
        assert_eq!(page.total_results, Some(0));
    }

    #[test]
    fn envelope_with_scalar_items_is_malformed() {
        let err = decode_envelope("u", br#"{"message": {"items": 3}}"#).unwrap_err();
        assert!(matches!(err, FetchError::MalformedEnvelope { .. }));
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve");
        });
        format!("http://{addr}/works")
    }

    async fn echo_works(
        headers: HeaderMap,
        Query(params): Query<HashMap<String, String>>,
    ) -> Json<JsonValue> {
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        Json(json!({
            "status": "ok",
            "message": {
                "total-results": 1,
                "items": [{ "params": params, "auth": auth }]
            }
        }))
    }

    #[tokio::test]
    async fn client_sends_configured_params_and_headers() {
        let base_url = serve(Router::new().route("/works", get(echo_works))).await;
        let client = SearchClient::new(HttpClientConfig::default()).expect("client");
        let request = SearchRequest {
            base_url,
            headers: BTreeMap::from([("Authorization".to_string(), "Bearer abcdefg".to_string())]),
            query: vec![
                ("query".to_string(), "test search terms".to_string()),
                ("offset".to_string(), "0".to_string()),
                ("rows".to_string(), "10".to_string()),
            ],
        };

        let page = client.fetch_page(&request).await.expect("fetch");

        assert_eq!(page.total_results, Some(1));
        assert_eq!(page.items.len(), 1);
        let echoed = &page.items[0];
        assert_eq!(echoed["auth"], "Bearer abcdefg");
        assert_eq!(echoed["params"]["query"], "test search terms");
        assert_eq!(echoed["params"]["rows"], "10");
    }

    #[tokio::test]
    async fn client_reports_non_success_status() {
        let base_url = serve(Router::new().route(
            "/works",
            get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "down") }),
        ))
        .await;
        let client = SearchClient::new(HttpClientConfig::default()).expect("client");
        let request = SearchRequest {
            base_url,
            headers: BTreeMap::new(),
            query: Vec::new(),
        };

        let err = client.fetch_page(&request).await.unwrap_err();

        assert!(matches!(err, FetchError::HttpStatus { status: 503, .. }));
    }
}
