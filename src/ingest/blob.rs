//! Blob storage contract for artifact bodies and side-blobs.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, Context, Result};
use dashmap::DashMap;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{BlobBackendKind, BlobsConfig};

const METADATA_SUFFIX: &str = ".meta.json";

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Fetch failures, split by whether a retry can help.
#[derive(Error, Debug)]
pub enum BlobError {
    #[error("blob {key} not found")]
    NotFound { key: String },

    #[error("invalid blob key {key:?}")]
    InvalidKey { key: String },

    #[error("fetching blob {key}: {source}")]
    Transient {
        key: String,
        #[source]
        source: BoxError,
    },
}

impl BlobError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    fn transient(key: &str, source: impl Into<BoxError>) -> Self {
        Self::Transient {
            key: key.to_string(),
            source: source.into(),
        }
    }
}

/// Metadata attached to an uploaded side-blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobMetadata {
    pub service_id: u64,
    pub perf_events: Vec<String>,
}

pub trait BlobStore: Send + Sync {
    fn fetch(&self, key: &str) -> impl Future<Output = Result<Vec<u8>, BlobError>> + Send;

    fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Creates or replaces the metadata stored alongside `key`.
    fn upsert_metadata(
        &self,
        key: &str,
        metadata: &BlobMetadata,
    ) -> impl Future<Output = Result<()>> + Send;
}

fn metadata_key(key: &str) -> String {
    format!("{key}{METADATA_SUFFIX}")
}

/// Blobs stored as files under a root directory.
#[derive(Debug)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Maps a key to a path under the root. Absolute keys and `..`
    /// components are refused.
    fn resolve(&self, key: &str) -> Option<PathBuf> {
        let rel = Path::new(key);
        if key.is_empty() || !rel.components().all(|c| matches!(c, Component::Normal(_))) {
            return None;
        }
        Some(self.root.join(rel))
    }

    async fn write(&self, key: &str, body: &[u8]) -> Result<()> {
        let Some(path) = self.resolve(key) else {
            bail!("invalid blob key {key:?}");
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        tokio::fs::write(&tmp, body)
            .await
            .with_context(|| format!("writing blob {key}"))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("publishing blob {key}"))?;
        Ok(())
    }
}

impl BlobStore for FsBlobStore {
    async fn fetch(&self, key: &str) -> Result<Vec<u8>, BlobError> {
        let path = self.resolve(key).ok_or_else(|| BlobError::InvalidKey {
            key: key.to_string(),
        })?;
        match tokio::fs::read(&path).await {
            Ok(body) => Ok(body),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(BlobError::NotFound {
                key: key.to_string(),
            }),
            Err(e) => Err(BlobError::transient(key, e)),
        }
    }

    async fn put(&self, key: &str, body: Vec<u8>, _content_type: &str) -> Result<()> {
        self.write(key, &body).await
    }

    async fn upsert_metadata(&self, key: &str, metadata: &BlobMetadata) -> Result<()> {
        let body = serde_json::to_vec(metadata).context("serializing blob metadata")?;
        self.write(&metadata_key(key), &body).await
    }
}

/// Blobs behind an HTTP object endpoint: `GET`/`PUT {endpoint}/{key}`.
#[derive(Debug)]
pub struct HttpBlobStore {
    client: reqwest::Client,
    endpoint: String,
    headers: HashMap<String, String>,
}

impl HttpBlobStore {
    pub fn new(cfg: &BlobsConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            client,
            endpoint: cfg.endpoint.trim_end_matches('/').to_string(),
            headers: cfg.headers.clone(),
        })
    }

    fn url(&self, key: &str) -> String {
        format!("{}/{}", self.endpoint, key.trim_start_matches('/'))
    }

    fn request(&self, method: reqwest::Method, key: &str) -> reqwest::RequestBuilder {
        let mut request = self.client.request(method, self.url(key));
        for (k, v) in &self.headers {
            request = request.header(k.as_str(), v.as_str());
        }
        request
    }

    async fn upload(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<()> {
        let resp = self
            .request(reqwest::Method::PUT, key)
            .header("Content-Type", content_type)
            .body(body)
            .send()
            .await
            .with_context(|| format!("uploading blob {key}"))?;

        let status = resp.status();
        // Drain body for connection reuse.
        let _ = resp.bytes().await;

        if !status.is_success() {
            bail!("blob upload {key} unexpected status: {status}");
        }
        Ok(())
    }
}

impl BlobStore for HttpBlobStore {
    async fn fetch(&self, key: &str) -> Result<Vec<u8>, BlobError> {
        let resp = self
            .request(reqwest::Method::GET, key)
            .send()
            .await
            .map_err(|e| BlobError::transient(key, e))?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(BlobError::NotFound {
                key: key.to_string(),
            });
        }
        if !status.is_success() {
            return Err(BlobError::transient(
                key,
                format!("unexpected status: {status}"),
            ));
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| BlobError::transient(key, e))?;
        Ok(body.to_vec())
    }

    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<()> {
        self.upload(key, body, content_type).await
    }

    async fn upsert_metadata(&self, key: &str, metadata: &BlobMetadata) -> Result<()> {
        let body = serde_json::to_vec(metadata).context("serializing blob metadata")?;
        self.upload(&metadata_key(key), body, "application/json")
            .await
    }
}

/// In-process blob store for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    objects: DashMap<String, Vec<u8>>,
    metadata: DashMap<String, BlobMetadata>,
    fail_fetch: AtomicBool,
    fail_put: AtomicBool,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: &str, body: Vec<u8>) {
        self.objects.insert(key.to_string(), body);
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.get(key).map(|v| v.clone())
    }

    pub fn metadata(&self, key: &str) -> Option<BlobMetadata> {
        self.metadata.get(key).map(|v| v.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Makes every fetch fail transiently until cleared.
    pub fn set_fetch_failing(&self, failing: bool) {
        self.fail_fetch.store(failing, Ordering::SeqCst);
    }

    /// Makes every upload fail until cleared.
    pub fn set_put_failing(&self, failing: bool) {
        self.fail_put.store(failing, Ordering::SeqCst);
    }
}

impl BlobStore for MemoryBlobStore {
    async fn fetch(&self, key: &str) -> Result<Vec<u8>, BlobError> {
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(BlobError::transient(key, "store unavailable"));
        }
        self.get(key).ok_or_else(|| BlobError::NotFound {
            key: key.to_string(),
        })
    }

    async fn put(&self, key: &str, body: Vec<u8>, _content_type: &str) -> Result<()> {
        if self.fail_put.load(Ordering::SeqCst) {
            bail!("blob store rejected upload of {key}");
        }
        self.insert(key, body);
        Ok(())
    }

    async fn upsert_metadata(&self, key: &str, metadata: &BlobMetadata) -> Result<()> {
        self.metadata.insert(key.to_string(), metadata.clone());
        Ok(())
    }
}

/// Configured blob backend.
#[derive(Debug)]
pub enum BlobBackend {
    Fs(FsBlobStore),
    Http(HttpBlobStore),
    Memory(MemoryBlobStore),
}

impl BlobBackend {
    pub fn from_config(cfg: &BlobsConfig) -> Result<Self> {
        Ok(match cfg.backend {
            BlobBackendKind::Fs => Self::Fs(FsBlobStore::new(&cfg.root)),
            BlobBackendKind::Http => Self::Http(HttpBlobStore::new(cfg)?),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Fs(_) => "fs",
            Self::Http(_) => "http",
            Self::Memory(_) => "memory",
        }
    }
}

impl BlobStore for BlobBackend {
    async fn fetch(&self, key: &str) -> Result<Vec<u8>, BlobError> {
        match self {
            Self::Fs(s) => s.fetch(key).await,
            Self::Http(s) => s.fetch(key).await,
            Self::Memory(s) => s.fetch(key).await,
        }
    }

    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<()> {
        match self {
            Self::Fs(s) => s.put(key, body, content_type).await,
            Self::Http(s) => s.put(key, body, content_type).await,
            Self::Memory(s) => s.put(key, body, content_type).await,
        }
    }

    async fn upsert_metadata(&self, key: &str, metadata: &BlobMetadata) -> Result<()> {
        match self {
            Self::Fs(s) => s.upsert_metadata(key, metadata).await,
            Self::Http(s) => s.upsert_metadata(key, metadata).await,
            Self::Memory(s) => s.upsert_metadata(key, metadata).await,
        }
    }
}
