use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("failed to download resource from {url}")]
    Download {
        url: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("unexpected status {status} downloading {url}")]
    Status { url: String, status: u16 },
}

/// Remote fetch collaborator: raw bytes behind a URL.
#[async_trait::async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let download = |e: reqwest::Error| FetchError::Download { url: url.to_string(), source: e.into() };
        let resp = self.client.get(url).send().await.map_err(download)?;
        if !resp.status().is_success() {
            return Err(FetchError::Status { url: url.to_string(), status: resp.status().as_u16() });
        }
        let body = resp.bytes().await.map_err(download)?;
        debug!(url = %url, bytes = body.len(), "fetched");
        Ok(body.to_vec())
    }
}

/// Canned bodies keyed by URL; unknown URLs answer 404. Records every request.
#[derive(Default)]
pub struct StaticFetcher {
    bodies: HashMap<String, Vec<u8>>,
    requests: Mutex<Vec<String>>,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, url: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        self.bodies.insert(url.into(), body.into());
        self
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl Fetcher for StaticFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        if let Ok(mut r) = self.requests.lock() {
            r.push(url.to_string());
        }
        self.bodies.get(url).cloned().ok_or_else(|| FetchError::Status { url: url.to_string(), status: 404 })
    }
}
