use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::debug;

use crate::fetch::Fetcher;
use crate::manifest::ModuleMetadata;
use crate::types::ModuleTemplate;

/// Where module templates come from.
#[async_trait::async_trait]
pub trait ModuleSource: Send + Sync {
    fn name(&self) -> &str;
    async fn templates(&self) -> Result<Vec<ModuleTemplate>>;
}

/// Templates installed on the cluster.
pub struct ClusterSource {
    metadata: Arc<dyn ModuleMetadata>,
}

impl ClusterSource {
    pub fn new(metadata: Arc<dyn ModuleMetadata>) -> Self {
        Self { metadata }
    }
}

#[async_trait::async_trait]
impl ModuleSource for ClusterSource {
    fn name(&self) -> &str {
        "cluster"
    }

    async fn templates(&self) -> Result<Vec<ModuleTemplate>> {
        self.metadata.list_module_templates().await.context("failed to list module templates")
    }
}

/// A JSON or YAML list of templates published at a URL.
pub struct RemoteSource {
    fetcher: Arc<dyn Fetcher>,
    url: String,
}

impl RemoteSource {
    pub fn new(fetcher: Arc<dyn Fetcher>, url: impl Into<String>) -> Self {
        Self { fetcher, url: url.into() }
    }
}

#[async_trait::async_trait]
impl ModuleSource for RemoteSource {
    fn name(&self) -> &str {
        &self.url
    }

    async fn templates(&self) -> Result<Vec<ModuleTemplate>> {
        let body = self.fetcher.fetch(&self.url).await.context("failed to fetch external module templates")?;
        // YAML is a superset of JSON
        let list: Vec<ModuleTemplate> = serde_yaml::from_slice(&body).with_context(|| format!("failed to parse module templates from {}", self.url))?;
        debug!(url = %self.url, count = list.len(), "remote templates loaded");
        Ok(list)
    }
}
