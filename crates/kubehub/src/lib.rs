//! modctl kubehub: discovery capability and the resource resolver built on it.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use kube::Client;
use modctl_core::{ClientError, GroupVersion, ResourceDescriptor};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// One kind registered under a group/version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
}

impl DiscoveredResource {
    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }

    fn descriptor(&self) -> ResourceDescriptor {
        ResourceDescriptor {
            group: self.group.clone(),
            version: self.version.clone(),
            kind: self.kind.clone(),
            plural: self.plural.clone(),
            namespaced: self.namespaced,
        }
    }
}

/// Discovery capability: what is registered under exactly one group/version.
#[async_trait::async_trait]
pub trait DiscoveryApi: Send + Sync {
    async fn resources_for(&self, gv: &GroupVersion) -> Result<Vec<DiscoveredResource>>;
}

/// Build a kube client from the ambient kubeconfig / in-cluster environment.
pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("failed to build kube client from kubeconfig")
}

/// Discovery backed by the API server's per-group-version resource lists.
#[derive(Clone)]
pub struct KubeDiscovery {
    client: Client,
}

impl KubeDiscovery {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl DiscoveryApi for KubeDiscovery {
    async fn resources_for(&self, gv: &GroupVersion) -> Result<Vec<DiscoveredResource>> {
        let list = if gv.group.is_empty() {
            self.client.list_core_api_resources(&gv.version).await
        } else {
            self.client.list_api_group_resources(&gv.api_version()).await
        }
        .with_context(|| format!("listing API resources for {}", gv.api_version()))?;
        let out = list
            .resources
            .into_iter()
            .map(|r| DiscoveredResource {
                group: gv.group.clone(),
                version: gv.version.clone(),
                kind: r.kind,
                plural: r.name,
                namespaced: r.namespaced,
            })
            .collect();
        Ok(out)
    }
}

/// Maps `(apiVersion, kind)` to a concrete descriptor using discovery.
///
/// Without a cache every call requeries discovery. With [`Resolver::with_cache`]
/// lists are kept per group/version and a miss invalidates the entry and
/// requeries once before failing.
pub struct Resolver {
    discovery: Arc<dyn DiscoveryApi>,
    cache: Option<Mutex<HashMap<GroupVersion, Vec<DiscoveredResource>>>>,
}

impl Resolver {
    pub fn new(discovery: Arc<dyn DiscoveryApi>) -> Self {
        Self { discovery, cache: None }
    }

    pub fn with_cache(mut self) -> Self {
        self.cache = Some(Mutex::new(HashMap::new()));
        self
    }

    pub async fn resolve(&self, api_version: &str, kind: &str) -> Result<ResourceDescriptor, ClientError> {
        let gv = GroupVersion::parse(api_version);
        if let Some(cache) = &self.cache {
            let cached = cache.lock().ok().and_then(|c| c.get(&gv).cloned());
            if let Some(list) = cached {
                if let Some(found) = find_kind(&list, kind) {
                    debug!(gvk = %found.gvk_key(), "resolved from discovery cache");
                    return Ok(found.descriptor());
                }
                if let Ok(mut c) = cache.lock() {
                    c.remove(&gv);
                }
            }
        }

        let list = self
            .discovery
            .resources_for(&gv)
            .await
            .map_err(|source| ClientError::Discovery { api_version: gv.api_version(), source })?;
        let found = find_kind(&list, kind).map(|r| r.descriptor());
        if let Some(cache) = &self.cache {
            if let Ok(mut c) = cache.lock() {
                c.insert(gv.clone(), list);
            }
        }
        match found {
            Some(desc) => {
                info!(gvk = %desc.gvk_key(), plural = %desc.plural, namespaced = desc.namespaced, "resolved resource");
                Ok(desc)
            }
            None => Err(ClientError::Resolution { group: gv.group, version: gv.version, kind: kind.to_string() }),
        }
    }
}

fn find_kind<'a>(list: &'a [DiscoveredResource], kind: &str) -> Option<&'a DiscoveredResource> {
    // subresources (`pods/status`) share the parent kind
    list.iter().find(|r| r.kind == kind && !r.plural.contains('/'))
}
