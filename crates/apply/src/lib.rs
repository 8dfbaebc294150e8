//! modctl apply: generic resource client over discovery-resolved kinds.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use modctl_core::{AccessError, ClientError, Json, ListOptions, ObjectRef, ResourceDescriptor, ResourceEvent};
use modctl_kubehub::Resolver;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub mod fake;
mod kube_access;
mod wait;

pub use kube_access::KubeAccess;
pub use wait::{ScopeEnded, WaitScope};

/// Cluster-access capability: raw operations against an already-resolved descriptor.
///
/// `namespace` is `None` for cluster-scoped kinds and for cluster-wide listing.
#[async_trait::async_trait]
pub trait ClusterAccess: Send + Sync {
    async fn apply(&self, desc: &ResourceDescriptor, namespace: Option<&str>, name: &str, body: &Json) -> Result<Json, AccessError>;
    async fn get(&self, desc: &ResourceDescriptor, namespace: Option<&str>, name: &str) -> Result<Json, AccessError>;
    async fn list(&self, desc: &ResourceDescriptor, namespace: Option<&str>, field_selector: Option<&str>) -> Result<Vec<Json>, AccessError>;
    async fn delete(&self, desc: &ResourceDescriptor, namespace: Option<&str>, name: &str) -> Result<(), AccessError>;
    async fn replace(&self, desc: &ResourceDescriptor, namespace: Option<&str>, name: &str, body: &Json) -> Result<Json, AccessError>;
    async fn watch(&self, desc: &ResourceDescriptor, namespace: Option<&str>, name: &str) -> Result<WatchSubscription, AccessError>;
}

/// Open event stream for one resource. Dropping it (or calling [`stop`](Self::stop))
/// closes the channel and aborts the pump task, so no exit path leaks the subscription.
pub struct WatchSubscription {
    rx: mpsc::Receiver<ResourceEvent>,
    task: Option<JoinHandle<()>>,
}

impl WatchSubscription {
    pub fn new(rx: mpsc::Receiver<ResourceEvent>, task: Option<JoinHandle<()>>) -> Self {
        Self { rx, task }
    }

    /// Next event; `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<ResourceEvent> {
        self.rx.recv().await
    }

    pub fn stop(self) {}
}

impl Drop for WatchSubscription {
    fn drop(&mut self) {
        self.rx.close();
        if let Some(h) = self.task.take() {
            h.abort();
        }
    }
}

impl std::fmt::Debug for WatchSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchSubscription").field("pumped", &self.task.is_some()).finish()
    }
}

/// Generic create/get/list/delete/apply/watch for arbitrary kinds.
///
/// Every call resolves its kind first; a resolution failure returns before the
/// cluster is touched.
#[derive(Clone)]
pub struct ResourceClient {
    resolver: Arc<Resolver>,
    access: Arc<dyn ClusterAccess>,
    default_namespace: String,
}

impl ResourceClient {
    pub fn new(resolver: Arc<Resolver>, access: Arc<dyn ClusterAccess>) -> Self {
        Self { resolver, access, default_namespace: "default".to_string() }
    }

    pub fn with_default_namespace(mut self, ns: impl Into<String>) -> Self {
        self.default_namespace = ns.into();
        self
    }

    pub fn default_namespace(&self) -> &str {
        &self.default_namespace
    }

    async fn target(&self, r: &ObjectRef) -> Result<(ResourceDescriptor, Option<String>), ClientError> {
        let desc = self.resolver.resolve(&r.api_version, &r.kind).await?;
        let ns = if desc.namespaced {
            Some(r.namespace.clone().unwrap_or_else(|| self.default_namespace.clone()))
        } else {
            None
        };
        Ok((desc, ns))
    }

    /// Server-side apply of one document under the fixed field manager.
    pub async fn apply(&self, obj: &Json) -> Result<Json, ClientError> {
        let t0 = Instant::now();
        let r = ObjectRef::from_json(obj)?;
        if r.name.is_empty() {
            return Err(ClientError::Invalid(format!("{} resource missing metadata.name", r.kind)));
        }
        let (desc, ns) = self.target(&r).await?;
        let body = scoped_body(obj, ns.as_deref());
        counter!("resource_apply_total", 1u64);
        match self.access.apply(&desc, ns.as_deref(), &r.name, &body).await {
            Ok(live) => {
                histogram!("resource_apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
                info!(gvk = %desc.gvk_key(), name = %r.name, ns = %ns.as_deref().unwrap_or("-"), "applied resource");
                Ok(live)
            }
            Err(e) => {
                counter!("resource_apply_err_total", 1u64);
                Err(access_err(format!("apply {}", display_ref(&r, ns.as_deref())), e))
            }
        }
    }

    /// Apply sequentially; the first failure halts the batch and earlier items stay applied.
    pub async fn apply_many(&self, objs: &[Json]) -> Result<(), ClientError> {
        for obj in objs {
            self.apply(obj).await?;
        }
        Ok(())
    }

    pub async fn get(&self, r: &ObjectRef) -> Result<Json, ClientError> {
        let (desc, ns) = self.target(r).await?;
        self.access
            .get(&desc, ns.as_deref(), &r.name)
            .await
            .map_err(|e| access_err(format!("get {}", display_ref(r, ns.as_deref())), e))
    }

    pub async fn get_opt(&self, r: &ObjectRef) -> Result<Option<Json>, ClientError> {
        match self.get(r).await {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// List the kind named by `template`, in its namespace or across the cluster.
    pub async fn list(&self, template: &ObjectRef, opts: &ListOptions) -> Result<Vec<Json>, ClientError> {
        let desc = self.resolver.resolve(&template.api_version, &template.kind).await?;
        let ns = if desc.namespaced && !opts.all_namespaces {
            Some(template.namespace.clone().unwrap_or_else(|| self.default_namespace.clone()))
        } else {
            None
        };
        let items = self
            .access
            .list(&desc, ns.as_deref(), opts.field_selector.as_deref())
            .await
            .map_err(|e| access_err(format!("list {} in {}", desc.kind, ns.as_deref().unwrap_or("all namespaces")), e))?;
        debug!(gvk = %desc.gvk_key(), count = items.len(), "listed resources");
        Ok(items)
    }

    pub async fn remove(&self, r: &ObjectRef) -> Result<(), ClientError> {
        let (desc, ns) = self.target(r).await?;
        self.access
            .delete(&desc, ns.as_deref(), &r.name)
            .await
            .map_err(|e| access_err(format!("delete {}", display_ref(r, ns.as_deref())), e))?;
        counter!("resource_remove_total", 1u64);
        info!(gvk = %desc.gvk_key(), name = %r.name, ns = %ns.as_deref().unwrap_or("-"), "deleted resource");
        Ok(())
    }

    /// Delete sequentially; halts on the first failure, NotFound included.
    pub async fn remove_many(&self, refs: &[ObjectRef]) -> Result<(), ClientError> {
        for r in refs {
            self.remove(r).await?;
        }
        Ok(())
    }

    /// Full replace; a stale `metadata.resourceVersion` is rejected by the backend.
    pub async fn update(&self, obj: &Json) -> Result<Json, ClientError> {
        let r = ObjectRef::from_json(obj)?;
        let (desc, ns) = self.target(&r).await?;
        let body = scoped_body(obj, ns.as_deref());
        self.access
            .replace(&desc, ns.as_deref(), &r.name, &body)
            .await
            .map_err(|e| access_err(format!("update {}", display_ref(&r, ns.as_deref())), e))
    }

    /// Open an event stream filtered to exactly one named resource.
    pub async fn watch_single_resource(&self, r: &ObjectRef) -> Result<WatchSubscription, ClientError> {
        let (desc, ns) = self.target(r).await?;
        let target = display_ref(r, ns.as_deref());
        match self.access.watch(&desc, ns.as_deref(), &r.name).await {
            Ok(sub) => {
                debug!(target = %target, "watch opened");
                Ok(sub)
            }
            Err(e) => {
                warn!(target = %target, error = %e, "watch open failed");
                Err(ClientError::Watch { target, source: e.into() })
            }
        }
    }
}

fn display_ref(r: &ObjectRef, ns: Option<&str>) -> String {
    match ns {
        Some(ns) => format!("{}/{} ({})", ns, r.name, r.kind),
        None => format!("{} ({})", r.name, r.kind),
    }
}

fn access_err(action: String, e: AccessError) -> ClientError {
    match e {
        AccessError::NotFound(_) => ClientError::NotFound(strip_verb(&action)),
        AccessError::Api(source) => ClientError::Api { action, source },
    }
}

fn strip_verb(action: &str) -> String {
    action.split_once(' ').map(|(_, rest)| rest.to_string()).unwrap_or_else(|| action.to_string())
}

/// Align `metadata.namespace` with the resolved scope.
fn scoped_body(obj: &Json, ns: Option<&str>) -> Json {
    let mut body = obj.clone();
    if let Some(meta) = body.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        match ns {
            Some(ns) => {
                meta.insert("namespace".into(), Json::String(ns.to_string()));
            }
            None => {
                meta.remove("namespace");
            }
        }
    }
    body
}

/// Split a multi-document YAML stream on `---` separator lines. Blank documents are dropped.
pub fn split_documents(text: &str) -> Vec<String> {
    let mut docs = Vec::new();
    let mut cur = String::new();
    for line in text.lines() {
        let t = line.trim_end();
        if t == "---" || t.starts_with("--- ") {
            docs.push(std::mem::take(&mut cur));
            continue;
        }
        cur.push_str(line);
        cur.push('\n');
    }
    docs.push(cur);
    docs.into_iter().filter(|d| !is_blank_document(d)).collect()
}

fn is_blank_document(d: &str) -> bool {
    d.lines().map(str::trim).all(|l| l.is_empty() || l.starts_with('#'))
}

/// Decode one YAML/JSON document; `None` for an empty (null) document.
pub fn parse_document(doc: &str) -> Result<Option<Json>, ClientError> {
    let val = serde_yaml::from_str::<serde_yaml::Value>(doc)
        .map_err(|e| ClientError::Invalid(format!("failed to parse manifest document: {}", e)))?;
    if val.is_null() {
        return Ok(None);
    }
    let json = serde_json::to_value(val).map_err(|e| ClientError::Invalid(format!("failed to convert manifest document: {}", e)))?;
    if !json.is_object() {
        return Err(ClientError::Invalid("manifest document is not a mapping".into()));
    }
    Ok(Some(json))
}

/// Split and decode every document of a manifest stream.
pub fn split_manifests(text: &str) -> Result<Vec<Json>, ClientError> {
    let mut out = Vec::new();
    for doc in split_documents(text) {
        if let Some(v) = parse_document(&doc)? {
            out.push(v);
        }
    }
    Ok(out)
}
