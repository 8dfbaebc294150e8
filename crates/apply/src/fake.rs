//! In-memory cluster for tests: discovery, access, watches and failure injection.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use modctl_core::{AccessError, GroupVersion, Json, ResourceDescriptor, ResourceEvent};
use modctl_kubehub::{DiscoveredResource, DiscoveryApi};
use tokio::sync::mpsc;

use crate::{ClusterAccess, WatchSubscription};

type Key = (String, String, String);

#[derive(Default)]
struct State {
    kinds: Vec<DiscoveredResource>,
    objects: BTreeMap<Key, Json>,
    calls: Vec<String>,
    fail_apply: HashSet<String>,
    fail_delete: HashSet<String>,
    fail_watch: HashSet<String>,
    held: HashSet<String>,
    stalled_apply: HashSet<String>,
    watchers: Vec<(Key, mpsc::Sender<ResourceEvent>)>,
    rv: u64,
}

impl State {
    fn bump(&mut self) -> String {
        self.rv += 1;
        self.rv.to_string()
    }

    fn notify(&mut self, key: &Key, ev: ResourceEvent) {
        self.watchers.retain(|(_, tx)| !tx.is_closed());
        for (k, tx) in &self.watchers {
            if k == key {
                let _ = tx.try_send(ev.clone());
            }
        }
    }
}

/// Fake cluster shared by discovery and access. Names passed to the failure
/// injectors match `metadata.name` of any kind.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

fn key(desc: &ResourceDescriptor, namespace: Option<&str>, name: &str) -> Key {
    (format!("{}/{}", desc.api_version(), desc.plural), namespace.unwrap_or_default().to_string(), name.to_string())
}

fn target(desc: &ResourceDescriptor, namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) => format!("{} {}/{}", desc.kind, ns, name),
        None => format!("{} {}", desc.kind, name),
    }
}

fn merge_into(dst: &mut Json, src: &Json) {
    match (dst, src) {
        (Json::Object(d), Json::Object(s)) => {
            for (k, v) in s {
                match d.get_mut(k) {
                    Some(existing) => merge_into(existing, v),
                    None => {
                        d.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (d, s) => *d = s.clone(),
    }
}

fn set_rv(obj: &mut Json, rv: &str) {
    if let Some(meta) = obj.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.insert("resourceVersion".into(), Json::String(rv.to_string()));
    }
}

fn rv_of(obj: &Json) -> Option<&str> {
    obj.get("metadata").and_then(|m| m.get("resourceVersion")).and_then(|v| v.as_str())
}

fn without_rv(obj: &Json) -> Json {
    let mut v = obj.clone();
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("resourceVersion");
    }
    v
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Core kinds plus the module operator's kinds.
    pub fn standard() -> Self {
        Self::new()
            .with_kind("", "v1", "Namespace", "namespaces", false)
            .with_kind("", "v1", "Secret", "secrets", true)
            .with_kind("", "v1", "ConfigMap", "configmaps", true)
            .with_kind("", "v1", "ServiceAccount", "serviceaccounts", true)
            .with_kind("apps", "v1", "Deployment", "deployments", true)
            .with_kind("apps", "v1", "Deployment", "deployments/status", true)
            .with_kind("operator.kyma-project.io", "v1beta2", "Kyma", "kymas", true)
            .with_kind("operator.kyma-project.io", "v1beta2", "ModuleTemplate", "moduletemplates", true)
            .with_kind("operator.kyma-project.io", "v1beta2", "ModuleReleaseMeta", "modulereleasemetas", true)
    }

    pub fn with_kind(self, group: &str, version: &str, kind: &str, plural: &str, namespaced: bool) -> Self {
        if let Ok(mut st) = self.state.lock() {
            st.kinds.push(DiscoveredResource {
                group: group.into(),
                version: version.into(),
                kind: kind.into(),
                plural: plural.into(),
                namespaced,
            });
        }
        self
    }

    fn descriptor(&self, api_version: &str, kind: &str) -> Result<ResourceDescriptor> {
        let gv = GroupVersion::parse(api_version);
        let st = self.state.lock().map_err(|_| anyhow!("fake cluster poisoned"))?;
        st.kinds
            .iter()
            .find(|r| r.group == gv.group && r.version == gv.version && r.kind == kind && !r.plural.contains('/'))
            .map(|r| ResourceDescriptor {
                group: r.group.clone(),
                version: r.version.clone(),
                kind: r.kind.clone(),
                plural: r.plural.clone(),
                namespaced: r.namespaced,
            })
            .ok_or_else(|| anyhow!("fake cluster has no kind {} {}", api_version, kind))
    }

    /// Store an object directly, bypassing the call log.
    pub fn seed(&self, obj: Json) -> Result<()> {
        let api_version = obj.get("apiVersion").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let kind = obj.get("kind").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let desc = self.descriptor(&api_version, &kind)?;
        let name = modctl_core::name_of(&obj).unwrap_or_default().to_string();
        let ns = if desc.namespaced { modctl_core::namespace_of(&obj).map(|s| s.to_string()) } else { None };
        let mut st = self.state.lock().map_err(|_| anyhow!("fake cluster poisoned"))?;
        let rv = st.bump();
        let mut obj = obj;
        set_rv(&mut obj, &rv);
        st.objects.insert(key(&desc, ns.as_deref(), &name), obj);
        Ok(())
    }

    pub fn object(&self, api_version: &str, kind: &str, namespace: Option<&str>, name: &str) -> Option<Json> {
        let desc = self.descriptor(api_version, kind).ok()?;
        let ns = if desc.namespaced { namespace } else { None };
        self.state.lock().ok()?.objects.get(&key(&desc, ns, name)).cloned()
    }

    /// Replace `status` on a stored object and emit `Modified` to its watchers.
    pub fn set_status(&self, api_version: &str, kind: &str, namespace: Option<&str>, name: &str, status: Json) -> Result<()> {
        let desc = self.descriptor(api_version, kind)?;
        let ns = if desc.namespaced { namespace } else { None };
        let k = key(&desc, ns, name);
        let mut st = self.state.lock().map_err(|_| anyhow!("fake cluster poisoned"))?;
        let rv = st.bump();
        let obj = st.objects.get_mut(&k).ok_or_else(|| anyhow!("no object {}", name))?;
        if let Some(map) = obj.as_object_mut() {
            map.insert("status".into(), status);
        }
        set_rv(obj, &rv);
        let snapshot = obj.clone();
        st.notify(&k, ResourceEvent::Modified(snapshot));
        Ok(())
    }

    /// Access calls in order, e.g. `apply Secret ns/name`, `delete Namespace name`.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().map(|st| st.calls.clone()).unwrap_or_default()
    }

    pub fn clear_calls(&self) {
        if let Ok(mut st) = self.state.lock() {
            st.calls.clear();
        }
    }

    /// Calls that changed state (apply, replace, delete).
    pub fn mutations(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with("apply ") || c.starts_with("replace ") || c.starts_with("delete "))
            .collect()
    }

    pub fn fail_apply_of(&self, name: &str) {
        if let Ok(mut st) = self.state.lock() {
            st.fail_apply.insert(name.to_string());
        }
    }

    pub fn fail_delete_of(&self, name: &str) {
        if let Ok(mut st) = self.state.lock() {
            st.fail_delete.insert(name.to_string());
        }
    }

    pub fn fail_watch_of(&self, name: &str) {
        if let Ok(mut st) = self.state.lock() {
            st.fail_watch.insert(name.to_string());
        }
    }

    /// Deletions of `name` are accepted but never complete, as with a stuck finalizer.
    pub fn hold_deletion_of(&self, name: &str) {
        if let Ok(mut st) = self.state.lock() {
            st.held.insert(name.to_string());
        }
    }

    /// Applies of `name` are recorded and then never answered.
    pub fn stall_apply_of(&self, name: &str) {
        if let Ok(mut st) = self.state.lock() {
            st.stalled_apply.insert(name.to_string());
        }
    }

    /// Watches whose subscriber is still alive.
    pub fn open_watches(&self) -> usize {
        self.state.lock().map(|st| st.watchers.iter().filter(|(_, tx)| !tx.is_closed()).count()).unwrap_or(0)
    }
}

fn poisoned() -> AccessError {
    AccessError::Api(anyhow!("fake cluster poisoned"))
}

#[async_trait::async_trait]
impl DiscoveryApi for FakeCluster {
    async fn resources_for(&self, gv: &GroupVersion) -> Result<Vec<DiscoveredResource>> {
        let st = self.state.lock().map_err(|_| anyhow!("fake cluster poisoned"))?;
        Ok(st.kinds.iter().filter(|r| r.group == gv.group && r.version == gv.version).cloned().collect())
    }
}

#[async_trait::async_trait]
impl ClusterAccess for FakeCluster {
    async fn apply(&self, desc: &ResourceDescriptor, namespace: Option<&str>, name: &str, body: &Json) -> Result<Json, AccessError> {
        let stalled = {
            let mut st = self.state.lock().map_err(|_| poisoned())?;
            st.calls.push(format!("apply {}", target(desc, namespace, name)));
            st.stalled_apply.contains(name)
        };
        if stalled {
            return std::future::pending().await;
        }
        let mut st = self.state.lock().map_err(|_| poisoned())?;
        if st.fail_apply.contains(name) {
            return Err(AccessError::Api(anyhow!("admission webhook denied {}", name)));
        }
        let k = key(desc, namespace, name);
        let existing = st.objects.get(&k).cloned();
        let (merged, created) = match existing {
            Some(mut cur) => {
                let before = without_rv(&cur);
                merge_into(&mut cur, body);
                if without_rv(&cur) == before {
                    return Ok(cur);
                }
                (cur, false)
            }
            None => (body.clone(), true),
        };
        let rv = st.bump();
        let mut merged = merged;
        set_rv(&mut merged, &rv);
        st.objects.insert(k.clone(), merged.clone());
        let ev = if created { ResourceEvent::Added(merged.clone()) } else { ResourceEvent::Modified(merged.clone()) };
        st.notify(&k, ev);
        Ok(merged)
    }

    async fn get(&self, desc: &ResourceDescriptor, namespace: Option<&str>, name: &str) -> Result<Json, AccessError> {
        let mut st = self.state.lock().map_err(|_| poisoned())?;
        st.calls.push(format!("get {}", target(desc, namespace, name)));
        st.objects.get(&key(desc, namespace, name)).cloned().ok_or_else(|| AccessError::NotFound(name.to_string()))
    }

    async fn list(&self, desc: &ResourceDescriptor, namespace: Option<&str>, field_selector: Option<&str>) -> Result<Vec<Json>, AccessError> {
        let mut st = self.state.lock().map_err(|_| poisoned())?;
        st.calls.push(format!("list {} {}", desc.kind, namespace.unwrap_or("*")));
        let mut want_name = None;
        let mut want_ns = None;
        if let Some(fs) = field_selector {
            for term in fs.split(',').filter(|t| !t.is_empty()) {
                match term.split_once('=') {
                    Some(("metadata.name", v)) => want_name = Some(v.to_string()),
                    Some(("metadata.namespace", v)) => want_ns = Some(v.to_string()),
                    _ => return Err(AccessError::Api(anyhow!("unsupported field selector {}", term))),
                }
            }
        }
        let gvr = format!("{}/{}", desc.api_version(), desc.plural);
        let items = st
            .objects
            .iter()
            .filter(|((g, ns, name), _)| {
                *g == gvr
                    && namespace.map_or(true, |want| ns == want)
                    && want_ns.as_deref().map_or(true, |want| ns == want)
                    && want_name.as_deref().map_or(true, |want| name == want)
            })
            .map(|(_, v)| v.clone())
            .collect();
        Ok(items)
    }

    async fn delete(&self, desc: &ResourceDescriptor, namespace: Option<&str>, name: &str) -> Result<(), AccessError> {
        let mut st = self.state.lock().map_err(|_| poisoned())?;
        st.calls.push(format!("delete {}", target(desc, namespace, name)));
        if st.fail_delete.contains(name) {
            return Err(AccessError::Api(anyhow!("deletion of {} forbidden", name)));
        }
        let k = key(desc, namespace, name);
        if !st.objects.contains_key(&k) {
            return Err(AccessError::NotFound(name.to_string()));
        }
        if st.held.contains(name) {
            return Ok(());
        }
        if let Some(obj) = st.objects.remove(&k) {
            st.notify(&k, ResourceEvent::Deleted(obj));
        }
        Ok(())
    }

    async fn replace(&self, desc: &ResourceDescriptor, namespace: Option<&str>, name: &str, body: &Json) -> Result<Json, AccessError> {
        let mut st = self.state.lock().map_err(|_| poisoned())?;
        st.calls.push(format!("replace {}", target(desc, namespace, name)));
        let k = key(desc, namespace, name);
        let cur_rv = match st.objects.get(&k) {
            Some(cur) => rv_of(cur).map(|s| s.to_string()),
            None => return Err(AccessError::NotFound(name.to_string())),
        };
        if let (Some(sent), Some(cur)) = (rv_of(body), cur_rv.as_deref()) {
            if sent != cur {
                return Err(AccessError::Api(anyhow!("conflict: {} was modified (rv {} != {})", name, sent, cur)));
            }
        }
        let rv = st.bump();
        let mut obj = body.clone();
        set_rv(&mut obj, &rv);
        st.objects.insert(k.clone(), obj.clone());
        st.notify(&k, ResourceEvent::Modified(obj.clone()));
        Ok(obj)
    }

    async fn watch(&self, desc: &ResourceDescriptor, namespace: Option<&str>, name: &str) -> Result<WatchSubscription, AccessError> {
        let mut st = self.state.lock().map_err(|_| poisoned())?;
        st.calls.push(format!("watch {}", target(desc, namespace, name)));
        if st.fail_watch.contains(name) {
            return Err(AccessError::Api(anyhow!("watch of {} refused", name)));
        }
        let (tx, rx) = mpsc::channel(64);
        let k = key(desc, namespace, name);
        // resourceVersion "0" semantics: the current object arrives first
        if let Some(cur) = st.objects.get(&k) {
            let _ = tx.try_send(ResourceEvent::Added(cur.clone()));
        }
        st.watchers.push((k, tx));
        Ok(WatchSubscription::new(rx, None))
    }
}
