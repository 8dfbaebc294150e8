use anyhow::{anyhow, Context, Result};
use modctl_apply::{ResourceClient, ScopeEnded, WaitScope};
use modctl_core::{ClientError, Json, ListOptions, ObjectRef, ResourceEvent};
use tracing::{debug, info};

use crate::types::{
    CustomResourcePolicy, Manifest, ModuleRecord, ModuleTemplate, ReleaseMeta, MANIFEST_KIND, OPERATOR_API_VERSION,
    RELEASE_META_KIND, TEMPLATE_KIND,
};

/// Failure of a bounded wait on a module's reported state.
#[derive(Debug, thiserror::Error)]
pub enum StateWaitError {
    #[error("{reason} with last error: {}", .last.as_deref().unwrap_or("none"))]
    Ended { reason: ScopeEnded, last: Option<String> },
    #[error("watch closed with last error: {}", .last.as_deref().unwrap_or("none"))]
    Closed { last: Option<String> },
    #[error(transparent)]
    Watch(#[from] ClientError),
}

/// Operations against the umbrella manifest and the module catalog objects.
#[async_trait::async_trait]
pub trait ModuleMetadata: Send + Sync {
    async fn get_manifest(&self) -> Result<Manifest>;
    async fn update_manifest(&self, manifest: &Manifest) -> Result<()>;
    async fn module_info(&self, module: &str) -> Result<ModuleRecord>;
    /// Add the module entry, or update channel and policy when present.
    async fn enable_module(&self, module: &str, channel: &str, policy: CustomResourcePolicy) -> Result<()>;
    async fn disable_module(&self, module: &str) -> Result<()>;
    async fn manage_module(&self, module: &str, policy: CustomResourcePolicy) -> Result<()>;
    async fn unmanage_module(&self, module: &str) -> Result<()>;
    /// Block until the module reports one of `states`, bounded by `scope`.
    async fn wait_for_module_state(&self, module: &str, states: &[&str], scope: &WaitScope) -> Result<(), StateWaitError>;
    async fn list_module_templates(&self) -> Result<Vec<ModuleTemplate>>;
    async fn list_release_metas(&self) -> Result<Vec<ReleaseMeta>>;
}

/// [`ModuleMetadata`] over the generic resource client.
#[derive(Clone)]
pub struct ManifestClient {
    resources: ResourceClient,
    name: String,
    namespace: String,
}

impl ManifestClient {
    pub fn new(resources: ResourceClient, name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self { resources, name: name.into(), namespace: namespace.into() }
    }

    fn manifest_ref(&self) -> ObjectRef {
        ObjectRef::new(OPERATOR_API_VERSION, MANIFEST_KIND).named(self.name.clone()).within(self.namespace.clone())
    }

    async fn edit<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Manifest) -> Result<()> + Send,
    {
        let mut manifest = self.get_manifest().await?;
        f(&mut manifest)?;
        self.update_manifest(&manifest).await
    }

    async fn list_all<T: serde::de::DeserializeOwned>(&self, kind: &str) -> Result<Vec<T>> {
        let items = self
            .resources
            .list(&ObjectRef::new(OPERATOR_API_VERSION, kind), &ListOptions { all_namespaces: true, field_selector: None })
            .await
            .with_context(|| format!("failed to list {} objects", kind))?;
        items
            .into_iter()
            .map(|v| serde_json::from_value(v).with_context(|| format!("decoding {}", kind)))
            .collect()
    }
}

/// `Ok` when the module reports one of `states`, otherwise the mismatch message.
pub fn check_module_state(manifest: &Json, module: &str, states: &[&str]) -> Result<(), String> {
    let m = Manifest::from_json(manifest).map_err(|e| format!("failed to decode manifest: {}", e))?;
    let state = m.record(module).status.map(|s| s.state).unwrap_or_default();
    if states.iter().any(|s| *s == state) {
        Ok(())
    } else {
        Err(format!("module {} is in the {} state", module, state))
    }
}

#[async_trait::async_trait]
impl ModuleMetadata for ManifestClient {
    async fn get_manifest(&self) -> Result<Manifest> {
        let raw = self.resources.get(&self.manifest_ref()).await.context("failed to get the umbrella manifest")?;
        Manifest::from_json(&raw).context("decoding the umbrella manifest")
    }

    async fn update_manifest(&self, manifest: &Manifest) -> Result<()> {
        let mut raw = manifest.to_json().context("encoding the umbrella manifest")?;
        if let Some(map) = raw.as_object_mut() {
            // the read may come from a list without type fields
            map.insert("apiVersion".into(), Json::String(OPERATOR_API_VERSION.into()));
            map.insert("kind".into(), Json::String(MANIFEST_KIND.into()));
        }
        self.resources.update(&raw).await.context("failed to update the umbrella manifest")?;
        debug!(name = %self.name, ns = %self.namespace, "manifest updated");
        Ok(())
    }

    async fn module_info(&self, module: &str) -> Result<ModuleRecord> {
        Ok(self.get_manifest().await?.record(module))
    }

    async fn enable_module(&self, module: &str, channel: &str, policy: CustomResourcePolicy) -> Result<()> {
        self.edit(|m| {
            m.enable(module, channel, policy);
            Ok(())
        })
        .await?;
        info!(module, channel, policy = %policy, "module entry enabled");
        Ok(())
    }

    async fn disable_module(&self, module: &str) -> Result<()> {
        self.edit(|m| {
            m.disable(module);
            Ok(())
        })
        .await
    }

    async fn manage_module(&self, module: &str, policy: CustomResourcePolicy) -> Result<()> {
        self.edit(|m| if m.set_managed(module, true, policy) { Ok(()) } else { Err(anyhow!("module not found")) }).await
    }

    async fn unmanage_module(&self, module: &str) -> Result<()> {
        self.edit(|m| {
            if m.set_managed(module, false, CustomResourcePolicy::Ignore) {
                Ok(())
            } else {
                Err(anyhow!("module not found"))
            }
        })
        .await
    }

    async fn wait_for_module_state(&self, module: &str, states: &[&str], scope: &WaitScope) -> Result<(), StateWaitError> {
        let mut sub = self.resources.watch_single_resource(&self.manifest_ref()).await?;
        let mut last: Option<String> = None;
        loop {
            let ev = match scope.run(sub.next()).await {
                Err(reason) => return Err(StateWaitError::Ended { reason, last }),
                Ok(None) => return Err(StateWaitError::Closed { last }),
                Ok(Some(ev)) => ev,
            };
            let obj = match &ev {
                ResourceEvent::Error(msg) => {
                    last = Some(msg.clone());
                    continue;
                }
                other => other.object(),
            };
            if let Some(obj) = obj {
                match check_module_state(obj, module, states) {
                    Ok(()) => {
                        debug!(module, "module reached expected state");
                        return Ok(());
                    }
                    Err(msg) => last = Some(msg),
                }
            }
        }
    }

    async fn list_module_templates(&self) -> Result<Vec<ModuleTemplate>> {
        self.list_all(TEMPLATE_KIND).await
    }

    async fn list_release_metas(&self) -> Result<Vec<ReleaseMeta>> {
        self.list_all(RELEASE_META_KIND).await
    }
}

/// Template for `module` at `version`; a legacy `<module>-<channel>` name also matches.
pub fn module_template_for<'a>(templates: &'a [ModuleTemplate], module: &str, version: &str, channel: &str) -> Option<&'a ModuleTemplate> {
    let legacy = format!("{}-{}", module, channel);
    templates
        .iter()
        .find(|t| (!channel.is_empty() && t.name() == legacy) || (t.module_name() == module && t.version() == version))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn state_check_reports_current_state() {
        let m = json!({"spec": {"channel": "regular"}, "status": {"modules": [{"name": "keda", "state": "Processing"}]}});
        assert_eq!(check_module_state(&m, "keda", &["Ready", "Warning"]), Err("module keda is in the Processing state".to_string()));
        let ready = json!({"status": {"modules": [{"name": "keda", "state": "Warning"}]}});
        assert_eq!(check_module_state(&ready, "keda", &["Ready", "Warning"]), Ok(()));
    }

    #[test]
    fn template_lookup_accepts_legacy_names() {
        let mut legacy = ModuleTemplate::default();
        legacy.metadata.name = "keda-fast".into();
        let mut current = ModuleTemplate::default();
        current.metadata.name = "keda-1.2.0".into();
        current.spec.module_name = "keda".into();
        current.spec.version = "1.2.0".into();
        let ts = vec![legacy, current];
        assert_eq!(module_template_for(&ts, "keda", "9.9.9", "fast").map(|t| t.name()), Some("keda-fast"));
        assert_eq!(module_template_for(&ts, "keda", "1.2.0", "regular").map(|t| t.name()), Some("keda-1.2.0"));
        assert!(module_template_for(&ts, "keda", "0.1.0", "").is_none());
    }

    #[test]
    fn timeout_message_carries_last_error() {
        let e = StateWaitError::Ended { reason: ScopeEnded::DeadlineExceeded, last: Some("module keda is in the Processing state".into()) };
        assert_eq!(e.to_string(), "context deadline exceeded with last error: module keda is in the Processing state");
    }
}
