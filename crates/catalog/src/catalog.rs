use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use modctl_apply::{parse_document, split_documents, ResourceClient};
use modctl_core::{kind_of, name_of, namespace_of, Json, ListOptions, ObjectRef};
use tracing::{debug, warn};

use crate::fetch::Fetcher;
use crate::manifest::ModuleMetadata;
use crate::source::ModuleSource;
use crate::types::{assigned_channel, latest, manager_version, ModuleTemplate};

/// Queries over the local (cluster) and optional remote module sources.
pub struct Catalog {
    local: Arc<dyn ModuleSource>,
    remote: Option<Arc<dyn ModuleSource>>,
    fetcher: Arc<dyn Fetcher>,
    resources: ResourceClient,
    metadata: Arc<dyn ModuleMetadata>,
}

impl Catalog {
    pub fn new(
        local: Arc<dyn ModuleSource>,
        fetcher: Arc<dyn Fetcher>,
        resources: ResourceClient,
        metadata: Arc<dyn ModuleMetadata>,
    ) -> Self {
        Self { local, remote: None, fetcher, resources, metadata }
    }

    pub fn with_remote(mut self, remote: Arc<dyn ModuleSource>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    pub async fn core(&self) -> Result<Vec<ModuleTemplate>> {
        Ok(self.local.templates().await?.into_iter().filter(|t| !t.is_community()).collect())
    }

    pub async fn community(&self) -> Result<Vec<ModuleTemplate>> {
        Ok(self.local.templates().await?.into_iter().filter(|t| t.is_community()).collect())
    }

    pub async fn community_by_name(&self, module: &str) -> Result<Vec<ModuleTemplate>> {
        Ok(self.community().await?.into_iter().filter(|t| t.module_name() == module).collect())
    }

    pub async fn external_community(&self) -> Result<Vec<ModuleTemplate>> {
        let remote = self.remote.as_ref().ok_or_else(|| anyhow!("no external community catalog configured"))?;
        remote.templates().await.context("failed to fetch external module templates")
    }

    /// Remote templates of `module`; an empty `version` yields only the latest release.
    pub async fn external_by_name_and_version(&self, module: &str, version: &str) -> Result<Vec<ModuleTemplate>> {
        let by_name: Vec<ModuleTemplate> = self.external_community().await?.into_iter().filter(|t| t.module_name() == module).collect();
        if version.is_empty() {
            return Ok(latest(&by_name).cloned().into_iter().collect());
        }
        Ok(by_name.into_iter().filter(|t| t.version() == version).collect())
    }

    /// Versions of `module` in the core catalog.
    pub async fn available_versions(&self, module: &str) -> Result<Vec<String>> {
        let mut versions: Vec<String> =
            self.core().await?.into_iter().filter(|t| t.module_name() == module).map(|t| t.spec.version).collect();
        versions.sort();
        versions.dedup();
        Ok(versions)
    }

    /// Channel to version for `module`, from release metadata.
    /// Legacy templates that carry their own channel contribute it directly.
    pub async fn channels_and_versions(&self, module: &str) -> Result<BTreeMap<String, String>> {
        let core = self.core().await?;
        let metas = self.metadata.list_release_metas().await.context("failed to get module release metas")?;
        let mut out = BTreeMap::new();
        for t in core.iter().filter(|t| t.module_name() == module) {
            if let Some(channel) = assigned_channel(&metas, module, t.version()) {
                out.insert(channel, t.version().to_string());
            } else if !t.spec.channel.is_empty() {
                out.insert(t.spec.channel.clone(), t.version().to_string());
            }
        }
        Ok(out)
    }

    /// Unparsed documents behind one manifest link.
    pub async fn fetch_documents(&self, link: &str) -> Result<Vec<String>> {
        let body = self.fetcher.fetch(link).await.with_context(|| format!("failed to fetch resource YAMLs from {}", link))?;
        Ok(split_documents(&String::from_utf8_lossy(&body)))
    }

    /// Raw manifest documents of every resource link, in declared order.
    pub async fn resource_documents(&self, template: &ModuleTemplate) -> Result<Vec<String>> {
        let mut docs = Vec::new();
        for res in &template.spec.resources {
            docs.extend(self.fetch_documents(&res.link).await?);
        }
        Ok(docs)
    }

    pub async fn resources(&self, template: &ModuleTemplate) -> Result<Vec<Json>> {
        let mut out = Vec::new();
        for doc in self.resource_documents(template).await? {
            let parsed = parse_document(&doc)
                .with_context(|| format!("failed to parse module resource YAML for {}:{}", template.module_name(), template.version()))?;
            out.extend(parsed);
        }
        Ok(out)
    }

    /// The running manager of `template`, when its version matches the template's.
    pub async fn installed_manager(&self, template: &ModuleTemplate) -> Result<Option<Json>> {
        let resources = self
            .resources(template)
            .await
            .with_context(|| format!("failed to get resources for module {}", template.module_name()))?;
        let manager = template.spec.manager.as_ref().ok_or_else(|| anyhow!("manager not found in resources"))?;
        let doc = resources
            .iter()
            .find(|r| kind_of(r) == Some(manager.kind.as_str()) && name_of(r) == Some(manager.name.as_str()))
            .ok_or_else(|| anyhow!("failed to retrieve manager info from {}: manager not found in resources", template.module_name()))?;
        let api_version = doc.get("apiVersion").and_then(|v| v.as_str()).unwrap_or_default();
        let r = ObjectRef::new(api_version, manager.kind.clone())
            .named(manager.name.clone())
            .within(namespace_of(doc).unwrap_or(manager.namespace.as_str()).to_string());
        let installed = self
            .resources
            .get_opt(&r)
            .await
            .context("failed to retrieve installed manager from the target environment")?;
        Ok(installed.filter(|obj| {
            let v = manager_version(obj).unwrap_or_default();
            let matches = v == template.version();
            if !matches {
                debug!(module = template.module_name(), installed = %v, template = template.version(), "manager version differs");
            }
            matches
        }))
    }

    /// Community templates of `module` whose manager is running at the template version.
    pub async fn community_installed_by_name(&self, module: &str) -> Result<Vec<ModuleTemplate>> {
        let mut installed: Vec<ModuleTemplate> = Vec::new();
        for t in self.community_by_name(module).await? {
            match self.installed_manager(&t).await {
                Ok(Some(_)) => {}
                Ok(None) => continue,
                Err(e) => {
                    warn!(template = t.name(), error = %format!("{:#}", e), "failed to request for installed manager");
                    continue;
                }
            }
            if !installed.iter().any(|i| i.same_release(&t)) {
                installed.push(t);
            }
        }
        Ok(installed)
    }

    /// Live instances of the template's associated kinds, excluding the default CR kind.
    /// Kinds the cluster does not know are skipped.
    pub async fn running_associated_resources(&self, template: &ModuleTemplate) -> Result<Vec<Json>> {
        let default_cr = template.default_cr();
        let mut running = Vec::new();
        for gvk in &template.spec.associated_resources {
            let api_version = if gvk.group.is_empty() { gvk.version.clone() } else { format!("{}/{}", gvk.group, gvk.version) };
            let is_default = default_cr
                .map(|cr| kind_of(cr) == Some(gvk.kind.as_str()) && cr.get("apiVersion").and_then(|v| v.as_str()) == Some(api_version.as_str()))
                .unwrap_or(false);
            if is_default {
                continue;
            }
            let opts = ListOptions { all_namespaces: true, field_selector: None };
            match self.resources.list(&ObjectRef::new(api_version.clone(), gvk.kind.clone()), &opts).await {
                Ok(items) => running.extend(items),
                Err(e) if e.is_not_found() || e.is_resolution() => continue,
                Err(e) => warn!(kind = %gvk.kind, api_version = %api_version, error = %e, "failed to list associated resources"),
            }
        }
        Ok(running)
    }
}
