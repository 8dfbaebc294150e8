use std::collections::BTreeMap;

use modctl_apply::{WaitScope, WatchSubscription};
use modctl_catalog::{assigned_channel, module_template_for, CustomResourcePolicy, ModuleTemplate};
use modctl_core::{Json, ListOptions, ObjectRef};
use tracing::{info, warn};

use crate::{ensure_not_cancelled, wait_for_deletion, within, ModuleError, ModuleOrchestrator, READY_STATES, UNMANAGED_STATE};

const UNAVAILABLE_HINT: &str =
    "check the channels listed by `modctl catalog <module>`, or use `modctl install` for a community module";

fn cr_label(r: &ObjectRef) -> String {
    format!("{}/{}", r.namespace.as_deref().unwrap_or_default(), r.name)
}

impl ModuleOrchestrator {
    /// Add the module to the manifest, then apply `crs` once it reports ready.
    ///
    /// An empty `channel` keeps the manifest's default channel. Failures after
    /// the manifest edit leave the edit in place.
    pub async fn enable(
        &self,
        module: &str,
        channel: &str,
        want_default_cr: bool,
        crs: &[Json],
        scope: &WaitScope,
    ) -> Result<(), ModuleError> {
        self.validate_availability(module, channel).await?;

        let policy = CustomResourcePolicy::from_default_cr(want_default_cr);
        self.printer.msgln(format!("adding {} module to the manifest", module));
        self.metadata.enable_module(module, channel, policy).await.map_err(|e| ModuleError::catalog("enable module", e))?;

        self.apply_custom_crs(module, crs, scope).await?;

        self.printer.msgln(format!("{} module enabled", module));
        Ok(())
    }

    async fn validate_availability(&self, module: &str, channel: &str) -> Result<(), ModuleError> {
        let effective = if channel.is_empty() {
            self.metadata.get_manifest().await.map_err(|e| ModuleError::catalog("get the umbrella manifest", e))?.spec.channel
        } else {
            channel.to_string()
        };
        let channels = self
            .catalog
            .channels_and_versions(module)
            .await
            .map_err(|e| ModuleError::catalog(format!("list available versions of {}", module), e))?;
        if channels.contains_key(&effective) {
            return Ok(());
        }
        info!(module, channel = %effective, available = ?channels.keys().collect::<Vec<_>>(), "module not available");
        Err(ModuleError::Unavailable {
            module: module.to_string(),
            hint: format!("no version in channel '{}'; {}", effective, UNAVAILABLE_HINT),
        })
    }

    async fn apply_custom_crs(&self, module: &str, crs: &[Json], scope: &WaitScope) -> Result<(), ModuleError> {
        if crs.is_empty() {
            return Ok(());
        }
        let phase = self.phase(scope);
        self.printer.msgln("waiting for module to be ready");
        self.wait_for_state(module, READY_STATES, &phase).await?;

        for cr in crs {
            let r = ObjectRef::from_json(cr).map_err(|e| ModuleError::client("read custom resource", e))?;
            self.printer.msgln(format!("applying {} cr", cr_label(&r)));
            within(&phase, "custom resource apply", async {
                self.resources.apply(cr).await.map_err(|e| ModuleError::client("apply custom cr", e))
            })
            .await?;
        }
        Ok(())
    }

    /// Remove a module. Core modules with the `Ignore` policy have their
    /// custom resources deleted (and confirmed gone) before the manifest entry
    /// is removed; community modules are uninstalled.
    pub async fn disable(&self, module: &str, community: bool, scope: &WaitScope) -> Result<(), ModuleError> {
        if community {
            return self.uninstall(module, scope).await.map(|_| ());
        }
        self.remove_module_crs(module, scope).await?;

        self.printer.msgln(format!("removing {} module from the manifest", module));
        self.metadata.disable_module(module).await.map_err(|e| ModuleError::catalog("disable module", e))?;
        self.printer.msgln(format!("{} module disabled", module));
        Ok(())
    }

    async fn remove_module_crs(&self, module: &str, scope: &WaitScope) -> Result<(), ModuleError> {
        let manifest = self.metadata.get_manifest().await.map_err(|e| ModuleError::catalog("get module info from the manifest", e))?;
        let record = manifest.record(module);
        // an unset policy is defaulted to CreateAndDelete by the server
        let policy = record.entry.as_ref().and_then(|e| e.custom_resource_policy).unwrap_or(CustomResourcePolicy::CreateAndDelete);
        if policy == CustomResourcePolicy::CreateAndDelete {
            return Ok(());
        }

        let template = self.template_for_enabled(module, &record, &manifest.spec.channel).await?;
        let default_cr = match template.default_cr() {
            Some(cr) => cr,
            None => return Ok(()),
        };
        let kind = ObjectRef::from_json(default_cr).map_err(|e| ModuleError::client("read default custom resource", e))?;
        let instances = self
            .resources
            .list(&kind, &ListOptions { all_namespaces: true, field_selector: None })
            .await
            .map_err(|e| ModuleError::client("list module CRs", e))?;
        let refs = instances
            .iter()
            .map(ObjectRef::from_json)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ModuleError::client("read module CR", e))?;

        // dropping a subscription stops it, so every early return below closes all of them
        let mut watches: Vec<WatchSubscription> = Vec::with_capacity(refs.len());
        for r in &refs {
            let sub = self
                .resources
                .watch_single_resource(r)
                .await
                .map_err(|e| ModuleError::client(format!("watch resource {}", cr_label(r)), e))?;
            watches.push(sub);
        }

        ensure_not_cancelled(scope, &format!("removal of {} CRs", module))?;
        for r in &refs {
            self.printer.msgln(format!("removing {} CR", cr_label(r)));
            match self.resources.remove(r).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(ModuleError::client(format!("remove {} cr", cr_label(r)), e)),
            }
        }

        for (r, sub) in refs.iter().zip(watches.iter_mut()) {
            self.printer.msgln(format!("waiting for {} CR to be removed", cr_label(r)));
            wait_for_deletion(sub, &cr_label(r), &self.phase(scope)).await?;
        }
        info!(module, count = refs.len(), "module CRs removed");
        Ok(())
    }

    async fn template_for_enabled(
        &self,
        module: &str,
        record: &modctl_catalog::ModuleRecord,
        default_channel: &str,
    ) -> Result<ModuleTemplate, ModuleError> {
        let status = record.status.clone().unwrap_or_default();
        let name = if status.name.is_empty() { module } else { status.name.as_str() };
        let channel = [status.channel.as_str(), record.entry.as_ref().map(|e| e.channel.as_str()).unwrap_or_default(), default_channel]
            .into_iter()
            .find(|c| !c.is_empty())
            .unwrap_or_default();
        let templates = self
            .metadata
            .list_module_templates()
            .await
            .map_err(|e| ModuleError::catalog("get ModuleTemplate CR for module", e))?;
        module_template_for(&templates, name, &status.version, channel).cloned().ok_or_else(|| {
            ModuleError::catalog(
                "get ModuleTemplate CR for module",
                anyhow::anyhow!("no module template for {} in channel {} (version '{}')", name, channel, status.version),
            )
        })
    }

    /// Mark the module managed and wait for it to become ready. A module
    /// missing from the manifest is re-enabled in the channel of its installed version.
    pub async fn manage(&self, module: &str, policy: CustomResourcePolicy, scope: &WaitScope) -> Result<(), ModuleError> {
        let manifest = self.metadata.get_manifest().await.map_err(|e| ModuleError::catalog("get the umbrella manifest", e))?;
        if !manifest.contains(module) {
            return self.manage_missing(module, policy, scope).await;
        }
        self.metadata.manage_module(module, policy).await.map_err(|e| ModuleError::catalog("set module as managed", e))?;
        self.wait_for_state(module, READY_STATES, &self.phase(scope)).await
    }

    pub async fn manage_missing(&self, module: &str, policy: CustomResourcePolicy, scope: &WaitScope) -> Result<(), ModuleError> {
        let installed = self.find_installed_core_template(module).await?;
        let metas = self.metadata.list_release_metas().await.map_err(|e| ModuleError::catalog("get module release metas", e))?;
        let assigned = assigned_channel(&metas, module, installed.version()).unwrap_or_default();
        let expected = self.metadata.get_manifest().await.map_err(|e| ModuleError::catalog("get the umbrella manifest", e))?.spec.channel;
        if assigned.is_empty() || assigned != expected {
            return Err(ModuleError::InstalledVersionNotInChannel {
                module: module.to_string(),
                version: installed.version().to_string(),
                channel: expected,
            });
        }
        info!(module, channel = %assigned, version = installed.version(), "re-enabling installed module");
        self.enable(module, &assigned, policy == CustomResourcePolicy::CreateAndDelete, &[], scope).await
    }

    async fn find_installed_core_template(&self, module: &str) -> Result<ModuleTemplate, ModuleError> {
        let core = self.catalog.core().await.map_err(|e| ModuleError::catalog("get core modules", e))?;
        for t in core.into_iter().filter(|t| t.module_name() == module) {
            match self.catalog.installed_manager(&t).await {
                Ok(Some(_)) => return Ok(t),
                Ok(None) => continue,
                Err(e) => warn!(template = t.name(), error = %format!("{:#}", e), "failed to get installed manager"),
            }
        }
        Err(ModuleError::catalog("find installed module", anyhow::anyhow!("no running manager matches a {} template", module)))
    }

    /// Hand the module over to the user and wait for the operator to confirm.
    pub async fn unmanage(&self, module: &str, scope: &WaitScope) -> Result<(), ModuleError> {
        self.metadata.unmanage_module(module).await.map_err(|e| ModuleError::catalog("set module as unmanaged", e))?;
        self.wait_for_state(module, &[UNMANAGED_STATE], &self.phase(scope)).await
    }

    /// Channel to version of `module` in the core catalog.
    pub async fn available_channels(&self, module: &str) -> Result<BTreeMap<String, String>, ModuleError> {
        self.catalog
            .channels_and_versions(module)
            .await
            .map_err(|e| ModuleError::catalog(format!("list channels of {}", module), e))
    }
}
