use modctl_apply::{parse_document, WaitScope};
use modctl_catalog::{latest, ModuleTemplate};
use modctl_core::{kind_of, name_of, Json, ObjectRef};
use serde::Serialize;
use tracing::{info, warn};

use crate::{ensure_not_cancelled, wait_for_deletion, within, ModuleError, ModuleOrchestrator};

/// Outcome of a community module removal that ran to the end.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UninstallReport {
    /// `name (Kind)` of each resource confirmed deleted, in deletion order.
    pub removed: Vec<String>,
    /// `name (Kind)` and the reason, for each resource that could not be removed.
    pub failed: Vec<(String, String)>,
}

impl UninstallReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

fn label(doc: &Json) -> String {
    format!("{} ({})", name_of(doc).unwrap_or_default(), kind_of(doc).unwrap_or_default())
}

impl ModuleOrchestrator {
    /// Install a community module at `version` (empty for the latest release).
    pub async fn install(
        &self,
        module: &str,
        version: &str,
        want_default_cr: bool,
        crs: &[Json],
        scope: &WaitScope,
    ) -> Result<ModuleTemplate, ModuleError> {
        let template = self.find_community_template(module, version).await?;
        self.install_template(&template, want_default_cr, crs, scope).await?;
        Ok(template)
    }

    async fn find_community_template(&self, module: &str, version: &str) -> Result<ModuleTemplate, ModuleError> {
        let local = self
            .catalog
            .community_by_name(module)
            .await
            .map_err(|e| ModuleError::catalog("retrieve community modules", e))?;
        let found = if version.is_empty() {
            latest(&local).cloned()
        } else {
            local.into_iter().find(|t| t.version() == version)
        };
        if let Some(t) = found {
            return Ok(t);
        }
        if self.catalog.has_remote() {
            let remote = self
                .catalog
                .external_by_name_and_version(module, version)
                .await
                .map_err(|e| ModuleError::catalog("retrieve external community modules", e))?;
            if let Some(t) = remote.into_iter().next() {
                return Ok(t);
            }
        }
        Err(ModuleError::Unavailable {
            module: module.to_string(),
            hint: format!(
                "no community template{}; list community modules with `modctl catalog --community`",
                if version.is_empty() { String::new() } else { format!(" in version {}", version) }
            ),
        })
    }

    /// Apply every document of the template's manifests in order, then the
    /// requested custom resources. A failing document rolls back the ones
    /// already applied, in the order they were applied.
    pub async fn install_template(
        &self,
        template: &ModuleTemplate,
        want_default_cr: bool,
        crs: &[Json],
        scope: &WaitScope,
    ) -> Result<(), ModuleError> {
        if want_default_cr && !crs.is_empty() {
            return Err(ModuleError::Invalid("default custom resource and custom resources list cannot be applied together".into()));
        }
        let default_cr = if want_default_cr {
            let cr = template.default_cr().ok_or_else(|| {
                ModuleError::Invalid(format!("module {} declares no default custom resource", template.module_name()))
            })?;
            Some(cr)
        } else {
            None
        };
        let mut applied: Vec<ObjectRef> = Vec::new();
        if let Err(e) = self.apply_module_resources(template, &mut applied).await {
            self.rollback(&applied).await;
            return Err(e);
        }
        info!(template = template.name(), count = applied.len(), "module resources applied");

        // custom resources are not rolled back; the module itself stays installed
        let phase = self.phase(scope);
        if let Some(cr) = default_cr {
            within(&phase, "default custom resource apply", async {
                self.resources.apply(cr).await.map_err(|e| ModuleError::client("apply default custom resource", e))
            })
            .await?;
        }
        for cr in crs {
            within(&phase, "custom resource apply", async {
                self.resources.apply(cr).await.map_err(|e| ModuleError::client("apply custom resource from path", e))
            })
            .await?;
        }

        self.printer.msgln(format!("{} community module enabled", template.name()));
        Ok(())
    }

    async fn apply_module_resources(&self, template: &ModuleTemplate, applied: &mut Vec<ObjectRef>) -> Result<(), ModuleError> {
        for res in &template.spec.resources {
            let docs = self
                .catalog
                .fetch_documents(&res.link)
                .await
                .map_err(|e| ModuleError::catalog("fetch module resources", e))?;
            for doc in docs {
                let obj = match parse_document(&doc).map_err(|e| ModuleError::client("parse module resource", e))? {
                    Some(obj) => obj,
                    None => continue,
                };
                let r = ObjectRef::from_json(&obj).map_err(|e| ModuleError::client("parse module resource", e))?;
                self.resources.apply(&obj).await.map_err(|e| ModuleError::client("apply resource", e))?;
                applied.push(r);
            }
        }
        Ok(())
    }

    async fn rollback(&self, applied: &[ObjectRef]) {
        for r in applied {
            if let Err(e) = self.resources.remove(r).await {
                warn!(target = %r, error = %e, "rollback failed");
                self.printer.msgln(format!("failed to rollback resource {}: {}", r, e));
            }
        }
    }

    /// The single installed community template named `module`.
    pub async fn template_to_delete(&self, module: &str) -> Result<ModuleTemplate, ModuleError> {
        let action = || format!("retrieve the module {}", module);
        let mut installed = self
            .catalog
            .community_installed_by_name(module)
            .await
            .map_err(|e| ModuleError::catalog(action(), e.context("failed to retrieve a list of installed community modules")))?;
        match installed.len() {
            0 => Err(ModuleError::catalog(action(), anyhow::anyhow!("failed to find any version of the module {}", module))),
            1 => Ok(installed.remove(0)),
            _ => Err(ModuleError::catalog(action(), anyhow::anyhow!("failed to determine module version for {}", module))),
        }
    }

    /// Remove the installed community module, continuing past per-resource failures.
    pub async fn uninstall(&self, module: &str, scope: &WaitScope) -> Result<UninstallReport, ModuleError> {
        self.printer.msgln(format!("removing {} community module from the target environment", module));
        let template = self.template_to_delete(module).await?;
        let report = self.uninstall_template(&template, scope).await?;
        if report.is_clean() {
            self.printer.msgln(format!("{} community module successfully removed", module));
        } else {
            self.printer.msgln(format!("some errors occured during the {} community module removal", module));
        }
        Ok(report)
    }

    /// Delete the template's resources in reverse manifest order, each
    /// confirmed by its watch before moving on.
    pub async fn uninstall_template(&self, template: &ModuleTemplate, scope: &WaitScope) -> Result<UninstallReport, ModuleError> {
        let mut resources = self
            .catalog
            .resources(template)
            .await
            .map_err(|e| ModuleError::catalog(format!("get resources for module {}", template.module_name()), e))?;
        resources.reverse();

        let mut report = UninstallReport::default();
        for doc in &resources {
            let what = label(doc);
            ensure_not_cancelled(scope, &format!("removal of {}", what))?;
            match self.delete_and_wait(doc, &what, scope).await {
                Ok(()) => report.removed.push(what),
                // only deadline misses are recorded; cancellation stops the removal
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    let reason = format!("{:#}", anyhow::Error::new(e));
                    self.printer.msgln(format!("failed to delete resource {}: {}", what, reason));
                    report.failed.push((what, reason));
                }
            }
        }
        info!(template = template.name(), removed = report.removed.len(), failed = report.failed.len(), "uninstall finished");
        Ok(report)
    }

    async fn delete_and_wait(&self, doc: &Json, what: &str, scope: &WaitScope) -> Result<(), ModuleError> {
        let r = ObjectRef::from_json(doc).map_err(|e| ModuleError::client("read module resource", e))?;
        let mut sub = self
            .resources
            .watch_single_resource(&r)
            .await
            .map_err(|e| ModuleError::client(format!("watch resource {}", what), e))?;
        match self.resources.remove(&r).await {
            Ok(()) => {}
            // already gone
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(ModuleError::client(format!("remove resource {}", what), e)),
        }
        self.printer.msgln(format!("waiting for resource deletion: {}", what));
        wait_for_deletion(&mut sub, what, &self.phase(scope)).await
    }

    /// `name (Kind)` of live instances of the module's associated kinds.
    pub async fn running_resources_of_community_module(&self, module: &str) -> Result<Vec<String>, ModuleError> {
        let template = self.template_to_delete(module).await?;
        let running = self
            .catalog
            .running_associated_resources(&template)
            .await
            .map_err(|e| ModuleError::catalog(format!("retrieve running resources of the {} module", module), e))?;
        Ok(running.iter().map(label).collect())
    }
}
