//! modctl ops: module lifecycle workflows over the generic resource client.
//! Every wait is bounded by a [`WaitScope`] derived from the caller's scope.

#![forbid(unsafe_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use modctl_apply::{split_manifests, ResourceClient, ScopeEnded, WaitScope, WatchSubscription};
use modctl_catalog::{Catalog, ModuleMetadata, StateWaitError};
use modctl_core::{ClientError, Json, Printer, ResourceEvent};
use modctl_params::{ParamError, Parameter};
use tracing::{debug, warn};

mod community;
mod core_modules;

pub use community::UninstallReport;

/// States a module reports once it is usable.
pub const READY_STATES: &[&str] = &["Ready", "Warning"];
pub const UNMANAGED_STATE: &str = "Unmanaged";

#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    #[error("module {module} is not available: {hint}")]
    Unavailable { module: String, hint: String },
    #[error("version of the installed module doesn't exist in the configured release channel")]
    InstalledVersionNotInChannel { module: String, version: String, channel: String },
    /// Deadline or cancellation; only the reason text tells them apart.
    #[error("context timeout waiting for {what}: {reason}{}", .last.as_ref().map(|l| format!(" (last error: {})", l)).unwrap_or_default())]
    ContextTimeout { what: String, reason: ScopeEnded, last: Option<String> },
    #[error("failed to {action}")]
    Client {
        action: String,
        #[source]
        source: ClientError,
    },
    #[error("failed to {action}")]
    Catalog {
        action: String,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    Params(#[from] ParamError),
    #[error("{0}")]
    Invalid(String),
}

impl ModuleError {
    pub(crate) fn timeout(what: impl Into<String>, reason: ScopeEnded, last: Option<String>) -> Self {
        let what = what.into();
        counter!("module_wait_timeout_total", 1u64);
        warn!(what = %what, reason = %reason, "bounded wait ended");
        ModuleError::ContextTimeout { what, reason, last }
    }

    pub(crate) fn client(action: impl Into<String>, source: ClientError) -> Self {
        ModuleError::Client { action: action.into(), source }
    }

    pub(crate) fn catalog(action: impl Into<String>, source: anyhow::Error) -> Self {
        ModuleError::Catalog { action: action.into(), source }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ModuleError::ContextTimeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ModuleError::ContextTimeout { reason: ScopeEnded::Cancelled, .. })
    }
}

/// Drives module workflows; collaborators are handed in explicitly.
pub struct ModuleOrchestrator {
    resources: ResourceClient,
    metadata: Arc<dyn ModuleMetadata>,
    catalog: Arc<Catalog>,
    printer: Printer,
    timeout: Duration,
}

impl ModuleOrchestrator {
    pub fn new(resources: ResourceClient, metadata: Arc<dyn ModuleMetadata>, catalog: Arc<Catalog>, printer: Printer) -> Self {
        Self { resources, metadata, catalog, printer, timeout: Duration::from_secs(modctl_core::config::DEFAULT_WAIT_TIMEOUT_SECS) }
    }

    /// Bound for each wait phase.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    fn phase(&self, scope: &WaitScope) -> WaitScope {
        scope.child(self.timeout)
    }

    /// Decode custom resources from a YAML stream and set `params` on each.
    pub fn prepare_custom_resources(&self, text: &str, params: &[Parameter]) -> Result<Vec<Json>, ModuleError> {
        let mut docs = split_manifests(text).map_err(|e| ModuleError::client("read custom resources", e))?;
        for doc in docs.iter_mut() {
            modctl_params::set(doc, params)?;
        }
        Ok(docs)
    }

    async fn wait_for_state(&self, module: &str, states: &[&str], scope: &WaitScope) -> Result<(), ModuleError> {
        debug!(module, ?states, "waiting for module state");
        self.metadata.wait_for_module_state(module, states, scope).await.map_err(|e| match e {
            StateWaitError::Ended { reason, last } => ModuleError::timeout(format!("module {} state", module), reason, last),
            StateWaitError::Watch(source) => ModuleError::client("check module state", source),
            other => ModuleError::catalog("check module state", other.into()),
        })
    }
}

/// Resolve `fut` within `scope`, turning an ended scope into a timeout.
pub(crate) async fn within<T, F>(scope: &WaitScope, what: &str, fut: F) -> Result<T, ModuleError>
where
    F: Future<Output = Result<T, ModuleError>>,
{
    match scope.run(fut).await {
        Ok(r) => r,
        Err(reason) => Err(ModuleError::timeout(what, reason, None)),
    }
}

/// Fail fast when the caller has already given up, before starting `what`.
pub(crate) fn ensure_not_cancelled(scope: &WaitScope, what: &str) -> Result<(), ModuleError> {
    if scope.is_cancelled() {
        return Err(ModuleError::timeout(what, ScopeEnded::Cancelled, None));
    }
    Ok(())
}

/// Block until `sub` reports a deletion or `scope` ends.
pub(crate) async fn wait_for_deletion(sub: &mut WatchSubscription, what: &str, scope: &WaitScope) -> Result<(), ModuleError> {
    let mut last = None;
    loop {
        match scope.run(sub.next()).await {
            Err(reason) => return Err(ModuleError::timeout(format!("deletion of {}", what), reason, last)),
            Ok(None) => {
                return Err(ModuleError::client(
                    format!("wait for deletion of {}", what),
                    ClientError::Watch { target: what.to_string(), source: anyhow::anyhow!("watch stream closed") },
                ))
            }
            Ok(Some(ResourceEvent::Error(msg))) => last = Some(msg),
            Ok(Some(ev)) if ev.is_deleted() => {
                debug!(target = %what, "deletion observed");
                return Ok(());
            }
            Ok(Some(_)) => continue,
        }
    }
}
