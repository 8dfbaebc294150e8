#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use modctl_apply::{fake::FakeCluster, ResourceClient};
use modctl_catalog::{Catalog, ClusterSource, ManifestClient, ModuleMetadata, StaticFetcher};
use modctl_core::printer::Captured;
use modctl_core::Printer;
use modctl_kubehub::Resolver;
use modctl_ops::ModuleOrchestrator;
use serde_json::{json, Value};

pub const OPERATOR: &str = "operator.kyma-project.io/v1beta2";
pub const KEDA_API: &str = "operator.kyma-project.io/v1alpha1";
pub const MANIFEST_NS: &str = "kyma-system";

pub struct Harness {
    pub fake: Arc<FakeCluster>,
    pub orch: ModuleOrchestrator,
    pub out: Captured,
}

pub fn harness(fetcher: StaticFetcher, timeout: Duration) -> Harness {
    let fake = Arc::new(FakeCluster::standard().with_kind("operator.kyma-project.io", "v1alpha1", "Keda", "kedas", true));
    let resources = ResourceClient::new(Arc::new(Resolver::new(fake.clone())), fake.clone());
    let metadata: Arc<dyn ModuleMetadata> = Arc::new(ManifestClient::new(resources.clone(), "default", MANIFEST_NS));
    let catalog = Catalog::new(Arc::new(ClusterSource::new(metadata.clone())), Arc::new(fetcher), resources.clone(), metadata.clone());
    let (printer, out) = Printer::capture();
    let orch = ModuleOrchestrator::new(resources, metadata, Arc::new(catalog), printer).with_timeout(timeout);
    Harness { fake, orch, out }
}

pub fn manifest(modules: Value, status: Value) -> Value {
    json!({
        "apiVersion": OPERATOR,
        "kind": "Kyma",
        "metadata": {"name": "default", "namespace": MANIFEST_NS},
        "spec": {"channel": "regular", "modules": modules},
        "status": {"modules": status}
    })
}

pub fn keda_cr(name: &str, ns: &str) -> Value {
    json!({"apiVersion": KEDA_API, "kind": "Keda", "metadata": {"name": name, "namespace": ns}, "spec": {"logging": {"level": "info"}}})
}

pub fn core_template(module: &str, version: &str, extra_spec: Value) -> Value {
    let mut spec = json!({"moduleName": module, "version": version});
    if let (Some(dst), Some(src)) = (spec.as_object_mut(), extra_spec.as_object()) {
        for (k, v) in src {
            dst.insert(k.clone(), v.clone());
        }
    }
    json!({
        "apiVersion": OPERATOR,
        "kind": "ModuleTemplate",
        "metadata": {
            "name": format!("{}-{}", module, version),
            "namespace": MANIFEST_NS,
            "labels": {"operator.kyma-project.io/managed-by": "kyma"}
        },
        "spec": spec
    })
}

pub fn community_template(module: &str, version: &str, links: &[&str]) -> Value {
    let resources: Vec<Value> = links.iter().map(|l| json!({"name": "rawManifest", "link": l})).collect();
    json!({
        "apiVersion": OPERATOR,
        "kind": "ModuleTemplate",
        "metadata": {"name": format!("{}-{}", module, version), "namespace": "default"},
        "spec": {
            "moduleName": module,
            "version": version,
            "manager": {"group": "apps", "version": "v1", "kind": "Deployment", "name": format!("{}-manager", module), "namespace": format!("{}-system", module)},
            "resources": resources
        }
    })
}

pub fn release_meta(module: &str, channels: &[(&str, &str)]) -> Value {
    let channels: Vec<Value> = channels.iter().map(|(c, v)| json!({"channel": c, "version": v})).collect();
    json!({
        "apiVersion": OPERATOR,
        "kind": "ModuleReleaseMeta",
        "metadata": {"name": module, "namespace": MANIFEST_NS},
        "spec": {"moduleName": module, "channels": channels}
    })
}

pub fn running_manager(module: &str, version: &str) -> Value {
    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": format!("{}-manager", module),
            "namespace": format!("{}-system", module),
            "labels": {"app.kubernetes.io/version": version}
        }
    })
}

pub fn stored_manifest(fake: &FakeCluster) -> Value {
    fake.object(OPERATOR, "Kyma", Some(MANIFEST_NS), "default").unwrap_or(Value::Null)
}

/// Report `state` for `module` once a watch is open on the cluster.
pub fn report_state_when_watched(fake: Arc<FakeCluster>, module: &'static str, state: &'static str) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        for _ in 0..200 {
            if fake.open_watches() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let _ = fake.set_status(OPERATOR, "Kyma", Some(MANIFEST_NS), "default", json!({"modules": [{"name": module, "state": state}]}));
    })
}
