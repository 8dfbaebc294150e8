//! Wire shapes of the umbrella manifest, module templates and release metadata.

use std::collections::BTreeMap;
use std::fmt;

use modctl_core::Json;
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::Map;

pub const OPERATOR_API_VERSION: &str = "operator.kyma-project.io/v1beta2";
pub const MANIFEST_KIND: &str = "Kyma";
pub const TEMPLATE_KIND: &str = "ModuleTemplate";
pub const RELEASE_META_KIND: &str = "ModuleReleaseMeta";

pub const MANAGED_BY_LABEL: &str = "operator.kyma-project.io/managed-by";
pub const VERSION_LABEL: &str = "app.kubernetes.io/version";
pub const CORE_NAMESPACE: &str = "kyma-system";

/// Who owns the lifecycle of a module's custom resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CustomResourcePolicy {
    CreateAndDelete,
    Ignore,
}

impl CustomResourcePolicy {
    pub fn from_default_cr(want_default_cr: bool) -> Self {
        if want_default_cr { Self::CreateAndDelete } else { Self::Ignore }
    }
}

impl fmt::Display for CustomResourcePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateAndDelete => f.write_str("CreateAndDelete"),
            Self::Ignore => f.write_str("Ignore"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(flatten)]
    pub extra: Map<String, Json>,
}

/// The umbrella manifest. Unknown fields survive a read-modify-write cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub metadata: Meta,
    #[serde(default)]
    pub spec: ManifestSpec,
    #[serde(default, skip_serializing_if = "ManifestStatus::is_empty")]
    pub status: ManifestStatus,
    #[serde(flatten)]
    pub extra: Map<String, Json>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestSpec {
    #[serde(default)]
    pub channel: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modules: Vec<ModuleEntry>,
    #[serde(flatten)]
    pub extra: Map<String, Json>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleEntry {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_resource_policy: Option<CustomResourcePolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Json>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modules: Vec<ModuleStatus>,
    #[serde(flatten)]
    pub extra: Map<String, Json>,
}

impl ManifestStatus {
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty() && self.extra.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleStatus {
    pub name: String,
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub state: String,
    #[serde(flatten)]
    pub extra: Map<String, Json>,
}

/// Spec entry and reported status of one module; either may be absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModuleRecord {
    pub entry: Option<ModuleEntry>,
    pub status: Option<ModuleStatus>,
}

impl Manifest {
    pub fn from_json(v: &Json) -> Result<Self, serde_json::Error> {
        serde_json::from_value(v.clone())
    }

    pub fn to_json(&self) -> Result<Json, serde_json::Error> {
        serde_json::to_value(self)
    }

    pub fn record(&self, module: &str) -> ModuleRecord {
        ModuleRecord {
            entry: self.spec.modules.iter().find(|m| m.name == module).cloned(),
            status: self.status.modules.iter().find(|m| m.name == module).cloned(),
        }
    }

    pub fn contains(&self, module: &str) -> bool {
        self.spec.modules.iter().any(|m| m.name == module)
    }

    /// Add the entry or update channel and policy of an existing one.
    pub fn enable(&mut self, module: &str, channel: &str, policy: CustomResourcePolicy) {
        if let Some(m) = self.spec.modules.iter_mut().find(|m| m.name == module) {
            m.channel = channel.to_string();
            m.custom_resource_policy = Some(policy);
            return;
        }
        self.spec.modules.push(ModuleEntry {
            name: module.to_string(),
            channel: channel.to_string(),
            custom_resource_policy: Some(policy),
            ..Default::default()
        });
    }

    pub fn disable(&mut self, module: &str) {
        self.spec.modules.retain(|m| m.name != module);
    }

    /// Set the managed flag and policy; `false` when the entry does not exist.
    pub fn set_managed(&mut self, module: &str, managed: bool, policy: CustomResourcePolicy) -> bool {
        match self.spec.modules.iter_mut().find(|m| m.name == module) {
            Some(m) => {
                m.managed = Some(managed);
                m.custom_resource_policy = Some(policy);
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleTemplate {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub metadata: Meta,
    #[serde(default)]
    pub spec: ModuleTemplateSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleTemplateSpec {
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub module_name: String,
    #[serde(default)]
    pub mandatory: bool,
    /// Default custom resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Json>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<TemplateResource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manager: Option<Manager>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub associated_resources: Vec<Gvk>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<TemplateInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateResource {
    #[serde(default)]
    pub name: String,
    pub link: String,
}

/// Workload whose presence and version tell whether a module is running.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manager {
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gvk {
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub kind: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateInfo {
    #[serde(default)]
    pub repository: String,
    #[serde(default)]
    pub documentation: String,
}

impl ModuleTemplate {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn module_name(&self) -> &str {
        &self.spec.module_name
    }

    pub fn version(&self) -> &str {
        &self.spec.version
    }

    /// Core templates are labelled as managed by the platform and live in its namespace.
    pub fn is_community(&self) -> bool {
        let managed = self.metadata.labels.get(MANAGED_BY_LABEL).map(|v| v == "kyma").unwrap_or(false);
        !managed || self.metadata.namespace != CORE_NAMESPACE
    }

    /// Declared default custom resource; an empty object counts as none.
    pub fn default_cr(&self) -> Option<&Json> {
        self.spec.data.as_ref().filter(|d| d.as_object().map(|o| !o.is_empty()).unwrap_or(false))
    }

    pub fn same_release(&self, other: &ModuleTemplate) -> bool {
        self.name() == other.name() && self.version() == other.version() && self.module_name() == other.module_name()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseMeta {
    #[serde(default)]
    pub metadata: Meta,
    #[serde(default)]
    pub spec: ReleaseMetaSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseMetaSpec {
    #[serde(default)]
    pub module_name: String,
    #[serde(default)]
    pub channels: Vec<ChannelAssignment>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelAssignment {
    pub channel: String,
    pub version: String,
}

/// Channel that release metadata assigns to `module` at `version`.
pub fn assigned_channel(metas: &[ReleaseMeta], module: &str, version: &str) -> Option<String> {
    let meta = metas.iter().find(|m| m.spec.module_name == module)?;
    meta.spec.channels.iter().find(|c| c.version == version).map(|c| c.channel.clone())
}

/// Version a running manager reports: its version label, else the image tag
/// of a container whose name mentions `manager`.
pub fn manager_version(obj: &Json) -> Option<String> {
    let label = obj
        .get("metadata")
        .and_then(|m| m.get("labels"))
        .and_then(|l| l.get(VERSION_LABEL))
        .and_then(|v| v.as_str())
        .filter(|v| !v.is_empty());
    if let Some(v) = label {
        return Some(v.to_string());
    }
    let containers = obj.pointer("/spec/template/spec/containers")?.as_array()?;
    containers
        .iter()
        .filter(|c| c.get("name").and_then(|n| n.as_str()).map(|n| n.contains("manager")).unwrap_or(false))
        .filter_map(|c| c.get("image").and_then(|i| i.as_str()))
        .find_map(|image| image.rsplit_once(':').map(|(_, tag)| tag.to_string()))
}

/// Parse a release version, tolerating a leading `v` and a missing minor or patch part.
pub fn parse_version(s: &str) -> Option<Version> {
    let s = s.trim();
    let s = s.strip_prefix('v').unwrap_or(s);
    let split = s.find(|c| c == '-' || c == '+').unwrap_or(s.len());
    let (core, suffix) = s.split_at(split);
    let padded = match core.split('.').count() {
        1 => format!("{}.0.0{}", core, suffix),
        2 => format!("{}.0{}", core, suffix),
        _ => s.to_string(),
    };
    Version::parse(&padded).ok()
}

/// Pre-releases only win over other pre-releases; an unparsable old version always loses.
pub fn is_newer_version(new: &str, old: &str) -> bool {
    let Some(n) = parse_version(new) else { return false };
    let Some(o) = parse_version(old) else { return true };
    match (n.pre.is_empty(), o.pre.is_empty()) {
        (false, true) => false,
        (true, false) => true,
        _ => n > o,
    }
}

pub fn latest<'a>(templates: impl IntoIterator<Item = &'a ModuleTemplate>) -> Option<&'a ModuleTemplate> {
    let mut it = templates.into_iter();
    let first = it.next()?;
    Some(it.fold(first, |best, t| if is_newer_version(t.version(), best.version()) { t } else { best }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn manifest_round_trip_keeps_unknown_fields() {
        let raw = json!({
            "apiVersion": OPERATOR_API_VERSION,
            "kind": "Kyma",
            "metadata": {"name": "default", "namespace": "kyma-system", "resourceVersion": "7", "annotations": {"a": "b"}},
            "spec": {"channel": "regular", "sync": {"enabled": true}, "modules": [{"name": "istio", "controller": "x"}]},
            "status": {"state": "Ready", "modules": [{"name": "istio", "state": "Ready", "version": "1.2.0"}]}
        });
        let m = Manifest::from_json(&raw).expect("decode");
        assert_eq!(m.spec.channel, "regular");
        assert_eq!(m.record("istio").status.map(|s| s.version), Some("1.2.0".to_string()));
        let back = m.to_json().expect("encode");
        assert_eq!(back["metadata"]["resourceVersion"], "7");
        assert_eq!(back["spec"]["sync"]["enabled"], true);
        assert_eq!(back["spec"]["modules"][0]["controller"], "x");
        assert_eq!(back["status"]["state"], "Ready");
    }

    #[test]
    fn entry_edits() {
        let mut m = Manifest::default();
        m.enable("keda", "fast", CustomResourcePolicy::Ignore);
        m.enable("keda", "regular", CustomResourcePolicy::CreateAndDelete);
        assert_eq!(m.spec.modules.len(), 1);
        assert_eq!(m.spec.modules[0].channel, "regular");
        assert!(m.set_managed("keda", false, CustomResourcePolicy::Ignore));
        assert_eq!(m.spec.modules[0].managed, Some(false));
        assert!(!m.set_managed("istio", true, CustomResourcePolicy::Ignore));
        m.disable("keda");
        assert!(!m.contains("keda"));
        let v = m.to_json().expect("encode");
        assert!(v.get("status").is_none());
    }

    #[test]
    fn community_classification() {
        let mut t = ModuleTemplate::default();
        assert!(t.is_community());
        t.metadata.labels.insert(MANAGED_BY_LABEL.into(), "kyma".into());
        assert!(t.is_community());
        t.metadata.namespace = CORE_NAMESPACE.into();
        assert!(!t.is_community());
    }

    #[test]
    fn manager_version_prefers_label_then_manager_image_tag() {
        let labelled = json!({"metadata": {"labels": {VERSION_LABEL: "1.0.1"}}});
        assert_eq!(manager_version(&labelled).as_deref(), Some("1.0.1"));
        let imaged = json!({"metadata": {}, "spec": {"template": {"spec": {"containers": [
            {"name": "sidecar", "image": "proxy:9.9"},
            {"name": "keda-manager", "image": "europe-docker.pkg.dev/kyma/keda-manager:1.4.0"}
        ]}}}});
        assert_eq!(manager_version(&imaged).as_deref(), Some("1.4.0"));
        assert_eq!(manager_version(&json!({"metadata": {}})), None);
    }

    #[test]
    fn version_ordering() {
        assert!(is_newer_version("1.10.0", "1.9.3"));
        assert!(!is_newer_version("1.9.3", "1.10.0"));
        assert!(!is_newer_version("2.0.0-rc1", "1.0.0"));
        assert!(is_newer_version("1.0.0", "2.0.0-rc1"));
        assert!(is_newer_version("0.0.1", "garbage"));
        assert!(!is_newer_version("garbage", "0.0.1"));
        assert!(!is_newer_version("1.0", "1.0.0"));
        assert!(is_newer_version("v1.2", "1.1.9"));
    }

    #[test]
    fn prerelease_identifiers_compare_numerically() {
        assert!(is_newer_version("1.0.0-rc.10", "1.0.0-rc.9"));
        assert!(!is_newer_version("1.0.0-rc.9", "1.0.0-rc.10"));
        assert!(!is_newer_version("1.0.0+build.2", "1.0.0+build.1"));
        assert_eq!(parse_version("1.2.3-alpha.1+sha.5").map(|v| v.to_string()).as_deref(), Some("1.2.3-alpha.1+sha.5"));
        assert!(parse_version("1.x").is_none());
    }

    #[test]
    fn latest_prefers_releases_then_highest_prerelease() {
        let t = |v: &str| -> ModuleTemplate {
            serde_json::from_value(json!({
                "apiVersion": OPERATOR_API_VERSION,
                "kind": TEMPLATE_KIND,
                "metadata": {"name": format!("cap-{}", v), "namespace": "default"},
                "spec": {"moduleName": "cap", "version": v}
            }))
            .expect("template")
        };
        let pre = vec![t("1.0.0-rc.9"), t("1.0.0-rc.10"), t("0.9.0-beta.1")];
        assert_eq!(latest(&pre).map(|t| t.version()), Some("1.0.0-rc.10"));
        let mixed = vec![t("2.0.0-rc.1"), t("1.4.0"), t("1.10.0")];
        assert_eq!(latest(&mixed).map(|t| t.version()), Some("1.10.0"));
    }

    #[test]
    fn channel_assignment_lookup() {
        let metas = vec![ReleaseMeta {
            metadata: Meta::default(),
            spec: ReleaseMetaSpec {
                module_name: "keda".into(),
                channels: vec![
                    ChannelAssignment { channel: "regular".into(), version: "1.0.0".into() },
                    ChannelAssignment { channel: "fast".into(), version: "1.1.0".into() },
                ],
            },
        }];
        assert_eq!(assigned_channel(&metas, "keda", "1.1.0").as_deref(), Some("fast"));
        assert_eq!(assigned_channel(&metas, "keda", "0.9.0"), None);
        assert_eq!(assigned_channel(&metas, "istio", "1.0.0"), None);
    }
}
