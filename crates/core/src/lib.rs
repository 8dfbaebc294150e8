//! modctl core types: object references, resolved descriptors, watch events and errors.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod config;
pub mod printer;

pub use config::Config;
pub use printer::Printer;

pub type Json = serde_json::Value;

/// Identity attached to every server-side apply issued by this tool.
pub const FIELD_MANAGER: &str = "modctl";

pub mod prelude {
    pub use super::{
        AccessError, ClientError, GroupVersion, Json, ListOptions, ObjectRef, ResourceDescriptor, ResourceEvent,
    };
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupVersion {
    pub group: String,
    pub version: String,
}

impl GroupVersion {
    /// Split an `apiVersion`; a single segment is the core (unnamed) group.
    pub fn parse(api_version: &str) -> Self {
        match api_version.split_once('/') {
            Some((g, v)) => Self { group: g.to_string(), version: v.to_string() },
            None => Self { group: String::new(), version: api_version.to_string() },
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }
}

/// Concrete addressable form of a kind, computed from a discovery snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub group: String,
    pub version: String,
    pub kind: String,
    /// Plural resource name used in request paths.
    pub plural: String,
    pub namespaced: bool,
}

impl ResourceDescriptor {
    pub fn api_version(&self) -> String {
        GroupVersion { group: self.group.clone(), version: self.version.clone() }.api_version()
    }

    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

/// Reference to one resource (or, with an empty name, to a kind for listing).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
}

impl ObjectRef {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { api_version: api_version.into(), kind: kind.into(), name: String::new(), namespace: None }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn within(mut self, namespace: impl Into<String>) -> Self {
        let ns = namespace.into();
        self.namespace = if ns.is_empty() { None } else { Some(ns) };
        self
    }

    /// Read `apiVersion`, `kind`, `metadata.name` and `metadata.namespace` from a document.
    pub fn from_json(v: &Json) -> Result<Self, ClientError> {
        let api_version = v
            .get("apiVersion")
            .and_then(|s| s.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ClientError::Invalid("resource missing apiVersion".into()))?;
        let kind = v
            .get("kind")
            .and_then(|s| s.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ClientError::Invalid("resource missing kind".into()))?;
        Ok(Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            name: name_of(v).unwrap_or_default().to_string(),
            namespace: namespace_of(v).map(|s| s.to_string()),
        })
    }

    pub fn group_version(&self) -> GroupVersion {
        GroupVersion::parse(&self.api_version)
    }

    /// Minimal document carrying only the identity fields.
    pub fn to_json(&self) -> Json {
        let mut meta = serde_json::Map::new();
        if !self.name.is_empty() {
            meta.insert("name".into(), Json::String(self.name.clone()));
        }
        if let Some(ns) = &self.namespace {
            meta.insert("namespace".into(), Json::String(ns.clone()));
        }
        serde_json::json!({ "apiVersion": self.api_version, "kind": self.kind, "metadata": meta })
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{} ({})", ns, self.name, self.kind),
            None => write!(f, "{} ({})", self.name, self.kind),
        }
    }
}

pub fn name_of(v: &Json) -> Option<&str> {
    v.get("metadata").and_then(|m| m.get("name")).and_then(|s| s.as_str())
}

pub fn namespace_of(v: &Json) -> Option<&str> {
    v.get("metadata").and_then(|m| m.get("namespace")).and_then(|s| s.as_str()).filter(|s| !s.is_empty())
}

pub fn kind_of(v: &Json) -> Option<&str> {
    v.get("kind").and_then(|s| s.as_str())
}

/// Options for listing a kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListOptions {
    /// Ignore the template namespace and list across the whole cluster.
    pub all_namespaces: bool,
    /// Single-field match layered on top of namespace scoping, e.g. `metadata.name=foo`.
    pub field_selector: Option<String>,
}

/// One notification from a watch stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceEvent {
    Added(Json),
    Modified(Json),
    Deleted(Json),
    /// Server-side error delivered inside the stream.
    Error(String),
}

impl ResourceEvent {
    pub fn object(&self) -> Option<&Json> {
        match self {
            ResourceEvent::Added(o) | ResourceEvent::Modified(o) | ResourceEvent::Deleted(o) => Some(o),
            ResourceEvent::Error(_) => None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, ResourceEvent::Deleted(_))
    }
}

/// Errors returned by the cluster-access capability.
#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Api(#[from] anyhow::Error),
}

/// Errors surfaced by the generic resource client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("resource '{kind}' in group '{group}' and version '{version}' not registered on cluster")]
    Resolution { group: String, version: String, kind: String },
    #[error("failed to discover API resources for {api_version}")]
    Discovery {
        api_version: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid resource: {0}")]
    Invalid(String),
    #[error("failed to {action}")]
    Api {
        action: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to watch {target}")]
    Watch {
        target: String,
        #[source]
        source: anyhow::Error,
    },
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound(_))
    }

    pub fn is_resolution(&self) -> bool {
        matches!(self, ClientError::Resolution { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_version_parses_core_and_named_groups() {
        assert_eq!(GroupVersion::parse("v1"), GroupVersion { group: String::new(), version: "v1".into() });
        let gv = GroupVersion::parse("apps/v1");
        assert_eq!(gv.group, "apps");
        assert_eq!(gv.version, "v1");
        assert_eq!(gv.api_version(), "apps/v1");
    }

    #[test]
    fn object_ref_reads_identity_fields() {
        let v = serde_json::json!({
            "apiVersion": "operator.kyma-project.io/v1beta2",
            "kind": "Kyma",
            "metadata": { "name": "default", "namespace": "kyma-system" },
            "spec": { "channel": "regular" }
        });
        let r = ObjectRef::from_json(&v).expect("ok");
        assert_eq!(r.kind, "Kyma");
        assert_eq!(r.name, "default");
        assert_eq!(r.namespace.as_deref(), Some("kyma-system"));
        assert_eq!(r.group_version().group, "operator.kyma-project.io");
        assert_eq!(r.to_string(), "kyma-system/default (Kyma)");
    }

    #[test]
    fn object_ref_requires_api_version_and_kind() {
        let e1 = ObjectRef::from_json(&serde_json::json!({ "kind": "Secret" })).unwrap_err();
        assert!(e1.to_string().contains("missing apiVersion"), "e1={}", e1);
        let e2 = ObjectRef::from_json(&serde_json::json!({ "apiVersion": "v1" })).unwrap_err();
        assert!(e2.to_string().contains("missing kind"), "e2={}", e2);
    }

    #[test]
    fn resolution_error_names_kind_group_and_version() {
        let e = ClientError::Resolution { group: "keda.sh".into(), version: "v1alpha1".into(), kind: "Keda".into() };
        assert_eq!(e.to_string(), "resource 'Keda' in group 'keda.sh' and version 'v1alpha1' not registered on cluster");
        assert!(e.is_resolution());
    }

    #[test]
    fn skeleton_document_omits_empty_namespace() {
        let r = ObjectRef::new("v1", "Namespace").named("team-a").within("");
        let v = r.to_json();
        assert_eq!(v["metadata"]["name"], "team-a");
        assert!(v["metadata"].get("namespace").is_none());
    }
}
