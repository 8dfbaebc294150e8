//! modctl catalog: umbrella manifest access, module templates, release metadata and module sources.

#![forbid(unsafe_code)]

mod catalog;
mod fetch;
mod manifest;
mod source;
pub mod types;

pub use catalog::Catalog;
pub use fetch::{FetchError, Fetcher, HttpFetcher, StaticFetcher};
pub use manifest::{check_module_state, module_template_for, ManifestClient, ModuleMetadata, StateWaitError};
pub use source::{ClusterSource, ModuleSource, RemoteSource};
pub use types::{
    assigned_channel, is_newer_version, latest, manager_version, CustomResourcePolicy, Manifest, ModuleEntry, ModuleRecord,
    ModuleStatus, ModuleTemplate, ReleaseMeta,
};
