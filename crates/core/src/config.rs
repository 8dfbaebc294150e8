//! Runtime configuration read from `MODCTL_*` environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_WAIT_TIMEOUT_SECS: u64 = 100;
pub const DEFAULT_MANIFEST_NAME: &str = "default";
pub const DEFAULT_MANIFEST_NAMESPACE: &str = "kyma-system";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Bound for every wait-for-ready / wait-for-deletion phase.
    pub wait_timeout_secs: u64,
    /// Namespace used for namespaced resources whose document omits one.
    pub default_namespace: String,
    pub manifest_name: String,
    pub manifest_namespace: String,
    pub community_catalog_url: Option<String>,
    pub discovery_cache: bool,
    pub fetch_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            wait_timeout_secs: DEFAULT_WAIT_TIMEOUT_SECS,
            default_namespace: "default".to_string(),
            manifest_name: DEFAULT_MANIFEST_NAME.to_string(),
            manifest_namespace: DEFAULT_MANIFEST_NAMESPACE.to_string(),
            community_catalog_url: None,
            discovery_cache: false,
            fetch_timeout_secs: 30,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build from an arbitrary key lookup; unparsable values fall back to defaults.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let non_empty = |k: &str| get(k).filter(|s| !s.trim().is_empty());
        Self {
            wait_timeout_secs: non_empty("MODCTL_WAIT_TIMEOUT_SECS").and_then(|s| s.parse().ok()).unwrap_or(d.wait_timeout_secs),
            default_namespace: non_empty("MODCTL_DEFAULT_NAMESPACE").unwrap_or(d.default_namespace),
            manifest_name: non_empty("MODCTL_MANIFEST_NAME").unwrap_or(d.manifest_name),
            manifest_namespace: non_empty("MODCTL_MANIFEST_NAMESPACE").unwrap_or(d.manifest_namespace),
            community_catalog_url: non_empty("MODCTL_COMMUNITY_CATALOG_URL"),
            discovery_cache: non_empty("MODCTL_DISCOVERY_CACHE")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(d.discovery_cache),
            fetch_timeout_secs: non_empty("MODCTL_FETCH_TIMEOUT_SECS").and_then(|s| s.parse().ok()).unwrap_or(d.fetch_timeout_secs),
        }
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_apply_when_unset() {
        let c = Config::from_lookup(|_| None);
        assert_eq!(c, Config::default());
        assert_eq!(c.wait_timeout(), Duration::from_secs(100));
    }

    #[test]
    fn env_overrides_and_bad_numbers_fall_back() {
        let env: HashMap<&str, &str> = [
            ("MODCTL_WAIT_TIMEOUT_SECS", "nope"),
            ("MODCTL_DEFAULT_NAMESPACE", "team-a"),
            ("MODCTL_DISCOVERY_CACHE", "TRUE"),
            ("MODCTL_COMMUNITY_CATALOG_URL", " "),
        ]
        .into_iter()
        .collect();
        let c = Config::from_lookup(|k| env.get(k).map(|s| s.to_string()));
        assert_eq!(c.wait_timeout_secs, 100);
        assert_eq!(c.default_namespace, "team-a");
        assert!(c.discovery_cache);
        assert_eq!(c.community_catalog_url, None);
    }
}
