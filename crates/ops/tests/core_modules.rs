#![forbid(unsafe_code)]

mod common;

use std::time::Duration;

use common::*;
use modctl_apply::WaitScope;
use modctl_catalog::{CustomResourcePolicy, StaticFetcher};
use modctl_ops::ModuleError;
use serde_json::json;

const KEDA_MANIFEST_URL: &str = "https://example.test/keda/1.1.0/manifest.yaml";
const KEDA_MANIFEST: &str = "\
apiVersion: apps/v1
kind: Deployment
metadata:
  name: keda-manager
  namespace: keda-system
";

fn scope() -> WaitScope {
    WaitScope::new(Duration::from_secs(30))
}

fn seed_keda_catalog(h: &Harness) {
    let data = json!({"data": keda_cr("default", "kyma-system")});
    h.fake.seed(core_template("keda", "1.0.0", data)).expect("seed");
    h.fake.seed(release_meta("keda", &[("regular", "1.0.0")])).expect("seed");
}

#[tokio::test]
async fn enable_of_unknown_channel_changes_nothing() {
    let h = harness(StaticFetcher::new(), Duration::from_secs(5));
    h.fake.seed(manifest(json!([]), json!([]))).expect("seed");
    seed_keda_catalog(&h);
    let before = stored_manifest(&h.fake);

    let e = h.orch.enable("keda", "fast", false, &[], &scope()).await.unwrap_err();
    assert!(matches!(e, ModuleError::Unavailable { .. }), "e={:?}", e);
    assert!(e.to_string().starts_with("module keda is not available"), "e={}", e);
    assert!(h.fake.mutations().is_empty());
    assert_eq!(stored_manifest(&h.fake), before);
}

#[tokio::test]
async fn enable_adds_entry_with_policy_from_default_cr_flag() {
    let h = harness(StaticFetcher::new(), Duration::from_secs(5));
    h.fake.seed(manifest(json!([]), json!([]))).expect("seed");
    seed_keda_catalog(&h);

    h.orch.enable("keda", "regular", false, &[], &scope()).await.expect("enable");
    let m = stored_manifest(&h.fake);
    assert_eq!(m["spec"]["modules"][0]["name"], "keda");
    assert_eq!(m["spec"]["modules"][0]["channel"], "regular");
    assert_eq!(m["spec"]["modules"][0]["customResourcePolicy"], "Ignore");
    assert_eq!(h.out.lines(), vec!["adding keda module to the manifest", "keda module enabled"]);
}

#[tokio::test]
async fn enable_without_channel_validates_against_manifest_channel() {
    let h = harness(StaticFetcher::new(), Duration::from_secs(5));
    h.fake.seed(manifest(json!([]), json!([]))).expect("seed");
    seed_keda_catalog(&h);

    h.orch.enable("keda", "", true, &[], &scope()).await.expect("enable");
    let m = stored_manifest(&h.fake);
    assert!(m["spec"]["modules"][0].get("channel").is_none());
    assert_eq!(m["spec"]["modules"][0]["customResourcePolicy"], "CreateAndDelete");
}

#[tokio::test]
async fn enable_applies_custom_resources_once_ready() {
    let h = harness(StaticFetcher::new(), Duration::from_secs(5));
    h.fake.seed(manifest(json!([]), json!([{"name": "keda", "state": "Processing"}]))).expect("seed");
    seed_keda_catalog(&h);
    let reporter = report_state_when_watched(h.fake.clone(), "keda", "Ready");

    let crs = vec![keda_cr("custom", "team-a")];
    h.orch.enable("keda", "regular", false, &crs, &scope()).await.expect("enable");
    reporter.await.expect("reporter");

    assert!(h.fake.object(KEDA_API, "Keda", Some("team-a"), "custom").is_some());
    assert_eq!(
        h.out.lines(),
        vec!["adding keda module to the manifest", "waiting for module to be ready", "applying team-a/custom cr", "keda module enabled"]
    );
    assert_eq!(h.fake.open_watches(), 0);
}

#[tokio::test]
async fn enable_timeout_keeps_the_manifest_edit() {
    let h = harness(StaticFetcher::new(), Duration::from_millis(50));
    h.fake.seed(manifest(json!([]), json!([{"name": "keda", "state": "Processing"}]))).expect("seed");
    seed_keda_catalog(&h);

    let e = h.orch.enable("keda", "regular", false, &[keda_cr("custom", "team-a")], &scope()).await.unwrap_err();
    assert!(e.is_timeout(), "e={:?}", e);
    assert!(e.to_string().contains("module keda is in the Processing state"), "e={}", e);
    assert_eq!(stored_manifest(&h.fake)["spec"]["modules"][0]["name"], "keda");
    assert!(h.fake.object(KEDA_API, "Keda", Some("team-a"), "custom").is_none());
}

#[tokio::test]
async fn cancelling_the_scope_ends_the_wait() {
    let h = harness(StaticFetcher::new(), Duration::from_secs(60));
    h.fake.seed(manifest(json!([]), json!([{"name": "keda", "state": "Processing"}]))).expect("seed");
    seed_keda_catalog(&h);
    let top = scope();
    top.cancel();

    let e = h.orch.enable("keda", "regular", false, &[keda_cr("custom", "team-a")], &top).await.unwrap_err();
    match e {
        ModuleError::ContextTimeout { reason, .. } => assert_eq!(reason.to_string(), "context canceled"),
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn disable_with_create_and_delete_only_edits_the_manifest() {
    let h = harness(StaticFetcher::new(), Duration::from_secs(5));
    h.fake
        .seed(manifest(
            json!([{"name": "keda", "channel": "regular", "customResourcePolicy": "CreateAndDelete"}]),
            json!([{"name": "keda", "channel": "regular", "version": "1.0.0", "state": "Ready"}]),
        ))
        .expect("seed");
    seed_keda_catalog(&h);
    h.fake.seed(keda_cr("default", "kyma-system")).expect("seed");
    h.fake.clear_calls();

    h.orch.disable("keda", false, &scope()).await.expect("disable");
    assert_eq!(h.fake.mutations(), vec!["replace Kyma kyma-system/default"]);
    assert!(!h.fake.calls().iter().any(|c| c.contains("Keda")));
    assert!(h.fake.object(KEDA_API, "Keda", Some("kyma-system"), "default").is_some());
}

fn seed_ignored_keda(h: &Harness) {
    h.fake
        .seed(manifest(
            json!([{"name": "keda", "channel": "regular", "customResourcePolicy": "Ignore"}]),
            json!([{"name": "keda", "channel": "regular", "version": "1.0.0", "state": "Ready"}]),
        ))
        .expect("seed");
    seed_keda_catalog(&h);
    h.fake.seed(keda_cr("x", "team-a")).expect("seed");
    h.fake.seed(keda_cr("y", "team-b")).expect("seed");
    h.fake.clear_calls();
}

#[tokio::test]
async fn disable_with_ignore_deletes_every_cr_before_the_entry() {
    let h = harness(StaticFetcher::new(), Duration::from_secs(5));
    seed_ignored_keda(&h);

    h.orch.disable("keda", false, &scope()).await.expect("disable");
    assert_eq!(h.fake.mutations(), vec!["delete Keda team-a/x", "delete Keda team-b/y", "replace Kyma kyma-system/default"]);
    let watches: Vec<String> = h.fake.calls().into_iter().filter(|c| c.starts_with("watch Keda")).collect();
    assert_eq!(watches, vec!["watch Keda team-a/x", "watch Keda team-b/y"]);
    assert_eq!(h.fake.open_watches(), 0);
    assert!(stored_manifest(&h.fake)["spec"].get("modules").is_none());
    assert_eq!(
        h.out.lines(),
        vec![
            "removing team-a/x CR",
            "removing team-b/y CR",
            "waiting for team-a/x CR to be removed",
            "waiting for team-b/y CR to be removed",
            "removing keda module from the manifest",
            "keda module disabled",
        ]
    );
}

#[tokio::test]
async fn stuck_deletion_times_out_and_keeps_the_entry() {
    let h = harness(StaticFetcher::new(), Duration::from_millis(50));
    seed_ignored_keda(&h);
    h.fake.hold_deletion_of("y");

    let e = h.orch.disable("keda", false, &scope()).await.unwrap_err();
    assert!(e.is_timeout(), "e={:?}", e);
    assert!(!h.fake.mutations().iter().any(|m| m.starts_with("replace Kyma")));
    assert_eq!(stored_manifest(&h.fake)["spec"]["modules"][0]["name"], "keda");
    assert_eq!(h.fake.open_watches(), 0);
}

#[tokio::test]
async fn watch_failure_aborts_before_any_deletion() {
    let h = harness(StaticFetcher::new(), Duration::from_secs(5));
    seed_ignored_keda(&h);
    h.fake.fail_watch_of("y");

    let e = h.orch.disable("keda", false, &scope()).await.unwrap_err();
    assert_eq!(e.to_string(), "failed to watch resource team-b/y");
    assert!(h.fake.mutations().is_empty());
    assert_eq!(h.fake.open_watches(), 0);
}

#[tokio::test]
async fn manage_marks_the_entry_and_waits_for_ready() {
    let h = harness(StaticFetcher::new(), Duration::from_secs(5));
    h.fake
        .seed(manifest(
            json!([{"name": "keda", "channel": "regular", "managed": false}]),
            json!([{"name": "keda", "state": "Unmanaged"}]),
        ))
        .expect("seed");
    let reporter = report_state_when_watched(h.fake.clone(), "keda", "Warning");

    h.orch.manage("keda", CustomResourcePolicy::CreateAndDelete, &scope()).await.expect("manage");
    reporter.await.expect("reporter");
    let entry = &stored_manifest(&h.fake)["spec"]["modules"][0];
    assert_eq!(entry["managed"], true);
    assert_eq!(entry["customResourcePolicy"], "CreateAndDelete");
}

#[tokio::test]
async fn unmanage_waits_for_the_unmanaged_state() {
    let h = harness(StaticFetcher::new(), Duration::from_secs(5));
    h.fake
        .seed(manifest(json!([{"name": "keda", "channel": "regular"}]), json!([{"name": "keda", "state": "Ready"}])))
        .expect("seed");
    let reporter = report_state_when_watched(h.fake.clone(), "keda", "Unmanaged");

    h.orch.unmanage("keda", &scope()).await.expect("unmanage");
    reporter.await.expect("reporter");
    assert_eq!(stored_manifest(&h.fake)["spec"]["modules"][0]["managed"], false);
}

fn seed_installed_keda(h: &Harness, assignments: &[(&str, &str)]) {
    h.fake.seed(manifest(json!([]), json!([]))).expect("seed");
    let spec = json!({
        "manager": {"group": "apps", "version": "v1", "kind": "Deployment", "name": "keda-manager", "namespace": "keda-system"},
        "resources": [{"name": "rawManifest", "link": KEDA_MANIFEST_URL}]
    });
    h.fake.seed(core_template("keda", "1.1.0", spec)).expect("seed");
    h.fake.seed(release_meta("keda", assignments)).expect("seed");
    h.fake.seed(running_manager("keda", "1.1.0")).expect("seed");
}

#[tokio::test]
async fn manage_of_a_missing_module_rejects_a_version_outside_the_channel() {
    let h = harness(StaticFetcher::new().with(KEDA_MANIFEST_URL, KEDA_MANIFEST), Duration::from_secs(5));
    seed_installed_keda(&h, &[("fast", "1.1.0")]);

    let e = h.orch.manage("keda", CustomResourcePolicy::Ignore, &scope()).await.unwrap_err();
    match &e {
        ModuleError::InstalledVersionNotInChannel { version, channel, .. } => {
            assert_eq!(version, "1.1.0");
            assert_eq!(channel, "regular");
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(e.to_string(), "version of the installed module doesn't exist in the configured release channel");
    assert!(h.fake.mutations().is_empty());
}

#[tokio::test]
async fn manage_of_a_missing_module_enables_it_in_the_assigned_channel() {
    let h = harness(StaticFetcher::new().with(KEDA_MANIFEST_URL, KEDA_MANIFEST), Duration::from_secs(5));
    seed_installed_keda(&h, &[("regular", "1.1.0")]);

    h.orch.manage("keda", CustomResourcePolicy::CreateAndDelete, &scope()).await.expect("manage");
    let entry = &stored_manifest(&h.fake)["spec"]["modules"][0];
    assert_eq!(entry["name"], "keda");
    assert_eq!(entry["channel"], "regular");
    assert_eq!(entry["customResourcePolicy"], "CreateAndDelete");
}

#[tokio::test]
async fn available_channels_map_channel_to_version() {
    let h = harness(StaticFetcher::new(), Duration::from_secs(5));
    h.fake.seed(core_template("keda", "1.0.0", json!({}))).expect("seed");
    h.fake.seed(core_template("keda", "1.1.0", json!({}))).expect("seed");
    h.fake.seed(release_meta("keda", &[("regular", "1.0.0"), ("fast", "1.1.0")])).expect("seed");

    let channels = h.orch.available_channels("keda").await.expect("channels");
    assert_eq!(channels.into_iter().collect::<Vec<_>>(), vec![("fast".to_string(), "1.1.0".to_string()), ("regular".to_string(), "1.0.0".to_string())]);
}

#[tokio::test]
async fn cancelled_disable_deletes_no_custom_resources() {
    let h = harness(StaticFetcher::new(), Duration::from_secs(5));
    seed_ignored_keda(&h);
    let top = scope();
    top.cancel();

    let e = h.orch.disable("keda", false, &top).await.unwrap_err();
    assert!(e.is_cancelled(), "e={:?}", e);
    assert_eq!(e.to_string(), "context timeout waiting for removal of keda CRs: context canceled");
    assert!(h.fake.mutations().is_empty());
    assert_eq!(h.fake.open_watches(), 0);
    assert_eq!(stored_manifest(&h.fake)["spec"]["modules"][0]["name"], "keda");
}
