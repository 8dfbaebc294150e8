use anyhow::anyhow;
use futures::StreamExt;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, WatchParams},
    core::{ApiResource, DynamicObject, WatchEvent},
    Client,
};
use modctl_core::{AccessError, Json, ResourceDescriptor, ResourceEvent, FIELD_MANAGER};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::{ClusterAccess, WatchSubscription};

const WATCH_BUFFER: usize = 64;

/// Cluster access through the kube dynamic API.
#[derive(Clone)]
pub struct KubeAccess {
    client: Client,
}

impl KubeAccess {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, desc: &ResourceDescriptor, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = ApiResource {
            group: desc.group.clone(),
            version: desc.version.clone(),
            api_version: desc.api_version(),
            kind: desc.kind.clone(),
            plural: desc.plural.clone(),
        };
        match namespace {
            Some(ns) if desc.namespaced => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        }
    }
}

fn map_kube_err(e: kube::Error) -> AccessError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => AccessError::NotFound(ae.message),
        other => AccessError::Api(anyhow::Error::new(other)),
    }
}

/// Serialize a live object, filling in the type fields list responses leave out.
fn to_doc(desc: &ResourceDescriptor, obj: &DynamicObject) -> Result<Json, AccessError> {
    let mut v = serde_json::to_value(obj).map_err(|e| AccessError::Api(anyhow!("encoding {} object: {}", desc.kind, e)))?;
    if let Some(map) = v.as_object_mut() {
        map.entry("apiVersion").or_insert_with(|| Json::String(desc.api_version()));
        map.entry("kind").or_insert_with(|| Json::String(desc.kind.clone()));
    }
    Ok(v)
}

#[async_trait::async_trait]
impl ClusterAccess for KubeAccess {
    async fn apply(&self, desc: &ResourceDescriptor, namespace: Option<&str>, name: &str, body: &Json) -> Result<Json, AccessError> {
        let pp = PatchParams::apply(FIELD_MANAGER);
        let obj = self.api(desc, namespace).patch(name, &pp, &Patch::Apply(body)).await.map_err(map_kube_err)?;
        to_doc(desc, &obj)
    }

    async fn get(&self, desc: &ResourceDescriptor, namespace: Option<&str>, name: &str) -> Result<Json, AccessError> {
        let obj = self.api(desc, namespace).get(name).await.map_err(map_kube_err)?;
        to_doc(desc, &obj)
    }

    async fn list(&self, desc: &ResourceDescriptor, namespace: Option<&str>, field_selector: Option<&str>) -> Result<Vec<Json>, AccessError> {
        let mut lp = ListParams::default();
        if let Some(fs) = field_selector {
            lp = lp.fields(fs);
        }
        let list = self.api(desc, namespace).list(&lp).await.map_err(map_kube_err)?;
        list.items.iter().map(|o| to_doc(desc, o)).collect()
    }

    async fn delete(&self, desc: &ResourceDescriptor, namespace: Option<&str>, name: &str) -> Result<(), AccessError> {
        self.api(desc, namespace).delete(name, &DeleteParams::default()).await.map_err(map_kube_err)?;
        Ok(())
    }

    async fn replace(&self, desc: &ResourceDescriptor, namespace: Option<&str>, name: &str, body: &Json) -> Result<Json, AccessError> {
        let data: DynamicObject = serde_json::from_value(body.clone()).map_err(|e| AccessError::Api(anyhow!("decoding {} body: {}", desc.kind, e)))?;
        let obj = self.api(desc, namespace).replace(name, &PostParams::default(), &data).await.map_err(map_kube_err)?;
        to_doc(desc, &obj)
    }

    async fn watch(&self, desc: &ResourceDescriptor, namespace: Option<&str>, name: &str) -> Result<WatchSubscription, AccessError> {
        let api = self.api(desc, namespace);
        let wp = WatchParams::default().fields(&format!("metadata.name={}", name));
        let desc = desc.clone();
        let (tx, rx) = mpsc::channel::<ResourceEvent>(WATCH_BUFFER);
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), kube::Error>>();
        // The stream lives inside the task; the open result comes back over `ready`.
        let task = tokio::spawn(async move {
            let stream = match api.watch(&wp, "0").await {
                Ok(s) => {
                    let _ = ready_tx.send(Ok(()));
                    s
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            futures::pin_mut!(stream);
            while let Some(item) = stream.next().await {
                let ev = match item {
                    Ok(WatchEvent::Added(o)) => to_doc(&desc, &o).map(ResourceEvent::Added),
                    Ok(WatchEvent::Modified(o)) => to_doc(&desc, &o).map(ResourceEvent::Modified),
                    Ok(WatchEvent::Deleted(o)) => to_doc(&desc, &o).map(ResourceEvent::Deleted),
                    Ok(WatchEvent::Bookmark(_)) => continue,
                    Ok(WatchEvent::Error(e)) => Ok(ResourceEvent::Error(e.message)),
                    Err(e) => Ok(ResourceEvent::Error(e.to_string())),
                };
                let ev = ev.unwrap_or_else(|e| ResourceEvent::Error(e.to_string()));
                if tx.send(ev).await.is_err() {
                    break;
                }
            }
            debug!(kind = %desc.kind, "watch stream ended");
        });
        match ready_rx.await {
            Ok(Ok(())) => Ok(WatchSubscription::new(rx, Some(task))),
            Ok(Err(e)) => Err(map_kube_err(e)),
            Err(_) => Err(AccessError::Api(anyhow!("watch task ended before the stream opened"))),
        }
    }
}
