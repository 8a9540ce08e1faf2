//! Kubernetes-backed AgentInfo store
//!
//! AgentInfo is a cluster-scoped custom resource. Objects are exchanged as
//! `DynamicObject`s so no generated client is needed; the typed model is
//! converted at the boundary.

use super::store::{AgentInfoIndex, AgentInfoStore, StoreError};
use crate::models::{AgentInfo, AGENTINFO_GROUP, AGENTINFO_KIND, AGENTINFO_VERSION};
use async_trait::async_trait;
use futures::StreamExt;
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind, PostParams, TypeMeta};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::Client;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// API resource description of AgentInfo
pub fn agentinfo_api_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(
        AGENTINFO_GROUP,
        AGENTINFO_VERSION,
        AGENTINFO_KIND,
    ))
}

/// Convert a typed AgentInfo into the object sent to the API server
pub fn to_dynamic(info: &AgentInfo, resource: &ApiResource) -> Result<DynamicObject, StoreError> {
    let mut data = serde_json::to_value(info)
        .map_err(|e| StoreError::Backend(format!("encode agentinfo: {}", e)))?;
    if let Some(object) = data.as_object_mut() {
        object.remove("metadata");
    }

    Ok(DynamicObject {
        types: Some(TypeMeta {
            api_version: resource.api_version.clone(),
            kind: resource.kind.clone(),
        }),
        metadata: info.metadata.clone(),
        data,
    })
}

/// Convert an object returned by the API server into a typed AgentInfo
pub fn from_dynamic(object: DynamicObject) -> Result<AgentInfo, StoreError> {
    let mut info: AgentInfo = serde_json::from_value(object.data)
        .map_err(|e| StoreError::Backend(format!("decode agentinfo: {}", e)))?;
    info.metadata = object.metadata;
    Ok(info)
}

/// Map API errors onto the store error taxonomy. A 409 means "already
/// exists" on create and "conflict" on update.
fn map_error(name: &str, error: kube::Error, creating: bool) -> StoreError {
    match error {
        kube::Error::Api(response) if response.code == 404 => {
            StoreError::NotFound(name.to_string())
        }
        kube::Error::Api(response) if response.code == 409 => {
            if creating {
                StoreError::AlreadyExists(name.to_string())
            } else {
                StoreError::Conflict {
                    name: name.to_string(),
                    message: response.message,
                }
            }
        }
        other => StoreError::Backend(other.to_string()),
    }
}

/// AgentInfo store talking to the Kubernetes API server
pub struct KubeAgentInfoStore {
    api: Api<DynamicObject>,
    resource: ApiResource,
}

impl KubeAgentInfoStore {
    pub fn new(client: Client) -> Self {
        let resource = agentinfo_api_resource();
        Self {
            api: Api::all_with(client, &resource),
            resource,
        }
    }
}

#[async_trait]
impl AgentInfoStore for KubeAgentInfoStore {
    async fn get(&self, name: &str) -> Result<AgentInfo, StoreError> {
        match self.api.get_opt(name).await {
            Ok(Some(object)) => from_dynamic(object),
            Ok(None) => Err(StoreError::NotFound(name.to_string())),
            Err(e) => Err(map_error(name, e, false)),
        }
    }

    async fn create(&self, info: &AgentInfo) -> Result<AgentInfo, StoreError> {
        let object = to_dynamic(info, &self.resource)?;
        let created = self
            .api
            .create(&PostParams::default(), &object)
            .await
            .map_err(|e| map_error(info.name(), e, true))?;
        from_dynamic(created)
    }

    async fn update(&self, info: &AgentInfo) -> Result<AgentInfo, StoreError> {
        let object = to_dynamic(info, &self.resource)?;
        let updated = self
            .api
            .replace(info.name(), &PostParams::default(), &object)
            .await
            .map_err(|e| map_error(info.name(), e, false))?;
        from_dynamic(updated)
    }
}

/// Watch-backed read-through index of AgentInfo objects
#[derive(Clone)]
pub struct KubeAgentInfoIndex {
    reader: Store<DynamicObject>,
    resource: ApiResource,
    synced: Arc<AtomicBool>,
}

impl KubeAgentInfoIndex {
    /// Start watching AgentInfo objects. The watch runs until shutdown.
    pub fn spawn(client: Client, mut shutdown: broadcast::Receiver<()>) -> Self {
        let resource = agentinfo_api_resource();
        let api: Api<DynamicObject> = Api::all_with(client, &resource);

        let writer = reflector::store::Writer::new(resource.clone());
        let reader = writer.as_reader();
        let synced = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&synced);
        let events = reflector(writer, watcher(api, watcher::Config::default()))
            .default_backoff()
            .for_each(move |event| {
                match event {
                    Ok(watcher::Event::Restarted(objects)) => {
                        if !flag.swap(true, Ordering::AcqRel) {
                            info!(objects = objects.len(), "AgentInfo index synced");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => debug!(error = %e, "AgentInfo watch error"),
                }
                futures::future::ready(())
            });

        tokio::spawn(async move {
            tokio::select! {
                _ = events => {}
                _ = shutdown.recv() => {
                    debug!("Stopping AgentInfo index");
                }
            }
        });

        Self {
            reader,
            resource,
            synced,
        }
    }
}

impl AgentInfoIndex for KubeAgentInfoIndex {
    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    fn get_by_key(&self, name: &str) -> Option<AgentInfo> {
        let key = ObjectRef::new_with(name, self.resource.clone());
        let object = self.reader.get(&key)?;
        match from_dynamic(object.as_ref().clone()) {
            Ok(info) => Some(info),
            Err(e) => {
                debug!(name = %name, error = %e, "Ignoring undecodable AgentInfo in index");
                None
            }
        }
    }
}
