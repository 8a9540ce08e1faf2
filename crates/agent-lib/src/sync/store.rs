//! Remote AgentInfo object store contract
//!
//! The store follows optimistic concurrency: an update must carry the
//! resource version of the object it replaces, otherwise it fails with a
//! conflict. An optional read-through index serves reads once it has
//! completed its initial listing.

use crate::models::AgentInfo;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use thiserror::Error;

/// Errors returned by an AgentInfo store
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("agentinfo {0} not found")]
    NotFound(String),

    #[error("agentinfo {0} already exists")]
    AlreadyExists(String),

    #[error("conflict on agentinfo {name}: {message}")]
    Conflict { name: String, message: String },

    #[error("agentinfo store error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists(_))
    }
}

/// Create/read/update access to AgentInfo objects
#[async_trait]
pub trait AgentInfoStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<AgentInfo, StoreError>;

    async fn create(&self, info: &AgentInfo) -> Result<AgentInfo, StoreError>;

    async fn update(&self, info: &AgentInfo) -> Result<AgentInfo, StoreError>;
}

/// Local read-through index of AgentInfo objects
pub trait AgentInfoIndex: Send + Sync {
    /// Whether the initial listing has completed
    fn has_synced(&self) -> bool;

    fn get_by_key(&self, name: &str) -> Option<AgentInfo>;
}

/// Store operation, used to target injected failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Get,
    Create,
    Update,
}

/// In-process AgentInfo store with resource-version concurrency control.
///
/// Also serves as its own read-through index. Failures can be injected per
/// operation to exercise retry paths.
#[derive(Default)]
pub struct MemoryAgentInfoStore {
    objects: RwLock<HashMap<String, AgentInfo>>,
    next_version: AtomicU64,
    synced: AtomicBool,
    injected: Mutex<VecDeque<(StoreOp, StoreError)>>,
    gets: AtomicU64,
    creates: AtomicU64,
    updates: AtomicU64,
}

impl MemoryAgentInfoStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the index as having completed its initial listing
    pub fn set_synced(&self, synced: bool) {
        self.synced.store(synced, Ordering::Release);
    }

    /// Fail the next call of `op` with `error`
    pub fn inject_failure(&self, op: StoreOp, error: StoreError) {
        self.injected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back((op, error));
    }

    /// Overwrite an object as another writer would, bumping its version
    pub fn put(&self, mut info: AgentInfo) -> AgentInfo {
        info.metadata.resource_version = Some(self.bump_version());
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(info.name().to_string(), info.clone());
        info
    }

    /// Current stored copy of an object
    pub fn object(&self, name: &str) -> Option<AgentInfo> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn get_count(&self) -> u64 {
        self.gets.load(Ordering::Acquire)
    }

    pub fn create_count(&self) -> u64 {
        self.creates.load(Ordering::Acquire)
    }

    pub fn update_count(&self) -> u64 {
        self.updates.load(Ordering::Acquire)
    }

    fn bump_version(&self) -> String {
        (self.next_version.fetch_add(1, Ordering::AcqRel) + 1).to_string()
    }

    fn take_failure(&self, op: StoreOp) -> Option<StoreError> {
        let mut injected = self.injected.lock().unwrap_or_else(PoisonError::into_inner);
        let position = injected.iter().position(|(o, _)| *o == op)?;
        injected.remove(position).map(|(_, error)| error)
    }
}

#[async_trait]
impl AgentInfoStore for MemoryAgentInfoStore {
    async fn get(&self, name: &str) -> Result<AgentInfo, StoreError> {
        self.gets.fetch_add(1, Ordering::AcqRel);
        if let Some(error) = self.take_failure(StoreOp::Get) {
            return Err(error);
        }

        self.object(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    async fn create(&self, info: &AgentInfo) -> Result<AgentInfo, StoreError> {
        self.creates.fetch_add(1, Ordering::AcqRel);
        if let Some(error) = self.take_failure(StoreOp::Create) {
            return Err(error);
        }

        let name = info.name().to_string();
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        if objects.contains_key(&name) {
            return Err(StoreError::AlreadyExists(name));
        }

        let mut created = info.clone();
        created.metadata.resource_version = Some(self.bump_version());
        objects.insert(name, created.clone());
        Ok(created)
    }

    async fn update(&self, info: &AgentInfo) -> Result<AgentInfo, StoreError> {
        self.updates.fetch_add(1, Ordering::AcqRel);
        if let Some(error) = self.take_failure(StoreOp::Update) {
            return Err(error);
        }

        let name = info.name().to_string();
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        let current = objects
            .get(&name)
            .ok_or_else(|| StoreError::NotFound(name.clone()))?;

        if current.metadata.resource_version != info.metadata.resource_version {
            return Err(StoreError::Conflict {
                name,
                message: format!(
                    "resource version {:?} is stale, current is {:?}",
                    info.metadata.resource_version, current.metadata.resource_version
                ),
            });
        }

        let mut updated = info.clone();
        updated.metadata.resource_version = Some(self.bump_version());
        objects.insert(name, updated.clone());
        Ok(updated)
    }
}

impl AgentInfoIndex for MemoryAgentInfoStore {
    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    fn get_by_key(&self, name: &str) -> Option<AgentInfo> {
        self.object(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_then_get() {
        let store = MemoryAgentInfoStore::new();
        let created = store.create(&AgentInfo::new("agent")).await.unwrap();
        assert_eq!(created.metadata.resource_version.as_deref(), Some("1"));

        let fetched = store.get("agent").await.unwrap();
        assert_eq!(fetched, created);
        assert!(store.get("other").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_create_existing_fails() {
        let store = MemoryAgentInfoStore::new();
        store.create(&AgentInfo::new("agent")).await.unwrap();
        let err = store.create(&AgentInfo::new("agent")).await.unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn test_stale_update_conflicts() {
        let store = MemoryAgentInfoStore::new();
        let created = store.create(&AgentInfo::new("agent")).await.unwrap();

        let updated = store.update(&created).await.unwrap();
        assert_eq!(updated.metadata.resource_version.as_deref(), Some("2"));

        let err = store.update(&created).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_injected_failure_is_consumed_once() {
        let store = MemoryAgentInfoStore::new();
        store.inject_failure(StoreOp::Get, StoreError::Backend("unavailable".into()));

        assert!(matches!(
            store.get("agent").await,
            Err(StoreError::Backend(_))
        ));
        assert!(store.get("agent").await.unwrap_err().is_not_found());
        assert_eq!(store.get_count(), 2);
    }

    #[test]
    fn test_index_reports_sync_state() {
        let store = MemoryAgentInfoStore::new();
        assert!(!store.has_synced());
        store.put(AgentInfo::new("agent"));
        store.set_synced(true);
        assert!(store.has_synced());
        assert!(store.get_by_key("agent").is_some());
    }
}
