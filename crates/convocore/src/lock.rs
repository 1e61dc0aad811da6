//! Named, TTL-bounded locks used to keep background work from running twice.

use crate::LockError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

/// Identifies the run that created a lock.
pub type LockOwner = Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockKey {
    pub name: String,
    pub scope: String,
}

impl LockKey {
    pub fn new(name: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scope: scope.into(),
        }
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scope, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub key: LockKey,
    pub owner: LockOwner,
    pub created_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl Lock {
    pub fn expires_at(&self) -> DateTime<Utc> {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::zero());
        self.created_at + ttl
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAcquisition {
    Created(Lock),
    /// A live lock with the same key already exists.
    Exists(Lock),
}

/// Shared key-value store backing the lock table.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Create the lock unless a live one already holds the key. Expired locks
    /// are replaced.
    async fn create(
        &self,
        key: &LockKey,
        owner: LockOwner,
        ttl: Duration,
    ) -> Result<LockAcquisition, LockError>;

    /// Delete the lock if `owner` still holds it. Returns whether anything was
    /// removed.
    async fn delete(&self, key: &LockKey, owner: LockOwner) -> Result<bool, LockError>;

    /// Look up a live lock.
    async fn get(&self, key: &LockKey) -> Result<Option<Lock>, LockError>;

    /// Remove every lock in `scope` (or all scopes), live or not.
    async fn purge(&self, scope: Option<&str>) -> Result<usize, LockError>;
}

/// Process-local lock table.
#[derive(Default)]
pub struct InMemoryLockStore {
    locks: Mutex<HashMap<LockKey, Lock>>,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn create(
        &self,
        key: &LockKey,
        owner: LockOwner,
        ttl: Duration,
    ) -> Result<LockAcquisition, LockError> {
        let mut locks = self.locks.lock().await;
        let now = Utc::now();

        if let Some(existing) = locks.get(key) {
            if !existing.is_expired(now) {
                return Ok(LockAcquisition::Exists(existing.clone()));
            }
            debug!("Replacing expired lock {}", key);
        }

        let lock = Lock {
            key: key.clone(),
            owner,
            created_at: now,
            ttl,
        };
        locks.insert(key.clone(), lock.clone());
        Ok(LockAcquisition::Created(lock))
    }

    async fn delete(&self, key: &LockKey, owner: LockOwner) -> Result<bool, LockError> {
        let mut locks = self.locks.lock().await;
        match locks.get(key) {
            Some(existing) if existing.owner == owner => {
                locks.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, key: &LockKey) -> Result<Option<Lock>, LockError> {
        let locks = self.locks.lock().await;
        Ok(locks
            .get(key)
            .filter(|lock| !lock.is_expired(Utc::now()))
            .cloned())
    }

    async fn purge(&self, scope: Option<&str>) -> Result<usize, LockError> {
        let mut locks = self.locks.lock().await;
        let before = locks.len();
        match scope {
            Some(scope) => locks.retain(|key, _| key.scope != scope),
            None => locks.clear(),
        }
        Ok(before - locks.len())
    }
}

/// Front door to the lock store with the engine's TTL and default scope.
pub struct LockManager {
    store: Arc<dyn LockStore>,
    ttl: Duration,
    default_scope: String,
}

impl LockManager {
    pub fn new(store: Arc<dyn LockStore>, ttl: Duration, default_scope: impl Into<String>) -> Self {
        Self {
            store,
            ttl,
            default_scope: default_scope.into(),
        }
    }

    pub fn default_scope(&self) -> &str {
        &self.default_scope
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn key(&self, name: &str, scope: Option<&str>) -> LockKey {
        LockKey::new(name, scope.unwrap_or(&self.default_scope))
    }

    pub async fn try_acquire(
        &self,
        key: &LockKey,
        owner: LockOwner,
    ) -> Result<LockAcquisition, LockError> {
        self.store.create(key, owner, self.ttl).await
    }

    pub async fn release(&self, key: &LockKey, owner: LockOwner) -> Result<bool, LockError> {
        self.store.delete(key, owner).await
    }

    pub async fn is_locked(&self, key: &LockKey) -> Result<bool, LockError> {
        Ok(self.store.get(key).await?.is_some())
    }

    /// Drop leftovers of crashed runs in the default scope.
    pub async fn purge_default_scope(&self) -> Result<usize, LockError> {
        self.store.purge(Some(&self.default_scope)).await
    }
}

/// Locks created by one run. Cloned into every node context of the run; the
/// processor releases whatever is held when the run ends.
#[derive(Clone)]
pub struct RunLocks {
    manager: Arc<LockManager>,
    owner: LockOwner,
    held: Arc<Mutex<Vec<LockKey>>>,
}

impl RunLocks {
    pub fn new(manager: Arc<LockManager>) -> Self {
        Self {
            manager,
            owner: Uuid::new_v4(),
            held: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn owner(&self) -> LockOwner {
        self.owner
    }

    pub fn key(&self, name: &str, scope: Option<&str>) -> LockKey {
        self.manager.key(name, scope)
    }

    /// Returns `Exists` without creating anything when another live lock
    /// holds the key.
    pub async fn acquire(&self, key: &LockKey) -> Result<LockAcquisition, LockError> {
        let acquisition = self.manager.try_acquire(key, self.owner).await?;
        if let LockAcquisition::Created(_) = &acquisition {
            self.held.lock().await.push(key.clone());
        }
        Ok(acquisition)
    }

    pub async fn held(&self) -> Vec<LockKey> {
        self.held.lock().await.clone()
    }

    /// Release every lock this run created. Failures are logged, not raised,
    /// since the TTL reclaims the lock anyway.
    pub async fn release_all(&self) {
        let keys: Vec<LockKey> = self.held.lock().await.drain(..).collect();
        for key in keys {
            match self.manager.release(&key, self.owner).await {
                Ok(true) => debug!("Released lock {}", key),
                Ok(false) => debug!("Lock {} was no longer ours to release", key),
                Err(e) => warn!("Failed to release lock {}: {}", key, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(ttl: Duration) -> Arc<LockManager> {
        Arc::new(LockManager::new(Arc::new(InMemoryLockStore::new()), ttl, "user"))
    }

    #[tokio::test]
    async fn second_acquire_sees_existing_lock() {
        let manager = manager(Duration::from_secs(60));
        let key = manager.key("mem-lock", None);
        let first = RunLocks::new(manager.clone());
        let second = RunLocks::new(manager.clone());

        assert!(matches!(first.acquire(&key).await.unwrap(), LockAcquisition::Created(_)));
        match second.acquire(&key).await.unwrap() {
            LockAcquisition::Exists(lock) => assert_eq!(lock.owner, first.owner()),
            other => panic!("expected existing lock, got {:?}", other),
        }
        assert!(second.held().await.is_empty());
    }

    #[tokio::test]
    async fn release_all_frees_the_key() {
        let manager = manager(Duration::from_secs(60));
        let key = manager.key("mem-lock", Some("alice"));
        let run = RunLocks::new(manager.clone());

        run.acquire(&key).await.unwrap();
        assert!(manager.is_locked(&key).await.unwrap());

        run.release_all().await;
        assert!(!manager.is_locked(&key).await.unwrap());
        assert!(run.held().await.is_empty());
    }

    #[tokio::test]
    async fn expired_lock_can_be_taken_over() {
        let manager = manager(Duration::from_millis(20));
        let key = manager.key("mem-lock", None);
        let stale = RunLocks::new(manager.clone());
        let fresh = RunLocks::new(manager.clone());

        stale.acquire(&key).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(!manager.is_locked(&key).await.unwrap());
        assert!(matches!(fresh.acquire(&key).await.unwrap(), LockAcquisition::Created(_)));

        // The stale owner must not delete the new holder's lock.
        stale.release_all().await;
        assert!(manager.is_locked(&key).await.unwrap());
    }

    #[tokio::test]
    async fn scopes_do_not_collide() {
        let manager = manager(Duration::from_secs(60));
        let run = RunLocks::new(manager.clone());

        let alice = manager.key("mem-lock", Some("alice"));
        let bob = manager.key("mem-lock", Some("bob"));
        assert!(matches!(run.acquire(&alice).await.unwrap(), LockAcquisition::Created(_)));
        assert!(matches!(run.acquire(&bob).await.unwrap(), LockAcquisition::Created(_)));
    }

    #[tokio::test]
    async fn purge_only_touches_default_scope() {
        let manager = manager(Duration::from_secs(60));
        let run = RunLocks::new(manager.clone());
        run.acquire(&manager.key("a", None)).await.unwrap();
        run.acquire(&manager.key("b", Some("other"))).await.unwrap();

        assert_eq!(manager.purge_default_scope().await.unwrap(), 1);
        assert!(manager.is_locked(&manager.key("b", Some("other"))).await.unwrap());
    }
}
