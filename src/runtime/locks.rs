use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use uuid::Uuid;

use crate::error::{EngineError, Result};

/// Keyed read/write locks over workflow-instance ids and task ids.
///
/// Locks are created lazily and never removed: the key space is unbounded
/// over the process lifetime but small at any instant. This is a pure
/// in-process mutex table; it does not survive a restart and does not
/// need to.
///
/// Lock order: the instance lock is always acquired before a task lock
/// for the same operation. The registry enforces this by construction:
/// `lock_task` demands an already-held instance guard as proof.
#[derive(Default)]
pub struct LockRegistry {
    instance_locks: DashMap<Uuid, Arc<RwLock<()>>>,
    task_locks: DashMap<Uuid, Arc<RwLock<()>>>,
}

/// Proof that the holder owns the exclusive lock for one instance.
/// Mutation APIs take a reference to this instead of trusting convention.
pub struct InstanceGuard {
    id: Uuid,
    _guard: OwnedRwLockWriteGuard<()>,
}

impl InstanceGuard {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

pub struct InstanceSharedGuard {
    id: Uuid,
    _guard: OwnedRwLockReadGuard<()>,
}

impl InstanceSharedGuard {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

pub struct TaskGuard {
    id: Uuid,
    _guard: OwnedRwLockWriteGuard<()>,
}

impl TaskGuard {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn instance_entry(&self, id: Uuid) -> Arc<RwLock<()>> {
        // Clone the Arc out so the map shard lock is released before the
        // caller awaits the RwLock.
        self.instance_locks
            .entry(id)
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .value()
            .clone()
    }

    fn task_entry(&self, id: Uuid) -> Arc<RwLock<()>> {
        self.task_locks
            .entry(id)
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .value()
            .clone()
    }

    pub async fn lock_instance(&self, id: Uuid) -> InstanceGuard {
        let lock = self.instance_entry(id);
        InstanceGuard { id, _guard: lock.write_owned().await }
    }

    pub async fn lock_instance_shared(&self, id: Uuid) -> InstanceSharedGuard {
        let lock = self.instance_entry(id);
        InstanceSharedGuard { id, _guard: lock.read_owned().await }
    }

    /// Acquire a task's exclusive lock. Requires the instance guard so the
    /// instance-before-task order cannot be inverted by a caller.
    pub async fn lock_task(&self, instance: &InstanceGuard, task_id: Uuid) -> TaskGuard {
        // The proof is only needed for its existence.
        let _ = instance.id();
        let lock = self.task_entry(task_id);
        TaskGuard { id: task_id, _guard: lock.write_owned().await }
    }

    /// True when some holder currently has the exclusive instance lock.
    pub fn is_instance_locked(&self, id: Uuid) -> bool {
        match self.instance_locks.get(&id) {
            Some(lock) => lock.try_read().is_err(),
            None => false,
        }
    }
}

/// Fail fast when a guard does not cover the entity being mutated. This is
/// a programming error in the caller, surfaced loudly instead of racing.
pub fn assert_covers_instance(guard: &InstanceGuard, id: Uuid) -> Result<()> {
    if guard.id() != id {
        return Err(EngineError::LockContract(format!(
            "held instance lock {} does not cover instance {}",
            guard.id(),
            id
        )));
    }
    Ok(())
}

pub fn assert_covers_task(guard: &TaskGuard, id: Uuid) -> Result<()> {
    if guard.id() != id {
        return Err(EngineError::LockContract(format!(
            "held task lock {} does not cover task {}",
            guard.id(),
            id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exclusive_guard_blocks_second_holder() {
        let registry = Arc::new(LockRegistry::new());
        let id = Uuid::new_v4();
        let guard = registry.lock_instance(id).await;
        assert!(registry.is_instance_locked(id));

        let r2 = registry.clone();
        let contender = tokio::spawn(async move { r2.lock_instance(id).await });
        tokio::task::yield_now().await;
        assert!(!contender.is_finished());

        drop(guard);
        let second = contender.await.unwrap();
        assert_eq!(second.id(), id);
    }

    #[tokio::test]
    async fn shared_guards_coexist() {
        let registry = LockRegistry::new();
        let id = Uuid::new_v4();
        let _a = registry.lock_instance_shared(id).await;
        let _b = registry.lock_instance_shared(id).await;
        assert!(!registry.is_instance_locked(id));
    }

    #[tokio::test]
    async fn mismatched_guard_is_a_contract_violation() {
        let registry = LockRegistry::new();
        let guard = registry.lock_instance(Uuid::new_v4()).await;
        let other = Uuid::new_v4();
        assert!(matches!(
            assert_covers_instance(&guard, other),
            Err(EngineError::LockContract(_))
        ));
    }
}
