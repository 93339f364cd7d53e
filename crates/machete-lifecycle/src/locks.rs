use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::{ConflictReason, Result, ToolError};

type SlotMap = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

/// One async mutex per tool id. Distinct ids never contend. An id's entry lives
/// only while someone holds or waits for it.
#[derive(Clone, Default)]
pub struct ToolLocks {
    inner: SlotMap,
    wait: Option<Duration>,
}

/// Held for the whole of a mutating operation on one tool.
pub struct ToolGuard {
    id: String,
    operation: &'static str,
    slots: SlotMap,
    guard: Option<OwnedMutexGuard<()>>,
}

impl ToolGuard {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn operation(&self) -> &'static str {
        self.operation
    }
}

impl Drop for ToolGuard {
    fn drop(&mut self) {
        let mut map = lock_map(&self.slots);
        drop(self.guard.take());
        // Holders and waiters each own a clone, so a lone map reference means idle.
        if map.get(&self.id).is_some_and(|slot| Arc::strong_count(slot) == 1) {
            map.remove(&self.id);
        }
        debug!("released {} lock on {}", self.operation, self.id);
    }
}

impl ToolLocks {
    /// `wait` of `None` fails fast with a conflict; otherwise callers queue up to `wait`.
    pub fn new(wait: Option<Duration>) -> Self {
        ToolLocks {
            inner: Arc::default(),
            wait,
        }
    }

    fn slot(&self, id: &str) -> Arc<AsyncMutex<()>> {
        Arc::clone(lock_map(&self.inner).entry(id.to_string()).or_default())
    }

    fn guard(&self, id: &str, operation: &'static str, guard: OwnedMutexGuard<()>) -> ToolGuard {
        ToolGuard {
            id: id.to_string(),
            operation,
            slots: Arc::clone(&self.inner),
            guard: Some(guard),
        }
    }

    /// Ids currently held or waited on.
    pub fn tracked(&self) -> usize {
        lock_map(&self.inner).len()
    }

    pub async fn acquire(&self, id: &str, operation: &'static str) -> Result<ToolGuard> {
        let slot = self.slot(id);
        let attempt = match self.wait {
            None => Arc::clone(&slot).try_lock_owned().ok(),
            Some(wait) => tokio::time::timeout(wait, Arc::clone(&slot).lock_owned())
                .await
                .ok(),
        };
        let Some(guard) = attempt else {
            self.forget_if_idle(id, slot);
            return Err(busy(id, operation));
        };
        debug!("acquired {operation} lock on {id}");
        Ok(self.guard(id, operation, guard))
    }

    /// Non-blocking attempt used by readers that can fall back to a stale view.
    pub fn try_acquire(&self, id: &str, operation: &'static str) -> Option<ToolGuard> {
        let slot = self.slot(id);
        match Arc::clone(&slot).try_lock_owned() {
            Ok(guard) => Some(self.guard(id, operation, guard)),
            Err(_) => {
                self.forget_if_idle(id, slot);
                None
            }
        }
    }

    /// Drops a slot obtained for an attempt that never produced a guard.
    fn forget_if_idle(&self, id: &str, slot: Arc<AsyncMutex<()>>) {
        let mut map = lock_map(&self.inner);
        drop(slot);
        if map.get(id).is_some_and(|slot| Arc::strong_count(slot) == 1) {
            map.remove(id);
        }
    }
}

fn lock_map(
    slots: &SlotMap,
) -> std::sync::MutexGuard<'_, HashMap<String, Arc<AsyncMutex<()>>>> {
    slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn busy(id: &str, operation: &str) -> ToolError {
    ToolError::Conflict {
        id: id.to_string(),
        reason: ConflictReason::OperationInProgress,
        detail: format!("another operation is in progress; {operation} rejected"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_conflicts_until_release() {
        let locks = ToolLocks::new(None);
        let first = locks.acquire("alpha", "start").await.unwrap();
        let err = locks.acquire("alpha", "stop").await.err().unwrap();
        assert!(matches!(
            err,
            ToolError::Conflict { reason: ConflictReason::OperationInProgress, .. }
        ));
        assert!(locks.try_acquire("alpha", "status").is_none());
        drop(first);
        assert!(locks.acquire("alpha", "stop").await.is_ok());
    }

    #[tokio::test]
    async fn distinct_ids_do_not_contend() {
        let locks = ToolLocks::new(None);
        let _a = locks.acquire("alpha", "start").await.unwrap();
        assert!(locks.acquire("beta", "start").await.is_ok());
    }

    #[tokio::test]
    async fn waiting_policy_queues_behind_holder() {
        let locks = ToolLocks::new(Some(Duration::from_secs(5)));
        let first = locks.acquire("alpha", "start").await.unwrap();
        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire("alpha", "stop").await.map(|g| g.operation()) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(first);
        assert_eq!(waiter.await.unwrap().unwrap(), "stop");
    }

    #[tokio::test]
    async fn released_ids_are_forgotten() {
        let locks = ToolLocks::new(None);
        for id in ["alpha", "beta", "gamma"] {
            let guard = locks.acquire(id, "install").await.unwrap();
            assert_eq!(locks.tracked(), 1);
            drop(guard);
        }
        assert_eq!(locks.tracked(), 0);

        let held = locks.acquire("alpha", "start").await.unwrap();
        assert!(locks.acquire("alpha", "stop").await.is_err());
        assert!(locks.try_acquire("alpha", "status").is_none());
        assert_eq!(locks.tracked(), 1);
        drop(held);
        assert_eq!(locks.tracked(), 0);
    }

    #[tokio::test]
    async fn entry_survives_while_a_waiter_is_queued() {
        let locks = ToolLocks::new(Some(Duration::from_secs(5)));
        let first = locks.acquire("alpha", "start").await.unwrap();
        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let guard = locks.acquire("alpha", "stop").await.unwrap();
                tokio::time::sleep(Duration::from_millis(20)).await;
                drop(guard);
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(first);
        assert_eq!(locks.tracked(), 1);
        assert!(locks.acquire("alpha", "restart").await.is_ok());
        waiter.await.unwrap();
        assert_eq!(locks.tracked(), 0);
    }
}
