//! Awaiting-message store.
//!
//! One FIFO queue per scoped instance, holding commands that cannot be sent
//! until the agent of that scope is reachable. Each queue also carries a
//! delivery lock: whoever sends to, queues for, or flushes a scope holds it,
//! so messages for one scope leave in the order they were produced.
//! Queues of different scopes never share a lock.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use dm_messages::Message;
use dm_model::InstancePath;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

#[derive(Default)]
struct ScopeQueue {
    pending: Mutex<VecDeque<Message>>,
    delivery: Arc<tokio::sync::Mutex<()>>,
}

impl ScopeQueue {
    fn pending(&self) -> std::sync::MutexGuard<'_, VecDeque<Message>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Per-scope queues of undelivered messages.
#[derive(Default)]
pub struct AwaitingMessageStore {
    queues: Mutex<HashMap<InstancePath, Arc<ScopeQueue>>>,
}

impl AwaitingMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, scope: &InstancePath) -> Arc<ScopeQueue> {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(scope.clone())
            .or_default()
            .clone()
    }

    fn existing(&self, scope: &InstancePath) -> Option<Arc<ScopeQueue>> {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(scope)
            .cloned()
    }

    /// Append a message to the queue of `scope`.
    pub fn store(&self, scope: &InstancePath, message: Message) {
        let queue = self.queue(scope);
        let mut pending = queue.pending();
        pending.push_back(message);
        debug!(scope = %scope, queued = pending.len(), "Message stored");
    }

    /// Put messages back at the head of the queue, keeping their order.
    pub fn requeue_front(&self, scope: &InstancePath, messages: Vec<Message>) {
        if messages.is_empty() {
            return;
        }
        let queue = self.queue(scope);
        let mut pending = queue.pending();
        for message in messages.into_iter().rev() {
            pending.push_front(message);
        }
    }

    /// Take every queued message of `scope`, leaving the queue empty.
    pub fn drain_and_remove(&self, scope: &InstancePath) -> Vec<Message> {
        let Some(queue) = self.existing(scope) else {
            return Vec::new();
        };
        let drained: Vec<Message> = queue.pending().drain(..).collect();
        drained
    }

    /// Drop the messages of a scope that no longer exists.
    ///
    /// The queue itself stays so its delivery lock keeps excluding tasks
    /// that still hold or wait on it, should the path be reused.
    pub fn forget(&self, scope: &InstancePath) -> usize {
        self.existing(scope)
            .map(|queue| queue.pending().drain(..).count())
            .unwrap_or(0)
    }

    /// Total number of queued messages.
    pub fn count(&self) -> usize {
        let queues: Vec<Arc<ScopeQueue>> = self
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        queues.iter().map(|q| q.pending().len()).sum()
    }

    pub fn count_for(&self, scope: &InstancePath) -> usize {
        self.existing(scope)
            .map(|queue| queue.pending().len())
            .unwrap_or(0)
    }

    /// Copy of the queue of `scope`, oldest first.
    pub fn pending(&self, scope: &InstancePath) -> Vec<Message> {
        self.existing(scope)
            .map(|queue| queue.pending().iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Take the delivery lock of `scope`.
    pub async fn lock_delivery(&self, scope: &InstancePath) -> OwnedMutexGuard<()> {
        let delivery = self.queue(scope).delivery.clone();
        delivery.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dm_messages::{ChangeState, Command};
    use dm_model::InstanceStatus;

    fn path(s: &str) -> InstancePath {
        InstancePath::parse(s).unwrap()
    }

    fn change(target: &str) -> Message {
        Command::ChangeState(ChangeState {
            instance_path: path(target),
            new_state: InstanceStatus::DeployedStarted,
            file_name_to_file_content: None,
        })
        .into()
    }

    #[test]
    fn test_store_and_drain_keeps_order() {
        let store = AwaitingMessageStore::new();
        let vm = path("/vm");
        store.store(&vm, change("/vm/a"));
        store.store(&vm, change("/vm/b"));
        store.store(&vm, change("/vm/c"));
        assert_eq!(store.count_for(&vm), 3);

        let drained = store.drain_and_remove(&vm);
        assert_eq!(drained, vec![change("/vm/a"), change("/vm/b"), change("/vm/c")]);
        assert_eq!(store.count(), 0);
        assert!(store.drain_and_remove(&vm).is_empty());
    }

    #[test]
    fn test_scopes_are_independent() {
        let store = AwaitingMessageStore::new();
        store.store(&path("/vm1"), change("/vm1/a"));
        store.store(&path("/vm2"), change("/vm2/a"));
        store.store(&path("/vm2"), change("/vm2/b"));

        assert_eq!(store.count(), 3);
        assert_eq!(store.drain_and_remove(&path("/vm1")).len(), 1);
        assert_eq!(store.count_for(&path("/vm2")), 2);
    }

    #[test]
    fn test_requeue_front() {
        let store = AwaitingMessageStore::new();
        let vm = path("/vm");
        store.store(&vm, change("/vm/c"));
        store.requeue_front(&vm, vec![change("/vm/a"), change("/vm/b")]);

        assert_eq!(
            store.pending(&vm),
            vec![change("/vm/a"), change("/vm/b"), change("/vm/c")]
        );
    }

    #[test]
    fn test_forget() {
        let store = AwaitingMessageStore::new();
        let vm = path("/vm");
        store.store(&vm, change("/vm/a"));
        assert_eq!(store.forget(&vm), 1);
        assert_eq!(store.forget(&vm), 0);
        assert_eq!(store.count(), 0);
    }

    #[tokio::test]
    async fn test_forget_keeps_delivery_lock() {
        let store = Arc::new(AwaitingMessageStore::new());
        let vm = path("/vm");
        store.store(&vm, change("/vm/a"));
        let guard = store.lock_delivery(&vm).await;

        store.forget(&vm);

        // A scope re-added under the same path still waits for the holder.
        let contender = {
            let store = store.clone();
            let vm = vm.clone();
            tokio::spawn(async move {
                let _guard = store.lock_delivery(&vm).await;
            })
        };

        tokio::task::yield_now().await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
        assert_eq!(store.count_for(&vm), 0);
    }

    #[tokio::test]
    async fn test_delivery_lock_is_per_scope() {
        let store = AwaitingMessageStore::new();
        let _vm1 = store.lock_delivery(&path("/vm1")).await;

        // Another scope is not blocked.
        let _vm2 = store.lock_delivery(&path("/vm2")).await;

        // Storing into a locked scope does not need the delivery lock.
        store.store(&path("/vm1"), change("/vm1/a"));
        assert_eq!(store.count_for(&path("/vm1")), 1);
    }

    #[tokio::test]
    async fn test_delivery_lock_serializes_same_scope() {
        let store = Arc::new(AwaitingMessageStore::new());
        let vm = path("/vm");
        let guard = store.lock_delivery(&vm).await;

        let contender = {
            let store = store.clone();
            let vm = vm.clone();
            tokio::spawn(async move {
                let _guard = store.lock_delivery(&vm).await;
            })
        };

        tokio::task::yield_now().await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }
}
