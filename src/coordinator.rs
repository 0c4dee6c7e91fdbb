//! Distributed coordinator adapter: a trait whose methods this crate only ever *calls*. No
//! implementation here talks to a real distributed backend — that's
//! explicitly out of scope (spec.md Non-goals) — only the in-memory test
//! double below, gated behind the `coordinator` feature like the trait
//! itself.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StableResult;

/// Guarantee requested of a coordinator read/write (spec glossary).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsistencyLevel {
    Eventual,
    Session,
    Strong,
    Linearizable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    Acquired,
    Held,
    Expired,
    Released,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

/// A monotone integer issued on lock acquisition; used to reject writes
/// from a holder whose lease has since been superseded.
pub type FencingToken = u64;

#[derive(Debug, Clone)]
pub struct Lock {
    pub key: String,
    pub token: FencingToken,
    pub status: LockStatus,
}

#[derive(Debug, Clone)]
pub struct LeaderStatus {
    pub is_leader: bool,
    pub leader_id: Option<String>,
    pub term: u64,
}

pub type TransactionId = String;

/// A single operation staged within a coordinator transaction.
#[derive(Debug, Clone)]
pub struct TransactionOperation {
    pub key: String,
    pub value: Option<Value>,
}

pub type MessageHandler =
    Arc<dyn Fn(Value) -> futures::future::BoxFuture<'static, ()> + Send + Sync>;

/// Methods used against a distributed-coordination backend.
/// Every method propagates adapter failures to the caller unchanged —
/// this crate adds no retry or interpretation of its own around them.
#[async_trait]
pub trait Coordinator: Send + Sync {
    async fn connect(&self) -> StableResult<()>;
    async fn disconnect(&self) -> StableResult<()>;

    async fn set_state(&self, key: &str, value: Value, consistency: ConsistencyLevel) -> StableResult<()>;
    async fn get_state(&self, key: &str, consistency: ConsistencyLevel) -> StableResult<Option<Value>>;
    async fn compare_and_swap(&self, key: &str, expected: Option<Value>, new_value: Value) -> StableResult<bool>;

    async fn acquire_lock(&self, key: &str, ttl_ms: u64) -> StableResult<Lock>;
    async fn release_lock(&self, lock: &Lock) -> StableResult<()>;
    async fn extend(&self, lock: &Lock, ttl_ms: u64) -> StableResult<Lock>;
    async fn validate_fencing_token(&self, key: &str, token: FencingToken) -> StableResult<bool>;
    async fn with_fenced_access(
        &self,
        key: &str,
        ttl_ms: u64,
        f: Box<dyn FnOnce(FencingToken) -> StableResult<()> + Send>,
    ) -> StableResult<()>;

    async fn campaign_for_leader(&self, group: &str) -> StableResult<LeaderStatus>;
    async fn get_leader_status(&self, group: &str) -> StableResult<LeaderStatus>;
    async fn resign_leadership(&self, group: &str) -> StableResult<()>;
    async fn has_quorum(&self, group: &str) -> StableResult<bool>;

    async fn begin_transaction(&self) -> StableResult<TransactionId>;
    async fn add_transaction_operation(&self, tx: &TransactionId, op: TransactionOperation) -> StableResult<()>;
    async fn prepare_transaction(&self, tx: &TransactionId) -> StableResult<bool>;
    async fn commit_transaction(&self, tx: &TransactionId) -> StableResult<()>;
    async fn rollback_transaction(&self, tx: &TransactionId) -> StableResult<()>;
    async fn execute_transaction(&self, ops: Vec<TransactionOperation>) -> StableResult<()>;
    async fn atomic_update(&self, key: &str, f: Arc<dyn Fn(Option<Value>) -> Value + Send + Sync>) -> StableResult<Value>;

    async fn publish(&self, topic: &str, message: Value, mode: DeliveryMode) -> StableResult<()>;
    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> StableResult<()>;
    async fn publish_with_delivery(&self, topic: &str, message: Value, mode: DeliveryMode) -> StableResult<String>;
    async fn acknowledge_message(&self, topic: &str, message_id: &str) -> StableResult<()>;
}

/// A single-process, non-persistent [`Coordinator`] for tests and local
/// development. Never appropriate as a production backend — there is no
/// replication, no cross-process visibility, and locks/leadership are
/// scoped to this one instance.
#[derive(Default)]
pub struct InMemoryCoordinator {
    state: parking_lot::Mutex<HashMap<String, Value>>,
    locks: parking_lot::Mutex<HashMap<String, Lock>>,
    next_token: std::sync::atomic::AtomicU64,
    leader: parking_lot::Mutex<HashMap<String, LeaderStatus>>,
    transactions: parking_lot::Mutex<HashMap<TransactionId, Vec<TransactionOperation>>>,
    next_tx: std::sync::atomic::AtomicU64,
}

impl InMemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Coordinator for InMemoryCoordinator {
    async fn connect(&self) -> StableResult<()> {
        Ok(())
    }

    async fn disconnect(&self) -> StableResult<()> {
        Ok(())
    }

    async fn set_state(&self, key: &str, value: Value, _consistency: ConsistencyLevel) -> StableResult<()> {
        self.state.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn get_state(&self, key: &str, _consistency: ConsistencyLevel) -> StableResult<Option<Value>> {
        Ok(self.state.lock().get(key).cloned())
    }

    async fn compare_and_swap(&self, key: &str, expected: Option<Value>, new_value: Value) -> StableResult<bool> {
        let mut state = self.state.lock();
        if state.get(key).cloned() == expected {
            state.insert(key.to_string(), new_value);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn acquire_lock(&self, key: &str, _ttl_ms: u64) -> StableResult<Lock> {
        let mut locks = self.locks.lock();
        if locks.contains_key(key) {
            return Ok(Lock { key: key.to_string(), token: 0, status: LockStatus::Held });
        }
        let token = self.next_token.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
        let lock = Lock { key: key.to_string(), token, status: LockStatus::Acquired };
        locks.insert(key.to_string(), lock.clone());
        Ok(lock)
    }

    async fn release_lock(&self, lock: &Lock) -> StableResult<()> {
        self.locks.lock().remove(&lock.key);
        Ok(())
    }

    async fn extend(&self, lock: &Lock, _ttl_ms: u64) -> StableResult<Lock> {
        Ok(lock.clone())
    }

    async fn validate_fencing_token(&self, key: &str, token: FencingToken) -> StableResult<bool> {
        Ok(self.locks.lock().get(key).map(|l| l.token == token).unwrap_or(false))
    }

    async fn with_fenced_access(
        &self,
        key: &str,
        ttl_ms: u64,
        f: Box<dyn FnOnce(FencingToken) -> StableResult<()> + Send>,
    ) -> StableResult<()> {
        let lock = self.acquire_lock(key, ttl_ms).await?;
        let result = f(lock.token);
        self.release_lock(&lock).await?;
        result
    }

    async fn campaign_for_leader(&self, group: &str) -> StableResult<LeaderStatus> {
        let mut leader = self.leader.lock();
        let status = leader.entry(group.to_string()).or_insert(LeaderStatus {
            is_leader: true,
            leader_id: Some("local".to_string()),
            term: 1,
        });
        Ok(status.clone())
    }

    async fn get_leader_status(&self, group: &str) -> StableResult<LeaderStatus> {
        Ok(self.leader.lock().get(group).cloned().unwrap_or(LeaderStatus {
            is_leader: false,
            leader_id: None,
            term: 0,
        }))
    }

    async fn resign_leadership(&self, group: &str) -> StableResult<()> {
        self.leader.lock().remove(group);
        Ok(())
    }

    async fn has_quorum(&self, _group: &str) -> StableResult<bool> {
        Ok(true)
    }

    async fn begin_transaction(&self) -> StableResult<TransactionId> {
        let id = self.next_tx.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
        let tx = format!("tx-{id}");
        self.transactions.lock().insert(tx.clone(), Vec::new());
        Ok(tx)
    }

    async fn add_transaction_operation(&self, tx: &TransactionId, op: TransactionOperation) -> StableResult<()> {
        self.transactions.lock().entry(tx.clone()).or_default().push(op);
        Ok(())
    }

    async fn prepare_transaction(&self, tx: &TransactionId) -> StableResult<bool> {
        Ok(self.transactions.lock().contains_key(tx))
    }

    async fn commit_transaction(&self, tx: &TransactionId) -> StableResult<()> {
        let ops = self.transactions.lock().remove(tx).unwrap_or_default();
        let mut state = self.state.lock();
        for op in ops {
            match op.value {
                Some(v) => state.insert(op.key, v),
                None => state.remove(&op.key),
            };
        }
        Ok(())
    }

    async fn rollback_transaction(&self, tx: &TransactionId) -> StableResult<()> {
        self.transactions.lock().remove(tx);
        Ok(())
    }

    async fn execute_transaction(&self, ops: Vec<TransactionOperation>) -> StableResult<()> {
        let tx = self.begin_transaction().await?;
        for op in ops {
            self.add_transaction_operation(&tx, op).await?;
        }
        self.commit_transaction(&tx).await
    }

    async fn atomic_update(&self, key: &str, f: Arc<dyn Fn(Option<Value>) -> Value + Send + Sync>) -> StableResult<Value> {
        let mut state = self.state.lock();
        let current = state.get(key).cloned();
        let updated = f(current);
        state.insert(key.to_string(), updated.clone());
        Ok(updated)
    }

    async fn publish(&self, _topic: &str, _message: Value, _mode: DeliveryMode) -> StableResult<()> {
        Ok(())
    }

    async fn subscribe(&self, _topic: &str, _handler: MessageHandler) -> StableResult<()> {
        Ok(())
    }

    async fn publish_with_delivery(&self, _topic: &str, _message: Value, _mode: DeliveryMode) -> StableResult<String> {
        Ok("msg-1".to_string())
    }

    async fn acknowledge_message(&self, _topic: &str, _message_id: &str) -> StableResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn compare_and_swap_only_succeeds_on_expected_match() {
        let coordinator = InMemoryCoordinator::new();
        coordinator.set_state("k", serde_json::json!(1), ConsistencyLevel::Strong).await.unwrap();

        let stale = coordinator
            .compare_and_swap("k", Some(serde_json::json!(2)), serde_json::json!(3))
            .await
            .unwrap();
        assert!(!stale);

        let fresh = coordinator
            .compare_and_swap("k", Some(serde_json::json!(1)), serde_json::json!(3))
            .await
            .unwrap();
        assert!(fresh);
        assert_eq!(
            coordinator.get_state("k", ConsistencyLevel::Strong).await.unwrap(),
            Some(serde_json::json!(3))
        );
    }

    #[tokio::test]
    async fn second_lock_acquisition_is_held_not_acquired() {
        let coordinator = InMemoryCoordinator::new();
        let first = coordinator.acquire_lock("res", 1000).await.unwrap();
        assert_eq!(first.status, LockStatus::Acquired);

        let second = coordinator.acquire_lock("res", 1000).await.unwrap();
        assert_eq!(second.status, LockStatus::Held);

        coordinator.release_lock(&first).await.unwrap();
        let third = coordinator.acquire_lock("res", 1000).await.unwrap();
        assert_eq!(third.status, LockStatus::Acquired);
    }

    #[tokio::test]
    async fn fencing_token_invalid_after_release_and_reacquire() {
        let coordinator = InMemoryCoordinator::new();
        let first = coordinator.acquire_lock("res", 1000).await.unwrap();
        coordinator.release_lock(&first).await.unwrap();
        let second = coordinator.acquire_lock("res", 1000).await.unwrap();

        assert!(!coordinator.validate_fencing_token("res", first.token).await.unwrap());
        assert!(coordinator.validate_fencing_token("res", second.token).await.unwrap());
    }

    #[tokio::test]
    async fn transaction_commits_staged_operations_atomically() {
        let coordinator = InMemoryCoordinator::new();
        let tx = coordinator.begin_transaction().await.unwrap();
        coordinator
            .add_transaction_operation(&tx, TransactionOperation { key: "a".to_string(), value: Some(serde_json::json!(1)) })
            .await
            .unwrap();
        coordinator
            .add_transaction_operation(&tx, TransactionOperation { key: "b".to_string(), value: Some(serde_json::json!(2)) })
            .await
            .unwrap();
        coordinator.commit_transaction(&tx).await.unwrap();

        assert_eq!(coordinator.get_state("a", ConsistencyLevel::Eventual).await.unwrap(), Some(serde_json::json!(1)));
        assert_eq!(coordinator.get_state("b", ConsistencyLevel::Eventual).await.unwrap(), Some(serde_json::json!(2)));
    }
}
