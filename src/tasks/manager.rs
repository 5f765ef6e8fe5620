//! Persistent task manager: the only component that changes task and queue
//! status. Everything goes through the store's transactional API.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::store::Database;
use crate::tasks::followup::FollowupBroker;
use crate::tasks::model::{
    QueueItem, QueueStats, QueueStatus, StaleReset, TaskState, TaskStateUpdate, TaskStatus,
};
use crate::tasks::processors::{ProcessorLease, ProcessorRegistry};

const EVENT_CAPACITY: usize = 256;

/// Announced whenever a message is queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEvent {
    pub session_id: String,
    pub queue_item_id: String,
}

/// Durable per-session task state and message queue.
pub struct TaskManager {
    store: Arc<dyn Database>,
    processors: Arc<ProcessorRegistry>,
    followups: FollowupBroker,
    events: broadcast::Sender<QueueEvent>,
}

impl TaskManager {
    pub fn new(store: Arc<dyn Database>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            processors: Arc::new(ProcessorRegistry::new()),
            followups: FollowupBroker::new(),
            events,
        }
    }

    pub fn store(&self) -> &Arc<dyn Database> {
        &self.store
    }

    pub fn followups(&self) -> &FollowupBroker {
        &self.followups
    }

    /// Receive an event for every message queued through this manager.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    // ── Task state ──────────────────────────────────────────────────

    /// Idempotent: returns the existing row or creates a pending one.
    pub async fn initialize_task_state(&self, session_id: &str) -> Result<TaskState, DatabaseError> {
        self.store.get_or_create_task_state(session_id).await
    }

    pub async fn get_task_state(&self, session_id: &str) -> Result<Option<TaskState>, DatabaseError> {
        self.store.get_task_state(session_id).await
    }

    pub async fn update_task_state(
        &self,
        session_id: &str,
        update: TaskStateUpdate,
    ) -> Result<TaskState, DatabaseError> {
        self.store.update_task_state(session_id, &update).await
    }

    pub async fn increment_mistake_count(&self, session_id: &str) -> Result<u32, DatabaseError> {
        let update = TaskStateUpdate {
            increment_mistake_count: true,
            ..Default::default()
        };
        let state = self.store.update_task_state(session_id, &update).await?;
        debug!(session_id, mistakes = state.consecutive_mistake_count, "Mistake recorded");
        Ok(state.consecutive_mistake_count)
    }

    /// Sessions that were running when the process last stopped. Sessions
    /// waiting on a followup answer count too: their waiter died with the
    /// process, so they are resumed like running ones.
    ///
    /// Call before
    /// [`cleanup_stale_processing_states`](Self::cleanup_stale_processing_states),
    /// which resets them to pending.
    pub async fn get_sessions_to_resume(&self) -> Result<Vec<String>, DatabaseError> {
        let mut sessions = self.store.list_sessions_by_status(TaskStatus::Running).await?;
        sessions.extend(
            self.store
                .list_sessions_by_status(TaskStatus::WaitingForApproval)
                .await?,
        );
        Ok(sessions)
    }

    // ── Queue ───────────────────────────────────────────────────────

    pub async fn queue_message(
        &self,
        session_id: &str,
        message_id: &str,
        content: &str,
        sender_id: &str,
    ) -> Result<QueueItem, DatabaseError> {
        let item = self
            .store
            .enqueue_message(session_id, message_id, content, sender_id)
            .await?;
        // No receivers is fine: loops fall back to polling.
        let _ = self.events.send(QueueEvent {
            session_id: session_id.to_string(),
            queue_item_id: item.id.clone(),
        });
        Ok(item)
    }

    pub async fn get_next_message_to_process(
        &self,
        session_id: &str,
    ) -> Result<Option<QueueItem>, DatabaseError> {
        self.store.claim_next_queue_item(session_id).await
    }

    pub async fn mark_message_processed(
        &self,
        item_id: &str,
        result: Option<serde_json::Value>,
        task_update: Option<TaskStateUpdate>,
    ) -> Result<(), DatabaseError> {
        self.store
            .complete_queue_item(item_id, result.as_ref(), task_update.as_ref())
            .await
    }

    pub async fn mark_message_failed(&self, item_id: &str, error: &str) -> Result<(), DatabaseError> {
        self.store.fail_queue_item(item_id, error).await
    }

    pub async fn has_pending_messages(&self, session_id: &str) -> Result<bool, DatabaseError> {
        Ok(self
            .store
            .count_queue_items(session_id, QueueStatus::Queued)
            .await?
            > 0)
    }

    pub async fn queue_stats(&self, session_id: &str) -> Result<QueueStats, DatabaseError> {
        self.store.queue_stats(session_id).await
    }

    /// Startup recovery for rows a crashed process left mid-flight:
    /// processing items go back to queued, and both running and
    /// waiting-for-followup sessions go back to pending.
    pub async fn cleanup_stale_processing_states(&self) -> Result<StaleReset, DatabaseError> {
        let reset = self.store.reset_stale_processing().await?;
        info!(
            queue_items = reset.queue_items,
            task_states = reset.task_states,
            "Stale processing state cleaned up"
        );
        Ok(reset)
    }

    // ── Processor guard ─────────────────────────────────────────────

    /// Claim the session for a local loop. The claim lasts as long as the
    /// returned lease, or until [`unregister_processor`](Self::unregister_processor).
    pub fn register_processor(&self, session_id: &str) -> Option<ProcessorLease> {
        ProcessorLease::acquire(&self.processors, session_id)
    }

    /// Drop the session's claim regardless of which loop holds it.
    pub fn unregister_processor(&self, session_id: &str) {
        self.processors.unregister(session_id);
    }

    pub fn is_being_processed(&self, session_id: &str) -> bool {
        self.processors.is_registered(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;

    async fn manager() -> Arc<TaskManager> {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        Arc::new(TaskManager::new(store))
    }

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let manager = manager().await;
        let a = manager.initialize_task_state("s1").await.unwrap();
        manager
            .update_task_state("s1", TaskStateUpdate::status(TaskStatus::Running))
            .await
            .unwrap();
        let b = manager.initialize_task_state("s1").await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(b.status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn queueing_announces_the_item() {
        let manager = manager().await;
        let mut events = manager.subscribe();
        let item = manager.queue_message("s1", "m1", "hi", "u1").await.unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event.session_id, "s1");
        assert_eq!(event.queue_item_id, item.id);
        assert!(manager.has_pending_messages("s1").await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_claims_hand_out_one_item_once() {
        let manager = manager().await;
        manager.queue_message("s1", "m1", "only", "u1").await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let manager = Arc::clone(&manager);
            handles.push(tokio::spawn(async move {
                manager.get_next_message_to_process("s1").await.unwrap()
            }));
        }
        let mut claimed = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                claimed += 1;
            }
        }
        assert_eq!(claimed, 1);
    }

    #[tokio::test]
    async fn mistakes_accumulate() {
        let manager = manager().await;
        manager.initialize_task_state("s1").await.unwrap();
        assert_eq!(manager.increment_mistake_count("s1").await.unwrap(), 1);
        assert_eq!(manager.increment_mistake_count("s1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn resumable_sessions_include_waiting_ones() {
        let manager = manager().await;
        for id in ["a", "b", "c"] {
            manager.initialize_task_state(id).await.unwrap();
        }
        manager
            .update_task_state("a", TaskStateUpdate::status(TaskStatus::Running))
            .await
            .unwrap();
        manager
            .update_task_state("b", TaskStateUpdate::status(TaskStatus::Running))
            .await
            .unwrap();
        manager
            .update_task_state("b", TaskStateUpdate::status(TaskStatus::WaitingForApproval))
            .await
            .unwrap();

        let mut sessions = manager.get_sessions_to_resume().await.unwrap();
        sessions.sort();
        assert_eq!(sessions, vec!["a".to_string(), "b".to_string()]);
    }
}
