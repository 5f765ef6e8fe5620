//! Pending followup questions, keyed by session.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tokio::sync::oneshot;

/// Routes a user's answer to the tool call waiting for it.
#[derive(Debug, Default)]
pub struct FollowupBroker {
    pending: Mutex<HashMap<String, oneshot::Sender<String>>>,
}

impl FollowupBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start waiting for an answer. Replaces (and thereby cancels) any
    /// earlier wait for the same session.
    pub fn register(&self, session_id: &str) -> oneshot::Receiver<String> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id.to_string(), tx);
        rx
    }

    /// Deliver an answer. Returns false if nobody was waiting.
    pub fn submit_answer(&self, session_id: &str, answer: impl Into<String>) -> bool {
        let sender = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);
        match sender {
            Some(tx) => tx.send(answer.into()).is_ok(),
            None => false,
        }
    }

    pub fn is_waiting(&self, session_id: &str) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Drop the pending wait; the waiter sees a closed channel.
    pub fn cancel(&self, session_id: &str) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id)
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn answer_reaches_waiter() {
        let broker = FollowupBroker::new();
        let rx = broker.register("s1");
        assert!(broker.is_waiting("s1"));
        assert!(broker.submit_answer("s1", "blue"));
        assert_eq!(rx.await.unwrap(), "blue");
        assert!(!broker.is_waiting("s1"));
    }

    #[tokio::test]
    async fn cancel_closes_the_wait() {
        let broker = FollowupBroker::new();
        let rx = broker.register("s1");
        assert!(broker.cancel("s1"));
        assert!(rx.await.is_err());
        assert!(!broker.submit_answer("s1", "late"));
    }
}
