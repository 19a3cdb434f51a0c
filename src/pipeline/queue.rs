//! Durable agent-to-agent message queue.
//!
//! A thin async facade over the `messages` table. Messages are delivered
//! in insertion order per recipient; nothing is ever deleted, so the
//! table doubles as the project's communication log.

use anyhow::Result;
use botarmy_common::{AgentRole, MessageId, MessageStatus, ProjectId, Stage};
use serde_json::Value;

use crate::store::{Message, MessageKind, NewMessage, StoreHandle};

#[derive(Clone)]
pub struct MessageQueue {
    store: StoreHandle,
}

impl MessageQueue {
    pub fn new(store: StoreHandle) -> Self {
        Self { store }
    }

    /// Append a message in `Pending` status.
    ///
    /// Messages from a worker are handoffs of that worker's stage; messages
    /// from the operator or orchestrator are decisions for the recipient's
    /// stage.
    pub async fn enqueue(
        &self,
        from: AgentRole,
        to: AgentRole,
        project_id: ProjectId,
        payload: Value,
        confidence: Option<f64>,
    ) -> Result<MessageId> {
        let (kind, stage) = match from.stage() {
            Some(stage) => (MessageKind::Handoff, stage),
            None => (MessageKind::Decision, to.stage().unwrap_or(Stage::Idle)),
        };
        let new = NewMessage {
            project_id,
            from_agent: from,
            to_agent: to,
            kind,
            stage,
            payload,
            confidence,
        };
        let message = self.store.call(move |db| db.enqueue_message(&new)).await?;
        Ok(message.id)
    }

    /// Pending messages for `agent` across all projects, oldest first.
    pub async fn pending_for(&self, agent: AgentRole) -> Result<Vec<Message>> {
        self.store.call(move |db| db.pending_for(agent)).await
    }

    /// The message `agent` should consume next within one project.
    pub async fn next_for(&self, project_id: ProjectId, agent: AgentRole) -> Result<Option<Message>> {
        self.store
            .call(move |db| db.next_input(project_id, agent))
            .await
    }

    pub async fn mark_status(&self, id: MessageId, status: MessageStatus) -> Result<bool> {
        self.store
            .call(move |db| db.mark_message_status(id, status))
            .await
    }

    pub async fn get(&self, id: MessageId) -> Result<Option<Message>> {
        self.store.call(move |db| db.get_message(id)).await
    }

    /// A project's communication log in delivery order.
    pub async fn history(&self, project_id: ProjectId, limit: Option<u32>) -> Result<Vec<Message>> {
        self.store
            .call(move |db| db.list_messages(project_id, limit))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{NewProject, PipelineDb};
    use serde_json::json;

    fn setup() -> (MessageQueue, ProjectId) {
        let store = StoreHandle::new(PipelineDb::new_in_memory().unwrap());
        let id = store
            .lock_sync()
            .unwrap()
            .create_project(&NewProject::new("req"))
            .unwrap()
            .id;
        (MessageQueue::new(store), id)
    }

    #[tokio::test]
    async fn test_enqueue_infers_kind_and_stage() {
        let (queue, id) = setup();
        let handoff = queue
            .enqueue(AgentRole::Analyst, AgentRole::Architect, id, json!({"a": 1}), Some(0.9))
            .await
            .unwrap();
        let decision = queue
            .enqueue(AgentRole::Human, AgentRole::Developer, id, json!({"choice": "go"}), None)
            .await
            .unwrap();

        let handoff = queue.get(handoff).await.unwrap().unwrap();
        assert_eq!(handoff.kind, MessageKind::Handoff);
        assert_eq!(handoff.stage, Stage::Analyzing);
        assert_eq!(handoff.status, MessageStatus::Pending);
        assert_eq!(handoff.confidence, Some(0.9));

        let decision = queue.get(decision).await.unwrap().unwrap();
        assert_eq!(decision.kind, MessageKind::Decision);
        assert_eq!(decision.stage, Stage::Developing);
    }

    #[tokio::test]
    async fn test_delivery_is_fifo_and_status_filters() {
        let (queue, id) = setup();
        let mut ids = Vec::new();
        for n in 0..3 {
            ids.push(
                queue
                    .enqueue(AgentRole::Analyst, AgentRole::Architect, id, json!({"n": n}), None)
                    .await
                    .unwrap(),
            );
        }
        let pending = queue.pending_for(AgentRole::Architect).await.unwrap();
        assert_eq!(pending.iter().map(|m| m.id).collect::<Vec<_>>(), ids);

        assert!(queue.mark_status(ids[0], MessageStatus::Completed).await.unwrap());
        let next = queue.next_for(id, AgentRole::Architect).await.unwrap().unwrap();
        assert_eq!(next.id, ids[1]);
        assert_eq!(queue.pending_for(AgentRole::Architect).await.unwrap().len(), 2);
        assert!(queue.pending_for(AgentRole::Tester).await.unwrap().is_empty());

        assert_eq!(queue.history(id, None).await.unwrap().len(), 3);
        assert_eq!(queue.history(id, Some(1)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_mark_unknown_message() {
        let (queue, _id) = setup();
        assert!(!queue
            .mark_status(MessageId::new(), MessageStatus::Error)
            .await
            .unwrap());
    }
}
