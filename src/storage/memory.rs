use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::storage::traits::Storage;
use crate::types::{
    CoordinationSession, Message, MessageId, SessionId, SessionReport, Task, TaskId,
};

/// Process-local append log. Every appended version is kept; reads return the latest.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    sessions: Arc<RwLock<HashMap<SessionId, Vec<CoordinationSession>>>>,
    reports: Arc<RwLock<HashMap<SessionId, SessionReport>>>,
    tasks: Arc<RwLock<HashMap<TaskId, Vec<(SessionId, Task)>>>>,
    messages: Arc<RwLock<HashMap<MessageId, Message>>>,
    session_messages: Arc<RwLock<HashMap<SessionId, Vec<MessageId>>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn task_versions(&self, id: TaskId) -> usize {
        self.tasks.read().await.get(&id).map(Vec::len).unwrap_or(0)
    }
}

#[async_trait]
impl Storage for InMemoryStore {
    async fn append_session(&self, session: &CoordinationSession) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        sessions.entry(session.id).or_default().push(session.clone());
        Ok(())
    }

    async fn get_session(&self, id: SessionId) -> Result<Option<CoordinationSession>> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(&id).and_then(|v| v.last()).cloned())
    }

    async fn append_report(&self, report: &SessionReport) -> Result<()> {
        let mut reports = self.reports.write().await;
        reports.insert(report.session_id, report.clone());
        Ok(())
    }

    async fn get_report(&self, session_id: SessionId) -> Result<Option<SessionReport>> {
        Ok(self.reports.read().await.get(&session_id).cloned())
    }

    async fn append_task(&self, session_id: SessionId, task: &Task) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        tasks.entry(task.id).or_default().push((session_id, task.clone()));
        Ok(())
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        let tasks = self.tasks.read().await;
        Ok(tasks.get(&id).and_then(|v| v.last()).map(|(_, t)| t.clone()))
    }

    async fn append_message(&self, message: &Message) -> Result<()> {
        let mut messages = self.messages.write().await;
        if messages.contains_key(&message.id) {
            anyhow::bail!("message {} already appended", message.id);
        }
        messages.insert(message.id, message.clone());
        drop(messages);

        let mut index = self.session_messages.write().await;
        index.entry(message.session_id).or_default().push(message.id);
        Ok(())
    }

    async fn get_message(&self, id: MessageId) -> Result<Option<Message>> {
        Ok(self.messages.read().await.get(&id).cloned())
    }

    async fn list_session_messages(&self, session_id: SessionId) -> Result<Vec<Message>> {
        let index = self.session_messages.read().await;
        let messages = self.messages.read().await;
        Ok(index
            .get(&session_id)
            .map(|ids| ids.iter().filter_map(|id| messages.get(id).cloned()).collect())
            .unwrap_or_default())
    }
}
