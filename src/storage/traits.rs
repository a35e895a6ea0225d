use anyhow::Result;
use async_trait::async_trait;

use crate::types::{
    CoordinationSession, Message, MessageId, SessionId, SessionReport, Task, TaskId,
};

/// Durable append log for sessions, tasks and messages.
///
/// Every write is an append; reads return the latest appended version of an
/// entity. No multi-row transactional guarantees are assumed.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn append_session(&self, session: &CoordinationSession) -> Result<()>;
    async fn get_session(&self, id: SessionId) -> Result<Option<CoordinationSession>>;

    async fn append_report(&self, report: &SessionReport) -> Result<()>;
    async fn get_report(&self, session_id: SessionId) -> Result<Option<SessionReport>>;

    async fn append_task(&self, session_id: SessionId, task: &Task) -> Result<()>;
    async fn get_task(&self, id: TaskId) -> Result<Option<Task>>;

    async fn append_message(&self, message: &Message) -> Result<()>;
    async fn get_message(&self, id: MessageId) -> Result<Option<Message>>;
    async fn list_session_messages(&self, session_id: SessionId) -> Result<Vec<Message>>;
}
