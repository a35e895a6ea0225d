use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{AgentId, CompletionSignal, CorrelationId, MessageId, SessionId, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    TaskAssignment,
    ProgressReport,
    CompletionReport,
    Intervention,
    ErrorReport,
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::TaskAssignment => "task_assignment",
            MessageType::ProgressReport => "progress_report",
            MessageType::CompletionReport => "completion_report",
            MessageType::Intervention => "intervention",
            MessageType::ErrorReport => "error_report",
        }
    }

    pub fn for_response(signal: CompletionSignal) -> Self {
        match signal {
            CompletionSignal::Done => MessageType::CompletionReport,
            CompletionSignal::Blocked => MessageType::ErrorReport,
            CompletionSignal::Working | CompletionSignal::Unknown => MessageType::ProgressReport,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub task_id: Option<TaskId>,
    pub content: String,
    #[serde(default)]
    pub signal: Option<CompletionSignal>,
    #[serde(default)]
    pub data: Option<Value>,
}

/// Immutable once constructed; sessions keep an append-only log of these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub session_id: SessionId,
    pub message_type: MessageType,
    pub correlation_id: CorrelationId,
    pub from_agent_id: Option<AgentId>,
    pub to_agent_id: Option<AgentId>,
    pub payload: MessagePayload,
    pub sent_at: DateTime<Utc>,
}

impl Message {
    pub fn new(
        session_id: SessionId,
        message_type: MessageType,
        from_agent_id: Option<AgentId>,
        to_agent_id: Option<AgentId>,
        task_id: Option<TaskId>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: MessageId::new_v4(),
            session_id,
            message_type,
            correlation_id: CorrelationId::new_v4(),
            from_agent_id,
            to_agent_id,
            payload: MessagePayload {
                task_id,
                content: content.into(),
                signal: None,
                data: None,
            },
            sent_at: Utc::now(),
        }
    }

    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_signal(mut self, signal: CompletionSignal) -> Self {
        self.payload.signal = Some(signal);
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.payload.data = Some(data);
        self
    }

    pub fn reply(&self, message_type: MessageType, content: impl Into<String>) -> Self {
        Self::new(
            self.session_id,
            message_type,
            self.to_agent_id,
            self.from_agent_id,
            self.payload.task_id,
            content,
        )
        .with_correlation(self.correlation_id)
    }

    pub fn task_id(&self) -> Option<TaskId> {
        self.payload.task_id
    }

    pub fn content(&self) -> &str {
        &self.payload.content
    }
}
