use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::{AcceptanceCriteria, AgentId, CorrelationId, TaskId, TaskStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub timeout_seconds: u64,
    /// Remaining retries. Decremented on quality-gate rejection or execution failure.
    pub retry_count: u32,
    pub quality_threshold: f32,
}

impl TaskConfig {
    /// Longest accepted `timeout_seconds`: one year.
    pub const MAX_TIMEOUT_SECONDS: u64 = 365 * 24 * 60 * 60;
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 1800,
            retry_count: 3,
            quality_threshold: 0.7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskNote {
    pub author: String,
    pub content: String,
    pub recorded_at: DateTime<Utc>,
}

impl TaskNote {
    pub fn new(author: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            author: author.into(),
            content: content.into(),
            recorded_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDraft {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub dependencies: BTreeSet<TaskId>,
    #[serde(default)]
    pub required_specializations: BTreeSet<String>,
    #[serde(default)]
    pub acceptance: AcceptanceCriteria,
    #[serde(default)]
    pub config: Option<TaskConfig>,
}

impl TaskDraft {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            priority: 0,
            dependencies: BTreeSet::new(),
            required_specializations: BTreeSet::new(),
            acceptance: AcceptanceCriteria::default(),
            config: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on(mut self, task_id: TaskId) -> Self {
        self.dependencies.insert(task_id);
        self
    }

    pub fn requires(mut self, specialization: impl Into<String>) -> Self {
        self.required_specializations.insert(specialization.into());
        self
    }

    pub fn with_requirement(mut self, requirement: impl Into<String>) -> Self {
        self.acceptance.requirements.push(requirement.into());
        self
    }

    pub fn with_config(mut self, config: TaskConfig) -> Self {
        self.config = Some(config);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    /// Lower is more urgent.
    pub priority: i32,
    /// Creation order. Total tie-break for equal priorities.
    pub sequence: u64,
    pub dependencies: BTreeSet<TaskId>,
    pub required_specializations: BTreeSet<String>,
    pub acceptance: AcceptanceCriteria,
    pub assigned_agent_id: Option<AgentId>,
    pub progress: f32,
    pub config: TaskConfig,
    pub context: Vec<TaskNote>,
    pub attempts: u32,
    pub active_correlation: Option<CorrelationId>,
    pub failure_reason: Option<String>,
    pub first_started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn from_draft(draft: TaskDraft, sequence: u64, defaults: TaskConfig) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new_v4(),
            title: draft.title,
            description: draft.description,
            status: TaskStatus::Pending,
            priority: draft.priority,
            sequence,
            dependencies: draft.dependencies,
            required_specializations: draft.required_specializations,
            acceptance: draft.acceptance,
            assigned_agent_id: None,
            progress: 0.0,
            config: draft.config.unwrap_or(defaults),
            context: Vec::new(),
            attempts: 0,
            active_correlation: None,
            failure_reason: None,
            first_started_at: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall-clock deadline across every attempt, once the task has started.
    /// `None` when the budget does not fit in a timestamp.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        let started = self.first_started_at?;
        let secs = i64::try_from(self.config.timeout_seconds).ok()?;
        started.checked_add_signed(chrono::Duration::try_seconds(secs)?)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
