use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Agent, AgentId, Message, SessionId, Task, TaskId, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    Success,
    PartialSuccess,
    Failure,
    Cancelled,
}

impl SessionOutcome {
    pub fn as_str(&self) -> &str {
        match self {
            SessionOutcome::Success => "success",
            SessionOutcome::PartialSuccess => "partial_success",
            SessionOutcome::Failure => "failure",
            SessionOutcome::Cancelled => "cancelled",
        }
    }

    pub fn aggregate(tasks: &[Task]) -> Self {
        let completed = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .count();
        if completed == tasks.len() {
            SessionOutcome::Success
        } else if completed == 0 {
            SessionOutcome::Failure
        } else {
            SessionOutcome::PartialSuccess
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationSession {
    pub id: SessionId,
    pub goal: String,
    pub iteration: u32,
    pub max_iterations: u32,
    pub manager_id: Option<AgentId>,
    pub worker_ids: Vec<AgentId>,
    /// Ordered log of every message exchanged in the session.
    pub context: Vec<Message>,
    pub result: Option<SessionOutcome>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl CoordinationSession {
    pub fn new(goal: impl Into<String>, max_iterations: u32) -> Self {
        Self {
            id: SessionId::new_v4(),
            goal: goal.into(),
            iteration: 0,
            max_iterations,
            manager_id: None,
            worker_ids: Vec::new(),
            context: Vec::new(),
            result: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.result.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: TaskId,
    pub title: String,
    pub status: TaskStatus,
    pub attempts: u32,
    pub reason: Option<String>,
}

impl From<&Task> for TaskSummary {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id,
            title: task.title.clone(),
            status: task.status,
            attempts: task.attempts,
            reason: task.failure_reason.clone(),
        }
    }
}

/// Terminal result of a session. Partial progress is always itemised.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: SessionId,
    pub outcome: SessionOutcome,
    pub iterations: u32,
    pub succeeded: Vec<TaskSummary>,
    pub failed: Vec<TaskSummary>,
    /// Attempted at least once but stopped before reaching a result.
    pub interrupted: Vec<TaskSummary>,
    pub never_attempted: Vec<TaskSummary>,
    pub diagnostic: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl SessionReport {
    pub fn from_tasks(
        session_id: SessionId,
        outcome: SessionOutcome,
        iterations: u32,
        tasks: &[Task],
        diagnostic: Option<String>,
    ) -> Self {
        let mut report = Self {
            session_id,
            outcome,
            iterations,
            succeeded: Vec::new(),
            failed: Vec::new(),
            interrupted: Vec::new(),
            never_attempted: Vec::new(),
            diagnostic,
            finished_at: Utc::now(),
        };

        let mut ordered: Vec<&Task> = tasks.iter().collect();
        ordered.sort_by_key(|t| t.sequence);

        for task in ordered {
            let summary = TaskSummary::from(task);
            match task.status {
                TaskStatus::Completed => report.succeeded.push(summary),
                TaskStatus::Failed => report.failed.push(summary),
                _ if task.attempts == 0 => report.never_attempted.push(summary),
                _ => report.interrupted.push(summary),
            }
        }

        report
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub goal: String,
    pub running: bool,
    pub iteration: u32,
    pub max_iterations: u32,
    pub agents: Vec<Agent>,
    pub tasks: Vec<Task>,
    pub report: Option<SessionReport>,
    pub updated_at: DateTime<Utc>,
}

impl SessionSnapshot {
    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| &t.id == id)
    }

    pub fn agent(&self, id: &AgentId) -> Option<&Agent> {
        self.agents.iter().find(|a| &a.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TaskConfig, TaskDraft};

    fn task_with(status: TaskStatus, attempts: u32, seq: u64) -> Task {
        let mut task = Task::from_draft(TaskDraft::new("t", "d"), seq, TaskConfig::default());
        task.status = status;
        task.attempts = attempts;
        task
    }

    #[test]
    fn test_aggregate_outcomes() {
        let all_done = vec![task_with(TaskStatus::Completed, 1, 0)];
        assert_eq!(SessionOutcome::aggregate(&all_done), SessionOutcome::Success);

        let mixed = vec![
            task_with(TaskStatus::Completed, 1, 0),
            task_with(TaskStatus::Failed, 3, 1),
        ];
        assert_eq!(SessionOutcome::aggregate(&mixed), SessionOutcome::PartialSuccess);

        let none = vec![task_with(TaskStatus::Cancelled, 0, 0)];
        assert_eq!(SessionOutcome::aggregate(&none), SessionOutcome::Failure);
    }

    #[test]
    fn test_report_buckets() {
        let tasks = vec![
            task_with(TaskStatus::Completed, 1, 0),
            task_with(TaskStatus::Failed, 2, 1),
            task_with(TaskStatus::Cancelled, 0, 2),
            task_with(TaskStatus::Cancelled, 1, 3),
        ];
        let report = SessionReport::from_tasks(
            SessionId::new_v4(),
            SessionOutcome::PartialSuccess,
            4,
            &tasks,
            None,
        );
        assert_eq!(report.succeeded.len(), 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.never_attempted.len(), 1);
        assert_eq!(report.interrupted.len(), 1);
    }
}
