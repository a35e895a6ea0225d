use serde_json::json;
use std::collections::{BTreeSet, HashMap};

use crate::engine::graph::detect_cycle;
use crate::error::{CoordinationError, CoordinationResult};
use crate::lifecycle::TaskStateMachine;
use crate::notification::EventBus;
use crate::types::{
    AgentId, CorrelationId, Event, EventType, Task, TaskConfig, TaskDraft, TaskId, TaskNote,
    TaskStatus,
};

/// Tasks of one coordination session, their dependency DAG and status.
///
/// Not internally synchronized: the owning coordinator is the single writer.
pub struct TaskStore {
    tasks: HashMap<TaskId, Task>,
    next_sequence: u64,
    defaults: TaskConfig,
    events: EventBus,
}

impl TaskStore {
    pub fn new(defaults: TaskConfig, events: EventBus) -> Self {
        Self {
            tasks: HashMap::new(),
            next_sequence: 0,
            defaults,
            events,
        }
    }

    pub fn create(&mut self, draft: TaskDraft) -> CoordinationResult<Task> {
        if draft.title.trim().is_empty() {
            return Err(CoordinationError::Validation(
                "task title must not be empty".to_string(),
            ));
        }
        if let Some(config) = &draft.config {
            if !(0.0..=1.0).contains(&config.quality_threshold) {
                return Err(CoordinationError::Validation(format!(
                    "quality threshold {} outside [0, 1]",
                    config.quality_threshold
                )));
            }
            if !(1..=TaskConfig::MAX_TIMEOUT_SECONDS).contains(&config.timeout_seconds) {
                return Err(CoordinationError::Validation(format!(
                    "timeout of {}s outside [1, {}]",
                    config.timeout_seconds,
                    TaskConfig::MAX_TIMEOUT_SECONDS
                )));
            }
        }
        for dep in &draft.dependencies {
            let dependency = self.tasks.get(dep).ok_or_else(|| {
                CoordinationError::Validation(format!("unknown dependency {}", dep))
            })?;
            if matches!(dependency.status, TaskStatus::Failed | TaskStatus::Cancelled) {
                return Err(CoordinationError::Validation(format!(
                    "dependency {} is {} and can never complete",
                    dep,
                    dependency.status.as_str()
                )));
            }
        }

        let mut task = Task::from_draft(draft, self.next_sequence, self.defaults.clone());
        self.ensure_acyclic(task.id, &task.dependencies)?;

        if !self.dependencies_met(&task) {
            task.status = TaskStatus::Blocked;
        }
        self.next_sequence += 1;

        log::debug!(
            "created task {} '{}' ({})",
            task.id,
            task.title,
            task.status.as_str()
        );
        self.events.publish(
            Event::new(EventType::TaskCreated, task.id)
                .with_payload(json!({ "title": task.title, "status": task.status.as_str() })),
        );

        self.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    pub fn add_dependency(
        &mut self,
        task_id: &TaskId,
        dependency_id: &TaskId,
    ) -> CoordinationResult<Task> {
        if !self.tasks.contains_key(dependency_id) {
            return Err(CoordinationError::TaskNotFound(*dependency_id));
        }
        let task = self.get_existing(task_id)?;
        if !matches!(task.status, TaskStatus::Pending | TaskStatus::Blocked) {
            return Err(CoordinationError::Validation(format!(
                "cannot add dependencies to a task that is {}",
                task.status.as_str()
            )));
        }

        let mut deps = task.dependencies.clone();
        deps.insert(*dependency_id);
        self.ensure_acyclic(*task_id, &deps)?;

        let dependency_done = self.tasks[dependency_id].status == TaskStatus::Completed;
        let task = self.get_mut(task_id)?;
        task.dependencies = deps;
        task.touch();
        if !dependency_done && task.status == TaskStatus::Pending {
            self.transition(task_id, TaskStatus::Blocked)?;
        }
        self.get(task_id)
    }

    pub fn assign(&mut self, task_id: &TaskId, agent_id: AgentId) -> CoordinationResult<()> {
        let task = self.get_existing(task_id)?;
        if !matches!(task.status, TaskStatus::Pending | TaskStatus::Blocked)
            || !self.dependencies_met(task)
        {
            return Err(CoordinationError::task_transition(
                *task_id,
                task.status,
                TaskStatus::Assigned,
            ));
        }

        self.transition(task_id, TaskStatus::Assigned)?;
        let task = self.get_mut(task_id)?;
        task.assigned_agent_id = Some(agent_id);
        Ok(())
    }

    pub fn start(&mut self, task_id: &TaskId, correlation_id: CorrelationId) -> CoordinationResult<()> {
        self.transition(task_id, TaskStatus::InProgress)?;
        let task = self.get_mut(task_id)?;
        task.attempts += 1;
        task.active_correlation = Some(correlation_id);
        if task.first_started_at.is_none() {
            task.first_started_at = Some(task.updated_at);
        }
        Ok(())
    }

    pub fn redispatch(&mut self, task_id: &TaskId, correlation_id: CorrelationId) -> CoordinationResult<()> {
        let task = self.get_mut(task_id)?;
        if task.status != TaskStatus::InProgress {
            return Err(CoordinationError::task_transition(
                *task_id,
                task.status,
                TaskStatus::InProgress,
            ));
        }
        task.active_correlation = Some(correlation_id);
        task.touch();
        Ok(())
    }

    pub fn advance(&mut self, task_id: &TaskId, progress: f32) -> CoordinationResult<()> {
        if !(0.0..=1.0).contains(&progress) {
            return Err(CoordinationError::Validation(format!(
                "progress {} outside [0, 1]",
                progress
            )));
        }

        let task = self.get_mut(task_id)?;
        if task.status != TaskStatus::InProgress {
            return Err(CoordinationError::Validation(format!(
                "task {} is {}, progress only applies while in_progress",
                task_id,
                task.status.as_str()
            )));
        }
        if progress < task.progress {
            return Err(CoordinationError::Validation(format!(
                "progress must not decrease ({} -> {})",
                task.progress, progress
            )));
        }

        let previous = task.progress;
        task.progress = progress;
        task.touch();
        self.events.publish(
            Event::new(EventType::TaskProgress, *task_id)
                .with_payload(json!({ "previous": previous, "progress": progress })),
        );
        Ok(())
    }

    /// Completes the task and unblocks dependents. Completing twice is a no-op.
    /// Returns the tasks moved from `blocked` to `pending`.
    pub fn complete(&mut self, task_id: &TaskId) -> CoordinationResult<Vec<TaskId>> {
        if self.get_existing(task_id)?.status == TaskStatus::Completed {
            return Ok(Vec::new());
        }

        self.transition(task_id, TaskStatus::Completed)?;
        let task = self.get_mut(task_id)?;
        task.progress = 1.0;
        task.active_correlation = None;
        log::info!("task {} '{}' completed", task.id, task.title);
        self.events.publish(Event::new(EventType::TaskCompleted, *task_id));

        self.unblock_dependents(task_id)
    }

    /// Fails the task and cancels everything that depends on it.
    /// Failing an already failed task is a no-op.
    pub fn fail(&mut self, task_id: &TaskId, reason: &str) -> CoordinationResult<Vec<TaskId>> {
        if self.get_existing(task_id)?.status == TaskStatus::Failed {
            return Ok(Vec::new());
        }

        self.transition(task_id, TaskStatus::Failed)?;
        let task = self.get_mut(task_id)?;
        task.failure_reason = Some(reason.to_string());
        task.active_correlation = None;
        log::warn!("task {} '{}' failed: {}", task.id, task.title, reason);
        self.events.publish(
            Event::new(EventType::TaskFailed, *task_id).with_payload(json!({ "reason": reason })),
        );

        self.cancel_dependents(task_id)
    }

    /// Cancels a non-terminal task and its dependents. Cancelling twice is a no-op.
    pub fn cancel(&mut self, task_id: &TaskId, reason: &str) -> CoordinationResult<Vec<TaskId>> {
        if self.get_existing(task_id)?.status == TaskStatus::Cancelled {
            return Ok(Vec::new());
        }

        self.transition(task_id, TaskStatus::Cancelled)?;
        let task = self.get_mut(task_id)?;
        task.failure_reason = Some(reason.to_string());
        task.active_correlation = None;

        let mut cancelled = vec![*task_id];
        cancelled.extend(self.cancel_dependents(task_id)?);
        Ok(cancelled)
    }

    pub fn requeue(&mut self, task_id: &TaskId, note: Option<TaskNote>) -> CoordinationResult<()> {
        self.transition(task_id, TaskStatus::Pending)?;
        let task = self.get_mut(task_id)?;
        task.assigned_agent_id = None;
        task.active_correlation = None;
        if let Some(note) = note {
            task.context.push(note);
        }
        Ok(())
    }

    pub fn consume_retry(&mut self, task_id: &TaskId) -> CoordinationResult<u32> {
        let task = self.get_mut(task_id)?;
        task.config.retry_count = task.config.retry_count.saturating_sub(1);
        task.touch();
        Ok(task.config.retry_count)
    }

    pub fn add_note(&mut self, task_id: &TaskId, note: TaskNote) -> CoordinationResult<()> {
        let task = self.get_mut(task_id)?;
        task.context.push(note);
        task.touch();
        Ok(())
    }

    pub fn get(&self, task_id: &TaskId) -> CoordinationResult<Task> {
        self.get_existing(task_id).cloned()
    }

    pub fn contains(&self, task_id: &TaskId) -> bool {
        self.tasks.contains_key(task_id)
    }

    pub fn list(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.sequence);
        tasks
    }

    /// Pending tasks in scheduling order: lowest priority number first, then FIFO.
    pub fn actionable(&self) -> Vec<TaskId> {
        let mut ready: Vec<&Task> = self
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending && self.dependencies_met(t))
            .collect();
        ready.sort_by_key(|t| (t.priority, t.sequence));
        ready.into_iter().map(|t| t.id).collect()
    }

    pub fn next_actionable(&self) -> Option<TaskId> {
        self.actionable().into_iter().next()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn all_terminal(&self) -> bool {
        self.tasks.values().all(|t| t.is_terminal())
    }

    pub fn non_terminal(&self) -> Vec<TaskId> {
        let mut open: Vec<&Task> = self.tasks.values().filter(|t| !t.is_terminal()).collect();
        open.sort_by_key(|t| t.sequence);
        open.into_iter().map(|t| t.id).collect()
    }

    fn dependencies_met(&self, task: &Task) -> bool {
        task.dependencies.iter().all(|dep| {
            self.tasks
                .get(dep)
                .map(|d| d.status == TaskStatus::Completed)
                .unwrap_or(false)
        })
    }

    fn ensure_acyclic(&self, task_id: TaskId, deps: &BTreeSet<TaskId>) -> CoordinationResult<()> {
        let mut graph: HashMap<TaskId, BTreeSet<TaskId>> = self
            .tasks
            .values()
            .map(|t| (t.id, t.dependencies.clone()))
            .collect();
        graph.insert(task_id, deps.clone());

        match detect_cycle(&graph) {
            Some(cycle) => Err(CoordinationError::TaskDependencyCycle(cycle)),
            None => Ok(()),
        }
    }

    fn dependents_of(&self, task_id: &TaskId) -> Vec<TaskId> {
        let mut dependents: Vec<&Task> = self
            .tasks
            .values()
            .filter(|t| t.dependencies.contains(task_id))
            .collect();
        dependents.sort_by_key(|t| t.sequence);
        dependents.into_iter().map(|t| t.id).collect()
    }

    fn unblock_dependents(&mut self, task_id: &TaskId) -> CoordinationResult<Vec<TaskId>> {
        let mut unblocked = Vec::new();
        for dependent in self.dependents_of(task_id) {
            let ready = {
                let task = self.get_existing(&dependent)?;
                task.status == TaskStatus::Blocked && self.dependencies_met(task)
            };
            if ready {
                self.transition(&dependent, TaskStatus::Pending)?;
                unblocked.push(dependent);
            }
        }
        Ok(unblocked)
    }

    fn cancel_dependents(&mut self, task_id: &TaskId) -> CoordinationResult<Vec<TaskId>> {
        let title = self.get_existing(task_id)?.title.clone();
        let mut cancelled = Vec::new();
        for dependent in self.dependents_of(task_id) {
            if self.get_existing(&dependent)?.is_terminal() {
                continue;
            }
            let reason = format!("dependency '{}' did not complete", title);
            cancelled.extend(self.cancel(&dependent, &reason)?);
        }
        Ok(cancelled)
    }

    fn transition(&mut self, task_id: &TaskId, to: TaskStatus) -> CoordinationResult<TaskStatus> {
        let task = self.get_mut(task_id)?;
        let from = TaskStateMachine::transition(task, to)?;
        log::debug!("task {} {} -> {}", task_id, from.as_str(), to.as_str());
        self.events.publish(Event::transition(
            EventType::TaskStatusUpdate,
            *task_id,
            from.as_str(),
            to.as_str(),
        ));
        Ok(from)
    }

    fn get_existing(&self, task_id: &TaskId) -> CoordinationResult<&Task> {
        self.tasks
            .get(task_id)
            .ok_or(CoordinationError::TaskNotFound(*task_id))
    }

    fn get_mut(&mut self, task_id: &TaskId) -> CoordinationResult<&mut Task> {
        self.tasks
            .get_mut(task_id)
            .ok_or(CoordinationError::TaskNotFound(*task_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_store() -> TaskStore {
        TaskStore::new(TaskConfig::default(), EventBus::new())
    }

    fn start(store: &mut TaskStore, id: &TaskId) {
        store.assign(id, AgentId::new_v4()).unwrap();
        store.start(id, CorrelationId::new_v4()).unwrap();
    }

    #[test]
    fn test_out_of_range_timeout_is_rejected() {
        let mut store = create_test_store();
        for timeout_seconds in [0, TaskConfig::MAX_TIMEOUT_SECONDS + 1, u64::MAX / 2] {
            let draft = TaskDraft::new("Slow", "").with_config(TaskConfig {
                timeout_seconds,
                ..TaskConfig::default()
            });
            let err = store.create(draft).unwrap_err();
            assert!(matches!(err, CoordinationError::Validation(_)), "{:?}", err);
        }
        assert!(store.is_empty());

        let draft = TaskDraft::new("Year long", "").with_config(TaskConfig {
            timeout_seconds: TaskConfig::MAX_TIMEOUT_SECONDS,
            ..TaskConfig::default()
        });
        assert!(store.create(draft).is_ok());
    }

    #[test]
    fn test_deadline_overflow_means_no_deadline() {
        let mut store = create_test_store();
        let task = store.create(TaskDraft::new("A", "")).unwrap();
        start(&mut store, &task.id);

        let mut task = store.get(&task.id).unwrap();
        let started = task.first_started_at.unwrap();
        assert_eq!(task.deadline(), Some(started + chrono::Duration::seconds(1800)));

        for timeout_seconds in [u64::MAX, u64::MAX / 2, i64::MAX as u64] {
            task.config.timeout_seconds = timeout_seconds;
            assert_eq!(task.deadline(), None);
        }
    }

    #[test]
    fn test_dependent_task_blocked_until_dependency_completes() {
        let mut store = create_test_store();
        let a = store.create(TaskDraft::new("A", "first")).unwrap();
        let b = store
            .create(TaskDraft::new("B", "second").depends_on(a.id))
            .unwrap();
        assert_eq!(b.status, TaskStatus::Blocked);
        assert!(store.assign(&b.id, AgentId::new_v4()).is_err());

        start(&mut store, &a.id);
        let unblocked = store.complete(&a.id).unwrap();

        assert_eq!(unblocked, vec![b.id]);
        assert_eq!(store.get(&b.id).unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn test_complete_is_idempotent() {
        let mut store = create_test_store();
        let a = store.create(TaskDraft::new("A", "a")).unwrap();
        start(&mut store, &a.id);

        store.complete(&a.id).unwrap();
        let first = store.get(&a.id).unwrap();
        let second_result = store.complete(&a.id).unwrap();
        let second = store.get(&a.id).unwrap();

        assert!(second_result.is_empty());
        assert_eq!(first.status, second.status);
        assert_eq!(first.finished_at, second.finished_at);
        assert_eq!(first.progress, second.progress);
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let mut store = create_test_store();
        let result = store.create(TaskDraft::new("A", "a").depends_on(TaskId::new_v4()));
        assert!(matches!(result, Err(CoordinationError::Validation(_))));
    }

    #[test]
    fn test_add_dependency_rejects_cycle() {
        let mut store = create_test_store();
        let a = store.create(TaskDraft::new("A", "a")).unwrap();
        let b = store.create(TaskDraft::new("B", "b").depends_on(a.id)).unwrap();
        let c = store.create(TaskDraft::new("C", "c").depends_on(b.id)).unwrap();

        let result = store.add_dependency(&a.id, &c.id);
        assert!(matches!(
            result,
            Err(CoordinationError::TaskDependencyCycle(_))
        ));
        assert!(store.get(&a.id).unwrap().dependencies.is_empty());

        let result = store.add_dependency(&a.id, &a.id);
        assert!(matches!(
            result,
            Err(CoordinationError::TaskDependencyCycle(_))
        ));
    }

    #[test]
    fn test_add_dependency_blocks_pending_task() {
        let mut store = create_test_store();
        let a = store.create(TaskDraft::new("A", "a")).unwrap();
        let b = store.create(TaskDraft::new("B", "b")).unwrap();

        let updated = store.add_dependency(&b.id, &a.id).unwrap();
        assert_eq!(updated.status, TaskStatus::Blocked);
    }

    #[test]
    fn test_progress_is_monotonic() {
        let mut store = create_test_store();
        let a = store.create(TaskDraft::new("A", "a")).unwrap();
        assert!(store.advance(&a.id, 0.2).is_err());

        start(&mut store, &a.id);
        store.advance(&a.id, 0.4).unwrap();
        store.advance(&a.id, 0.4).unwrap();
        assert!(store.advance(&a.id, 0.3).is_err());
        assert!(store.advance(&a.id, 1.5).is_err());
        assert_eq!(store.get(&a.id).unwrap().progress, 0.4);
    }

    #[test]
    fn test_failure_cancels_dependents() {
        let mut store = create_test_store();
        let a = store.create(TaskDraft::new("A", "a")).unwrap();
        let b = store.create(TaskDraft::new("B", "b").depends_on(a.id)).unwrap();
        let c = store.create(TaskDraft::new("C", "c").depends_on(b.id)).unwrap();
        start(&mut store, &a.id);

        let cancelled = store.fail(&a.id, "broken build").unwrap();

        assert_eq!(cancelled, vec![b.id, c.id]);
        assert_eq!(store.get(&c.id).unwrap().status, TaskStatus::Cancelled);
        assert!(store.all_terminal());
    }

    #[test]
    fn test_actionable_order_priority_then_fifo() {
        let mut store = create_test_store();
        let low = store.create(TaskDraft::new("low", "l").with_priority(5)).unwrap();
        let first = store.create(TaskDraft::new("first", "f").with_priority(1)).unwrap();
        let second = store.create(TaskDraft::new("second", "s").with_priority(1)).unwrap();

        assert_eq!(store.actionable(), vec![first.id, second.id, low.id]);
    }

    #[test]
    fn test_requeue_clears_assignment() {
        let mut store = create_test_store();
        let a = store.create(TaskDraft::new("A", "a")).unwrap();
        start(&mut store, &a.id);

        store
            .requeue(&a.id, Some(TaskNote::new("manager", "try again")))
            .unwrap();

        let task = store.get(&a.id).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.assigned_agent_id.is_none());
        assert_eq!(task.context.len(), 1);
        assert_eq!(task.attempts, 1);
    }

    #[test]
    fn test_cancel_terminal_task_rejected() {
        let mut store = create_test_store();
        let a = store.create(TaskDraft::new("A", "a")).unwrap();
        start(&mut store, &a.id);
        store.complete(&a.id).unwrap();

        assert!(matches!(
            store.cancel(&a.id, "late"),
            Err(CoordinationError::InvalidTransition { .. })
        ));
    }
}
