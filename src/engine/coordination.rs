use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex, MutexGuard, Notify};
use tokio_util::sync::CancellationToken;

use crate::config::{Config, CoordinatorConfig};
use crate::engine::registry::{AgentRegistry, AgentUpdate};
use crate::engine::task_store::TaskStore;
use crate::error::{CoordinationError, CoordinationResult};
use crate::notification::EventBus;
use crate::providers::execution::{ExecutionEngine, ExecutionRequest, ExecutionResponse};
use crate::storage::Storage;
use crate::types::{
    Agent, AgentConfig, AgentFilter, AgentId, AgentStatus, CoordinationSession, Deliverable,
    Event, EventType, Message, MessageId, MessageType, QualityGateResult, SessionId,
    SessionOutcome, SessionReport, SessionSnapshot, Task, TaskDraft, TaskId, TaskNote,
    TaskStatus,
};
use crate::validation::QualityGateEvaluator;

#[derive(Debug, Clone)]
pub struct Exchange {
    pub request: Message,
    pub reply: Message,
    pub response: ExecutionResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateOutcome {
    Completed,
    Requeued { retries_left: u32 },
}

#[derive(Debug, Clone, Default)]
pub struct ScheduleView {
    pub actionable: Vec<TaskId>,
    pub awaiting_dispatch: Vec<TaskId>,
    pub is_empty: bool,
    pub all_terminal: bool,
    pub usable_workers: bool,
    pub next_deadline: Option<DateTime<Utc>>,
    pub expired: Vec<TaskId>,
}

enum RetryOutcome {
    Requeued(u32),
    Exhausted(Vec<TaskId>),
}

struct CoordinatorState {
    session: CoordinationSession,
    registry: AgentRegistry,
    tasks: TaskStore,
    running: bool,
    report: Option<SessionReport>,
}

impl CoordinatorState {
    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session.id,
            goal: self.session.goal.clone(),
            running: self.running,
            iteration: self.session.iteration,
            max_iterations: self.session.max_iterations,
            agents: self.registry.list(),
            tasks: self.tasks.list(),
            report: self.report.clone(),
            updated_at: Utc::now(),
        }
    }

    fn release_agent_of(&mut self, task_id: &TaskId) -> CoordinationResult<()> {
        let task = self.tasks.get(task_id)?;
        if let Some(agent_id) = task.assigned_agent_id {
            if self.registry.contains(&agent_id) {
                self.registry.release_work(&agent_id, task_id)?;
            }
        }
        Ok(())
    }

    fn retry_or_fail(
        &mut self,
        task_id: &TaskId,
        note: TaskNote,
        exhausted_reason: &str,
    ) -> CoordinationResult<RetryOutcome> {
        self.release_agent_of(task_id)?;
        let remaining = self.tasks.consume_retry(task_id)?;
        if remaining == 0 {
            self.tasks.add_note(task_id, note)?;
            let mut touched = vec![*task_id];
            touched.extend(self.tasks.fail(task_id, exhausted_reason)?);
            Ok(RetryOutcome::Exhausted(touched))
        } else {
            self.tasks.requeue(task_id, Some(note))?;
            Ok(RetryOutcome::Requeued(remaining))
        }
    }

    fn cancel_with_release(&mut self, task_id: &TaskId, reason: &str) -> CoordinationResult<Vec<TaskId>> {
        let cancelled = self.tasks.cancel(task_id, reason)?;
        for id in &cancelled {
            self.release_agent_of(id)?;
        }
        Ok(cancelled)
    }

    fn cancel_open_tasks(&mut self, reason: &str) -> Vec<TaskId> {
        let mut touched = Vec::new();
        for task_id in self.tasks.non_terminal() {
            let still_open = self
                .tasks
                .get(&task_id)
                .map(|t| !t.is_terminal())
                .unwrap_or(false);
            if !still_open {
                continue;
            }
            match self.cancel_with_release(&task_id, reason) {
                Ok(ids) => touched.extend(ids),
                Err(e) => log::error!("failed to cancel task {}: {}", task_id, e),
            }
        }
        touched
    }
}

/// Protocol engine for one coordination session.
///
/// All mutations of the session's agents and tasks go through the internal
/// mutex; every mutation publishes a fresh [`SessionSnapshot`] so readers never
/// contend with the writer.
pub struct Coordinator {
    session_id: SessionId,
    config: CoordinatorConfig,
    state: Mutex<CoordinatorState>,
    snapshot: watch::Sender<SessionSnapshot>,
    changed: Notify,
    events: EventBus,
    engine: Arc<dyn ExecutionEngine>,
    storage: Arc<dyn Storage>,
    evaluator: QualityGateEvaluator,
    manager_lock: Mutex<()>,
    cancel: CancellationToken,
}

impl Coordinator {
    pub fn new(
        session: CoordinationSession,
        config: &Config,
        engine: Arc<dyn ExecutionEngine>,
        storage: Arc<dyn Storage>,
        evaluator: QualityGateEvaluator,
    ) -> Self {
        let events = EventBus::new();
        let defaults = config
            .tasks
            .task_config(config.quality_gate.default_threshold);
        let state = CoordinatorState {
            registry: AgentRegistry::new(config.coordinator.max_agents, events.clone()),
            tasks: TaskStore::new(defaults, events.clone()),
            session,
            running: false,
            report: None,
        };
        let (snapshot, _) = watch::channel(state.snapshot());

        Self {
            session_id: state.session.id,
            config: config.coordinator.clone(),
            state: Mutex::new(state),
            snapshot,
            changed: Notify::new(),
            events,
            engine,
            storage,
            evaluator,
            manager_lock: Mutex::new(()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn changed(&self) {
        self.changed.notified().await
    }

    // Agents

    pub async fn create_agent(&self, config: AgentConfig) -> CoordinationResult<Agent> {
        let agent = {
            let mut state = self.state.lock().await;
            let agent = state.registry.create(config)?;
            if agent.is_manager() {
                state.session.manager_id.get_or_insert(agent.id);
            } else {
                state.session.worker_ids.push(agent.id);
            }
            self.commit(state, Vec::new()).await;
            agent
        };

        let prepared = self.engine.prepare(&agent).await;

        let mut state = self.state.lock().await;
        match prepared {
            Ok(()) => {
                state.registry.transition(&agent.id, AgentStatus::Idle)?;
            }
            Err(e) => {
                log::warn!("agent '{}' failed to start: {}", agent.name, e);
                state.registry.transition(&agent.id, AgentStatus::Error)?;
            }
        }
        let agent = state.registry.get(&agent.id)?;
        self.commit(state, Vec::new()).await;
        Ok(agent)
    }

    pub async fn update_agent(&self, agent_id: &AgentId, update: AgentUpdate) -> CoordinationResult<Agent> {
        let mut state = self.state.lock().await;
        let agent = state.registry.update(agent_id, update)?;
        self.commit(state, Vec::new()).await;
        Ok(agent)
    }

    /// Terminates an agent. Work it held goes back to `pending` without
    /// spending a retry.
    pub async fn terminate_agent(&self, agent_id: &AgentId) -> CoordinationResult<Agent> {
        let mut state = self.state.lock().await;
        let agent = state.registry.get(agent_id)?;
        let mut touched = Vec::new();
        for task_id in agent.active_tasks.clone() {
            state.registry.release_work(agent_id, &task_id)?;
            let open = state.tasks.get(&task_id).map(|t| !t.is_terminal()).unwrap_or(false);
            if open {
                state.tasks.requeue(
                    &task_id,
                    Some(TaskNote::new("coordinator", format!("agent '{}' was terminated", agent.name))),
                )?;
                touched.push(task_id);
            }
        }
        state.registry.transition(agent_id, AgentStatus::Terminated)?;
        let agent = state.registry.get(agent_id)?;
        log::info!("terminated agent '{}' ({})", agent.name, agent.id);
        self.commit(state, touched).await;
        Ok(agent)
    }

    pub fn get_agent(&self, agent_id: &AgentId) -> CoordinationResult<Agent> {
        self.snapshot
            .borrow()
            .agent(agent_id)
            .cloned()
            .ok_or(CoordinationError::AgentNotFound(*agent_id))
    }

    pub fn list_agents(&self, filter: &AgentFilter) -> Vec<Agent> {
        self.snapshot
            .borrow()
            .agents
            .iter()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect()
    }

    // Tasks

    pub async fn create_task(&self, draft: TaskDraft) -> CoordinationResult<Task> {
        let mut state = self.state.lock().await;
        let task = state.tasks.create(draft)?;
        self.commit(state, vec![task.id]).await;
        Ok(task)
    }

    pub async fn add_dependency(&self, task_id: &TaskId, dependency_id: &TaskId) -> CoordinationResult<Task> {
        let mut state = self.state.lock().await;
        let task = state.tasks.add_dependency(task_id, dependency_id)?;
        self.commit(state, vec![*task_id]).await;
        Ok(task)
    }

    pub fn get_task(&self, task_id: &TaskId) -> CoordinationResult<Task> {
        self.snapshot
            .borrow()
            .task(task_id)
            .cloned()
            .ok_or(CoordinationError::TaskNotFound(*task_id))
    }

    pub fn list_tasks(&self) -> Vec<Task> {
        self.snapshot.borrow().tasks.clone()
    }

    /// Picks the best idle agent for the task and assigns it.
    ///
    /// Ranking: specialization overlap (descending), current load (ascending),
    /// registration order.
    pub async fn assign_task(&self, task_id: &TaskId) -> CoordinationResult<AgentId> {
        let mut state = self.state.lock().await;
        let task = state.tasks.get(task_id)?;
        let agent_id = state
            .registry
            .select_for(&task, self.config.strict_specialization)
            .ok_or(CoordinationError::TaskAssignmentFailed(*task_id))?;

        state.tasks.assign(task_id, agent_id)?;
        state.registry.assign_work(&agent_id, *task_id)?;
        log::info!("assigned task '{}' to agent {}", task.title, agent_id);
        self.commit(state, vec![*task_id]).await;
        Ok(agent_id)
    }

    pub async fn begin_dispatch(&self, task_id: &TaskId) -> CoordinationResult<Message> {
        let mut state = self.state.lock().await;
        let task = state.tasks.get(task_id)?;
        if task.status != TaskStatus::Assigned {
            return Err(CoordinationError::task_transition(
                *task_id,
                task.status,
                TaskStatus::InProgress,
            ));
        }
        let agent_id = task
            .assigned_agent_id
            .ok_or(CoordinationError::TaskAssignmentFailed(*task_id))?;

        let message = Message::new(
            self.session_id,
            MessageType::TaskAssignment,
            state.session.manager_id,
            Some(agent_id),
            Some(*task_id),
            render_assignment(&task),
        );
        state.tasks.start(task_id, message.correlation_id)?;
        self.commit(state, vec![*task_id]).await;
        Ok(message)
    }

    pub async fn follow_up(&self, task_id: &TaskId) -> CoordinationResult<Message> {
        let mut state = self.state.lock().await;
        let task = state.tasks.get(task_id)?;
        let agent_id = task
            .assigned_agent_id
            .ok_or(CoordinationError::TaskAssignmentFailed(*task_id))?;

        let message = Message::new(
            self.session_id,
            MessageType::TaskAssignment,
            state.session.manager_id,
            Some(agent_id),
            Some(*task_id),
            format!(
                "Continue working on '{}'. Current progress: {:.0}%.\nReport `progress: NN%` and finish with a STATUS line.",
                task.title,
                task.progress * 100.0
            ),
        );
        state.tasks.redispatch(task_id, message.correlation_id)?;
        self.commit(state, vec![*task_id]).await;
        Ok(message)
    }

    /// Timeouts and engine failures requeue the in-flight task (spending a
    /// retry) and move the agent to `error` once it has failed
    /// `consecutive_timeouts_before_error` times in a row.
    pub async fn relay(&self, message: Message) -> CoordinationResult<Exchange> {
        let agent_id = message.to_agent_id.ok_or_else(|| {
            CoordinationError::Validation("message has no recipient".to_string())
        })?;

        {
            let mut state = self.state.lock().await;
            let agent = state.registry.get(&agent_id)?;
            if matches!(
                agent.status,
                AgentStatus::Starting | AgentStatus::Error | AgentStatus::Terminated
            ) {
                return Err(CoordinationError::Validation(format!(
                    "agent '{}' is {} and cannot receive messages",
                    agent.name,
                    agent.status.as_str()
                )));
            }
            self.record_message(&mut state, &message);
            self.commit(state, Vec::new()).await;
        }
        self.persist_message(&message).await;

        let request = ExecutionRequest {
            session_id: self.session_id,
            agent_id,
            task_id: message.task_id(),
            message_type: message.message_type,
            prompt: message.content().to_string(),
        };
        let timeout = self.config.communication_timeout();

        match tokio::time::timeout(timeout, self.engine.execute(request)).await {
            Ok(Ok(response)) => {
                let mut reply = message
                    .reply(MessageType::for_response(response.signal), response.text.clone())
                    .with_signal(response.signal);
                if let Some(deliverable) = &response.deliverable {
                    let data = serde_json::to_value(deliverable)
                        .map_err(|e| CoordinationError::Storage(e.into()))?;
                    reply = reply.with_data(data);
                }

                {
                    let mut state = self.state.lock().await;
                    if state.registry.contains(&agent_id) {
                        state.registry.reset_timeouts(&agent_id)?;
                    }
                    self.record_message(&mut state, &reply);
                    self.commit(state, Vec::new()).await;
                }
                self.persist_message(&reply).await;

                Ok(Exchange {
                    request: message,
                    reply,
                    response,
                })
            }
            Ok(Err(failure)) => Err(self.communication_failure(&message, failure.into()).await),
            Err(_) => Err(self
                .communication_failure(
                    &message,
                    CoordinationError::CommunicationTimeout { agent_id, timeout },
                )
                .await),
        }
    }

    async fn communication_failure(&self, message: &Message, error: CoordinationError) -> CoordinationError {
        let agent_id = match message.to_agent_id {
            Some(id) => id,
            None => return error,
        };
        log::warn!("communication with agent {} failed: {}", agent_id, error);

        let mut state = self.state.lock().await;
        self.events.publish(
            Event::new(EventType::SystemAlert, agent_id).with_payload(json!({
                "kind": error.kind(),
                "message": error.to_string(),
                "task_id": message.task_id(),
                "correlation_id": message.correlation_id,
            })),
        );

        let failures = match state.registry.record_timeout(&agent_id) {
            Ok(count) => count,
            Err(_) => return error,
        };

        let mut touched = Vec::new();
        if let Some(task_id) = message.task_id() {
            let in_flight = state
                .tasks
                .get(&task_id)
                .map(|t| {
                    t.active_correlation == Some(message.correlation_id)
                        && matches!(t.status, TaskStatus::Assigned | TaskStatus::InProgress)
                })
                .unwrap_or(false);
            if in_flight {
                let note = TaskNote::new("coordinator", format!("previous attempt failed: {}", error));
                let reason = format!("retries exhausted after communication failure: {}", error);
                match state.retry_or_fail(&task_id, note, &reason) {
                    Ok(RetryOutcome::Requeued(left)) => {
                        log::info!("task {} returned to pending ({} retries left)", task_id, left);
                        touched.push(task_id);
                    }
                    Ok(RetryOutcome::Exhausted(ids)) => touched.extend(ids),
                    Err(e) => log::error!("failed to requeue task {}: {}", task_id, e),
                }
            }
        }

        let agent_status = state.registry.get(&agent_id).map(|a| a.status).ok();
        if failures >= self.config.consecutive_timeouts_before_error
            && !matches!(agent_status, Some(AgentStatus::Error | AgentStatus::Terminated) | None)
        {
            log::warn!(
                "agent {} failed {} consecutive times, marking it as error",
                agent_id,
                failures
            );
            if let Err(e) = state.registry.transition(&agent_id, AgentStatus::Error) {
                log::error!("failed to mark agent {} as error: {}", agent_id, e);
            }
        }

        self.commit(state, touched).await;
        error
    }

    pub async fn is_current(&self, exchange: &Exchange) -> bool {
        let task_id = match exchange.request.task_id() {
            Some(id) => id,
            None => return false,
        };
        let state = self.state.lock().await;
        state
            .tasks
            .get(&task_id)
            .map(|t| {
                t.status == TaskStatus::InProgress
                    && t.active_correlation == Some(exchange.request.correlation_id)
            })
            .unwrap_or(false)
    }

    pub async fn task_history(&self, task_id: &TaskId, exclude: Option<MessageId>) -> Vec<Message> {
        let state = self.state.lock().await;
        state
            .session
            .context
            .iter()
            .filter(|m| m.task_id() == Some(*task_id) && Some(m.id) != exclude)
            .cloned()
            .collect()
    }

    pub async fn record_progress(&self, task_id: &TaskId, progress: f32) -> CoordinationResult<()> {
        let mut state = self.state.lock().await;
        let task = state.tasks.get(task_id)?;
        if task.status != TaskStatus::InProgress || progress <= task.progress {
            return Ok(());
        }
        state.tasks.advance(task_id, progress.clamp(0.0, 1.0))?;
        self.commit(state, vec![*task_id]).await;
        Ok(())
    }

    // Quality gate

    pub async fn evaluate_quality_gate(
        &self,
        task_id: &TaskId,
        deliverable: &Deliverable,
    ) -> CoordinationResult<QualityGateResult> {
        let task = {
            let state = self.state.lock().await;
            state.tasks.get(task_id)?
        };
        let result = self
            .evaluator
            .evaluate(deliverable, &task.acceptance, task.config.quality_threshold)
            .await?;
        log::debug!(
            "quality gate for task {}: score {:.2}, passed {}",
            task_id,
            result.score,
            result.passed
        );
        Ok(result)
    }

    /// A rejection spends a retry and requeues the task with the findings as
    /// feedback; with no retries left the task fails and
    /// [`CoordinationError::QualityGateExhausted`] is returned.
    pub async fn apply_quality_gate_result(
        &self,
        task_id: &TaskId,
        result: &QualityGateResult,
    ) -> CoordinationResult<GateOutcome> {
        let mut state = self.state.lock().await;
        let task = state.tasks.get(task_id)?;
        if task.status == TaskStatus::Completed && result.passed {
            return Ok(GateOutcome::Completed);
        }

        if result.passed {
            let agent_id = task.assigned_agent_id;
            let mut touched = vec![*task_id];
            touched.extend(state.tasks.complete(task_id)?);
            if let Some(agent_id) = agent_id {
                if state.registry.contains(&agent_id) {
                    state.registry.release_work(&agent_id, task_id)?;
                    state.registry.record_completion(&agent_id)?;
                }
            }
            self.commit(state, touched).await;
            return Ok(GateOutcome::Completed);
        }

        if task.is_terminal() {
            return Err(CoordinationError::task_transition(
                *task_id,
                task.status,
                TaskStatus::Pending,
            ));
        }

        log::warn!(
            "quality gate rejected task '{}' (score {:.2} < {:.2})",
            task.title,
            result.score,
            result.threshold
        );
        let exhausted = CoordinationError::QualityGateExhausted {
            task_id: *task_id,
            reason: format!(
                "last score {:.2} below threshold {:.2}",
                result.score, result.threshold
            ),
        };
        let note = TaskNote::new("quality_gate", result.feedback());
        match state.retry_or_fail(task_id, note, &exhausted.to_string())? {
            RetryOutcome::Requeued(left) => {
                self.commit(state, vec![*task_id]).await;
                Ok(GateOutcome::Requeued { retries_left: left })
            }
            RetryOutcome::Exhausted(touched) => {
                self.commit(state, touched).await;
                Err(exhausted)
            }
        }
    }

    pub async fn apply_quality_gate(
        &self,
        task_id: &TaskId,
        deliverable: &Deliverable,
    ) -> CoordinationResult<GateOutcome> {
        let result = self.evaluate_quality_gate(task_id, deliverable).await?;
        self.apply_quality_gate_result(task_id, &result).await
    }

    // Manager

    /// Sends a message to the session's manager. Only one manager call is in
    /// flight at a time. Returns `None` when no manager can answer; the
    /// request is still recorded in the session log.
    pub async fn consult_manager(
        &self,
        message_type: MessageType,
        task_id: Option<TaskId>,
        from: Option<AgentId>,
        content: impl Into<String>,
    ) -> CoordinationResult<Option<Exchange>> {
        let _manager_turn = self.manager_lock.lock().await;
        let content = content.into();

        let manager = {
            let state = self.state.lock().await;
            state
                .registry
                .first_manager()
                .filter(|m| matches!(m.status, AgentStatus::Idle | AgentStatus::Busy))
        };

        match manager {
            Some(manager) => {
                let message = Message::new(
                    self.session_id,
                    message_type,
                    from,
                    Some(manager.id),
                    task_id,
                    content,
                );
                self.relay(message).await.map(Some)
            }
            None => {
                log::warn!("no manager available, request recorded on session {}", self.session_id);
                let message = Message::new(
                    self.session_id,
                    message_type,
                    from,
                    None,
                    task_id,
                    content,
                );
                {
                    let mut state = self.state.lock().await;
                    self.record_message(&mut state, &message);
                    self.commit(state, Vec::new()).await;
                }
                self.persist_message(&message).await;
                Ok(None)
            }
        }
    }

    pub async fn escalate(&self, task_id: &TaskId, question: &str) -> CoordinationResult<Option<String>> {
        let (title, worker) = {
            let state = self.state.lock().await;
            let task = state.tasks.get(task_id)?;
            (task.title, task.assigned_agent_id)
        };

        let answer = match self
            .consult_manager(
                MessageType::Intervention,
                Some(*task_id),
                worker,
                format!("A worker needs input on task '{}':\n{}", title, question),
            )
            .await
        {
            Ok(exchange) => exchange.map(|e| e.response.text),
            Err(e) => {
                log::warn!("escalation for task {} went unanswered: {}", task_id, e);
                None
            }
        };

        let mut state = self.state.lock().await;
        let task = state.tasks.get(task_id)?;
        if task.is_terminal() {
            return Ok(answer);
        }
        let note = match &answer {
            Some(text) => TaskNote::new("manager", text.clone()),
            None => TaskNote::new("escalation", format!("unanswered question: {}", question)),
        };
        if matches!(task.status, TaskStatus::Assigned | TaskStatus::InProgress) {
            state.release_agent_of(task_id)?;
            state.tasks.requeue(task_id, Some(note))?;
        } else {
            state.tasks.add_note(task_id, note)?;
        }
        self.commit(state, vec![*task_id]).await;
        Ok(answer)
    }

    // Terminal paths

    pub async fn fail_task(&self, task_id: &TaskId, reason: &str) -> CoordinationResult<Vec<TaskId>> {
        let mut state = self.state.lock().await;
        state.release_agent_of(task_id)?;
        let mut touched = vec![*task_id];
        touched.extend(state.tasks.fail(task_id, reason)?);
        self.commit(state, touched.clone()).await;
        Ok(touched)
    }

    pub async fn fail_task_timeout(&self, task_id: &TaskId) -> CoordinationResult<Vec<TaskId>> {
        let reason = CoordinationError::TaskExecutionTimeout(*task_id).to_string();
        self.events.publish(
            Event::new(EventType::SystemAlert, *task_id)
                .with_payload(json!({ "kind": "TaskExecutionTimeout" })),
        );
        self.fail_task(task_id, &reason).await
    }

    pub async fn cancel_task(&self, task_id: &TaskId, reason: &str) -> CoordinationResult<Vec<TaskId>> {
        let mut state = self.state.lock().await;
        let cancelled = state.cancel_with_release(task_id, reason)?;
        log::info!("cancelled {} task(s): {}", cancelled.len(), reason);
        self.commit(state, cancelled.clone()).await;
        Ok(cancelled)
    }

    /// Cancels every non-terminal task and frees every busy agent. A session
    /// that never started is finished here; a running autopilot finishes on
    /// its next iteration.
    pub async fn emergency_stop(&self, reason: &str) -> Option<SessionReport> {
        self.cancel.cancel();

        let mut state = self.state.lock().await;
        let touched = state.cancel_open_tasks(reason);
        log::warn!(
            "emergency stop on session {}: {} task(s) cancelled",
            self.session_id,
            touched.len()
        );
        self.events.publish(
            Event::new(EventType::SystemAlert, self.session_id)
                .with_payload(json!({ "kind": "EmergencyStop", "reason": reason })),
        );
        let finish_here = !state.running && state.report.is_none();
        self.commit(state, touched).await;

        if finish_here {
            Some(
                self.finish(SessionOutcome::Cancelled, Some(reason.to_string()))
                    .await,
            )
        } else {
            None
        }
    }

    // Session lifecycle

    pub async fn mark_running(&self) -> CoordinationResult<()> {
        let mut state = self.state.lock().await;
        if state.running {
            return Err(CoordinationError::Validation(format!(
                "session {} is already running",
                self.session_id
            )));
        }
        if state.report.is_some() || self.cancel.is_cancelled() {
            return Err(CoordinationError::Validation(format!(
                "session {} has already finished",
                self.session_id
            )));
        }
        state.running = true;
        let session = state.session.clone();
        self.commit(state, Vec::new()).await;
        self.persist_session(&session).await;
        Ok(())
    }

    pub async fn next_iteration(&self) -> u32 {
        let mut state = self.state.lock().await;
        state.session.iteration += 1;
        let iteration = state.session.iteration;
        self.commit(state, Vec::new()).await;
        iteration
    }

    pub async fn schedule_view(&self) -> ScheduleView {
        let state = self.state.lock().await;
        let now = Utc::now();
        let tasks = state.tasks.list();

        let mut view = ScheduleView {
            actionable: state.tasks.actionable(),
            awaiting_dispatch: tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Assigned)
                .map(|t| t.id)
                .collect(),
            is_empty: tasks.is_empty(),
            all_terminal: state.tasks.all_terminal(),
            usable_workers: state.registry.list().iter().any(|a| {
                !a.is_manager()
                    && matches!(
                        a.status,
                        AgentStatus::Starting | AgentStatus::Idle | AgentStatus::Busy | AgentStatus::Paused
                    )
            }),
            ..ScheduleView::default()
        };

        for task in tasks.iter().filter(|t| !t.is_terminal()) {
            if let Some(deadline) = task.deadline() {
                if deadline <= now {
                    view.expired.push(task.id);
                } else if view.next_deadline.map_or(true, |d| deadline < d) {
                    view.next_deadline = Some(deadline);
                }
            }
        }
        view
    }

    /// Finishing twice returns the first report.
    pub async fn finish(&self, outcome: SessionOutcome, diagnostic: Option<String>) -> SessionReport {
        let mut state = self.state.lock().await;
        if let Some(report) = &state.report {
            return report.clone();
        }

        let touched = state.cancel_open_tasks(&format!("session ended ({})", outcome.as_str()));
        let report = SessionReport::from_tasks(
            self.session_id,
            outcome,
            state.session.iteration,
            &state.tasks.list(),
            diagnostic,
        );
        state.session.result = Some(outcome);
        state.session.finished_at = Some(report.finished_at);
        state.running = false;
        state.report = Some(report.clone());

        match outcome {
            SessionOutcome::Success => log::info!("session {} succeeded", self.session_id),
            SessionOutcome::Failure => log::error!(
                "session {} failed: {}",
                self.session_id,
                report.diagnostic.as_deref().unwrap_or("no task completed")
            ),
            _ => log::warn!("session {} ended: {}", self.session_id, outcome.as_str()),
        }
        self.events.publish(
            Event::new(EventType::SystemAlert, self.session_id).with_payload(json!({
                "kind": "SessionFinished",
                "outcome": outcome.as_str(),
                "succeeded": report.succeeded.len(),
                "failed": report.failed.len(),
            })),
        );

        let session = state.session.clone();
        self.commit(state, touched).await;
        self.persist_session(&session).await;
        if let Err(e) = self.storage.append_report(&report).await {
            log::error!("failed to persist report for session {}: {}", self.session_id, e);
        }
        report
    }

    fn record_message(&self, state: &mut CoordinatorState, message: &Message) {
        state.session.context.push(message.clone());
        self.events.publish(
            Event::new(EventType::AgentCommunication, message.id).with_payload(json!({
                "message_type": message.message_type.as_str(),
                "correlation_id": message.correlation_id,
                "from_agent_id": message.from_agent_id,
                "to_agent_id": message.to_agent_id,
                "task_id": message.task_id(),
            })),
        );
    }

    async fn commit(&self, state: MutexGuard<'_, CoordinatorState>, touched: Vec<TaskId>) {
        self.snapshot.send_replace(state.snapshot());
        let tasks: Vec<Task> = touched.iter().filter_map(|id| state.tasks.get(id).ok()).collect();
        drop(state);
        self.changed.notify_one();

        for task in tasks {
            if let Err(e) = self.storage.append_task(self.session_id, &task).await {
                log::error!("failed to persist task {}: {}", task.id, e);
            }
        }
    }

    async fn persist_message(&self, message: &Message) {
        if let Err(e) = self.storage.append_message(message).await {
            log::error!("failed to persist message {}: {}", message.id, e);
        }
    }

    async fn persist_session(&self, session: &CoordinationSession) {
        if let Err(e) = self.storage.append_session(session).await {
            log::error!("failed to persist session {}: {}", session.id, e);
        }
    }
}

fn render_assignment(task: &Task) -> String {
    let mut prompt = format!("{}\n\n{}\n", task.title, task.description);
    if !task.acceptance.requirements.is_empty() {
        prompt.push_str("\nAcceptance criteria:\n");
        for requirement in &task.acceptance.requirements {
            prompt.push_str(&format!("- {}\n", requirement));
        }
    }
    if !task.acceptance.expected_files.is_empty() {
        prompt.push_str(&format!(
            "\nExpected files: {}\n",
            task.acceptance.expected_files.join(", ")
        ));
    }
    if !task.context.is_empty() {
        prompt.push_str("\nNotes from earlier attempts:\n");
        for note in &task.context {
            prompt.push_str(&format!("- [{}] {}\n", note.author, note.content));
        }
    }
    prompt.push_str("\nReport `progress: NN%` as you go and finish with a STATUS line.");
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::execution::SimulatedEngine;
    use crate::storage::InMemoryStore;
    use crate::types::{AcceptanceCriteria, CompletionSignal};

    fn coordinator() -> Coordinator {
        let config = Config::default();
        Coordinator::new(
            CoordinationSession::new("test goal", 10),
            &config,
            Arc::new(SimulatedEngine),
            Arc::new(InMemoryStore::new()),
            QualityGateEvaluator::heuristic(config.quality_gate.clone()),
        )
    }

    #[tokio::test]
    async fn test_create_agent_becomes_idle() {
        let coordinator = coordinator();
        let agent = coordinator.create_agent(AgentConfig::worker("w1")).await.unwrap();
        assert_eq!(agent.status, AgentStatus::Idle);
        assert_eq!(coordinator.snapshot().agents.len(), 1);
    }

    #[tokio::test]
    async fn test_assign_without_idle_agent_fails() {
        let coordinator = coordinator();
        let task = coordinator.create_task(TaskDraft::new("a", "b")).await.unwrap();
        let err = coordinator.assign_task(&task.id).await.unwrap_err();
        assert!(matches!(err, CoordinationError::TaskAssignmentFailed(_)));
    }

    #[tokio::test]
    async fn test_dispatch_and_relay_round_trip() {
        let coordinator = coordinator();
        coordinator.create_agent(AgentConfig::worker("w1")).await.unwrap();
        let task = coordinator
            .create_task(TaskDraft::new("Write docs", "Document the API"))
            .await
            .unwrap();

        coordinator.assign_task(&task.id).await.unwrap();
        let message = coordinator.begin_dispatch(&task.id).await.unwrap();
        let exchange = coordinator.relay(message).await.unwrap();

        assert_eq!(exchange.response.signal, CompletionSignal::Done);
        assert_eq!(exchange.reply.correlation_id, exchange.request.correlation_id);
        assert!(coordinator.is_current(&exchange).await);
        assert_eq!(coordinator.task_history(&task.id, None).await.len(), 2);
        assert_eq!(coordinator.get_task(&task.id).unwrap().status, TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn test_gate_pass_completes_and_frees_agent() {
        let coordinator = coordinator();
        let agent = coordinator.create_agent(AgentConfig::worker("w1")).await.unwrap();
        let task = coordinator.create_task(TaskDraft::new("a", "b")).await.unwrap();
        coordinator.assign_task(&task.id).await.unwrap();
        assert_eq!(coordinator.get_agent(&agent.id).unwrap().status, AgentStatus::Busy);
        coordinator.begin_dispatch(&task.id).await.unwrap();

        let pass = QualityGateResult::new(0.9, 0.7, vec![]);
        let outcome = coordinator.apply_quality_gate_result(&task.id, &pass).await.unwrap();
        assert_eq!(outcome, GateOutcome::Completed);
        // Applying the same verdict again is a no-op.
        let again = coordinator.apply_quality_gate_result(&task.id, &pass).await.unwrap();
        assert_eq!(again, GateOutcome::Completed);

        let agent = coordinator.get_agent(&agent.id).unwrap();
        assert_eq!(agent.status, AgentStatus::Idle);
        assert_eq!(agent.completed_tasks, 1);
        assert_eq!(coordinator.get_task(&task.id).unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_gate_rejection_requeues_with_feedback() {
        let coordinator = coordinator();
        coordinator.create_agent(AgentConfig::worker("w1")).await.unwrap();
        let mut draft = TaskDraft::new("a", "b");
        draft.acceptance = AcceptanceCriteria {
            requirements: vec!["Handle expired tokens".into()],
            expected_files: vec![],
        };
        let task = coordinator.create_task(draft).await.unwrap();
        coordinator.assign_task(&task.id).await.unwrap();
        coordinator.begin_dispatch(&task.id).await.unwrap();

        let outcome = coordinator
            .apply_quality_gate(&task.id, &Deliverable::new("did something else"))
            .await
            .unwrap();
        assert_eq!(outcome, GateOutcome::Requeued { retries_left: 2 });

        let task = coordinator.get_task(&task.id).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.assigned_agent_id.is_none());
        assert_eq!(task.context.last().unwrap().author, "quality_gate");
    }

    #[tokio::test]
    async fn test_escalation_without_manager_requeues() {
        let coordinator = coordinator();
        coordinator.create_agent(AgentConfig::worker("w1")).await.unwrap();
        let task = coordinator.create_task(TaskDraft::new("a", "b")).await.unwrap();
        coordinator.assign_task(&task.id).await.unwrap();
        coordinator.begin_dispatch(&task.id).await.unwrap();

        let answer = coordinator.escalate(&task.id, "Which database?").await.unwrap();
        assert!(answer.is_none());

        let task = coordinator.get_task(&task.id).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.config.retry_count, 3);
        let history = coordinator.task_history(&task.id, None).await;
        assert_eq!(history.last().unwrap().message_type, MessageType::Intervention);
    }

    #[tokio::test]
    async fn test_escalation_with_manager_appends_answer() {
        let coordinator = coordinator();
        coordinator.create_agent(AgentConfig::manager("lead")).await.unwrap();
        coordinator.create_agent(AgentConfig::worker("w1")).await.unwrap();
        let task = coordinator.create_task(TaskDraft::new("a", "b")).await.unwrap();
        coordinator.assign_task(&task.id).await.unwrap();
        coordinator.begin_dispatch(&task.id).await.unwrap();

        let answer = coordinator.escalate(&task.id, "Which database?").await.unwrap();
        assert!(answer.is_some());
        let task = coordinator.get_task(&task.id).unwrap();
        assert_eq!(task.context.last().unwrap().author, "manager");
    }

    #[tokio::test]
    async fn test_emergency_stop_before_start_finishes_session() {
        let coordinator = coordinator();
        let agent = coordinator.create_agent(AgentConfig::worker("w1")).await.unwrap();
        let a = coordinator.create_task(TaskDraft::new("a", "b")).await.unwrap();
        coordinator.create_task(TaskDraft::new("c", "d")).await.unwrap();
        coordinator.assign_task(&a.id).await.unwrap();

        let report = coordinator.emergency_stop("operator").await.unwrap();
        assert_eq!(report.outcome, SessionOutcome::Cancelled);
        assert_eq!(report.never_attempted.len(), 2);
        assert_eq!(coordinator.get_agent(&agent.id).unwrap().status, AgentStatus::Idle);
        assert!(coordinator.mark_running().await.is_err());
    }

    #[tokio::test]
    async fn test_terminate_agent_requeues_its_work() {
        let coordinator = coordinator();
        let agent = coordinator.create_agent(AgentConfig::worker("w1")).await.unwrap();
        let task = coordinator.create_task(TaskDraft::new("a", "b")).await.unwrap();
        coordinator.assign_task(&task.id).await.unwrap();

        let agent = coordinator.terminate_agent(&agent.id).await.unwrap();
        assert_eq!(agent.status, AgentStatus::Terminated);
        assert_eq!(coordinator.get_task(&task.id).unwrap().status, TaskStatus::Pending);
        assert!(coordinator.terminate_agent(&agent.id).await.is_err());
    }

    #[test]
    fn test_render_assignment_includes_notes() {
        let mut task = Task::from_draft(
            TaskDraft::new("Add login", "JWT based").with_requirement("Reject expired tokens"),
            0,
            Default::default(),
        );
        task.context.push(TaskNote::new("quality_gate", "missing tests"));
        let prompt = render_assignment(&task);
        assert!(prompt.starts_with("Add login"));
        assert!(prompt.contains("- Reject expired tokens"));
        assert!(prompt.contains("[quality_gate] missing tests"));
    }
}
