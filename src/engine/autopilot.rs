use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::{AutopilotConfig, Config};
use crate::engine::coordination::{Coordinator, GateOutcome};
use crate::error::{CoordinationError, CoordinationResult};
use crate::types::{
    CompletionDecision, CompletionSignal, Message, QualityGateResult, SessionOutcome,
    SessionReport, TaskId,
};
use crate::validation::{CompletionInput, TaskCompletionAnalyzer};

/// Upper bound on a single idle wait; the loop re-evaluates the schedule after it.
const IDLE_WAIT: Duration = Duration::from_secs(3600);

#[derive(Debug)]
enum TurnOutcome {
    Continue(TaskId),
    Completed(TaskId),
    Failed(TaskId),
    Requeued(TaskId),
    Escalated(TaskId),
    CommunicationFailed(TaskId),
    Discarded,
    Fatal(String),
}

/// Drives one session until every task is terminal, a budget runs out, a
/// fatal error is assessed, or the session is cancelled.
pub struct AutopilotLoop {
    coordinator: Arc<Coordinator>,
    analyzer: TaskCompletionAnalyzer,
    config: AutopilotConfig,
    max_concurrent: usize,
}

impl AutopilotLoop {
    pub fn new(coordinator: Arc<Coordinator>, config: &Config) -> Self {
        Self {
            coordinator,
            analyzer: TaskCompletionAnalyzer::new(),
            config: config.autopilot.clone(),
            max_concurrent: config.coordinator.max_concurrent_tasks.max(1),
        }
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub async fn run(&self) -> CoordinationResult<SessionReport> {
        self.begin().await?;
        Ok(self.drive().await)
    }

    pub async fn begin(&self) -> CoordinationResult<()> {
        if self.coordinator.snapshot().tasks.is_empty() {
            return Err(CoordinationError::Validation(
                "a session needs at least one task to start".to_string(),
            ));
        }
        self.coordinator.mark_running().await?;
        log::info!(
            "autopilot started for session {} (max {} iterations)",
            self.coordinator.session_id(),
            self.coordinator.snapshot().max_iterations
        );
        Ok(())
    }

    pub async fn drive(&self) -> SessionReport {
        let started = Instant::now();
        let session_deadline = self
            .config
            .max_duration_secs
            .map(|secs| started + Duration::from_secs(secs));
        let cancel = self.coordinator.cancellation_token();
        let max_iterations = self.coordinator.snapshot().max_iterations;

        let mut in_flight = FuturesUnordered::new();
        let mut follow_ups: VecDeque<TaskId> = VecDeque::new();

        let (outcome, diagnostic) = loop {
            if cancel.is_cancelled() {
                break (SessionOutcome::Cancelled, Some("emergency stop".to_string()));
            }

            let view = self.coordinator.schedule_view().await;
            if view.all_terminal && in_flight.is_empty() {
                let tasks = self.coordinator.list_tasks();
                break (SessionOutcome::aggregate(&tasks), None);
            }

            if !view.expired.is_empty() {
                for task_id in &view.expired {
                    log::warn!("task {} exceeded its execution timeout", task_id);
                    if let Err(e) = self.coordinator.fail_task_timeout(task_id).await {
                        log::error!("failed to time out task {}: {}", task_id, e);
                    }
                }
                follow_ups.retain(|id| !view.expired.contains(id));
                continue;
            }

            let out_of_time = session_deadline.map_or(false, |d| Instant::now() >= d);
            let iteration = self.coordinator.snapshot().iteration;
            let budget_exhausted = out_of_time || iteration >= max_iterations;

            if budget_exhausted {
                if in_flight.is_empty() {
                    let diagnostic = if out_of_time {
                        "session time budget exhausted".to_string()
                    } else {
                        format!("iteration budget of {} exhausted", max_iterations)
                    };
                    log::warn!(
                        "session {}: {}",
                        self.coordinator.session_id(),
                        diagnostic
                    );
                    break (SessionOutcome::PartialSuccess, Some(diagnostic));
                }
            } else {
                let mut awaiting: VecDeque<TaskId> = view.awaiting_dispatch.iter().copied().collect();
                let mut actionable: VecDeque<TaskId> = view.actionable.iter().copied().collect();

                while in_flight.len() < self.max_concurrent {
                    if self.coordinator.snapshot().iteration >= max_iterations {
                        break;
                    }
                    let message =
                        match self.next_dispatch(&mut follow_ups, &mut awaiting, &mut actionable).await {
                            Some(message) => message,
                            None => break,
                        };
                    let iteration = self.coordinator.next_iteration().await;
                    log::debug!(
                        "iteration {}: dispatching task {:?}",
                        iteration,
                        message.task_id()
                    );
                    in_flight.push(self.run_turn(message));
                }
            }

            if in_flight.is_empty() && follow_ups.is_empty() {
                let view = self.coordinator.schedule_view().await;
                if !view.all_terminal && !view.usable_workers {
                    break (
                        SessionOutcome::Failure,
                        Some("no worker agents available".to_string()),
                    );
                }
            }

            let now = Instant::now();
            let mut wait = IDLE_WAIT;
            if let Some(deadline) = view.next_deadline {
                let until = (deadline - chrono::Utc::now()).to_std().unwrap_or(Duration::ZERO);
                wait = wait.min(until);
            }
            if let Some(deadline) = session_deadline {
                if deadline > now {
                    wait = wait.min(deadline - now);
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {}
                Some(turn) = in_flight.next(), if !in_flight.is_empty() => {
                    match turn {
                        TurnOutcome::Continue(task_id) => follow_ups.push_back(task_id),
                        TurnOutcome::Fatal(diagnostic) => break (SessionOutcome::Failure, Some(diagnostic)),
                        TurnOutcome::Completed(task_id) => log::debug!("task {} done", task_id),
                        TurnOutcome::Failed(task_id) => log::debug!("task {} failed", task_id),
                        TurnOutcome::Requeued(task_id)
                        | TurnOutcome::Escalated(task_id)
                        | TurnOutcome::CommunicationFailed(task_id) => {
                            log::debug!("task {} back in the queue", task_id)
                        }
                        TurnOutcome::Discarded => {}
                    }
                }
                _ = self.coordinator.changed() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        };

        let report = self.coordinator.finish(outcome, diagnostic).await;

        // Dispatches still in flight run to their answer or communication
        // timeout; their tasks are closed, so the answers are discarded.
        if !in_flight.is_empty() {
            log::debug!("waiting for {} in-flight dispatch(es) to settle", in_flight.len());
        }
        while let Some(turn) = in_flight.next().await {
            log::debug!("late turn after session end: {:?}", turn);
        }
        report
    }

    /// Next message to send, in order: follow-ups for tasks still being worked
    /// on, tasks assigned through the control surface, then fresh assignments.
    async fn next_dispatch(
        &self,
        follow_ups: &mut VecDeque<TaskId>,
        awaiting: &mut VecDeque<TaskId>,
        actionable: &mut VecDeque<TaskId>,
    ) -> Option<Message> {
        while let Some(task_id) = follow_ups.pop_front() {
            match self.coordinator.follow_up(&task_id).await {
                Ok(message) => return Some(message),
                Err(e) => log::debug!("dropping follow-up for task {}: {}", task_id, e),
            }
        }

        while let Some(task_id) = awaiting.pop_front() {
            match self.coordinator.begin_dispatch(&task_id).await {
                Ok(message) => return Some(message),
                Err(e) => log::debug!("task {} no longer awaiting dispatch: {}", task_id, e),
            }
        }

        while let Some(task_id) = actionable.pop_front() {
            match self.coordinator.assign_task(&task_id).await {
                Ok(_) => match self.coordinator.begin_dispatch(&task_id).await {
                    Ok(message) => return Some(message),
                    Err(e) => log::error!("failed to dispatch task {}: {}", task_id, e),
                },
                Err(CoordinationError::TaskAssignmentFailed(_)) => {
                    log::debug!("no idle agent can take task {} yet", task_id);
                }
                Err(e) => log::debug!("skipping task {}: {}", task_id, e),
            }
        }
        None
    }

    async fn run_turn(&self, message: Message) -> TurnOutcome {
        let task_id = match message.task_id() {
            Some(id) => id,
            None => return TurnOutcome::Discarded,
        };

        let exchange = match self.coordinator.relay(message).await {
            Ok(exchange) => exchange,
            Err(e) => {
                log::warn!("turn for task {} failed: {}", task_id, e);
                return TurnOutcome::CommunicationFailed(task_id);
            }
        };
        if !self.coordinator.is_current(&exchange).await {
            log::debug!("discarding stale response for task {}", task_id);
            return TurnOutcome::Discarded;
        }

        let response = &exchange.response;
        let wants_gate = self.analyzer.claims_completion(&response.text, response.signal)
            && !self.analyzer.has_open_question(&response.text)
            && response.signal != CompletionSignal::Blocked;
        let gate = if wants_gate {
            match self
                .coordinator
                .evaluate_quality_gate(&task_id, &response.deliverable_or_summary())
                .await
            {
                Ok(result) => Some(result),
                Err(e) => {
                    log::warn!("quality gate unavailable for task {}: {}", task_id, e);
                    None
                }
            }
        } else {
            None
        };

        let history = self
            .coordinator
            .task_history(&task_id, Some(exchange.reply.id))
            .await;
        let mut input = CompletionInput::new(&history, &response.text, response.signal);
        if let Some(gate) = &gate {
            input = input.with_gate(gate);
        }
        let assessment = self
            .analyzer
            .assess(input)
            .with_confidence_floor(self.config.confidence_floor);
        log::debug!(
            "task {} assessed {:?} ({:.2}): {}",
            task_id,
            assessment.decision,
            assessment.confidence,
            assessment.rationale
        );

        if let Some(progress) = assessment.progress {
            if let Err(e) = self.coordinator.record_progress(&task_id, progress).await {
                log::debug!("ignoring progress for task {}: {}", task_id, e);
            }
        }

        match (assessment.decision, gate.as_ref()) {
            (CompletionDecision::Error, _) => {
                let reason = format!(
                    "agent reported an unrecoverable error: {}",
                    first_line(&response.text)
                );
                if let Err(e) = self.coordinator.fail_task(&task_id, &reason).await {
                    log::error!("failed to fail task {}: {}", task_id, e);
                }
                TurnOutcome::Fatal(format!("task {} failed: {}", task_id, reason))
            }
            // A rejected deliverable spends a retry even when the assessment
            // fell below the confidence floor.
            (_, Some(gate)) if !gate.passed => self.apply_gate(task_id, gate).await,
            (CompletionDecision::NeedsInput, _) => {
                if let Err(e) = self.coordinator.escalate(&task_id, &response.text).await {
                    log::error!("escalation for task {} failed: {}", task_id, e);
                }
                TurnOutcome::Escalated(task_id)
            }
            (CompletionDecision::Complete | CompletionDecision::Continue, Some(gate)) => {
                self.apply_gate(task_id, gate).await
            }
            (CompletionDecision::Complete | CompletionDecision::Continue, None) => {
                TurnOutcome::Continue(task_id)
            }
        }
    }

    async fn apply_gate(&self, task_id: TaskId, gate: &QualityGateResult) -> TurnOutcome {
        match self.coordinator.apply_quality_gate_result(&task_id, gate).await {
            Ok(GateOutcome::Completed) => TurnOutcome::Completed(task_id),
            Ok(GateOutcome::Requeued { retries_left }) => {
                log::info!(
                    "task {} requeued after quality gate rejection ({} retries left)",
                    task_id,
                    retries_left
                );
                TurnOutcome::Requeued(task_id)
            }
            Err(e @ CoordinationError::QualityGateExhausted { .. }) => {
                log::warn!("{}", e);
                TurnOutcome::Failed(task_id)
            }
            Err(e) => {
                log::warn!("could not apply quality gate to task {}: {}", task_id, e);
                TurnOutcome::Requeued(task_id)
            }
        }
    }
}

fn first_line(text: &str) -> &str {
    text.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("")
}
