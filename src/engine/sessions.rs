use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::Config;
use crate::engine::autopilot::AutopilotLoop;
use crate::engine::coordination::Coordinator;
use crate::error::{CoordinationError, CoordinationResult};
use crate::providers::execution::ExecutionEngine;
use crate::storage::Storage;
use crate::types::{CoordinationSession, SessionId, SessionReport, SessionSnapshot};
use crate::validation::QualityGateEvaluator;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionStatus {
    Live(SessionSnapshot),
    Archived { goal: String, report: SessionReport },
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub goal: String,
    /// `staged`, `running`, or the outcome of a finished session.
    pub state: String,
    pub iteration: u32,
    pub updated_at: DateTime<Utc>,
}

struct ArchivedSession {
    goal: String,
    report: SessionReport,
}

/// Process-wide table of coordination sessions. Live sessions each own a
/// [`Coordinator`]; finished ones are archived as reports.
pub struct SessionTable {
    config: Config,
    engine: Arc<dyn ExecutionEngine>,
    storage: Arc<dyn Storage>,
    evaluator: QualityGateEvaluator,
    live: RwLock<HashMap<SessionId, Arc<Coordinator>>>,
    archive: RwLock<HashMap<SessionId, ArchivedSession>>,
}

impl SessionTable {
    pub fn new(
        config: Config,
        engine: Arc<dyn ExecutionEngine>,
        storage: Arc<dyn Storage>,
        evaluator: QualityGateEvaluator,
    ) -> Self {
        Self {
            config,
            engine,
            storage,
            evaluator,
            live: RwLock::new(HashMap::new()),
            archive: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Stages a new session. Fails with `SystemOverload` once the live table is full.
    pub async fn create(
        &self,
        goal: impl Into<String>,
        max_iterations: Option<u32>,
    ) -> CoordinationResult<Arc<Coordinator>> {
        let goal = goal.into();
        if goal.trim().is_empty() {
            return Err(CoordinationError::Validation(
                "session goal must not be empty".to_string(),
            ));
        }

        let mut live = self.live.write().await;
        if live.len() >= self.config.coordinator.max_sessions {
            return Err(CoordinationError::SystemOverload(format!(
                "{} sessions already live",
                live.len()
            )));
        }

        let session = CoordinationSession::new(
            goal,
            max_iterations.unwrap_or(self.config.autopilot.max_iterations),
        );
        let coordinator = Arc::new(Coordinator::new(
            session,
            &self.config,
            self.engine.clone(),
            self.storage.clone(),
            self.evaluator.clone(),
        ));
        live.insert(coordinator.session_id(), coordinator.clone());
        log::info!("staged session {}", coordinator.session_id());
        Ok(coordinator)
    }

    pub async fn get(&self, id: &SessionId) -> CoordinationResult<Arc<Coordinator>> {
        self.live
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or(CoordinationError::SessionNotFound(*id))
    }

    pub async fn status(&self, id: &SessionId) -> CoordinationResult<SessionStatus> {
        if let Some(coordinator) = self.live.read().await.get(id) {
            return Ok(SessionStatus::Live(coordinator.snapshot()));
        }
        self.archive
            .read()
            .await
            .get(id)
            .map(|a| SessionStatus::Archived {
                goal: a.goal.clone(),
                report: a.report.clone(),
            })
            .ok_or(CoordinationError::SessionNotFound(*id))
    }

    pub async fn list(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .live
            .read()
            .await
            .values()
            .map(|c| {
                let snapshot = c.snapshot();
                let state = match (&snapshot.report, snapshot.running) {
                    (Some(report), _) => report.outcome.as_str().to_string(),
                    (None, true) => "running".to_string(),
                    (None, false) => "staged".to_string(),
                };
                SessionSummary {
                    id: snapshot.session_id,
                    goal: snapshot.goal,
                    state,
                    iteration: snapshot.iteration,
                    updated_at: snapshot.updated_at,
                }
            })
            .collect();

        summaries.extend(self.archive.read().await.values().map(|a| SessionSummary {
            id: a.report.session_id,
            goal: a.goal.clone(),
            state: a.report.outcome.as_str().to_string(),
            iteration: a.report.iterations,
            updated_at: a.report.finished_at,
        }));
        summaries.sort_by_key(|s| s.updated_at);
        summaries
    }

    /// Starts the autopilot for a staged session in the background. The
    /// session is archived when the autopilot finishes.
    pub async fn start(self: &Arc<Self>, id: &SessionId) -> CoordinationResult<()> {
        let coordinator = self.get(id).await?;
        let autopilot = AutopilotLoop::new(coordinator, &self.config);
        autopilot.begin().await?;

        let table = Arc::clone(self);
        tokio::spawn(async move {
            let report = autopilot.drive().await;
            table.archive_report(report).await;
        });
        Ok(())
    }

    pub async fn run_to_completion(&self, id: &SessionId) -> CoordinationResult<SessionReport> {
        let coordinator = self.get(id).await?;
        let report = AutopilotLoop::new(coordinator, &self.config).run().await?;
        self.archive_report(report.clone()).await;
        Ok(report)
    }

    pub async fn emergency_stop_all(&self, reason: &str) -> usize {
        let coordinators: Vec<Arc<Coordinator>> = self.live.read().await.values().cloned().collect();
        log::warn!("emergency stop of {} session(s): {}", coordinators.len(), reason);

        for coordinator in &coordinators {
            // Staged sessions finish immediately; running ones are archived by
            // their autopilot task.
            if let Some(report) = coordinator.emergency_stop(reason).await {
                self.archive_report(report).await;
            }
        }
        coordinators.len()
    }

    async fn archive_report(&self, report: SessionReport) {
        let coordinator = self.live.write().await.remove(&report.session_id);
        let goal = coordinator
            .map(|c| c.snapshot().goal)
            .unwrap_or_default();
        log::info!(
            "archived session {} ({})",
            report.session_id,
            report.outcome.as_str()
        );
        self.archive
            .write()
            .await
            .insert(report.session_id, ArchivedSession { goal, report });
    }
}
