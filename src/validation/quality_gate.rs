use anyhow::{anyhow, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};

use crate::config::{DimensionWeights, QualityGateConfig};
use crate::error::{CoordinationResult, ExecutionFailure};
use crate::providers::llm::{ChatMessage, LLMProvider};
use crate::types::{AcceptanceCriteria, Deliverable, Finding, FindingSeverity, QualityGateResult};

/// Independently scored dimensions, each in [0, 1].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DimensionScores {
    pub functional: f32,
    pub requirements: f32,
    pub error_free: f32,
    pub findings: Vec<Finding>,
}

impl DimensionScores {
    pub fn weighted(&self, weights: &DimensionWeights) -> f32 {
        let total = weights.total();
        if total <= 0.0 {
            return (self.functional + self.requirements + self.error_free) / 3.0;
        }
        (self.functional * weights.functional
            + self.requirements * weights.requirements
            + self.error_free * weights.error_free)
            / total
    }
}

#[async_trait]
pub trait DeliverableScorer: Send + Sync {
    async fn score(
        &self,
        deliverable: &Deliverable,
        criteria: &AcceptanceCriteria,
    ) -> Result<DimensionScores>;
}

#[derive(Debug, Clone, Default)]
pub struct HeuristicScorer;

fn test_evidence_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(tests? pass(ed|ing)?|all tests|cargo test|tests? green|verified)\b")
            .expect("test evidence pattern is valid")
    })
}

impl HeuristicScorer {
    fn requirement_covered(requirement: &str, haystack: &str) -> bool {
        let words: Vec<String> = requirement
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.len() > 3)
            .map(|w| w.to_lowercase())
            .collect();
        if words.is_empty() {
            return true;
        }
        let hits = words.iter().filter(|w| haystack.contains(w.as_str())).count();
        hits * 2 >= words.len()
    }
}

#[async_trait]
impl DeliverableScorer for HeuristicScorer {
    async fn score(
        &self,
        deliverable: &Deliverable,
        criteria: &AcceptanceCriteria,
    ) -> Result<DimensionScores> {
        let mut findings = Vec::new();

        let mut evidence = 0.0;
        if !deliverable.files_touched.is_empty() {
            evidence += 0.5;
        }
        if test_evidence_regex().is_match(&deliverable.summary) {
            evidence += 0.5;
        }
        let functional = 0.6 * deliverable.self_confidence + 0.4 * evidence;
        if deliverable.self_confidence < 0.5 {
            findings.push(Finding::new(
                "functional",
                FindingSeverity::Info,
                format!("worker confidence is low ({:.2})", deliverable.self_confidence),
            ));
        }

        let haystack = format!(
            "{} {}",
            deliverable.summary.to_lowercase(),
            deliverable.files_touched.join(" ").to_lowercase()
        );
        let mut checks = 0usize;
        let mut satisfied = 0usize;
        for requirement in &criteria.requirements {
            checks += 1;
            if Self::requirement_covered(requirement, &haystack) {
                satisfied += 1;
            } else {
                findings.push(Finding::new(
                    "requirements",
                    FindingSeverity::Warning,
                    format!("no evidence for requirement: {}", requirement),
                ));
            }
        }
        for expected in &criteria.expected_files {
            checks += 1;
            if deliverable
                .files_touched
                .iter()
                .any(|f| f.ends_with(expected.as_str()))
            {
                satisfied += 1;
            } else {
                findings.push(Finding::new(
                    "requirements",
                    FindingSeverity::Warning,
                    format!("expected file not touched: {}", expected),
                ));
            }
        }
        let requirements = if checks == 0 {
            1.0
        } else {
            satisfied as f32 / checks as f32
        };

        for error in &deliverable.reported_errors {
            findings.push(Finding::new("errors", FindingSeverity::Error, error.clone()));
        }
        let error_free = 1.0 / (1.0 + deliverable.reported_errors.len() as f32);

        Ok(DimensionScores {
            functional,
            requirements,
            error_free,
            findings,
        })
    }
}

pub struct LlmScorer {
    llm_provider: Arc<dyn LLMProvider>,
}

fn dimension_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?im)^\s*(functional|requirements|errors?|error_free)\s*[:=]\s*([01](?:\.\d+)?)")
            .expect("dimension pattern is valid")
    })
}

impl LlmScorer {
    pub fn new(llm_provider: Arc<dyn LLMProvider>) -> Self {
        Self { llm_provider }
    }

    fn build_prompt(deliverable: &Deliverable, criteria: &AcceptanceCriteria) -> String {
        format!(
            "Requirements:\n{}\n\nExpected files: {}\n\nDeliverable summary:\n{}\n\nFiles touched: {}\n\nReported errors:\n{}\n\n\
             Grade each dimension between 0 and 1, one per line:\nfunctional: <score>\nrequirements: <score>\nerrors: <score>\n\
             List problems as lines starting with FINDING:",
            criteria.requirements.join("\n"),
            criteria.expected_files.join(", "),
            deliverable.summary,
            deliverable.files_touched.join(", "),
            deliverable.reported_errors.join("\n"),
        )
    }

    pub(crate) fn parse_scores(response: &str) -> Result<DimensionScores> {
        let mut functional = None;
        let mut requirements = None;
        let mut error_free = None;

        for caps in dimension_regex().captures_iter(response) {
            let value: f32 = caps[2].parse()?;
            let value = value.clamp(0.0, 1.0);
            match caps[1].to_lowercase().as_str() {
                "functional" => functional = Some(value),
                "requirements" => requirements = Some(value),
                _ => error_free = Some(value),
            }
        }

        let findings = response
            .lines()
            .filter_map(|line| line.trim().strip_prefix("FINDING:"))
            .map(|msg| Finding::new("review", FindingSeverity::Warning, msg.trim()))
            .collect();

        Ok(DimensionScores {
            functional: functional.ok_or_else(|| anyhow!("missing functional score"))?,
            requirements: requirements.ok_or_else(|| anyhow!("missing requirements score"))?,
            error_free: error_free.ok_or_else(|| anyhow!("missing errors score"))?,
            findings,
        })
    }
}

#[async_trait]
impl DeliverableScorer for LlmScorer {
    async fn score(
        &self,
        deliverable: &Deliverable,
        criteria: &AcceptanceCriteria,
    ) -> Result<DimensionScores> {
        let messages = vec![
            ChatMessage::system("You are a strict code reviewer grading a worker's deliverable against its acceptance criteria."),
            ChatMessage::user(Self::build_prompt(deliverable, criteria)),
        ];
        let response = self.llm_provider.complete(messages).await?;
        Self::parse_scores(&response)
    }
}

#[derive(Clone)]
pub struct QualityGateEvaluator {
    scorer: Arc<dyn DeliverableScorer>,
    config: QualityGateConfig,
}

impl QualityGateEvaluator {
    pub fn new(scorer: Arc<dyn DeliverableScorer>, config: QualityGateConfig) -> Self {
        Self { scorer, config }
    }

    pub fn heuristic(config: QualityGateConfig) -> Self {
        Self::new(Arc::new(HeuristicScorer), config)
    }

    pub fn config(&self) -> &QualityGateConfig {
        &self.config
    }

    /// Scores `deliverable` against `criteria`. Empty or failed deliverables
    /// score 0 without consulting the scorer. With `samples > 1` each dimension
    /// takes the median over samples, which bounds scorer noise.
    pub async fn evaluate(
        &self,
        deliverable: &Deliverable,
        criteria: &AcceptanceCriteria,
        threshold: f32,
    ) -> CoordinationResult<QualityGateResult> {
        if deliverable.is_empty_or_error() {
            return Ok(QualityGateResult::rejected(
                threshold,
                Finding::new(
                    "deliverable",
                    FindingSeverity::Critical,
                    "deliverable is empty or reported failure",
                ),
            ));
        }

        let samples = self.config.samples.max(1);
        let mut scored = Vec::with_capacity(samples);
        let mut last_error = None;
        for _ in 0..samples {
            match self.scorer.score(deliverable, criteria).await {
                Ok(scores) => scored.push(scores),
                Err(e) => {
                    log::warn!("quality gate scorer failed: {}", e);
                    last_error = Some(e);
                }
            }
        }
        if scored.is_empty() {
            let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
            return Err(ExecutionFailure::ExecutionError(format!("quality gate scorer failed: {}", reason)).into());
        }

        let combined = DimensionScores {
            functional: median(scored.iter().map(|s| s.functional).collect()),
            requirements: median(scored.iter().map(|s| s.requirements).collect()),
            error_free: median(scored.iter().map(|s| s.error_free).collect()),
            findings: scored[0].findings.clone(),
        };
        let mut findings = combined.findings.clone();

        let totals: Vec<f32> = scored.iter().map(|s| s.weighted(&self.config.weights)).collect();
        let spread = totals.iter().cloned().fold(f32::MIN, f32::max)
            - totals.iter().cloned().fold(f32::MAX, f32::min);
        if spread > self.config.tolerance {
            log::warn!(
                "quality gate samples diverged by {:.3} (tolerance {:.3})",
                spread,
                self.config.tolerance
            );
            findings.push(Finding::new(
                "scoring",
                FindingSeverity::Info,
                format!("scorer samples diverged by {:.3}", spread),
            ));
        }

        let score = combined.weighted(&self.config.weights);
        Ok(QualityGateResult::new(score, threshold, findings))
    }
}

fn median(mut values: Vec<f32>) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}
