use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AcceptanceCriteria {
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub expected_files: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Deliverable {
    pub summary: String,
    #[serde(default)]
    pub files_touched: Vec<String>,
    /// Worker's own confidence in the result, in [0, 1].
    #[serde(default)]
    pub self_confidence: f32,
    /// Non-fatal problems the worker reported (failing lints, skipped tests).
    #[serde(default)]
    pub reported_errors: Vec<String>,
    /// The worker reported that it could not produce the deliverable.
    #[serde(default)]
    pub failed: bool,
}

impl Deliverable {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            ..Self::default()
        }
    }

    pub fn with_files(mut self, files: Vec<String>) -> Self {
        self.files_touched = files;
        self
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.self_confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.reported_errors.push(error.into());
        self
    }

    pub fn failed(mut self) -> Self {
        self.failed = true;
        self
    }

    /// Empty or explicitly failed deliverables bypass scoring.
    pub fn is_empty_or_error(&self) -> bool {
        self.failed || (self.summary.trim().is_empty() && self.files_touched.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub category: String,
    pub severity: FindingSeverity,
    pub message: String,
}

impl Finding {
    pub fn new(
        category: impl Into<String>,
        severity: FindingSeverity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category: category.into(),
            severity,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityGateResult {
    pub score: f32,
    pub passed: bool,
    pub threshold: f32,
    pub findings: Vec<Finding>,
}

impl QualityGateResult {
    pub fn new(score: f32, threshold: f32, findings: Vec<Finding>) -> Self {
        let score = score.clamp(0.0, 1.0);
        Self {
            score,
            passed: score >= threshold,
            threshold,
            findings,
        }
    }

    pub fn rejected(threshold: f32, finding: Finding) -> Self {
        Self {
            score: 0.0,
            passed: false,
            threshold,
            findings: vec![finding],
        }
    }

    pub fn feedback(&self) -> String {
        let mut lines = vec![format!(
            "Quality gate score {:.2} (threshold {:.2})",
            self.score, self.threshold
        )];
        for finding in &self.findings {
            lines.push(format!(
                "- [{:?}] {}: {}",
                finding.severity, finding.category, finding.message
            ));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompletionDecision {
    Continue,
    Complete,
    NeedsInput,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionAssessment {
    pub decision: CompletionDecision,
    pub confidence: f32,
    pub rationale: String,
    #[serde(default)]
    pub progress: Option<f32>,
}

impl CompletionAssessment {
    pub fn new(decision: CompletionDecision, confidence: f32, rationale: impl Into<String>) -> Self {
        Self {
            decision,
            confidence: confidence.clamp(0.0, 1.0),
            rationale: rationale.into(),
            progress: None,
        }
    }

    /// Treats low-confidence decisions as NEEDS_INPUT.
    pub fn with_confidence_floor(mut self, floor: f32) -> Self {
        if self.confidence < floor && self.decision != CompletionDecision::NeedsInput {
            self.rationale = format!(
                "{} (confidence {:.2} below floor {:.2}, escalating)",
                self.rationale, self.confidence, floor
            );
            self.decision = CompletionDecision::NeedsInput;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_result_passes_at_threshold() {
        let result = QualityGateResult::new(0.7, 0.7, vec![]);
        assert!(result.passed);
        let result = QualityGateResult::new(0.69, 0.7, vec![]);
        assert!(!result.passed);
    }

    #[test]
    fn test_empty_deliverable_detected() {
        assert!(Deliverable::new("   ").is_empty_or_error());
        assert!(Deliverable::new("done").failed().is_empty_or_error());
        assert!(!Deliverable::new("").with_files(vec!["a.rs".into()]).is_empty_or_error());
    }

    #[test]
    fn test_confidence_floor_escalates() {
        let assessment = CompletionAssessment::new(CompletionDecision::Complete, 0.4, "weak")
            .with_confidence_floor(0.6);
        assert_eq!(assessment.decision, CompletionDecision::NeedsInput);

        let assessment = CompletionAssessment::new(CompletionDecision::Continue, 0.8, "ok")
            .with_confidence_floor(0.6);
        assert_eq!(assessment.decision, CompletionDecision::Continue);
    }
}
