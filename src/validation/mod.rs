pub mod completion;
pub mod quality_gate;

pub use completion::{CompletionInput, TaskCompletionAnalyzer};
pub use quality_gate::{
    DeliverableScorer, DimensionScores, HeuristicScorer, LlmScorer, QualityGateEvaluator,
};
