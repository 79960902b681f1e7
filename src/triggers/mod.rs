/// Threshold evaluation against the run's safe band
pub mod threshold_evaluator;

pub use threshold_evaluator::ThresholdEvaluator;
