use crate::core::domain::CompareDetail;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comparison {
    pub accepted: bool,
    pub detail: Option<CompareDetail>,
}

/// Externally supplied output checker behind `ComparisonMode::Custom`.
///
/// Called synchronously on the worker that judged the submission, so it
/// must be deterministic, free of side effects and cheap relative to the
/// submission's own time limits.
pub trait Comparator: std::fmt::Debug + Send + Sync {
    fn compare(&self, expected: &[u8], actual: &[u8]) -> Comparison;
}
