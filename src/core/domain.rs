use std::{fmt, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::core::errors::{LimitsError, UnsupportedLanguage};

pub type SubmissionId = Uuid;

#[derive(Clone, Debug)]
pub struct SubmissionRequest {
    pub id: SubmissionId,
    pub language: Language,
    pub source_code: String,
    pub stdin: Option<Vec<u8>>,
    pub expected_output: Option<Vec<u8>>,
    pub comparison_mode: ComparisonMode,
    pub limits: ResourceLimits,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Language {
    C,
    Cpp,
    Rust,
    Go,
    Java,
    Python,
    JavaScript,
    Shell,
}

impl Language {
    pub const ALL: [Language; 8] = [
        Language::C,
        Language::Cpp,
        Language::Rust,
        Language::Go,
        Language::Java,
        Language::Python,
        Language::JavaScript,
        Language::Shell,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Language::C => "c",
            Language::Cpp => "cpp",
            Language::Rust => "rust",
            Language::Go => "go",
            Language::Java => "java",
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::Shell => "shell",
        }
    }

    /// Numeric identifiers used by Judge0-compatible clients.
    pub fn judge0_id(&self) -> u32 {
        match self {
            Language::C => 50,
            Language::Cpp => 54,
            Language::Rust => 78,
            Language::Go => 60,
            Language::Java => 62,
            Language::Python => 71,
            Language::JavaScript => 63,
            Language::Shell => 46,
        }
    }

    pub fn from_judge0_id(id: u32) -> Result<Self, UnsupportedLanguage> {
        Language::ALL
            .into_iter()
            .find(|language| language.judge0_id() == id)
            .ok_or_else(|| UnsupportedLanguage(id.to_string()))
    }
}

impl FromStr for Language {
    type Err = UnsupportedLanguage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        let language = match normalized.as_str() {
            "c" => Language::C,
            "cpp" | "c++" | "gnucpp" => Language::Cpp,
            "rust" | "rs" => Language::Rust,
            "go" | "golang" => Language::Go,
            "java" => Language::Java,
            "python" | "python3" | "py" => Language::Python,
            "javascript" | "js" | "node" => Language::JavaScript,
            "shell" | "sh" | "bash" => Language::Shell,
            other => match other.parse::<u32>() {
                Ok(id) => return Language::from_judge0_id(id),
                Err(_) => return Err(UnsupportedLanguage(s.to_string())),
            },
        };
        Ok(language)
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ComparisonMode {
    Exact,
    #[default]
    TrimmedWhitespace,
    /// Delegates to the comparator injected into the scheduler.
    Custom,
}

impl FromStr for ComparisonMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exact" => Ok(ComparisonMode::Exact),
            "trimmed" | "trimmed_whitespace" | "trimmedwhitespace" => {
                Ok(ComparisonMode::TrimmedWhitespace)
            }
            "custom" => Ok(ComparisonMode::Custom),
            other => Err(format!("unknown comparison mode: {}", other)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResourceLimits {
    pub cpu_time_ms: u64,
    /// Hard ceiling, enforced even when the CPU budget has not been used up.
    pub wall_time_ms: u64,
    pub memory_bytes: u64,
    pub output_byte_cap: u64,
}

impl ResourceLimits {
    pub fn validate(&self) -> Result<(), LimitsError> {
        if self.cpu_time_ms == 0 {
            return Err(LimitsError::Zero("cpu_time_ms"));
        }
        if self.wall_time_ms == 0 {
            return Err(LimitsError::Zero("wall_time_ms"));
        }
        if self.memory_bytes == 0 {
            return Err(LimitsError::Zero("memory_bytes"));
        }
        if self.output_byte_cap == 0 {
            return Err(LimitsError::Zero("output_byte_cap"));
        }
        if self.wall_time_ms < self.cpu_time_ms {
            return Err(LimitsError::WallBelowCpu {
                wall_time_ms: self.wall_time_ms,
                cpu_time_ms: self.cpu_time_ms,
            });
        }
        Ok(())
    }

    pub fn cpu_time(&self) -> Duration {
        Duration::from_millis(self.cpu_time_ms)
    }

    pub fn wall_time(&self) -> Duration {
        Duration::from_millis(self.wall_time_ms)
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_time_ms: 2_000,
            wall_time_ms: 4_000,
            memory_bytes: 128 * 1024 * 1024,
            output_byte_cap: 1024 * 1024,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminationReason {
    Completed,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    OutputLimitExceeded,
    Killed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub cpu_time_used_ms: u64,
    pub wall_time_used_ms: u64,
    pub peak_memory_bytes: u64,
    pub termination_reason: TerminationReason,
}

/// What the execution engine hands back for one submission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecutionReport {
    /// The compile step failed or timed out; the run step never started.
    CompileFailed(ExecutionResult),
    Ran(ExecutionResult),
}

impl ExecutionReport {
    pub fn result(&self) -> &ExecutionResult {
        match self {
            ExecutionReport::CompileFailed(result) | ExecutionReport::Ran(result) => result,
        }
    }

    pub fn into_result(self) -> ExecutionResult {
        match self {
            ExecutionReport::CompileFailed(result) | ExecutionReport::Ran(result) => result,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Outcome {
    Accepted,
    WrongOutput,
    CompileError,
    RuntimeError,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    OutputLimitExceeded,
    InternalError,
    /// Cancelled or shut down while running.
    Aborted,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FaultCause {
    ResourceExhausted(String),
    Provisioning(String),
    Internal(String),
    SchedulerTimeout,
    ComparatorUnavailable,
    Killed,
}

impl FaultCause {
    /// Faults that say the judge itself is unhealthy.
    pub fn is_infrastructure(&self) -> bool {
        !matches!(self, FaultCause::ComparatorUnavailable | FaultCause::Killed)
    }
}

impl fmt::Display for FaultCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultCause::ResourceExhausted(msg) => write!(f, "resource exhausted: {}", msg),
            FaultCause::Provisioning(msg) => write!(f, "provisioning failed: {}", msg),
            FaultCause::Internal(msg) => write!(f, "internal error: {}", msg),
            FaultCause::SchedulerTimeout => f.write_str("scheduler timeout"),
            FaultCause::ComparatorUnavailable => f.write_str("no custom comparator configured"),
            FaultCause::Killed => f.write_str("process killed by the judge"),
        }
    }
}

/// First point where actual output diverged from the expected one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompareDetail {
    /// 1-based line number.
    pub line: usize,
    pub expected: String,
    pub actual: String,
}

#[derive(Clone, Debug)]
pub struct Verdict {
    pub submission_id: SubmissionId,
    pub outcome: Outcome,
    pub execution_result: Option<ExecutionResult>,
    pub compare_detail: Option<CompareDetail>,
    pub fault: Option<FaultCause>,
    pub finished_at: DateTime<Utc>,
}

impl Verdict {
    pub fn new(
        submission_id: SubmissionId,
        outcome: Outcome,
        execution_result: Option<ExecutionResult>,
    ) -> Self {
        Self {
            submission_id,
            outcome,
            execution_result,
            compare_detail: None,
            fault: None,
            finished_at: Utc::now(),
        }
    }

    pub fn internal(submission_id: SubmissionId, fault: FaultCause) -> Self {
        Self {
            fault: Some(fault),
            ..Self::new(submission_id, Outcome::InternalError, None)
        }
    }

    pub fn aborted(submission_id: SubmissionId) -> Self {
        Self::new(submission_id, Outcome::Aborted, None)
    }

    pub fn is_infrastructure_fault(&self) -> bool {
        self.fault
            .as_ref()
            .is_some_and(FaultCause::is_infrastructure)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmissionState {
    Queued,
    Admitted,
    Running,
    Completed,
    Rejected,
    Aborted,
}

impl SubmissionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubmissionState::Completed | SubmissionState::Rejected | SubmissionState::Aborted
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_validation() {
        assert!(ResourceLimits::default().validate().is_ok());

        let zero_memory = ResourceLimits {
            memory_bytes: 0,
            ..ResourceLimits::default()
        };
        assert_eq!(
            zero_memory.validate(),
            Err(LimitsError::Zero("memory_bytes"))
        );

        let wall_below_cpu = ResourceLimits {
            cpu_time_ms: 2000,
            wall_time_ms: 1000,
            ..ResourceLimits::default()
        };
        assert!(matches!(
            wall_below_cpu.validate(),
            Err(LimitsError::WallBelowCpu { .. })
        ));
    }

    #[test]
    fn test_language_parsing() {
        assert_eq!("cpp".parse::<Language>().unwrap(), Language::Cpp);
        assert_eq!("Python".parse::<Language>().unwrap(), Language::Python);
        assert_eq!("71".parse::<Language>().unwrap(), Language::Python);
        assert_eq!(Language::from_judge0_id(54).unwrap(), Language::Cpp);
        assert!("cobol".parse::<Language>().is_err());
        assert!("9999".parse::<Language>().is_err());
    }

    #[test]
    fn test_language_ids_are_unique() {
        for language in Language::ALL {
            assert_eq!(
                Language::from_judge0_id(language.judge0_id()).unwrap(),
                language
            );
            assert_eq!(language.name().parse::<Language>().unwrap(), language);
        }
    }

    #[test]
    fn test_infrastructure_faults() {
        let verdict = Verdict::internal(Uuid::new_v4(), FaultCause::SchedulerTimeout);
        assert!(verdict.is_infrastructure_fault());

        let verdict = Verdict::internal(Uuid::new_v4(), FaultCause::ComparatorUnavailable);
        assert!(!verdict.is_infrastructure_fault());

        let verdict = Verdict::new(Uuid::new_v4(), Outcome::Accepted, None);
        assert!(!verdict.is_infrastructure_fault());
    }
}
