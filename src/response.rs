use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::core::{
    domain::{
        ComparisonMode, Language, Outcome, ResourceLimits, SubmissionId, SubmissionRequest,
        Verdict,
    },
    errors::{Rejected, UnsupportedLanguage},
};

const BYTES_PER_MB: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConversionError {
    #[error(transparent)]
    Language(#[from] UnsupportedLanguage),
    #[error("{0}")]
    Comparison(String),
}

/// A language given either by name (`"cpp"`) or by numeric id (`54`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum LanguageRef {
    Id(u32),
    Name(String),
}

impl TryFrom<&LanguageRef> for Language {
    type Error = UnsupportedLanguage;

    fn try_from(language: &LanguageRef) -> Result<Self, Self::Error> {
        match language {
            LanguageRef::Id(id) => Language::from_judge0_id(*id),
            LanguageRef::Name(name) => name.parse(),
        }
    }
}

/// Incoming run request. Missing limits fall back to configured defaults.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RunRequest {
    pub source_code: String,
    #[serde(alias = "language_id")]
    pub language: LanguageRef,
    #[serde(default)]
    pub stdin: Option<String>,
    #[serde(default)]
    pub expected_output: Option<String>,
    #[serde(default)]
    pub comparison: Option<String>,
    #[serde(default)]
    pub cpu_time_limit_ms: Option<u64>,
    #[serde(default)]
    pub wall_time_limit_ms: Option<u64>,
    #[serde(default)]
    pub memory_limit_mb: Option<u64>,
    #[serde(default)]
    pub output_limit_bytes: Option<u64>,
}

impl RunRequest {
    pub fn into_submission(
        self,
        defaults: &ResourceLimits,
    ) -> Result<SubmissionRequest, ConversionError> {
        let language = Language::try_from(&self.language)?;
        let comparison_mode = match &self.comparison {
            Some(mode) => mode
                .parse::<ComparisonMode>()
                .map_err(ConversionError::Comparison)?,
            None => ComparisonMode::default(),
        };

        let cpu_time_ms = self.cpu_time_limit_ms.unwrap_or(defaults.cpu_time_ms);
        // Without an explicit wall limit a raised CPU limit drags it along.
        let wall_time_ms = self
            .wall_time_limit_ms
            .unwrap_or_else(|| defaults.wall_time_ms.max(cpu_time_ms.saturating_mul(2)));

        Ok(SubmissionRequest {
            id: Uuid::new_v4(),
            language,
            source_code: self.source_code,
            stdin: self.stdin.map(String::into_bytes),
            expected_output: self.expected_output.map(String::into_bytes),
            comparison_mode,
            limits: ResourceLimits {
                cpu_time_ms,
                wall_time_ms,
                memory_bytes: self
                    .memory_limit_mb
                    .map(|mb| mb.saturating_mul(BYTES_PER_MB))
                    .unwrap_or(defaults.memory_bytes),
                output_byte_cap: self.output_limit_bytes.unwrap_or(defaults.output_byte_cap),
            },
        })
    }
}

/// Judge0-compatible status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JudgeStatus {
    Accepted,
    WrongAnswer,
    TimeLimitExceeded,
    CompilationError,
    RuntimeErrorNzec,
    RuntimeErrorOther,
    InternalError,
}

impl JudgeStatus {
    pub fn id(&self) -> u32 {
        match self {
            JudgeStatus::Accepted => 3,
            JudgeStatus::WrongAnswer => 4,
            JudgeStatus::TimeLimitExceeded => 5,
            JudgeStatus::CompilationError => 6,
            JudgeStatus::RuntimeErrorNzec => 11,
            JudgeStatus::RuntimeErrorOther => 12,
            JudgeStatus::InternalError => 13,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            JudgeStatus::Accepted => "Accepted",
            JudgeStatus::WrongAnswer => "Wrong Answer",
            JudgeStatus::TimeLimitExceeded => "Time Limit Exceeded",
            JudgeStatus::CompilationError => "Compilation Error",
            JudgeStatus::RuntimeErrorNzec => "Runtime Error (NZEC)",
            JudgeStatus::RuntimeErrorOther => "Runtime Error (Other)",
            JudgeStatus::InternalError => "Internal Error",
        }
    }
}

impl From<Outcome> for JudgeStatus {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Accepted => JudgeStatus::Accepted,
            Outcome::WrongOutput => JudgeStatus::WrongAnswer,
            Outcome::CompileError => JudgeStatus::CompilationError,
            Outcome::RuntimeError => JudgeStatus::RuntimeErrorNzec,
            Outcome::TimeLimitExceeded => JudgeStatus::TimeLimitExceeded,
            Outcome::MemoryLimitExceeded | Outcome::OutputLimitExceeded => {
                JudgeStatus::RuntimeErrorOther
            }
            Outcome::InternalError | Outcome::Aborted => JudgeStatus::InternalError,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Status {
    pub id: u32,
    pub description: String,
}

impl From<JudgeStatus> for Status {
    fn from(status: JudgeStatus) -> Self {
        Status {
            id: status.id(),
            description: status.description().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunResponse {
    pub token: SubmissionId,
    pub status: Status,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub compile_output: Option<String>,
    /// Milliseconds of CPU time.
    pub time: Option<f64>,
    /// Megabytes, two decimals.
    pub memory: Option<f64>,
    /// Human-readable reason for faults and wrong answers.
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunResponse {
    pub fn from_verdict(verdict: &Verdict, created_at: DateTime<Utc>) -> Self {
        let status = JudgeStatus::from(verdict.outcome);
        let result = verdict.execution_result.as_ref();
        let text = |bytes: &[u8]| String::from_utf8_lossy(bytes).into_owned();

        let (stdout, stderr, compile_output) = match (verdict.outcome, result) {
            (Outcome::CompileError, Some(result)) => {
                let output = [result.stdout.as_slice(), result.stderr.as_slice()].concat();
                (None, None, Some(text(&output)))
            }
            (_, Some(result)) => (Some(text(&result.stdout)), Some(text(&result.stderr)), None),
            (_, None) => (None, None, None),
        };

        let message = match (&verdict.fault, &verdict.compare_detail, verdict.outcome) {
            (Some(fault), _, _) => Some(fault.to_string()),
            (None, Some(detail), _) => Some(format!(
                "line {}: expected {:?}, got {:?}",
                detail.line, detail.expected, detail.actual
            )),
            (None, None, Outcome::MemoryLimitExceeded) => Some("memory limit exceeded".to_string()),
            (None, None, Outcome::OutputLimitExceeded) => Some("output limit exceeded".to_string()),
            (None, None, Outcome::Aborted) => Some("submission aborted".to_string()),
            _ => None,
        };

        RunResponse {
            token: verdict.submission_id,
            status: status.into(),
            stdout,
            stderr,
            compile_output,
            time: result.map(|result| result.cpu_time_used_ms as f64),
            memory: result.map(|result| megabytes(result.peak_memory_bytes)),
            message,
            created_at,
            finished_at: verdict.finished_at,
        }
    }

    /// Response for a submission that never ran.
    pub fn rejected(token: SubmissionId, reason: &Rejected, created_at: DateTime<Utc>) -> Self {
        RunResponse {
            token,
            status: JudgeStatus::InternalError.into(),
            stdout: None,
            stderr: None,
            compile_output: None,
            time: None,
            memory: None,
            message: Some(reason.to_string()),
            created_at,
            finished_at: Utc::now(),
        }
    }
}

fn megabytes(bytes: u64) -> f64 {
    (bytes as f64 / BYTES_PER_MB as f64 * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::domain::{CompareDetail, ExecutionResult, FaultCause, TerminationReason};

    fn result(stdout: &str, stderr: &str) -> ExecutionResult {
        ExecutionResult {
            exit_code: 0,
            stdout: stdout.as_bytes().to_vec(),
            stderr: stderr.as_bytes().to_vec(),
            cpu_time_used_ms: 42,
            wall_time_used_ms: 50,
            peak_memory_bytes: 3 * 1024 * 1024 + 512 * 1024,
            termination_reason: TerminationReason::Completed,
        }
    }

    #[test]
    fn test_request_with_defaults() {
        let request: RunRequest = serde_json::from_str(
            r#"{"source_code": "print(1)", "language": "python", "stdin": "5\n"}"#,
        )
        .unwrap();
        let defaults = ResourceLimits::default();

        let submission = request.into_submission(&defaults).unwrap();

        assert_eq!(submission.language, Language::Python);
        assert_eq!(submission.stdin, Some(b"5\n".to_vec()));
        assert_eq!(submission.expected_output, None);
        assert_eq!(submission.comparison_mode, ComparisonMode::TrimmedWhitespace);
        assert_eq!(submission.limits, defaults);
    }

    #[test]
    fn test_request_with_numeric_language_and_limits() {
        let request: RunRequest = serde_json::from_str(
            r#"{
                "source_code": "int main() {}",
                "language_id": 54,
                "expected_output": "3\n",
                "comparison": "exact",
                "cpu_time_limit_ms": 5000,
                "memory_limit_mb": 64,
                "output_limit_bytes": 2048
            }"#,
        )
        .unwrap();

        let submission = request.into_submission(&ResourceLimits::default()).unwrap();

        assert_eq!(submission.language, Language::Cpp);
        assert_eq!(submission.comparison_mode, ComparisonMode::Exact);
        assert_eq!(submission.expected_output, Some(b"3\n".to_vec()));
        assert_eq!(
            submission.limits,
            ResourceLimits {
                cpu_time_ms: 5000,
                wall_time_ms: 10_000,
                memory_bytes: 64 * 1024 * 1024,
                output_byte_cap: 2048,
            }
        );
        submission.limits.validate().unwrap();
    }

    #[test]
    fn test_request_conversion_errors() {
        let request: RunRequest =
            serde_json::from_str(r#"{"source_code": "", "language": "cobol"}"#).unwrap();
        assert!(matches!(
            request.into_submission(&ResourceLimits::default()),
            Err(ConversionError::Language(_))
        ));

        let request: RunRequest = serde_json::from_str(
            r#"{"source_code": "", "language": 71, "comparison": "fuzzy"}"#,
        )
        .unwrap();
        assert!(matches!(
            request.into_submission(&ResourceLimits::default()),
            Err(ConversionError::Comparison(_))
        ));
    }

    #[test]
    fn test_outcome_status_ids() {
        let cases = [
            (Outcome::Accepted, 3),
            (Outcome::WrongOutput, 4),
            (Outcome::TimeLimitExceeded, 5),
            (Outcome::CompileError, 6),
            (Outcome::RuntimeError, 11),
            (Outcome::MemoryLimitExceeded, 12),
            (Outcome::OutputLimitExceeded, 12),
            (Outcome::InternalError, 13),
            (Outcome::Aborted, 13),
        ];
        for (outcome, id) in cases {
            assert_eq!(JudgeStatus::from(outcome).id(), id, "{:?}", outcome);
        }
    }

    #[test]
    fn test_accepted_response() {
        let verdict = Verdict::new(Uuid::new_v4(), Outcome::Accepted, Some(result("3\n", "")));
        let created_at = Utc::now();

        let response = RunResponse::from_verdict(&verdict, created_at);

        assert_eq!(response.token, verdict.submission_id);
        assert_eq!(response.status.id, 3);
        assert_eq!(response.status.description, "Accepted");
        assert_eq!(response.stdout.as_deref(), Some("3\n"));
        assert_eq!(response.compile_output, None);
        assert_eq!(response.time, Some(42.0));
        assert_eq!(response.memory, Some(3.5));
        assert_eq!(response.message, None);
        assert_eq!(response.created_at, created_at);
    }

    #[test]
    fn test_compile_error_response() {
        let verdict = Verdict::new(
            Uuid::new_v4(),
            Outcome::CompileError,
            Some(result("", "main.cpp:3: error: expected ';'")),
        );

        let response = RunResponse::from_verdict(&verdict, Utc::now());

        assert_eq!(response.status.id, 6);
        assert_eq!(response.stdout, None);
        assert_eq!(
            response.compile_output.as_deref(),
            Some("main.cpp:3: error: expected ';'")
        );
    }

    #[test]
    fn test_wrong_answer_and_fault_messages() {
        let mut wrong = Verdict::new(Uuid::new_v4(), Outcome::WrongOutput, Some(result("4\n", "")));
        wrong.compare_detail = Some(CompareDetail {
            line: 1,
            expected: "3".to_string(),
            actual: "4".to_string(),
        });
        let response = RunResponse::from_verdict(&wrong, Utc::now());
        assert_eq!(response.status.id, 4);
        assert_eq!(response.message.as_deref(), Some("line 1: expected \"3\", got \"4\""));

        let fault = Verdict::internal(Uuid::new_v4(), FaultCause::SchedulerTimeout);
        let response = RunResponse::from_verdict(&fault, Utc::now());
        assert_eq!(response.status.id, 13);
        assert_eq!(response.message.as_deref(), Some("scheduler timeout"));
        assert_eq!(response.time, None);
        assert_eq!(response.memory, None);
    }

    #[test]
    fn test_rejected_response_serializes() {
        let response = RunResponse::rejected(Uuid::new_v4(), &Rejected::Overloaded, Utc::now());
        let json = serde_json::to_value(&response).unwrap();

        assert_eq!(json["status"]["id"], 13);
        assert_eq!(json["status"]["description"], "Internal Error");
        assert_eq!(json["message"], "rejected: overloaded");
        assert!(json["stdout"].is_null());
    }
}
