use itertools::{EitherOrBoth, Itertools};

use crate::core::{
    domain::{
        CompareDetail, ComparisonMode, ExecutionReport, ExecutionResult, FaultCause, Outcome,
        TerminationReason,
    },
    traits::comparator::Comparator,
};

const FRAGMENT_LEN: usize = 80;
const MISSING_LINE: &str = "<EOF>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub outcome: Outcome,
    pub compare_detail: Option<CompareDetail>,
    pub fault: Option<FaultCause>,
}

impl Evaluation {
    fn outcome(outcome: Outcome) -> Self {
        Self {
            outcome,
            compare_detail: None,
            fault: None,
        }
    }
}

/// Classifies a full execution report, including a failed compile step.
pub fn evaluate_report(
    report: &ExecutionReport,
    expected_output: Option<&[u8]>,
    mode: ComparisonMode,
    comparator: Option<&dyn Comparator>,
) -> Evaluation {
    match report {
        ExecutionReport::CompileFailed(_) => Evaluation::outcome(Outcome::CompileError),
        ExecutionReport::Ran(result) => evaluate(result, expected_output, mode, comparator),
    }
}

/// Classifies the run phase of a submission.
pub fn evaluate(
    result: &ExecutionResult,
    expected_output: Option<&[u8]>,
    mode: ComparisonMode,
    comparator: Option<&dyn Comparator>,
) -> Evaluation {
    match result.termination_reason {
        TerminationReason::TimeLimitExceeded => {
            return Evaluation::outcome(Outcome::TimeLimitExceeded);
        }
        TerminationReason::MemoryLimitExceeded => {
            return Evaluation::outcome(Outcome::MemoryLimitExceeded);
        }
        TerminationReason::OutputLimitExceeded => {
            return Evaluation::outcome(Outcome::OutputLimitExceeded);
        }
        TerminationReason::Killed => {
            return Evaluation {
                fault: Some(FaultCause::Killed),
                ..Evaluation::outcome(Outcome::InternalError)
            };
        }
        TerminationReason::Completed => {}
    }

    if result.exit_code != 0 {
        return Evaluation::outcome(Outcome::RuntimeError);
    }

    // Without an expected output the submission is only checked for a clean exit.
    let Some(expected) = expected_output else {
        return Evaluation::outcome(Outcome::Accepted);
    };

    let divergence = match mode {
        ComparisonMode::Exact => compare_exact(expected, &result.stdout),
        ComparisonMode::TrimmedWhitespace => compare_trimmed(expected, &result.stdout),
        ComparisonMode::Custom => {
            let Some(comparator) = comparator else {
                tracing::error!("Custom comparison requested but no comparator is configured");
                return Evaluation {
                    fault: Some(FaultCause::ComparatorUnavailable),
                    ..Evaluation::outcome(Outcome::InternalError)
                };
            };
            let comparison = comparator.compare(expected, &result.stdout);
            if comparison.accepted {
                None
            } else {
                Some(comparison.detail.unwrap_or_else(|| {
                    compare_exact(expected, &result.stdout).unwrap_or(CompareDetail {
                        line: 1,
                        expected: String::new(),
                        actual: String::new(),
                    })
                }))
            }
        }
    };

    match divergence {
        None => Evaluation::outcome(Outcome::Accepted),
        Some(detail) => Evaluation {
            compare_detail: Some(detail),
            ..Evaluation::outcome(Outcome::WrongOutput)
        },
    }
}

/// Byte-identical comparison. Returns the first diverging line, if any.
pub fn compare_exact(expected: &[u8], actual: &[u8]) -> Option<CompareDetail> {
    if expected == actual {
        return None;
    }
    first_divergence(
        expected.split(|byte| *byte == b'\n'),
        actual.split(|byte| *byte == b'\n'),
    )
}

/// Ignores trailing whitespace on every line and trailing blank lines.
pub fn compare_trimmed(expected: &[u8], actual: &[u8]) -> Option<CompareDetail> {
    let expected = trimmed_lines(expected);
    let actual = trimmed_lines(actual);
    if expected == actual {
        return None;
    }
    first_divergence(expected.into_iter(), actual.into_iter())
}

fn trimmed_lines(output: &[u8]) -> Vec<&[u8]> {
    let mut lines: Vec<&[u8]> = output
        .split(|byte| *byte == b'\n')
        .map(<[u8]>::trim_ascii_end)
        .collect();
    while lines.last().is_some_and(|line| line.is_empty()) {
        lines.pop();
    }
    lines
}

fn first_divergence<'a>(
    expected: impl Iterator<Item = &'a [u8]>,
    actual: impl Iterator<Item = &'a [u8]>,
) -> Option<CompareDetail> {
    expected
        .zip_longest(actual)
        .enumerate()
        .find_map(|(idx, pair)| match pair {
            EitherOrBoth::Both(expected, actual) if expected == actual => None,
            EitherOrBoth::Both(expected, actual) => Some(detail(idx, Some(expected), Some(actual))),
            EitherOrBoth::Left(expected) => Some(detail(idx, Some(expected), None)),
            EitherOrBoth::Right(actual) => Some(detail(idx, None, Some(actual))),
        })
}

fn detail(idx: usize, expected: Option<&[u8]>, actual: Option<&[u8]>) -> CompareDetail {
    CompareDetail {
        line: idx + 1,
        expected: fragment(expected),
        actual: fragment(actual),
    }
}

fn fragment(line: Option<&[u8]>) -> String {
    let Some(line) = line else {
        return MISSING_LINE.to_string();
    };
    let text = String::from_utf8_lossy(line);
    if text.chars().count() <= FRAGMENT_LEN {
        return text.into_owned();
    }
    let mut truncated: String = text.chars().take(FRAGMENT_LEN).collect();
    truncated.push_str("...");
    truncated
}
