use std::{any::Any, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures::FutureExt;
use tokio::{
    task::JoinHandle,
    time::{Instant, timeout, timeout_at},
};
use tokio_util::sync::CancellationToken;

use crate::{
    constants::RELEASE_TIMEOUT,
    core::{
        domain::{
            ExecutionReport, FaultCause, ResourceLimits, SubmissionRequest, Verdict,
        },
        errors::{ExecuteError, ProvisionError},
        events::{EventSink, JudgeEvent, Stage},
        registry::RunnerRegistry,
        traits::{
            comparator::Comparator,
            executor::Executor,
            provisioner::{Provisioner, SandboxHandle},
        },
        verdict::evaluate_report,
    },
};

/// Runs one submission end-to-end: provision, execute, release, evaluate.
#[derive(Debug, Clone)]
pub struct Judge {
    provisioner: Arc<dyn Provisioner>,
    executor: Arc<dyn Executor>,
    registry: Arc<RunnerRegistry>,
    comparator: Option<Arc<dyn Comparator>>,
    events: Arc<dyn EventSink>,
    overhead: Duration,
}

enum Executed {
    Finished(ExecutionReport),
    Failed(ExecuteError),
    Panicked(String),
    TimedOut,
    Aborted,
}

impl Judge {
    pub fn new(
        provisioner: Arc<dyn Provisioner>,
        executor: Arc<dyn Executor>,
        registry: Arc<RunnerRegistry>,
        events: Arc<dyn EventSink>,
        overhead: Duration,
    ) -> Self {
        Self {
            provisioner,
            executor,
            registry,
            comparator: None,
            events,
            overhead,
        }
    }

    pub fn with_comparator(self, comparator: Arc<dyn Comparator>) -> Self {
        Self {
            comparator: Some(comparator),
            ..self
        }
    }

    pub fn registry(&self) -> &RunnerRegistry {
        &self.registry
    }

    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    /// Hard ceiling for the whole pipeline of one submission.
    pub fn ceiling(&self, limits: &ResourceLimits) -> Duration {
        limits.wall_time() + self.overhead
    }

    #[tracing::instrument(skip_all, fields(submission_id = %request.id, language = %request.language))]
    pub async fn judge(&self, request: &SubmissionRequest, cancel: &CancellationToken) -> Verdict {
        let deadline = Instant::now() + self.ceiling(&request.limits);

        let runner = match self.registry.resolve(request.language) {
            Ok(runner) => runner,
            Err(e) => {
                tracing::error!("Runner disappeared after admission: {}", e);
                return Verdict::internal(request.id, FaultCause::Internal(e.to_string()));
            }
        };

        let started = Instant::now();
        let sandbox = match self.provision(request, deadline, cancel).await {
            Ok(sandbox) => sandbox,
            Err(verdict) => return verdict,
        };
        self.emit(JudgeEvent::new(request.id, Stage::Provisioned, started.elapsed()));

        let started = Instant::now();
        let stdin = request.stdin.as_deref().unwrap_or_default();
        let execution = AssertUnwindSafe(async {
            self.executor
                .execute(&sandbox, runner, &request.source_code, stdin, &request.limits)
                .await
        })
        .catch_unwind();

        let executed = tokio::select! {
            biased;
            _ = cancel.cancelled() => Executed::Aborted,
            result = timeout_at(deadline, execution) => match result {
                Err(_) => Executed::TimedOut,
                Ok(Err(panic)) => Executed::Panicked(panic_message(panic)),
                Ok(Ok(Err(e))) => Executed::Failed(e),
                Ok(Ok(Ok(report))) => Executed::Finished(report),
            },
        };
        self.emit(JudgeEvent::new(request.id, Stage::Executed, started.elapsed()));

        self.release(sandbox).await;

        let report = match executed {
            Executed::Finished(report) => report,
            Executed::Failed(e) => {
                tracing::error!("Execution failed: {}", e);
                return Verdict::internal(request.id, e.into());
            }
            Executed::Panicked(msg) => {
                tracing::error!("Execution panicked: {}", msg);
                return Verdict::internal(request.id, FaultCause::Internal(msg));
            }
            Executed::TimedOut => {
                tracing::error!("Pipeline exceeded its ceiling");
                return Verdict::internal(request.id, FaultCause::SchedulerTimeout);
            }
            Executed::Aborted => {
                tracing::info!("Submission aborted while running");
                return Verdict::aborted(request.id);
            }
        };

        let evaluation = evaluate_report(
            &report,
            request.expected_output.as_deref(),
            request.comparison_mode,
            self.comparator.as_deref(),
        );
        self.emit(
            JudgeEvent::new(request.id, Stage::Evaluated, Duration::ZERO)
                .with_outcome(evaluation.outcome),
        );

        Verdict {
            compare_detail: evaluation.compare_detail,
            fault: evaluation.fault,
            ..Verdict::new(request.id, evaluation.outcome, Some(report.into_result()))
        }
    }

    /// Acquires a sandbox in its own task so that an abandoned acquisition
    /// (deadline, cancellation) still gets released once it completes.
    async fn provision(
        &self,
        request: &SubmissionRequest,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<SandboxHandle, Verdict> {
        let provisioner = self.provisioner.clone();
        let submission_id = request.id;
        let limits = request.limits;
        let mut acquiring =
            tokio::spawn(async move { provisioner.acquire(submission_id, &limits).await });

        let acquired = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            acquired = timeout_at(deadline, &mut acquiring) => Some(acquired),
        };
        let Some(acquired) = acquired else {
            self.release_late(acquiring);
            return Err(Verdict::aborted(submission_id));
        };

        match acquired {
            Err(_) => {
                tracing::error!("Provisioning exceeded the pipeline ceiling");
                self.release_late(acquiring);
                Err(Verdict::internal(submission_id, FaultCause::SchedulerTimeout))
            }
            Ok(Err(e)) => {
                tracing::error!("Provisioning task failed: {}", e);
                Err(Verdict::internal(
                    submission_id,
                    FaultCause::Internal(e.to_string()),
                ))
            }
            Ok(Ok(Err(e))) => {
                tracing::error!("Failed to provision sandbox: {}", e);
                Err(Verdict::internal(submission_id, e.into()))
            }
            Ok(Ok(Ok(sandbox))) => Ok(sandbox),
        }
    }

    fn release_late(&self, acquiring: JoinHandle<Result<SandboxHandle, ProvisionError>>) {
        let provisioner = self.provisioner.clone();
        tokio::spawn(async move {
            if let Ok(Ok(sandbox)) = acquiring.await {
                tracing::warn!("Releasing sandbox acquired after its submission gave up");
                provisioner.release(sandbox).await;
            }
        });
    }

    async fn release(&self, sandbox: SandboxHandle) {
        let submission_id = sandbox.submission_id;
        let started = Instant::now();
        let provisioner = self.provisioner.clone();
        let releasing = tokio::spawn(async move { provisioner.release(sandbox).await });

        match timeout(RELEASE_TIMEOUT, releasing).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("Sandbox release task failed: {}", e),
            Err(_) => tracing::error!("Sandbox release is taking too long, leaving it in background"),
        }
        self.emit(JudgeEvent::new(submission_id, Stage::Released, started.elapsed()));
    }

    fn emit(&self, event: JudgeEvent) {
        self.events.emit(event);
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("executor panicked: {}", msg)
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("executor panicked: {}", msg)
    } else {
        "executor panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::{
            domain::{
                ComparisonMode, ExecutionResult, Language, Outcome, TerminationReason,
            },
            events::testing::RecordingSink,
            traits::{
                comparator::Comparison,
                executor::MockExecutor,
                provisioner::{Isolation, MockProvisioner},
            },
        },
        stubs::{executor::ExecutorStub, provisioner::ProvisionerStub},
    };
    use uuid::Uuid;

    fn create_request() -> SubmissionRequest {
        SubmissionRequest {
            id: Uuid::new_v4(),
            language: Language::Cpp,
            source_code: "int main() { return 0; }".to_string(),
            stdin: None,
            expected_output: Some(b"5050\n".to_vec()),
            comparison_mode: ComparisonMode::TrimmedWhitespace,
            limits: ResourceLimits {
                cpu_time_ms: 100,
                wall_time_ms: 200,
                memory_bytes: 64 * 1024 * 1024,
                output_byte_cap: 1024,
            },
        }
    }

    fn completed(stdout: &str, exit_code: i32) -> ExecutionResult {
        ExecutionResult {
            exit_code,
            stdout: stdout.as_bytes().to_vec(),
            stderr: Vec::new(),
            cpu_time_used_ms: 5,
            wall_time_used_ms: 7,
            peak_memory_bytes: 1024 * 1024,
            termination_reason: TerminationReason::Completed,
        }
    }

    fn create_judge(provisioner: Arc<dyn Provisioner>, executor: Arc<dyn Executor>) -> Judge {
        Judge::new(
            provisioner,
            executor,
            Arc::new(RunnerRegistry::with_languages(&Language::ALL)),
            Arc::new(RecordingSink::default()),
            Duration::from_millis(300),
        )
    }

    fn provisioner_expecting(acquires: usize, releases: usize) -> MockProvisioner {
        let mut provisioner = MockProvisioner::new();
        provisioner
            .expect_acquire()
            .times(acquires)
            .returning(|id, _| Ok(SandboxHandle::new(id, "/tmp/sandbox", Isolation::default())));
        provisioner.expect_release().times(releases).return_const(());
        provisioner
    }

    #[tokio::test]
    async fn test_accepted_submission() {
        let provisioner = provisioner_expecting(1, 1);
        let mut executor = MockExecutor::new();
        executor
            .expect_execute()
            .times(1)
            .return_const(Ok(ExecutionReport::Ran(completed("5050\n", 0))));

        let judge = create_judge(Arc::new(provisioner), Arc::new(executor));
        let request = create_request();
        let verdict = judge.judge(&request, &CancellationToken::new()).await;

        assert_eq!(verdict.submission_id, request.id);
        assert_eq!(verdict.outcome, Outcome::Accepted);
        assert!(verdict.fault.is_none());
        assert_eq!(verdict.execution_result.unwrap().stdout, b"5050\n");
    }

    #[tokio::test]
    async fn test_wrong_output_has_detail() {
        let provisioner = provisioner_expecting(1, 1);
        let mut executor = MockExecutor::new();
        executor
            .expect_execute()
            .return_const(Ok(ExecutionReport::Ran(completed("5051\n", 0))));

        let judge = create_judge(Arc::new(provisioner), Arc::new(executor));
        let verdict = judge.judge(&create_request(), &CancellationToken::new()).await;

        assert_eq!(verdict.outcome, Outcome::WrongOutput);
        let detail = verdict.compare_detail.unwrap();
        assert_eq!(detail.line, 1);
        assert_eq!(detail.expected, "5050");
        assert_eq!(detail.actual, "5051");
    }

    #[derive(Debug)]
    struct IgnoreCase;

    impl Comparator for IgnoreCase {
        fn compare(&self, expected: &[u8], actual: &[u8]) -> Comparison {
            Comparison {
                accepted: expected.eq_ignore_ascii_case(actual),
                detail: None,
            }
        }
    }

    #[tokio::test]
    async fn test_custom_comparison_uses_configured_comparator() {
        let provisioner = provisioner_expecting(2, 2);
        let mut executor = MockExecutor::new();
        executor
            .expect_execute()
            .times(2)
            .return_const(Ok(ExecutionReport::Ran(completed("YES\n", 0))));
        let provisioner = Arc::new(provisioner);
        let executor = Arc::new(executor);

        let mut request = create_request();
        request.expected_output = Some(b"yes\n".to_vec());
        request.comparison_mode = ComparisonMode::Custom;

        let without = create_judge(provisioner.clone(), executor.clone());
        let verdict = without.judge(&request, &CancellationToken::new()).await;
        assert_eq!(verdict.outcome, Outcome::InternalError);
        assert_eq!(verdict.fault, Some(FaultCause::ComparatorUnavailable));

        let with = create_judge(provisioner, executor).with_comparator(Arc::new(IgnoreCase));
        let verdict = with.judge(&request, &CancellationToken::new()).await;
        assert_eq!(verdict.outcome, Outcome::Accepted);
    }

    #[tokio::test]
    async fn test_compile_error() {
        let provisioner = provisioner_expecting(1, 1);
        let mut executor = MockExecutor::new();
        executor
            .expect_execute()
            .return_const(Ok(ExecutionReport::CompileFailed(completed("", 1))));

        let judge = create_judge(Arc::new(provisioner), Arc::new(executor));
        let verdict = judge.judge(&create_request(), &CancellationToken::new()).await;

        assert_eq!(verdict.outcome, Outcome::CompileError);
        let result = verdict.execution_result.unwrap();
        assert_eq!(result.termination_reason, TerminationReason::Completed);
        assert_ne!(result.exit_code, 0);
    }

    #[tokio::test]
    async fn test_provisioning_failure_skips_execution() {
        let cases = [
            (
                ProvisionError::ResourceExhausted("no cgroup".to_string()),
                FaultCause::ResourceExhausted("no cgroup".to_string()),
            ),
            (
                ProvisionError::Provisioning("read-only fs".to_string()),
                FaultCause::Provisioning("read-only fs".to_string()),
            ),
        ];

        for (error, expected_fault) in cases {
            let mut provisioner = MockProvisioner::new();
            provisioner
                .expect_acquire()
                .times(1)
                .returning(move |_, _| Err(error.clone()));
            provisioner.expect_release().times(0);

            let mut executor = MockExecutor::new();
            executor.expect_execute().times(0);

            let judge = create_judge(Arc::new(provisioner), Arc::new(executor));
            let verdict = judge.judge(&create_request(), &CancellationToken::new()).await;

            assert_eq!(verdict.outcome, Outcome::InternalError);
            assert_eq!(verdict.fault, Some(expected_fault));
            assert!(verdict.execution_result.is_none());
        }
    }

    #[tokio::test]
    async fn test_executor_error_still_releases() {
        let provisioner = provisioner_expecting(1, 1);
        let mut executor = MockExecutor::new();
        executor
            .expect_execute()
            .return_const(Err(ExecuteError::internal("cannot spawn")));

        let judge = create_judge(Arc::new(provisioner), Arc::new(executor));
        let verdict = judge.judge(&create_request(), &CancellationToken::new()).await;

        assert_eq!(verdict.outcome, Outcome::InternalError);
        assert_eq!(
            verdict.fault,
            Some(FaultCause::Internal("cannot spawn".to_string()))
        );
    }

    #[tokio::test]
    async fn test_executor_panic_still_releases() {
        let provisioner = provisioner_expecting(1, 1);
        let mut executor = MockExecutor::new();
        executor
            .expect_execute()
            .returning(|_, _, _, _, _| panic!("Tux is sad and won't work :("));

        let judge = create_judge(Arc::new(provisioner), Arc::new(executor));
        let verdict = judge.judge(&create_request(), &CancellationToken::new()).await;

        assert_eq!(verdict.outcome, Outcome::InternalError);
        assert!(matches!(verdict.fault, Some(FaultCause::Internal(msg)) if msg.contains("Tux")));
    }

    #[tokio::test]
    async fn test_pipeline_ceiling_reports_scheduler_timeout() {
        let provisioner = Arc::new(ProvisionerStub::new());
        let executor = ExecutorStub::new(
            Ok(ExecutionReport::Ran(completed("5050\n", 0))),
            Duration::from_secs(5),
        );

        let judge = create_judge(provisioner.clone(), Arc::new(executor));
        let started = Instant::now();
        let verdict = judge.judge(&create_request(), &CancellationToken::new()).await;

        assert_eq!(verdict.outcome, Outcome::InternalError);
        assert_eq!(verdict.fault, Some(FaultCause::SchedulerTimeout));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(provisioner.acquired(), 1);
        assert_eq!(provisioner.released(), 1);
    }

    #[tokio::test]
    async fn test_hanging_provisioner_reports_scheduler_timeout() {
        let provisioner = Arc::new(ProvisionerStub::new().with_delay(Duration::from_secs(1)));
        let mut executor = MockExecutor::new();
        executor.expect_execute().times(0);

        let judge = create_judge(provisioner.clone(), Arc::new(executor));
        let verdict = judge.judge(&create_request(), &CancellationToken::new()).await;

        assert_eq!(verdict.fault, Some(FaultCause::SchedulerTimeout));

        // The late sandbox is still handed back once acquisition finishes.
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(provisioner.acquired(), 1);
        assert_eq!(provisioner.released(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_while_running_aborts() {
        let provisioner = Arc::new(ProvisionerStub::new());
        let executor = ExecutorStub::new(
            Ok(ExecutionReport::Ran(completed("5050\n", 0))),
            Duration::from_secs(5),
        );

        let judge = create_judge(provisioner.clone(), Arc::new(executor));
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let verdict = judge.judge(&create_request(), &cancel).await;

        assert_eq!(verdict.outcome, Outcome::Aborted);
        assert_eq!(provisioner.released(), 1);
    }

    #[tokio::test]
    async fn test_events_follow_pipeline_stages() {
        let provisioner = provisioner_expecting(1, 1);
        let mut executor = MockExecutor::new();
        executor
            .expect_execute()
            .return_const(Ok(ExecutionReport::Ran(completed("5050\n", 0))));

        let events = Arc::new(RecordingSink::default());
        let judge = Judge::new(
            Arc::new(provisioner),
            Arc::new(executor),
            Arc::new(RunnerRegistry::with_languages(&Language::ALL)),
            events.clone(),
            Duration::from_millis(300),
        );
        let request = create_request();
        judge.judge(&request, &CancellationToken::new()).await;

        assert_eq!(
            events.stages(request.id),
            vec![
                Stage::Provisioned,
                Stage::Executed,
                Stage::Released,
                Stage::Evaluated
            ]
        );
        let evaluated = events.events().pop().unwrap();
        assert_eq!(evaluated.outcome, Some(Outcome::Accepted));
    }
}
