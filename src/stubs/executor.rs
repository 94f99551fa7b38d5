use std::time::Duration;

use crate::core::{
    domain::{ExecutionReport, ResourceLimits},
    errors::ExecuteError,
    registry::Runner,
    traits::{executor::Executor, provisioner::SandboxHandle},
};

#[derive(Debug, Clone)]
pub struct ExecutorStub {
    result: Result<ExecutionReport, ExecuteError>,
    delay: Duration,
}

impl ExecutorStub {
    pub fn new(result: Result<ExecutionReport, ExecuteError>, delay: Duration) -> Self {
        Self { result, delay }
    }
}

#[async_trait::async_trait]
impl Executor for ExecutorStub {
    #[tracing::instrument(skip(sandbox, source_code, stdin))]
    async fn execute(
        &self,
        sandbox: &SandboxHandle,
        runner: &Runner,
        source_code: &str,
        stdin: &[u8],
        limits: &ResourceLimits,
    ) -> Result<ExecutionReport, ExecuteError> {
        tracing::debug!(
            "Start execution: sandbox={:?}, stdin_len={}, limits={:?}",
            sandbox.workdir,
            stdin.len(),
            limits
        );
        tokio::time::sleep(self.delay).await;
        tracing::debug!("Execution result: {:?}", self.result);

        self.result.clone()
    }
}
