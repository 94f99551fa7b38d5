use crate::core::{
    domain::{ExecutionReport, ResourceLimits},
    errors::ExecuteError,
    registry::Runner,
    traits::provisioner::SandboxHandle,
};

#[mockall::automock]
#[async_trait::async_trait]
pub trait Executor: std::fmt::Debug + Send + Sync {
    /// Compiles (when the runner needs it) and runs `source_code` inside
    /// `sandbox`. Program misbehaviour is reported through the termination
    /// reason of the returned result; `Err` means the judge itself failed.
    async fn execute(
        &self,
        sandbox: &SandboxHandle,
        runner: &Runner,
        source_code: &str,
        stdin: &[u8],
        limits: &ResourceLimits,
    ) -> Result<ExecutionReport, ExecuteError>;
}
