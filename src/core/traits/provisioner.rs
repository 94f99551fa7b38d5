use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use crate::core::{
    domain::{ResourceLimits, SubmissionId},
    errors::ProvisionError,
};

/// Isolation knobs a provisioner decided on for one sandbox. The executor
/// applies them to every process it starts inside that sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Isolation {
    /// Kernel limit group (cgroup v2 directory) the processes are placed in.
    pub limit_group: Option<PathBuf>,
    /// Dedicated sandbox identity. Without one the program keeps the
    /// judge's uid behind a user namespace.
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub max_processes: u64,
    pub file_size_bytes: u64,
}

/// Raised once the provisioner starts tearing a sandbox down, so that a
/// kill it causes is not taken for something the program did.
#[derive(Debug, Clone, Default)]
pub struct Teardown(Arc<AtomicBool>);

impl Teardown {
    pub fn begin(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn started(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One provisioned environment, owned by a single worker for a single
/// submission. Must be handed back to `Provisioner::release`.
#[derive(Debug)]
pub struct SandboxHandle {
    pub submission_id: SubmissionId,
    pub workdir: PathBuf,
    pub isolation: Isolation,
    pub teardown: Teardown,
}

impl SandboxHandle {
    pub fn new(submission_id: SubmissionId, workdir: impl AsRef<Path>, isolation: Isolation) -> Self {
        Self {
            submission_id,
            workdir: workdir.as_ref().into(),
            isolation,
            teardown: Teardown::default(),
        }
    }
}

#[mockall::automock]
#[async_trait::async_trait]
pub trait Provisioner: std::fmt::Debug + Send + Sync {
    async fn acquire(
        &self,
        submission_id: SubmissionId,
        limits: &ResourceLimits,
    ) -> Result<SandboxHandle, ProvisionError>;

    /// Removes the private tree and kills lingering processes. Never fails
    /// from the caller's point of view; cleanup problems are logged.
    async fn release(&self, sandbox: SandboxHandle);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_teardown_is_shared_between_clones() {
        let teardown = Teardown::default();
        let seen_by_executor = teardown.clone();
        assert!(!seen_by_executor.started());

        teardown.begin();
        assert!(seen_by_executor.started());
    }
}
