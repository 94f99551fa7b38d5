use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use crate::core::{
    domain::{ResourceLimits, SubmissionId},
    errors::ProvisionError,
    traits::provisioner::{Isolation, Provisioner, SandboxHandle},
};

/// Hands out sandboxes that point at a non-existent directory and counts
/// every acquire and release.
#[derive(Debug, Default)]
pub struct ProvisionerStub {
    error: Option<ProvisionError>,
    delay: Duration,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl ProvisionerStub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(error: ProvisionError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        Self { delay, ..self }
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Provisioner for ProvisionerStub {
    #[tracing::instrument(skip(self))]
    async fn acquire(
        &self,
        submission_id: SubmissionId,
        limits: &ResourceLimits,
    ) -> Result<SandboxHandle, ProvisionError> {
        tokio::time::sleep(self.delay).await;
        self.acquired.fetch_add(1, Ordering::SeqCst);

        if let Some(error) = &self.error {
            return Err(error.clone());
        }
        Ok(SandboxHandle::new(
            submission_id,
            format!("/nonexistent/sandbox/{}", submission_id),
            Isolation::default(),
        ))
    }

    async fn release(&self, sandbox: SandboxHandle) {
        tracing::debug!("Releasing stub sandbox {}", sandbox.submission_id);
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}
