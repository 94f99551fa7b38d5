use std::{
    collections::VecDeque,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use nix::unistd::{Gid, Uid, chown};
use tokio::{fs, sync::OnceCell};

use crate::{
    config::SandboxConfig,
    constants::{DEFAULT_UID_RANGE, ISOLATION_CHECK_TIMEOUT},
    core::{
        domain::{ResourceLimits, SubmissionId},
        errors::ProvisionError,
        traits::provisioner::{Isolation, Provisioner, SandboxHandle},
    },
    native::{
        cgroup::LimitGroup,
        process::{Launch, supervise},
    },
};

const WORKDIR_MODE: u32 = 0o700;

/// Unprivileged uids handed out one per live sandbox, so that two
/// submissions never share an identity.
#[derive(Debug)]
pub struct UidPool {
    free: Mutex<VecDeque<u32>>,
}

impl UidPool {
    pub fn new(first: u32, last: u32) -> Self {
        Self {
            free: Mutex::new((first..=last).collect()),
        }
    }

    pub fn take(&self) -> Option<u32> {
        self.free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    pub fn give_back(&self, uid: u32) {
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        if !free.contains(&uid) {
            free.push_back(uid);
        }
    }

    pub fn available(&self) -> usize {
        self.free.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Prepares sandboxes on the local host: a private working directory and a
/// cgroup v2 group per submission, plus a dedicated uid when the judge can
/// hand one out. The first sandbox also checks that processes can be
/// started in their own namespaces; without either primitive nothing is
/// provisioned.
#[derive(Debug)]
pub struct NativeProvisioner {
    settings: SandboxConfig,
    uids: Option<UidPool>,
    isolation_checked: OnceCell<Result<(), String>>,
}

impl NativeProvisioner {
    pub fn new(settings: SandboxConfig) -> Self {
        let uids = settings
            .uid_range
            .or_else(|| Uid::effective().is_root().then_some(DEFAULT_UID_RANGE))
            .map(|(first, last)| UidPool::new(first, last));
        Self {
            settings,
            uids,
            isolation_checked: OnceCell::new(),
        }
    }

    async fn prepare(
        &self,
        submission_id: SubmissionId,
        uid: Option<u32>,
    ) -> Result<SandboxHandle, ProvisionError> {
        let workdir = self.settings.root.join(submission_id.to_string());
        make_workdir(&self.settings.root, &workdir, uid)
            .await
            .map_err(|e| {
                ProvisionError::Provisioning(format!(
                    "cannot create {}: {}",
                    workdir.display(),
                    e
                ))
            })?;

        let group = match self.make_group(submission_id) {
            Ok(group) => group,
            Err(e) => {
                remove_workdir(&workdir).await;
                return Err(e);
            }
        };

        Ok(SandboxHandle::new(
            submission_id,
            workdir,
            Isolation {
                limit_group: Some(group.path().to_path_buf()),
                uid,
                gid: uid,
                max_processes: self.settings.max_processes,
                file_size_bytes: self.settings.file_size_bytes,
            },
        ))
    }

    fn cgroup_root(&self) -> std::io::Result<PathBuf> {
        match &self.settings.cgroup_root {
            Some(cgroup_root) => Ok(cgroup_root.clone()),
            None => Ok(LimitGroup::delegated()?.path().to_path_buf()),
        }
    }

    fn make_group(&self, submission_id: SubmissionId) -> Result<LimitGroup, ProvisionError> {
        let exhausted = |e: std::io::Error| {
            ProvisionError::ResourceExhausted(format!("cannot create limit group: {}", e))
        };
        let cgroup_root = self.cgroup_root().map_err(exhausted)?;
        let group = LimitGroup::create(&cgroup_root, &format!("judge-{}", submission_id))
            .map_err(exhausted)?;

        let limited = group
            .require_controllers()
            .and_then(|()| group.set_pids_max(self.settings.max_processes));
        if let Err(e) = limited {
            if let Err(cleanup) = std::fs::remove_dir(group.path()) {
                tracing::warn!("Failed to remove half-made limit group: {}", cleanup);
            }
            return Err(ProvisionError::ResourceExhausted(format!(
                "cannot limit sandbox: {}",
                e
            )));
        }
        Ok(group)
    }

    async fn check_isolation(&self, sandbox: &SandboxHandle) -> Result<(), ProvisionError> {
        self.isolation_checked
            .get_or_init(|| start_isolated(sandbox))
            .await
            .clone()
            .map_err(|e| ProvisionError::Provisioning(format!("namespace isolation unavailable: {}", e)))
    }
}

#[async_trait::async_trait]
impl Provisioner for NativeProvisioner {
    #[tracing::instrument(skip(self, limits))]
    async fn acquire(
        &self,
        submission_id: SubmissionId,
        limits: &ResourceLimits,
    ) -> Result<SandboxHandle, ProvisionError> {
        let uid = match &self.uids {
            Some(uids) => Some(uids.take().ok_or_else(|| {
                ProvisionError::ResourceExhausted("no free sandbox uid".to_string())
            })?),
            None => None,
        };

        let prepared = self.prepare(submission_id, uid).await;
        if prepared.is_err() {
            if let (Some(uids), Some(uid)) = (&self.uids, uid) {
                uids.give_back(uid);
            }
        }
        let sandbox = prepared?;

        if let Err(e) = self.check_isolation(&sandbox).await {
            self.release(sandbox).await;
            return Err(e);
        }

        tracing::debug!(
            "Sandbox ready: workdir={}, limit_group={:?}, uid={:?}, memory_bytes={}",
            sandbox.workdir.display(),
            sandbox.isolation.limit_group,
            sandbox.isolation.uid,
            limits.memory_bytes
        );
        Ok(sandbox)
    }

    #[tracing::instrument(skip_all, fields(submission_id = %sandbox.submission_id))]
    async fn release(&self, sandbox: SandboxHandle) {
        sandbox.teardown.begin();

        if let Some(path) = &sandbox.isolation.limit_group {
            if let Err(e) = LimitGroup::open(path).remove().await {
                tracing::error!("Failed to remove limit group {}: {}", path.display(), e);
            }
        }

        remove_workdir(&sandbox.workdir).await;

        if let (Some(uids), Some(uid)) = (&self.uids, sandbox.isolation.uid) {
            uids.give_back(uid);
        }
        tracing::debug!("Sandbox released");
    }
}

/// Starts one trivial program the way every submission is started.
async fn start_isolated(sandbox: &SandboxHandle) -> Result<(), String> {
    let launch = Launch {
        argv: vec!["/bin/true".into()],
        workdir: &sandbox.workdir,
        env: Vec::new(),
        stdin: b"",
        isolation: &sandbox.isolation,
        group: None,
        cpu_time: ISOLATION_CHECK_TIMEOUT,
        wall_time: ISOLATION_CHECK_TIMEOUT,
        output_cap: 0,
    };
    let exited = supervise(launch, &sandbox.teardown)
        .await
        .map_err(|e| e.to_string())?;
    if !exited.status.success() {
        return Err(format!("isolated process exited with {}", exited.exit_code()));
    }
    tracing::info!("Namespace isolation works");
    Ok(())
}

async fn make_workdir(root: &Path, workdir: &Path, uid: Option<u32>) -> std::io::Result<()> {
    fs::create_dir_all(root).await?;
    fs::create_dir(workdir).await?;
    fs::set_permissions(workdir, std::fs::Permissions::from_mode(WORKDIR_MODE)).await?;
    if let Some(uid) = uid {
        chown(
            workdir,
            Some(Uid::from_raw(uid)),
            Some(Gid::from_raw(uid)),
        )?;
    }
    Ok(())
}

async fn remove_workdir(workdir: &Path) {
    match fs::remove_dir_all(workdir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::error!("Failed to remove {}: {}", workdir.display(), e),
    }
}
