use std::time::Duration;

pub const RELEASE_TIMEOUT: Duration = Duration::from_secs(10);

pub const SANDBOX_PATH_ENV: &str = "/usr/local/bin:/usr/bin:/bin";

/// Exit code reported for a process that died from a signal: 128 + signo.
pub const SIGNAL_EXIT_BASE: i32 = 128;

pub const DEFAULT_COMPILE_MEMORY_BYTES: u64 = 512 * 1024 * 1024;
pub const DEFAULT_MAX_PROCESSES: u64 = 64;
pub const DEFAULT_FILE_SIZE_BYTES: u64 = 16 * 1024 * 1024;
pub const COMPILE_OUTPUT_CAP: u64 = 64 * 1024;

/// Sandbox uids used when the judge runs as root and none are configured.
pub const DEFAULT_UID_RANGE: (u32, u32) = (60000, 60999);
pub const ISOLATION_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

pub const CGROUP_MOUNT: &str = "/sys/fs/cgroup";
/// Leaf the judge's own processes move to when its cgroup is delegated.
pub const SUPERVISOR_GROUP: &str = "judge-supervisor";
pub const CGROUP_DRAIN_POLL: Duration = Duration::from_millis(10);
pub const CGROUP_DRAIN_ATTEMPTS: u32 = 100;

/// Terminal states kept for lookup after a submission finishes.
pub const FINISHED_STATE_RETENTION: usize = 1024;
