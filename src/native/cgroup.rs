use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::OnceLock,
    time::Duration,
};

use nix::{
    errno::Errno,
    sys::signal::{Signal, kill},
    unistd::Pid,
};

use crate::constants::{CGROUP_DRAIN_ATTEMPTS, CGROUP_DRAIN_POLL, CGROUP_MOUNT, SUPERVISOR_GROUP};

const CONTROLLERS: &[&str] = &["memory", "pids", "cpu"];
/// Controllers a sandbox cannot be limited without.
const REQUIRED_CONTROLLERS: &[&str] = &["memory", "pids"];

static DELEGATED: OnceLock<Result<PathBuf, String>> = OnceLock::new();

/// A cgroup v2 directory owned by one sandbox (or one phase inside it).
/// The caller must have write access to the parent, i.e. the hierarchy is
/// delegated to the judge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitGroup {
    path: PathBuf,
}

impl LimitGroup {
    pub fn create(parent: &Path, name: &str) -> io::Result<Self> {
        let path = parent.join(name);
        fs::create_dir(&path)?;
        Ok(Self { path })
    }

    pub fn open(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().into(),
        }
    }

    /// The cgroup the judge itself was started in, made ready to hold
    /// sandbox groups. Once controllers are enabled for children no process
    /// may stay in it, so its members move to a `judge-supervisor` leaf
    /// first. Prepared once per process.
    pub fn delegated() -> io::Result<LimitGroup> {
        DELEGATED
            .get_or_init(|| prepare_delegated().map_err(|e| e.to_string()))
            .clone()
            .map(LimitGroup::open)
            .map_err(io::Error::other)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fails unless memory and process limits can be set on this group.
    pub fn require_controllers(&self) -> io::Result<()> {
        let available = fs::read_to_string(self.path.join("cgroup.controllers"))?;
        let missing: Vec<&str> = REQUIRED_CONTROLLERS
            .iter()
            .copied()
            .filter(|controller| !available.split_whitespace().any(|c| c == *controller))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("controllers not delegated: {}", missing.join(", ")),
        ))
    }

    /// Creates a nested group. Controllers are enabled for children first,
    /// since processes may only live in leaf groups.
    pub fn child(&self, name: &str) -> io::Result<LimitGroup> {
        self.enable_controllers()?;
        LimitGroup::create(&self.path, name)
    }

    fn enable_controllers(&self) -> io::Result<()> {
        let available = fs::read_to_string(self.path.join("cgroup.controllers"))?;
        let enabled: Vec<String> = CONTROLLERS
            .iter()
            .filter(|controller| available.split_whitespace().any(|c| c == **controller))
            .map(|controller| format!("+{}", controller))
            .collect();
        if enabled.is_empty() {
            return Ok(());
        }
        fs::write(self.path.join("cgroup.subtree_control"), enabled.join(" "))
    }

    /// Hard memory cap with swap disabled. With `memory.oom.group` the
    /// kernel kills the whole group at once instead of a single victim.
    pub fn set_memory_max(&self, bytes: u64) -> io::Result<()> {
        fs::write(self.path.join("memory.max"), bytes.to_string())?;
        self.write_optional("memory.swap.max", "0")?;
        self.write_optional("memory.oom.group", "1")
    }

    pub fn set_pids_max(&self, max: u64) -> io::Result<()> {
        fs::write(self.path.join("pids.max"), max.to_string())
    }

    pub fn procs_file(&self) -> PathBuf {
        self.path.join("cgroup.procs")
    }

    pub fn oom_killed(&self) -> io::Result<bool> {
        let events = fs::read_to_string(self.path.join("memory.events"))?;
        Ok(read_key(&events, "oom_kill").is_some_and(|count| count > 0))
    }

    /// `memory.peak` where the kernel has it, `memory.current` otherwise.
    pub fn peak_memory(&self) -> io::Result<u64> {
        let raw = match fs::read_to_string(self.path.join("memory.peak")) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::read_to_string(self.path.join("memory.current"))?
            }
            Err(e) => return Err(e),
        };
        parse_u64(raw.trim())
    }

    pub fn cpu_usage(&self) -> io::Result<Duration> {
        let stat = fs::read_to_string(self.path.join("cpu.stat"))?;
        read_key(&stat, "usage_usec")
            .map(Duration::from_micros)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "cpu.stat has no usage_usec"))
    }

    /// Kills every process in the group and its children.
    pub fn kill(&self) -> io::Result<()> {
        let kill_file = self.path.join("cgroup.kill");
        if kill_file.exists() {
            return fs::write(kill_file, "1");
        }

        for pid in self.pids()? {
            match kill(Pid::from_raw(pid), Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => tracing::warn!(pid, "Failed to kill process in {}: {}", self.path.display(), e),
            }
        }
        for child in self.children()? {
            child.kill()?;
        }
        Ok(())
    }

    /// Kills, waits for the group to empty, then removes it. Nested groups
    /// go first.
    pub async fn remove(&self) -> io::Result<()> {
        self.kill()?;

        let descendants = self.descendants()?;
        for group in descendants.iter().rev().chain(std::iter::once(self)) {
            for _ in 0..CGROUP_DRAIN_ATTEMPTS {
                if group.pids()?.is_empty() {
                    break;
                }
                tokio::time::sleep(CGROUP_DRAIN_POLL).await;
            }

            match fs::remove_dir(&group.path) {
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                other => other?,
            }
        }
        Ok(())
    }

    /// Every nested group, parents before their children.
    fn descendants(&self) -> io::Result<Vec<LimitGroup>> {
        let mut groups = Vec::new();
        for child in self.children()? {
            let nested = child.descendants()?;
            groups.push(child);
            groups.extend(nested);
        }
        Ok(groups)
    }

    fn pids(&self) -> io::Result<Vec<i32>> {
        let procs = match fs::read_to_string(self.procs_file()) {
            Ok(procs) => procs,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(procs
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .collect())
    }

    fn children(&self) -> io::Result<Vec<LimitGroup>> {
        let entries = match fs::read_dir(&self.path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut children = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                children.push(LimitGroup::open(entry.path()));
            }
        }
        Ok(children)
    }

    /// Interface files that older kernels lack are skipped.
    fn write_optional(&self, file: &str, value: &str) -> io::Result<()> {
        let path = self.path.join(file);
        if !path.exists() {
            return Ok(());
        }
        fs::write(path, value)
    }
}

fn prepare_delegated() -> io::Result<PathBuf> {
    let membership = fs::read_to_string("/proc/self/cgroup")?;
    let own = own_group(&membership)
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "not in a cgroup v2 hierarchy"))?;

    let own = Path::new(CGROUP_MOUNT).join(own.trim_start_matches('/'));
    let group = match own.parent() {
        // An earlier judge process already moved everything out.
        Some(parent) if own.file_name().is_some_and(|name| name == SUPERVISOR_GROUP) => {
            LimitGroup::open(parent)
        }
        _ => {
            let group = LimitGroup::open(&own);
            // The root group is exempt from the leaf rule and has no type.
            if group.path.join("cgroup.type").exists() {
                group.evacuate()?;
            }
            group
        }
    };
    group.enable_controllers()?;
    tracing::info!("Sandbox limit groups live under {}", group.path.display());
    Ok(group.path)
}

impl LimitGroup {
    fn evacuate(&self) -> io::Result<()> {
        let supervisor = self.path.join(SUPERVISOR_GROUP);
        match fs::create_dir(&supervisor) {
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            other => other?,
        }
        let procs = supervisor.join("cgroup.procs");
        for pid in self.pids()? {
            match fs::write(&procs, pid.to_string()) {
                Err(e) if e.raw_os_error() == Some(libc::ESRCH) => {}
                other => other?,
            }
        }
        Ok(())
    }
}

/// Path of the unified hierarchy entry in `/proc/<pid>/cgroup`.
fn own_group(membership: &str) -> Option<&str> {
    membership.lines().find_map(|line| line.strip_prefix("0::"))
}

/// Value of a `key value` line in flat-keyed cgroup files.
fn read_key(content: &str, key: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some(k), Some(value)) if k == key => value.parse().ok(),
            _ => None,
        }
    })
}

fn parse_u64(raw: &str) -> io::Result<u64> {
    raw.parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("{}: {:?}", e, raw)))
}
