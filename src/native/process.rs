use std::{
    ffi::{CStr, CString, OsString},
    io,
    os::unix::{
        ffi::OsStrExt,
        process::{CommandExt, ExitStatusExt},
    },
    path::Path,
    process::{ExitStatus, Stdio},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use nix::{
    sched::{CloneFlags, unshare},
    sys::{
        resource::{Resource, setrlimit},
        signal::{Signal, killpg},
    },
    unistd::{Gid, Pid, Uid, setgid, setgroups, setuid},
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    process::{ChildStderr, ChildStdin, ChildStdout},
    task::JoinHandle,
    time::{Instant, timeout},
};
use tokio_util::sync::CancellationToken;

use crate::{
    constants::{SANDBOX_PATH_ENV, SIGNAL_EXIT_BASE},
    core::traits::provisioner::{Isolation, Teardown},
    native::cgroup::LimitGroup,
};

const READ_CHUNK: usize = 8 * 1024;
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
/// Upper bound for closing inherited descriptors one by one on kernels
/// without close_range(2).
const FALLBACK_FD_LIMIT: libc::c_uint = 4096;

/// One process to start inside a sandbox, with the limits of its phase.
#[derive(Debug)]
pub struct Launch<'a> {
    pub argv: Vec<OsString>,
    pub workdir: &'a Path,
    pub env: Vec<(String, OsString)>,
    pub stdin: &'a [u8],
    pub isolation: &'a Isolation,
    pub group: Option<&'a LimitGroup>,
    pub cpu_time: Duration,
    pub wall_time: Duration,
    /// Applies to stdout and stderr separately.
    pub output_cap: u64,
}

/// What the supervisor observed. Classification is left to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exited {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub output_exceeded: bool,
    pub wall_timed_out: bool,
    /// The sandbox was being torn down while the process ran.
    pub torn_down: bool,
    pub wall_time: Duration,
}

impl Exited {
    /// Exit code, or 128 + signal number for a signalled process.
    pub fn exit_code(&self) -> i32 {
        match (self.status.code(), self.status.signal()) {
            (Some(code), _) => code,
            (None, Some(signal)) => SIGNAL_EXIT_BASE + signal,
            (None, None) => -1,
        }
    }

    pub fn signal(&self) -> Option<Signal> {
        self.status
            .signal()
            .and_then(|signal| Signal::try_from(signal).ok())
    }
}

/// Starts the program inside fresh PID, mount, network and IPC namespaces
/// and supervises it until it exits, the wall clock runs out, or a stream
/// goes past the output cap. Only infrastructure problems (spawn, wait) are
/// errors.
///
/// The direct child is a relay that stays outside the namespaces. It is
/// only reaped once everything is killed, so its process group id can
/// never refer to somebody else when the supervisor signals it.
#[tracing::instrument(skip_all, fields(program = ?launch.argv.first()))]
pub async fn supervise(launch: Launch<'_>, teardown: &Teardown) -> io::Result<Exited> {
    let mut command = command(&launch)?;
    let mut child = command.spawn()?;
    let pid = child.id() as i32;
    let mut abandoned = KillOnDrop(Some(pid));

    let stdin = child.stdin.take().map(ChildStdin::from_std).transpose()?;
    let stdout = child.stdout.take().map(ChildStdout::from_std).transpose()?;
    let stderr = child.stderr.take().map(ChildStderr::from_std).transpose()?;
    // The child is reaped below, not through `Child`.
    drop(child);

    let started = Instant::now();
    let overflow = CancellationToken::new();
    let feeding = stdin.map(|stdin| tokio::spawn(feed(stdin, launch.stdin.to_vec())));
    let stdout = stdout.map(|pipe| Capture::start(pipe, launch.output_cap, overflow.clone()));
    let stderr = stderr.map(|pipe| Capture::start(pipe, launch.output_cap, overflow.clone()));

    let mut exiting = tokio::task::spawn_blocking(move || wait_exited(pid));
    let deadline = tokio::time::sleep(launch.wall_time);
    tokio::pin!(deadline);

    let mut killed = false;
    let mut wall_timed_out = false;
    let exited = loop {
        tokio::select! {
            exited = &mut exiting => break exited,
            _ = &mut deadline, if !killed => {
                tracing::debug!(pid, "Wall clock limit reached, killing sandbox processes");
                wall_timed_out = true;
                killed = true;
                kill_group(pid);
            }
            _ = overflow.cancelled(), if !killed => {
                tracing::debug!(pid, cap = launch.output_cap, "Output cap exceeded, killing sandbox processes");
                killed = true;
                kill_group(pid);
            }
        }
    };
    exited.map_err(io::Error::other)??;
    let wall_time = started.elapsed();
    let torn_down = teardown.started();

    abandoned.0 = None;
    let status = reap(pid)?;

    if let Some(feeding) = feeding {
        feeding.abort();
    }
    let stdout = collect(stdout).await;
    let stderr = collect(stderr).await;

    Ok(Exited {
        status,
        stdout,
        stderr,
        output_exceeded: overflow.is_cancelled(),
        wall_timed_out,
        torn_down,
        wall_time,
    })
}

fn command(launch: &Launch<'_>) -> io::Result<std::process::Command> {
    let (program, args) = launch
        .argv
        .split_first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command line"))?;

    let mut command = std::process::Command::new(program);
    command
        .args(args)
        .current_dir(launch.workdir)
        .env_clear()
        .env("PATH", SANDBOX_PATH_ENV)
        .env("HOME", launch.workdir)
        .envs(launch.env.iter().map(|(key, value)| (key, value)))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);

    let confinement = Confinement::new(launch)?;
    // SAFETY: the hook only performs async-signal-safe syscalls and does
    // not allocate.
    unsafe {
        command.pre_exec(move || confinement.apply());
    }
    Ok(command)
}

/// Everything the forked child applies to itself before exec. Prepared in
/// the parent so that nothing is allocated after fork.
struct Confinement {
    procs_file: Option<CString>,
    cpu_seconds: u64,
    file_size_bytes: u64,
    max_processes: Option<u64>,
    /// Only without a dedicated uid: the judge's own ids, mapped into a
    /// user namespace.
    id_maps: Option<IdMaps>,
    mounts: MountPlan,
    uid: Option<Uid>,
    gid: Option<Gid>,
}

impl Confinement {
    fn new(launch: &Launch<'_>) -> io::Result<Self> {
        let isolation = launch.isolation;
        let procs_file = launch
            .group
            .map(|group| CString::new(group.procs_file().as_os_str().as_bytes()))
            .transpose()?;

        Ok(Self {
            procs_file,
            cpu_seconds: launch.cpu_time.as_millis().div_ceil(1000) as u64 + 1,
            file_size_bytes: isolation.file_size_bytes,
            // RLIMIT_NPROC counts per user, so it is only meaningful for a
            // dedicated sandbox uid.
            max_processes: isolation.uid.map(|_| isolation.max_processes),
            id_maps: match isolation.uid {
                Some(_) => None,
                None => Some(IdMaps::own()?),
            },
            mounts: MountPlan::new(launch.workdir)?,
            uid: isolation.uid.map(Uid::from_raw),
            gid: isolation.gid.map(Gid::from_raw),
        })
    }

    /// Runs in the forked child. The child turns into the relay and forks
    /// the namespace init, which forks the program. Only the program
    /// returns from here.
    fn apply(&self) -> io::Result<()> {
        if let Some(procs_file) = &self.procs_file {
            write_file(procs_file, b"0")?;
        }

        setrlimit(Resource::RLIMIT_CPU, self.cpu_seconds, self.cpu_seconds + 1)?;
        setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
        if self.file_size_bytes > 0 {
            setrlimit(Resource::RLIMIT_FSIZE, self.file_size_bytes, self.file_size_bytes)?;
        }
        if let Some(max) = self.max_processes {
            setrlimit(Resource::RLIMIT_NPROC, max, max)?;
        }

        let mut namespaces = CloneFlags::CLONE_NEWPID
            | CloneFlags::CLONE_NEWNS
            | CloneFlags::CLONE_NEWNET
            | CloneFlags::CLONE_NEWIPC;
        if self.id_maps.is_some() {
            namespaces |= CloneFlags::CLONE_NEWUSER;
        }
        unshare(namespaces)?;
        if let Some(id_maps) = &self.id_maps {
            id_maps.write()?;
        }
        self.mounts.apply()?;

        let (status_read, status_write) = status_pipe()?;
        if fork()? != 0 {
            relay(status_read)
        }

        // PID 1 of the new namespace.
        // SAFETY: plain syscalls on descriptors and paths we own.
        unsafe {
            libc::close(status_read);
            libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL);
        }
        mount(c"proc", c"/proc", Some(c"proc"), PROC_FLAGS, None)?;

        let program = fork()?;
        if program != 0 {
            init(program, status_write)
        }

        // SAFETY: closing our copy of the status pipe.
        unsafe {
            libc::close(status_write);
        }
        if let Some(gid) = self.gid {
            setgroups(&[gid])?;
            setgid(gid)?;
        }
        if let Some(uid) = self.uid {
            setuid(uid)?;
        }
        Ok(())
    }
}

const PROC_FLAGS: libc::c_ulong = libc::MS_NOSUID | libc::MS_NODEV | libc::MS_NOEXEC;
const TMPFS_FLAGS: libc::c_ulong = libc::MS_NOSUID | libc::MS_NODEV;

/// Single-entry uid and gid maps for an unprivileged user namespace.
struct IdMaps {
    uid_map: CString,
    gid_map: CString,
}

impl IdMaps {
    fn own() -> io::Result<Self> {
        let uid = Uid::effective();
        let gid = Gid::effective();
        Ok(Self {
            uid_map: CString::new(format!("{} {} 1\n", uid, uid))?,
            gid_map: CString::new(format!("{} {} 1\n", gid, gid))?,
        })
    }

    fn write(&self) -> io::Result<()> {
        write_file(c"/proc/self/setgroups", b"deny")?;
        write_file(c"/proc/self/uid_map", self.uid_map.as_bytes())?;
        write_file(c"/proc/self/gid_map", self.gid_map.as_bytes())
    }
}

/// Private view of the filesystem: a fresh /tmp, and the directory holding
/// every sandbox replaced by one that only contains this workdir.
#[derive(Debug)]
struct MountPlan {
    masks: Vec<(CString, &'static CStr)>,
    /// Recreated under the masks, outermost first.
    dirs: Vec<CString>,
    workdir: CString,
}

impl MountPlan {
    fn new(workdir: &Path) -> io::Result<Self> {
        let root = workdir
            .parent()
            .filter(|root| *root != Path::new("/"))
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{} cannot be a sandbox workdir", workdir.display()),
                )
            })?;

        let tmp = Path::new("/tmp");
        let mut masks = vec![(path_cstring(tmp)?, c"mode=1777")];
        let base = if root.starts_with(tmp) {
            tmp
        } else {
            masks.push((path_cstring(root)?, c"mode=0755"));
            root
        };

        let mut dirs = workdir
            .ancestors()
            .take_while(|dir| *dir != base)
            .map(path_cstring)
            .collect::<io::Result<Vec<_>>>()?;
        dirs.reverse();

        Ok(Self {
            masks,
            dirs,
            workdir: path_cstring(workdir)?,
        })
    }

    fn apply(&self) -> io::Result<()> {
        mount(c"none", c"/", None, libc::MS_REC | libc::MS_PRIVATE, None)?;
        for (target, options) in &self.masks {
            mount(c"tmpfs", target, Some(c"tmpfs"), TMPFS_FLAGS, Some(options))?;
        }
        for dir in &self.dirs {
            // SAFETY: NUL-terminated path prepared before fork.
            if unsafe { libc::mkdir(dir.as_ptr(), 0o755) } != 0 {
                let error = io::Error::last_os_error();
                if error.kind() != io::ErrorKind::AlreadyExists {
                    return Err(error);
                }
            }
        }
        // The current directory is still the real workdir.
        mount(c".", &self.workdir, None, libc::MS_BIND | libc::MS_REC, None)?;
        // SAFETY: as above.
        if unsafe { libc::chdir(self.workdir.as_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

fn path_cstring(path: &Path) -> io::Result<CString> {
    Ok(CString::new(path.as_os_str().as_bytes())?)
}

fn mount(
    source: &CStr,
    target: &CStr,
    fstype: Option<&CStr>,
    flags: libc::c_ulong,
    data: Option<&CStr>,
) -> io::Result<()> {
    // SAFETY: every pointer is either null or a NUL-terminated string.
    let rc = unsafe {
        libc::mount(
            source.as_ptr(),
            target.as_ptr(),
            fstype.map_or(std::ptr::null(), CStr::as_ptr),
            flags,
            data.map_or(std::ptr::null(), |data| data.as_ptr().cast()),
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Writes a small value to a kernel interface file.
fn write_file(path: &CStr, value: &[u8]) -> io::Result<()> {
    // SAFETY: plain open/write/close on a NUL-terminated path.
    unsafe {
        let fd = libc::open(path.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let written = libc::write(fd, value.as_ptr().cast(), value.len());
        let error = io::Error::last_os_error();
        libc::close(fd);
        if written != value.len() as isize {
            return Err(error);
        }
    }
    Ok(())
}

fn status_pipe() -> io::Result<(libc::c_int, libc::c_int)> {
    let mut fds = [0; 2];
    // SAFETY: fds has room for both ends.
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((fds[0], fds[1]))
}

fn fork() -> io::Result<libc::pid_t> {
    // SAFETY: the caller is already a freshly forked single-threaded child.
    match unsafe { libc::fork() } {
        -1 => Err(io::Error::last_os_error()),
        pid => Ok(pid),
    }
}

/// The namespace init: reaps whatever gets orphaned until the program
/// itself exits, then reports its raw wait status. Exiting takes every
/// other process of the namespace down with it.
fn init(program: libc::pid_t, status_write: libc::c_int) -> ! {
    close_other_fds(status_write);
    default_signal(libc::SIGCHLD);
    loop {
        let mut status = 0;
        // SAFETY: status points to a live local.
        let reaped = unsafe { libc::waitpid(-1, &mut status, 0) };
        if reaped == program {
            // SAFETY: writes one int from a live local, then exits.
            unsafe {
                libc::write(
                    status_write,
                    (&status as *const libc::c_int).cast(),
                    size_of::<libc::c_int>(),
                );
                libc::_exit(0)
            }
        }
        if reaped < 0 && io::Error::last_os_error().kind() != io::ErrorKind::Interrupted {
            // SAFETY: exiting the forked child.
            unsafe { libc::_exit(1) }
        }
    }
}

/// The process the supervisor sees: waits for the namespace init and ends
/// the way the program ended. Without a reported status (the init itself
/// was killed) it ends the way the init did.
fn relay(status_read: libc::c_int) -> ! {
    close_other_fds(status_read);
    default_signal(libc::SIGCHLD);

    let mut init_status = 0;
    loop {
        // SAFETY: init_status points to a live local.
        let reaped = unsafe { libc::waitpid(-1, &mut init_status, 0) };
        if reaped > 0 {
            break;
        }
        if io::Error::last_os_error().kind() != io::ErrorKind::Interrupted {
            // SAFETY: exiting the forked child.
            unsafe { libc::_exit(1) }
        }
    }

    let mut program_status: libc::c_int = 0;
    // SAFETY: reads at most one int into a live local.
    let received = unsafe {
        libc::read(
            status_read,
            (&mut program_status as *mut libc::c_int).cast(),
            size_of::<libc::c_int>(),
        )
    };
    if received == size_of::<libc::c_int>() as isize {
        mirror(program_status)
    }
    mirror(init_status)
}

fn mirror(status: libc::c_int) -> ! {
    if libc::WIFSIGNALED(status) {
        let signal = libc::WTERMSIG(status);
        default_signal(signal);
        // SAFETY: signalling ourselves after restoring the default action.
        unsafe {
            let mut unblocked: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut unblocked);
            libc::sigaddset(&mut unblocked, signal);
            libc::sigprocmask(libc::SIG_UNBLOCK, &unblocked, std::ptr::null_mut());
            libc::kill(libc::getpid(), signal);
            libc::_exit(SIGNAL_EXIT_BASE + signal)
        }
    }
    // SAFETY: exiting the forked child.
    unsafe { libc::_exit(libc::WEXITSTATUS(status)) }
}

/// Handlers inherited from the judge stay installed in a child that never
/// execs.
fn default_signal(signal: libc::c_int) {
    // SAFETY: restoring a default disposition.
    unsafe {
        libc::signal(signal, libc::SIG_DFL);
    }
}

/// Drops every inherited descriptor except `keep`: stdio, the spawn error
/// pipe, and anything else the judge had open.
fn close_other_fds(keep: libc::c_int) {
    let keep = keep as libc::c_uint;
    if keep > 0 {
        close_range(0, keep - 1);
    }
    close_range(keep + 1, libc::c_uint::MAX);
}

fn close_range(first: libc::c_uint, last: libc::c_uint) {
    // SAFETY: closing descriptors of this process only.
    unsafe {
        if libc::syscall(libc::SYS_close_range, first, last, 0) == 0 {
            return;
        }
        for fd in first..=last.min(FALLBACK_FD_LIMIT) {
            libc::close(fd as libc::c_int);
        }
    }
}

/// Blocks until the child has exited, leaving it unreaped.
fn wait_exited(pid: i32) -> io::Result<()> {
    loop {
        // SAFETY: siginfo_t is plain old data, zero is a valid value.
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        // SAFETY: pid is our own child; info is a valid out-pointer.
        let rc = unsafe {
            libc::waitid(
                libc::P_PID,
                pid as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOWAIT,
            )
        };
        if rc == 0 {
            return Ok(());
        }
        let error = io::Error::last_os_error();
        if error.kind() != io::ErrorKind::Interrupted {
            return Err(error);
        }
    }
}

fn reap(pid: i32) -> io::Result<ExitStatus> {
    let mut status = 0;
    loop {
        // SAFETY: pid is our own unreaped child; status is a valid out-pointer.
        let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
        if rc == pid {
            return Ok(ExitStatus::from_raw(status));
        }
        let error = io::Error::last_os_error();
        if error.kind() != io::ErrorKind::Interrupted {
            return Err(error);
        }
    }
}

fn kill_group(pgid: i32) {
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => tracing::warn!(pgid, "Failed to kill process group: {}", e),
    }
}

/// Kills and reaps the relay when supervision is abandoned half way, e.g.
/// the judging future was dropped on cancellation.
struct KillOnDrop(Option<i32>);

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        let Some(pid) = self.0.take() else {
            return;
        };
        tracing::debug!(pid, "Supervision abandoned, killing sandbox processes");
        kill_group(pid);
        let reaping = move || {
            if let Err(e) = reap(pid) {
                tracing::warn!(pid, "Failed to reap abandoned process: {}", e);
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(reaping);
            }
            Err(_) => reaping(),
        }
    }
}

async fn feed(mut stdin: ChildStdin, input: Vec<u8>) {
    // A program that never reads its input closes the pipe early; that is
    // its own business.
    if let Err(e) = stdin.write_all(&input).await {
        tracing::debug!("Stdin writer stopped: {}", e);
    }
}

/// Bounded reader for one output stream. What is read is published as it
/// arrives, so a pipe that never closes loses nothing already read.
#[derive(Debug)]
struct Capture {
    cap: usize,
    captured: Arc<Mutex<Vec<u8>>>,
    overflow: CancellationToken,
}

#[derive(Debug)]
struct Reading {
    captured: Arc<Mutex<Vec<u8>>>,
    task: JoinHandle<()>,
}

impl Capture {
    fn start(
        pipe: impl AsyncRead + Unpin + Send + 'static,
        cap: u64,
        overflow: CancellationToken,
    ) -> Reading {
        let captured = Arc::new(Mutex::new(Vec::new()));
        let capture = Capture {
            cap: usize::try_from(cap).unwrap_or(usize::MAX),
            captured: captured.clone(),
            overflow,
        };
        Reading {
            captured,
            task: tokio::spawn(capture.read(pipe)),
        }
    }

    async fn read(self, mut pipe: impl AsyncRead + Unpin) {
        let mut chunk = vec![0; READ_CHUNK];
        loop {
            let read = match pipe.read(&mut chunk).await {
                Ok(0) => break,
                Ok(read) => read,
                Err(e) => {
                    tracing::debug!("Output reader stopped: {}", e);
                    break;
                }
            };

            let mut captured = self.captured.lock().unwrap_or_else(PoisonError::into_inner);
            let allowed = self.cap.saturating_sub(captured.len()).min(read);
            captured.extend_from_slice(&chunk[..allowed]);
            if allowed < read {
                self.overflow.cancel();
                break;
            }
        }
    }
}

async fn collect(reading: Option<Reading>) -> Vec<u8> {
    let Some(mut reading) = reading else {
        return Vec::new();
    };
    match timeout(PIPE_DRAIN_TIMEOUT, &mut reading.task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!("Output reader failed: {}", e),
        Err(_) => {
            tracing::warn!("Output pipe still open after the process exited");
            reading.task.abort();
        }
    }
    std::mem::take(&mut *reading.captured.lock().unwrap_or_else(PoisonError::into_inner))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn launch<'a>(script: &str, workdir: &'a Path, isolation: &'a Isolation) -> Launch<'a> {
        Launch {
            argv: vec!["/bin/sh".into(), "-c".into(), script.into()],
            workdir,
            env: vec![("GREETING".to_string(), "hello".into())],
            stdin: b"",
            isolation,
            group: None,
            cpu_time: Duration::from_secs(2),
            wall_time: Duration::from_secs(4),
            output_cap: 1024,
        }
    }

    #[tokio::test]
    async fn test_runs_with_clean_environment() {
        let dir = tempfile::tempdir().unwrap();
        let isolation = Isolation::default();

        let exited = supervise(
            launch("echo $GREETING; echo $HOME; echo oops >&2", dir.path(), &isolation),
            &Teardown::default(),
        )
        .await
        .unwrap();

        let expected = format!("hello\n{}\n", dir.path().display());
        assert_eq!(String::from_utf8_lossy(&exited.stdout), expected);
        assert_eq!(exited.stderr, b"oops\n");
        assert_eq!(exited.exit_code(), 0);
        assert!(!exited.output_exceeded);
        assert!(!exited.wall_timed_out);
        assert!(!exited.torn_down);
    }

    #[tokio::test]
    async fn test_stdin_is_piped() {
        let dir = tempfile::tempdir().unwrap();
        let isolation = Isolation::default();

        let mut job = launch("read a b; echo $((a + b))", dir.path(), &isolation);
        job.stdin = b"2 3\n";
        let exited = supervise(job, &Teardown::default()).await.unwrap();

        assert_eq!(exited.stdout, b"5\n");
    }

    #[tokio::test]
    async fn test_signal_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let isolation = Isolation::default();

        let exited = supervise(launch("kill -SEGV $$", dir.path(), &isolation), &Teardown::default())
            .await
            .unwrap();

        assert_eq!(exited.signal(), Some(Signal::SIGSEGV));
        assert_eq!(exited.exit_code(), 128 + 11);
    }

    #[tokio::test]
    async fn test_program_is_not_namespace_init() {
        let dir = tempfile::tempdir().unwrap();
        let isolation = Isolation::default();

        let exited = supervise(
            launch("echo $$; for p in /proc/[0-9]*; do echo ${p#/proc/}; done", dir.path(), &isolation),
            &Teardown::default(),
        )
        .await
        .unwrap();

        // The shell is the second process of a namespace nobody else lives in.
        assert_eq!(String::from_utf8_lossy(&exited.stdout), "2\n1\n2\n");
    }

    #[tokio::test]
    async fn test_wall_clock_kills_sleeping_process() {
        let dir = tempfile::tempdir().unwrap();
        let isolation = Isolation::default();

        let mut job = launch("sleep 30", dir.path(), &isolation);
        job.wall_time = Duration::from_millis(200);
        let exited = supervise(job, &Teardown::default()).await.unwrap();

        assert!(exited.wall_timed_out);
        assert_eq!(exited.signal(), Some(Signal::SIGKILL));
        assert!(exited.wall_time < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_detached_descendant_dies_with_the_program() {
        let dir = tempfile::tempdir().unwrap();
        let isolation = Isolation::default();

        let exited = supervise(
            launch("cp /bin/sleep ./marker; echo 5050; setsid ./marker 30 & sleep 0.3", dir.path(), &isolation),
            &Teardown::default(),
        )
        .await
        .unwrap();

        assert_eq!(exited.stdout, b"5050\n");
        assert_eq!(exited.exit_code(), 0);
        assert!(exited.wall_time < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_each_stream_has_its_own_cap() {
        let dir = tempfile::tempdir().unwrap();
        let isolation = Isolation::default();

        let mut job = launch("printf '%600s' x; printf '%600s' y >&2", dir.path(), &isolation);
        job.output_cap = 1000;
        let exited = supervise(job, &Teardown::default()).await.unwrap();

        assert!(!exited.output_exceeded);
        assert_eq!(exited.stdout.len(), 600);
        assert_eq!(exited.stderr.len(), 600);
        assert_eq!(exited.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_stream_over_cap_kills_the_program() {
        let dir = tempfile::tempdir().unwrap();
        let isolation = Isolation::default();

        let mut job = launch("printf '%1200s' x >&2; sleep 5", dir.path(), &isolation);
        job.output_cap = 1000;
        let exited = supervise(job, &Teardown::default()).await.unwrap();

        assert!(exited.output_exceeded);
        assert!(exited.stdout.is_empty());
        assert_eq!(exited.stderr.len(), 1000);
        assert!(exited.wall_time < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_teardown_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let isolation = Isolation::default();
        let teardown = Teardown::default();
        teardown.begin();

        let exited = supervise(launch("true", dir.path(), &isolation), &teardown)
            .await
            .unwrap();

        assert!(exited.torn_down);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let isolation = Isolation::default();

        let mut job = launch("", dir.path(), &isolation);
        job.argv = vec!["/nonexistent/compiler".into()];
        let result = supervise(job, &Teardown::default()).await;

        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_collect_keeps_output_of_a_stuck_pipe() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let reading = Capture::start(reader, 1024, CancellationToken::new());

        writer.write_all(b"5050\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        // The writer stays open, as if a descendant still held the pipe.
        let output = collect(Some(reading)).await;

        assert_eq!(output, b"5050\n");
        drop(writer);
    }

    #[test]
    fn test_mount_plan_masks_sandbox_root() {
        let plan = MountPlan::new(Path::new("/var/lib/judge/abc")).unwrap();
        let masks: Vec<_> = plan.masks.iter().map(|(target, _)| target.as_c_str()).collect();
        assert_eq!(masks, vec![c"/tmp", c"/var/lib/judge"]);
        assert_eq!(plan.dirs, vec![c"/var/lib/judge/abc".to_owned()]);

        let plan = MountPlan::new(Path::new("/tmp/coderunner-judge/abc")).unwrap();
        assert_eq!(plan.masks.len(), 1);
        assert_eq!(
            plan.dirs,
            vec![c"/tmp/coderunner-judge".to_owned(), c"/tmp/coderunner-judge/abc".to_owned()]
        );

        assert!(MountPlan::new(Path::new("/abc")).is_err());
    }
}
