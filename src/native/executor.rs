use std::{ffi::OsString, path::Path, time::Duration};

use nix::{
    sys::signal::Signal,
    unistd::{Gid, Uid, chown},
};
use tokio::fs;

use crate::{
    constants::{COMPILE_OUTPUT_CAP, DEFAULT_COMPILE_MEMORY_BYTES},
    core::{
        domain::{ExecutionReport, ExecutionResult, ResourceLimits, TerminationReason},
        errors::ExecuteError,
        registry::Runner,
        traits::{executor::Executor, provisioner::SandboxHandle},
    },
    native::{
        cgroup::LimitGroup,
        process::{Exited, Launch, supervise},
    },
};

/// Compiles and runs submissions directly on the host, inside the sandbox
/// a `NativeProvisioner` prepared.
#[derive(Clone, Debug)]
pub struct NativeExecutor {
    compile_time_ceiling: Duration,
    compile_memory_bytes: u64,
}

impl Default for NativeExecutor {
    fn default() -> Self {
        Self::new(Duration::from_secs(10), DEFAULT_COMPILE_MEMORY_BYTES)
    }
}

/// Limits of one phase. Compilation gets its own budget, never the
/// submission's full limits.
#[derive(Debug)]
struct Phase<'a> {
    name: &'static str,
    argv: Vec<OsString>,
    stdin: &'a [u8],
    cpu_time: Duration,
    wall_time: Duration,
    memory_bytes: u64,
    output_cap: u64,
}

/// Resource usage of a finished phase, read from its limit group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Usage {
    cpu_time: Duration,
    peak_memory_bytes: u64,
    oom_killed: bool,
}

impl NativeExecutor {
    pub fn new(compile_time_ceiling: Duration, compile_memory_bytes: u64) -> Self {
        NativeExecutor {
            compile_time_ceiling,
            compile_memory_bytes,
        }
    }

    async fn run_phase(
        &self,
        sandbox: &SandboxHandle,
        phase: Phase<'_>,
        env: Vec<(String, OsString)>,
    ) -> Result<ExecutionResult, ExecuteError> {
        let isolation = &sandbox.isolation;
        let sandbox_group = isolation
            .limit_group
            .as_deref()
            .ok_or_else(|| ExecuteError::internal("sandbox has no limit group"))?;
        let group = phase_group(sandbox_group, &phase, isolation.max_processes)?;

        let exited = supervise(
            Launch {
                argv: phase.argv,
                workdir: &sandbox.workdir,
                env,
                stdin: phase.stdin,
                isolation,
                group: Some(&group),
                cpu_time: phase.cpu_time,
                wall_time: phase.wall_time,
                output_cap: phase.output_cap,
            },
            &sandbox.teardown,
        )
        .await
        .map_err(|e| ExecuteError::internal(format!("cannot run {} phase: {}", phase.name, e)))?;

        let usage = group_usage(&group)
            .map_err(|e| ExecuteError::internal(format!("cannot read limit group: {}", e)))?;

        let termination_reason = classify(&exited, &usage, phase.cpu_time);
        tracing::debug!(
            phase = phase.name,
            exit_code = exited.exit_code(),
            ?termination_reason,
            cpu_ms = usage.cpu_time.as_millis() as u64,
            wall_ms = exited.wall_time.as_millis() as u64,
            peak_memory_bytes = usage.peak_memory_bytes,
            "Phase finished"
        );

        Ok(ExecutionResult {
            exit_code: exited.exit_code(),
            cpu_time_used_ms: usage.cpu_time.as_millis() as u64,
            wall_time_used_ms: exited.wall_time.as_millis() as u64,
            peak_memory_bytes: usage.peak_memory_bytes,
            termination_reason,
            stdout: exited.stdout,
            stderr: exited.stderr,
        })
    }
}

#[async_trait::async_trait]
impl Executor for NativeExecutor {
    #[tracing::instrument(skip_all, fields(submission_id = %sandbox.submission_id, language = %runner.language()))]
    async fn execute(
        &self,
        sandbox: &SandboxHandle,
        runner: &Runner,
        source_code: &str,
        stdin: &[u8],
        limits: &ResourceLimits,
    ) -> Result<ExecutionReport, ExecuteError> {
        let source_path = sandbox.workdir.join(runner.source_file());
        fs::write(&source_path, source_code)
            .await
            .map_err(|e| ExecuteError::internal(format!("cannot write source: {}", e)))?;
        hand_over(&source_path, sandbox)?;

        let env = runner.env(&sandbox.workdir);

        if let Some(argv) = runner.compile_command(&source_path) {
            let budget = limits.wall_time().min(self.compile_time_ceiling);
            let phase = Phase {
                name: "compile",
                argv,
                stdin: &[],
                cpu_time: budget,
                wall_time: budget,
                memory_bytes: self.compile_memory_bytes,
                output_cap: COMPILE_OUTPUT_CAP,
            };
            let compiled = self.run_phase(sandbox, phase, env.clone()).await?;

            if compiled.termination_reason != TerminationReason::Completed
                || compiled.exit_code != 0
            {
                tracing::debug!("Compilation failed with exit code {}", compiled.exit_code);
                return Ok(ExecutionReport::CompileFailed(ExecutionResult {
                    termination_reason: TerminationReason::Completed,
                    ..compiled
                }));
            }
        }

        let artifact_path = runner.artifact_path(&source_path);
        let phase = Phase {
            name: "run",
            argv: runner.run_command(&artifact_path),
            stdin,
            cpu_time: limits.cpu_time(),
            wall_time: limits.wall_time(),
            memory_bytes: limits.memory_bytes,
            output_cap: limits.output_byte_cap,
        };
        let result = self.run_phase(sandbox, phase, env).await?;

        Ok(ExecutionReport::Ran(result))
    }
}

/// Files written by the judge must belong to the sandbox user.
fn hand_over(path: &Path, sandbox: &SandboxHandle) -> Result<(), ExecuteError> {
    let isolation = &sandbox.isolation;
    if isolation.uid.is_none() {
        return Ok(());
    }
    chown(
        path,
        isolation.uid.map(Uid::from_raw),
        isolation.gid.map(Gid::from_raw),
    )
    .map_err(|e| ExecuteError::internal(format!("cannot chown {}: {}", path.display(), e)))
}

fn phase_group(
    sandbox_group: &Path,
    phase: &Phase<'_>,
    max_processes: u64,
) -> Result<LimitGroup, ExecuteError> {
    let setup = || -> std::io::Result<LimitGroup> {
        let group = LimitGroup::open(sandbox_group).child(phase.name)?;
        group.set_memory_max(phase.memory_bytes)?;
        group.set_pids_max(max_processes)?;
        Ok(group)
    };
    setup().map_err(|e| {
        ExecuteError::internal(format!("cannot set up {} limit group: {}", phase.name, e))
    })
}

fn group_usage(group: &LimitGroup) -> std::io::Result<Usage> {
    Ok(Usage {
        cpu_time: group.cpu_usage()?,
        peak_memory_bytes: group.peak_memory()?,
        oom_killed: group.oom_killed()?,
    })
}

/// Output → memory → time → teardown kill → completed. A SIGKILL the judge
/// did not send is the program's own business and completes like any other
/// signal.
fn classify(exited: &Exited, usage: &Usage, cpu_limit: Duration) -> TerminationReason {
    if exited.output_exceeded {
        return TerminationReason::OutputLimitExceeded;
    }
    if usage.oom_killed {
        return TerminationReason::MemoryLimitExceeded;
    }
    if exited.wall_timed_out
        || usage.cpu_time > cpu_limit
        || exited.signal() == Some(Signal::SIGXCPU)
    {
        return TerminationReason::TimeLimitExceeded;
    }
    if exited.torn_down && exited.signal() == Some(Signal::SIGKILL) {
        return TerminationReason::Killed;
    }
    TerminationReason::Completed
}
