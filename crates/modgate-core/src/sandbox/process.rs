//! Child-process executor.
//!
//! One interpreter process per invocation, in its own process group, with
//! rlimits applied in `pre_exec`. The child is confined to a read-only jail
//! holding its candidate directory and the interpreter runtime, and gets an
//! empty network namespace unless networking is allowed. A cgroup v2 group is
//! used on top when the hierarchy is writable. Timeouts kill the whole
//! process group.

use std::io::{self, Read};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

use super::cgroup::{Cgroup, DEFAULT_CGROUP_ROOT};
use super::confine::{
    default_runtime_paths, unshare_namespaces, IdMaps, Isolation, IsolationMode, Jail, MountPlan,
    JAIL_WORKDIR,
};
use super::error::SandboxError;
use super::execution::{classify, ExecutionState, ExecutionTrace, ProcessOutcome, SandboxResult};
use super::harness::HARNESS_SCRIPT;
use super::request::{ResourceLimits, SandboxInvocation};
use super::SandboxRunner;

const SAFE_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
/// Grace period for output readers once the child has been reaped.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessSandboxConfig {
    pub interpreter: String,
    pub use_cgroups: bool,
    pub cgroup_root: PathBuf,
    pub allow_network: bool,
    pub isolation: IsolationMode,
    /// Host directories bound read-only into the jail for the interpreter.
    pub runtime_paths: Vec<PathBuf>,
}

impl Default for ProcessSandboxConfig {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
            use_cgroups: true,
            cgroup_root: PathBuf::from(DEFAULT_CGROUP_ROOT),
            allow_network: false,
            isolation: IsolationMode::Required,
            runtime_paths: default_runtime_paths(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProcessSandbox {
    config: ProcessSandboxConfig,
}

impl ProcessSandbox {
    pub fn new(config: ProcessSandboxConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProcessSandboxConfig {
        &self.config
    }
}

#[async_trait]
impl SandboxRunner for ProcessSandbox {
    async fn run(&self, invocation: SandboxInvocation) -> Result<SandboxResult, SandboxError> {
        invocation.validate()?;
        let entry_path = invocation.entry_path();
        if !entry_path.is_file() {
            return Err(SandboxError::InvalidRequest(format!(
                "entry file {} does not exist",
                entry_path.display()
            )));
        }

        let mut trace = ExecutionTrace::default();
        trace.advance(ExecutionState::Launching);
        match launch_and_wait(&self.config, &invocation, &mut trace).await {
            Ok(outcome) => {
                let result = classify(outcome, trace);
                debug!(
                    entry = %invocation.entry_point,
                    state = ?result.state,
                    ok = result.ok,
                    ms = result.execution_time_ms,
                    "sandbox run finished"
                );
                Ok(result)
            }
            Err(err) => {
                trace.advance(ExecutionState::CrashedOnLaunch);
                Err(err)
            }
        }
    }
}

async fn launch_and_wait(
    config: &ProcessSandboxConfig,
    invocation: &SandboxInvocation,
    trace: &mut ExecutionTrace,
) -> Result<ProcessOutcome, SandboxError> {
    let interpreter = resolve_interpreter(&config.interpreter)?;
    let candidate_dir = std::fs::canonicalize(&invocation.candidate_dir).map_err(|e| {
        SandboxError::InvalidRequest(format!("{}: {e}", invocation.candidate_dir.display()))
    })?;
    let required = config.isolation == IsolationMode::Required;

    let jail = match Jail::prepare(&candidate_dir, &config.runtime_paths, &interpreter) {
        Ok(jail) => Some(jail),
        Err(e) if required => {
            return Err(SandboxError::launch(format!("failed to prepare the sandbox jail: {e}")))
        }
        Err(e) => {
            warn!(error = %e, "sandbox jail unavailable; running without filesystem confinement");
            None
        }
    };

    let cgroup = if config.use_cgroups {
        Cgroup::create(&config.cgroup_root, &invocation.limits).map_err(SandboxError::launch)?
    } else {
        None
    };
    let procs_file = match &cgroup {
        Some(group) => Some(
            std::fs::OpenOptions::new()
                .write(true)
                .open(group.procs_path())
                .map_err(SandboxError::launch)?,
        ),
        None => None,
    };
    let (status_read, status_write) = status_pipe().map_err(SandboxError::launch)?;

    let home = match &jail {
        Some(_) => PathBuf::from(JAIL_WORKDIR),
        None => candidate_dir.clone(),
    };
    let mut cmd = Command::new(&interpreter);
    cmd.arg("-I")
        .arg("-B")
        .arg("-c")
        .arg(HARNESS_SCRIPT)
        .arg(&invocation.entry_file)
        .arg(&invocation.entry_point)
        .current_dir(&candidate_dir)
        .env_clear()
        .env("PATH", SAFE_PATH)
        .env("HOME", home)
        .env("PYTHONDONTWRITEBYTECODE", "1")
        .env("PYTHONIOENCODING", "utf-8")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);

    let setup = ChildSetup {
        limits: invocation.limits.clone(),
        allow_network: config.allow_network,
        mode: config.isolation,
        procs_fd: procs_file.as_ref().map(|f| f.as_raw_fd()),
        status_fd: status_write.as_raw_fd(),
        plan: jail.as_ref().map(Jail::plan),
        id_maps: IdMaps::for_current_user().map_err(SandboxError::launch)?,
    };
    // SAFETY: the closure runs between fork and exec and only issues
    // syscalls on values allocated before the fork.
    unsafe {
        cmd.pre_exec(move || setup.confine());
    }

    let started = Instant::now();
    let spawned = cmd.spawn();
    drop(status_write);
    drop(procs_file);
    let mut child = spawned.map_err(|e| {
        let hint = if required && e.raw_os_error() != Some(libc::ENOENT) {
            " (sandbox isolation is required; namespaces or mounts may be unavailable)"
        } else {
            ""
        };
        SandboxError::launch(format!("failed to spawn {}: {e}{hint}", interpreter.display()))
    })?;
    trace.advance(ExecutionState::Running);
    let pid = child.id();
    let isolation = read_isolation(status_read).await;
    if !isolation.satisfies(config.allow_network) {
        warn!(
            network_isolated = isolation.network_isolated,
            filesystem_confined = isolation.filesystem_confined,
            "candidate running with reduced isolation"
        );
    }

    let cap = invocation.limits.max_output_bytes;
    let stdout_task = child
        .stdout
        .take()
        .map(|out| tokio::spawn(read_capped(out, cap)));
    let stderr_task = child
        .stderr
        .take()
        .map(|err| tokio::spawn(read_capped(err, cap)));

    if let Some(mut stdin) = child.stdin.take() {
        let payload = serde_json::to_vec(&invocation.payload)
            .map_err(|e| SandboxError::InvalidRequest(format!("payload: {e}")))?;
        // A child that exits without reading its stdin closes the pipe.
        if let Err(e) = stdin.write_all(&payload).await {
            debug!(error = %e, "payload not fully written");
        }
        drop(stdin);
    }

    let (status, timed_out) = match tokio::time::timeout(invocation.timeout, child.wait()).await {
        Ok(status) => (status.map_err(SandboxError::launch)?, false),
        Err(_elapsed) => {
            kill_group(pid);
            if let Some(group) = &cgroup {
                group.remove().await;
            }
            let _ = child.start_kill();
            (child.wait().await.map_err(SandboxError::launch)?, true)
        }
    };
    let execution_time_ms = started.elapsed().as_millis() as u64;
    // Background children left in the group would hold the pipes open.
    kill_group(pid);

    let (stdout, out_truncated) = drain(stdout_task).await;
    let (stderr, err_truncated) = drain(stderr_task).await;

    let oom_killed = match &cgroup {
        Some(group) => {
            let kills = group.oom_kills();
            group.remove().await;
            kills > 0
        }
        None => false,
    };

    let signal = status.signal();
    Ok(ProcessOutcome {
        exit_code: status.code().or(signal.map(|s| 128 + s)),
        signal,
        timed_out,
        oom_killed,
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        output_truncated: out_truncated || err_truncated,
        execution_time_ms,
        isolation,
    })
}

/// Absolute, canonical path of `name`, searched on the sandbox `PATH` and
/// then on ours.
fn resolve_interpreter(name: &str) -> Result<PathBuf, SandboxError> {
    let given = Path::new(name);
    let found = if given.components().count() > 1 {
        Some(given.to_path_buf())
    } else {
        let ours = std::env::var_os("PATH").unwrap_or_default();
        std::env::split_paths(SAFE_PATH)
            .chain(std::env::split_paths(&ours))
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.is_file())
    };
    found
        .and_then(|path| std::fs::canonicalize(path).ok())
        .ok_or_else(|| SandboxError::launch(format!("interpreter {name} not found")))
}

fn status_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];
    // SAFETY: pipe2 fills both descriptors on success; each is owned once.
    unsafe {
        if libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])))
    }
}

/// The byte the child wrote right before exec; none means no isolation.
async fn read_isolation(read_end: OwnedFd) -> Isolation {
    tokio::task::spawn_blocking(move || {
        let mut byte = [0u8; 1];
        match std::fs::File::from(read_end).read(&mut byte) {
            Ok(1) => Isolation::from_byte(byte[0]),
            _ => Isolation::default(),
        }
    })
    .await
    .unwrap_or_default()
}

fn kill_group(pid: Option<u32>) {
    if let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) {
        // SAFETY: killpg has no memory-safety preconditions.
        unsafe {
            libc::killpg(pid, libc::SIGKILL);
        }
    }
}

async fn drain(task: Option<tokio::task::JoinHandle<(Vec<u8>, bool)>>) -> (Vec<u8>, bool) {
    let Some(mut task) = task else {
        return (Vec::new(), false);
    };
    match tokio::time::timeout(DRAIN_GRACE, &mut task).await {
        Ok(Ok(captured)) => captured,
        Ok(Err(e)) => {
            warn!(error = %e, "output reader failed");
            (Vec::new(), true)
        }
        Err(_) => {
            task.abort();
            (Vec::new(), true)
        }
    }
}

/// Read everything, keeping at most `cap` bytes.
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> (Vec<u8>, bool) {
    let mut kept = Vec::new();
    let mut truncated = false;
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = cap.saturating_sub(kept.len());
                kept.extend_from_slice(&chunk[..n.min(room)]);
                truncated |= n > room;
            }
        }
    }
    (kept, truncated)
}

fn set_limit(resource: libc::__rlimit_resource_t, soft: u64, hard: u64) -> std::io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: soft as libc::rlim_t,
        rlim_max: hard as libc::rlim_t,
    };
    // SAFETY: setrlimit reads a fully initialised struct.
    if unsafe { libc::setrlimit(resource, &limit) } == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Everything the forked child needs, prepared by the parent.
struct ChildSetup {
    limits: ResourceLimits,
    allow_network: bool,
    mode: IsolationMode,
    procs_fd: Option<RawFd>,
    status_fd: RawFd,
    plan: Option<Arc<MountPlan>>,
    id_maps: IdMaps,
}

impl ChildSetup {
    /// Runs in the forked child before exec.
    fn confine(&self) -> io::Result<()> {
        if let Some(fd) = self.procs_fd {
            // Best effort: rlimits still apply if the join fails.
            // SAFETY: `fd` stays open in the parent until after spawn.
            unsafe {
                libc::write(fd, b"0".as_ptr().cast(), 1);
            }
        }

        // SAFETY: prctl with integer arguments only.
        unsafe {
            libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong, 0, 0, 0);
        }

        let required = self.mode == IsolationMode::Required;
        let mut isolation = Isolation::default();
        match unshare_namespaces(self.plan.is_some(), !self.allow_network, &self.id_maps) {
            Ok(()) => {
                isolation.network_isolated = !self.allow_network;
                if let Some(plan) = &self.plan {
                    match plan.enter() {
                        Ok(()) => isolation.filesystem_confined = true,
                        Err(e) if required => return Err(e),
                        Err(_) => {}
                    }
                }
            }
            Err(e) if required => return Err(e),
            Err(_) => {}
        }
        if required && !isolation.satisfies(self.allow_network) {
            return Err(io::Error::from_raw_os_error(libc::EPERM));
        }

        let limits = &self.limits;
        set_limit(libc::RLIMIT_AS, limits.memory_bytes(), limits.memory_bytes())?;
        set_limit(libc::RLIMIT_CPU, limits.cpu_seconds, limits.cpu_seconds + 1)?;
        set_limit(libc::RLIMIT_NOFILE, limits.open_files, limits.open_files)?;
        set_limit(libc::RLIMIT_NPROC, limits.max_processes, limits.max_processes)?;
        set_limit(libc::RLIMIT_CORE, 0, 0)?;

        // SAFETY: prctl with integer arguments; write of one stack byte to a
        // descriptor the parent keeps open until spawn returns.
        unsafe {
            libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0);
            let byte = isolation.to_byte();
            libc::write(self.status_fd, (&byte as *const u8).cast(), 1);
        }
        Ok(())
    }
}
