//! Privileged task launch.
//!
//! # Sequence
//!
//! ```text
//! check:  executable exists?          no  -> Error::FileNotFound
//!         owner uid == effective uid? no  -> Error::Permissions
//! fork ─┬─ child:  setsid
//!       │          setpriority(niceness)
//!       │          setuid(owner of executable)
//!       │          umask(0o022)
//!       │          exec(executable, leading words, --key=value ...)
//!       │          with task env + SIMULTANEOUS_{DOMAIN,TASK_NAME,CONNECTION}
//!       └─ parent: reap on a detached thread, return pid
//! ```
//!
//! The checks run on every launch; nothing is cached between launches.
//! Pid registration is left to the task itself, which reports back with a
//! `SetPid` command once it starts.
//!
//! All of this blocks (stat, fork, exec), so the server runs it on the
//! blocking pool, never on the event loop.

use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use crate::command::{Params, TaskDescription};
use crate::constants::{ENV_CONNECTION, ENV_DOMAIN, ENV_TASK_NAME, TASK_UMASK};
use crate::error::{Error, Result};
use crate::registry::namespaced_key;

/// OS process operations used by the launcher and the `Kill` command.
///
/// [`SystemProcessControl`] is the real implementation; tests substitute a
/// recorder.
pub trait ProcessControl: Send + Sync + std::fmt::Debug {
    /// Fork and exec according to `plan`, returning the child's pid.
    fn spawn(&self, plan: &LaunchPlan) -> io::Result<u32>;

    /// Send SIGTERM to `pid`.
    fn terminate(&self, pid: u32) -> io::Result<()>;
}

/// [`ProcessControl`] backed by `fork`/`exec` and `kill(2)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessControl;

impl ProcessControl for SystemProcessControl {
    fn spawn(&self, plan: &LaunchPlan) -> io::Result<u32> {
        use std::os::unix::process::CommandExt;

        let mut command = std::process::Command::new(&plan.program);
        command
            .args(plan.args())
            .envs(plan.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null());

        match &plan.log_file {
            Some(path) => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                command.stdout(file.try_clone()?).stderr(file);
            }
            None => {
                command.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        let niceness = plan.niceness;
        let uid = plan.uid as libc::uid_t;
        let umask = plan.umask as libc::mode_t;
        // SAFETY: the hook runs between fork and exec and only issues
        // async-signal-safe syscalls; it allocates nothing.
        unsafe {
            command.pre_exec(move || prepare_child(niceness, uid, umask));
        }

        let mut child = command.spawn()?;
        let pid = child.id();

        let reaper = std::thread::Builder::new()
            .name(format!("reap-{pid}"))
            .spawn(move || match child.wait() {
                Ok(status) => log::debug!("[Launcher] pid {pid} exited: {status}"),
                Err(e) => log::warn!("[Launcher] Failed to reap pid {pid}: {e}"),
            });
        if let Err(e) = reaper {
            log::warn!("[Launcher] Could not start reaper for pid {pid}: {e}");
        }

        Ok(pid)
    }

    fn terminate(&self, pid: u32) -> io::Result<()> {
        let Some(pid) = signalable_pid(pid) else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("refusing to signal pid {pid}"),
            ));
        };
        // SAFETY: kill(2) has no memory-safety preconditions; pid > 0, so
        // exactly one process is addressed.
        let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Child-side setup, in order: new session, niceness, privilege drop, umask.
fn prepare_child(niceness: i32, uid: libc::uid_t, umask: libc::mode_t) -> io::Result<()> {
    // SAFETY: plain syscalls on the freshly forked child.
    unsafe {
        if libc::setsid() == -1 {
            return Err(io::Error::last_os_error());
        }
        if libc::setpriority(libc::PRIO_PROCESS, 0, niceness) == -1 {
            return Err(io::Error::last_os_error());
        }
        if libc::setuid(uid) == -1 {
            return Err(io::Error::last_os_error());
        }
        libc::umask(umask);
    }
    Ok(())
}

/// `pid` as a `pid_t` that names a single process.
///
/// `kill(2)` treats `0` as the caller's process group and negative values
/// as process groups (`-1`: every process), so those are `None`.
pub fn signalable_pid(pid: u32) -> Option<libc::pid_t> {
    libc::pid_t::try_from(pid).ok().filter(|pid| *pid > 0)
}

/// Effective uid of this process.
pub fn effective_uid() -> u32 {
    // SAFETY: geteuid(2) always succeeds.
    unsafe { libc::geteuid() }
}

/// A task to launch on behalf of `domain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    /// Domain the task reports back under.
    pub domain: String,
    /// Task description.
    pub task: TaskDescription,
    /// Merged parameters.
    pub params: Params,
}

/// Everything the child needs, resolved before fork.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    /// Executable path.
    pub program: PathBuf,
    /// Literal words that followed the executable in the task's binary.
    pub leading_args: Vec<String>,
    /// Merged parameters, rendered as `--key=value` arguments.
    pub params: Params,
    /// Variables added to the inherited environment.
    pub env: Vec<(String, String)>,
    /// Scheduling niceness.
    pub niceness: i32,
    /// Uid the child switches to (the executable's owner).
    pub uid: u32,
    /// File-creation mask of the child.
    pub umask: u32,
    /// Where stdout/stderr go; `/dev/null` when `None`.
    pub log_file: Option<PathBuf>,
}

impl LaunchPlan {
    /// Argument vector passed to exec (program excluded).
    pub fn args(&self) -> Vec<String> {
        let mut args = self.leading_args.clone();
        args.extend(self.params.iter().map(|(k, v)| format!("--{k}={v}")));
        args
    }

    /// Shell-style rendering, e.g. `/bin/task all --key="value"`.
    pub fn command_line(&self) -> String {
        let mut line = self.program.display().to_string();
        for word in &self.leading_args {
            line.push(' ');
            line.push_str(word);
        }
        for (k, v) in self.params.iter() {
            line.push_str(&format!(" --{k}=\"{v}\""));
        }
        line
    }

    /// Value of `key` in the injected environment.
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env.iter().rev().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }
}

/// Validates and launches tasks.
#[derive(Debug, Clone)]
pub struct Launcher {
    connection: String,
    control: Arc<dyn ProcessControl>,
    effective_uid: u32,
    umask: u32,
    log_dir: Option<PathBuf>,
}

impl Launcher {
    /// Launcher whose tasks report back to `connection`.
    pub fn new(connection: impl Into<String>, control: Arc<dyn ProcessControl>) -> Self {
        Self {
            connection: connection.into(),
            control,
            effective_uid: effective_uid(),
            umask: TASK_UMASK,
            log_dir: None,
        }
    }

    /// Compare binary ownership against `uid` instead of this process's
    /// effective uid.
    pub fn with_effective_uid(mut self, uid: u32) -> Self {
        self.effective_uid = uid;
        self
    }

    /// Umask applied in the child.
    pub fn with_umask(mut self, umask: u32) -> Self {
        self.umask = umask;
        self
    }

    /// Directory for per-task stdout/stderr logs.
    pub fn with_log_dir(mut self, log_dir: Option<PathBuf>) -> Self {
        self.log_dir = log_dir;
        self
    }

    /// Process control used for spawning and signalling.
    pub fn control(&self) -> &Arc<dyn ProcessControl> {
        &self.control
    }

    /// Check that `task`'s executable exists and is owned by the effective
    /// uid. Returns the owner uid.
    pub fn check(&self, task: &TaskDescription) -> Result<u32> {
        let program = task.executable();
        let metadata = match std::fs::metadata(&program) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::FileNotFound(program));
            }
            Err(e) => return Err(Error::Io(e)),
        };

        let owner = metadata.uid();
        if owner != self.effective_uid {
            return Err(Error::Permissions(format!(
                "{} is owned by uid {owner}, not by effective uid {}",
                program.display(),
                self.effective_uid
            )));
        }
        Ok(owner)
    }

    /// Run the checks and resolve the launch plan.
    pub fn prepare(&self, request: &LaunchRequest) -> Result<LaunchPlan> {
        let uid = self.check(&request.task)?;
        let task = &request.task;

        let mut env: Vec<(String, String)> =
            task.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        env.push((ENV_DOMAIN.to_string(), request.domain.clone()));
        env.push((ENV_TASK_NAME.to_string(), task.name.clone()));
        env.push((ENV_CONNECTION.to_string(), self.connection.clone()));

        let log_file = self.log_dir.as_ref().map(|dir| {
            let file = format!("{}-{}.log", request.domain, task.name).replace('/', "_");
            dir.join(file)
        });

        Ok(LaunchPlan {
            program: task.executable(),
            leading_args: task.leading_args(),
            params: request.params.clone(),
            env,
            niceness: task.niceness,
            uid,
            umask: self.umask,
            log_file,
        })
    }

    /// Check, fork and exec. Returns the child's pid.
    pub fn launch(&self, request: &LaunchRequest) -> Result<u32> {
        let key = namespaced_key(&request.domain, &request.task.name);
        let plan = match self.prepare(request) {
            Ok(plan) => plan,
            Err(e) => {
                log::warn!("[Launcher] Refusing to launch {key}: {e}");
                return Err(e);
            }
        };

        let pid = self.control.spawn(&plan)?;
        log::info!("[Launcher] {key}: {} (pid {pid})", plan.command_line());
        Ok(pid)
    }
}
