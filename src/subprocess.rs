//! Subprocess handle and exit monitoring
//!
//! A [`Subprocess`] wraps exactly one OS process (which is always the
//! trampoline; the user code runs inside it). The handle exposes kill,
//! running/killed queries, an awaitable join, and the raw standard streams
//! when they were configured as pipes.
//!
//! ## Monitoring
//!
//! A monitor task starts at handle construction and runs for the handle's
//! whole life: it owns the underlying child, waits for it to exit, and
//! publishes the terminal status on a watch channel that `running()` and
//! `join()` observe. Exits after `kill()` are expected and handled quietly;
//! otherwise the exit is either logged or, if termination linkage was
//! configured, treated as fatal to the spawner itself.
//!
//! The handle and the process have independent lifetimes: dropping the
//! handle neither kills the subprocess nor stops the monitor.

use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SpawnError};

/// A spawned subprocess that terminates itself if this process dies.
///
/// Created by [`SubprocessBuilder::spawn`](crate::builder::SubprocessBuilder::spawn).
#[derive(Debug)]
pub struct Subprocess {
    pid: Pid,
    entry: String,
    killed: Arc<AtomicBool>,
    exit_rx: watch::Receiver<Option<ExitStatus>>,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
}

impl Subprocess {
    /// Wrap a started child and begin monitoring it for exit.
    ///
    /// Must be called from within a tokio runtime; the monitor is spawned
    /// onto it. `entry` is the user entry point name, kept as the label for
    /// diagnostics.
    pub(crate) fn new(
        mut child: Child,
        entry: String,
        parent_exit_code: Option<i32>,
    ) -> Result<Self> {
        let raw_pid = child
            .id()
            .ok_or_else(|| SpawnError::ProcessSpawn("Spawned child did not have a PID".to_string()))?;
        let pid = Pid::from_raw(raw_pid as i32);

        // Whatever the relay tasks did not claim stays available through the
        // stream accessors.
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let killed = Arc::new(AtomicBool::new(false));
        let (exit_tx, exit_rx) = watch::channel(None);
        monitor(child, entry.clone(), pid, Arc::clone(&killed), parent_exit_code, exit_tx);

        Ok(Self {
            pid,
            entry,
            killed,
            exit_rx,
            stdin,
            stdout,
            stderr,
        })
    }

    /// The OS process id of the subprocess.
    ///
    /// This is also its process group id: the child is spawned as a session
    /// leader, so the whole subprocess tree shares the group.
    pub fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    /// The entry point name this subprocess was launched with.
    pub fn entry(&self) -> &str {
        &self.entry
    }

    /// Request termination of the subprocess tree.
    ///
    /// Sends SIGTERM to the child's process group and marks the handle
    /// killed, so the monitor treats the coming exit as expected rather than
    /// as an anomaly. Idempotent. Does not wait for the exit; use [`join`]
    /// for that.
    ///
    /// [`join`]: Subprocess::join
    pub fn kill(&self) -> Result<()> {
        self.killed.store(true, Ordering::SeqCst);

        if !self.running() {
            debug!("Process group {} already exited", self.pid);
            return Ok(());
        }

        debug!("Sending SIGTERM to process group {}", self.pid);
        match killpg(self.pid, Signal::SIGTERM) {
            Ok(()) => Ok(()),
            Err(nix::errno::Errno::ESRCH) => {
                // Process group doesn't exist, which means it already exited
                debug!("Process group {} already exited", self.pid);
                Ok(())
            }
            Err(nix::errno::Errno::EPERM) => {
                // Permission denied - process may have already exited or changed ownership
                debug!(
                    "Permission denied signaling process group {} (likely already exited)",
                    self.pid
                );
                Ok(())
            }
            Err(e) => {
                error!("Failed to send SIGTERM to process group {}: {}", self.pid, e);
                Err(SpawnError::ProcessSignal(format!(
                    "Failed to send SIGTERM to process group {}: {}",
                    self.pid, e
                )))
            }
        }
    }

    /// Whether [`kill`](Subprocess::kill) has been called on this handle.
    ///
    /// Reflects only the local request; says nothing about whether the
    /// process has actually exited yet.
    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Whether the process is still running. Non-blocking.
    pub fn running(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    /// Wait until the process exits and return its exit status.
    ///
    /// Safe to call concurrently with the monitor task's own wait and from
    /// multiple callers; every call observes the same terminal status.
    pub async fn join(&self) -> Result<ExitStatus> {
        let mut exit_rx = self.exit_rx.clone();
        let status = *exit_rx
            .wait_for(|status| status.is_some())
            .await
            .map_err(|e| {
                SpawnError::ProcessWait(format!("Monitor for process {} went away: {}", self.pid, e))
            })?;
        status.ok_or_else(|| {
            SpawnError::ProcessWait(format!("No exit status recorded for process {}", self.pid))
        })
    }

    /// Take the stdin handle, if stdin was configured as piped and not
    /// claimed by a relay.
    pub fn stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    /// Take the stdout handle, if stdout was configured as piped and not
    /// claimed by a relay.
    pub fn stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Take the stderr handle, if stderr was configured as piped and not
    /// claimed by a relay.
    pub fn stderr(&mut self) -> Option<ChildStderr> {
        self.stderr.take()
    }
}

/// Observe the subprocess exit, log it, and optionally take the spawner down.
///
/// Fire-and-forget: the task's lifetime is bounded by the owning process and
/// it never blocks process exit. The killed flag is the only shared mutable
/// state with the handle; it is written once by `kill()` and read once here,
/// and both orderings of that race lead to a quiet return.
fn monitor(
    mut child: Child,
    entry: String,
    pid: Pid,
    killed: Arc<AtomicBool>,
    parent_exit_code: Option<i32>,
    exit_tx: watch::Sender<Option<ExitStatus>>,
) {
    tokio::spawn(async move {
        let status = match child.wait().await {
            Ok(status) => status,
            Err(e) => {
                error!("Failed to wait for subprocess {}: {}", pid, e);
                return;
            }
        };
        let _ = exit_tx.send(Some(status));

        if killed.load(Ordering::SeqCst) {
            debug!("'{}' ({}) exited after kill(): {}", entry, pid, status);
            return;
        }

        if let Some(code) = parent_exit_code {
            error!(
                "'{}' ({}) exited: {}. Exiting with code {}.",
                entry, pid, status, code
            );
            std::process::exit(code);
        } else if !status.success() {
            warn!("'{}' ({}) exited: {}", entry, pid, status);
        } else {
            info!("'{}' ({}) exited: 0", entry, pid);
        }
    });
}

#[cfg(test)]
mod tests {
    #![allow(unsafe_code)] // setsid in pre_exec, as in the builder

    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    /// Spawn a plain command wrapped in a handle, bypassing the trampoline.
    /// Mirrors the builder's process-group setup so kill() targets only the
    /// spawned tree.
    fn spawn_raw(cmd: &str, args: &[&str]) -> Subprocess {
        let mut command = Command::new(cmd);
        command.args(args);
        command.stdin(Stdio::null());
        command.stdout(Stdio::null());
        command.stderr(Stdio::null());
        unsafe {
            command.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        let child = command.spawn().expect("Failed to spawn test command");
        Subprocess::new(child, cmd.to_string(), None).expect("Failed to wrap test command")
    }

    #[tokio::test]
    async fn test_join_observes_clean_exit() {
        let subprocess = spawn_raw("true", &[]);
        let status = subprocess.join().await.expect("Failed to join");
        assert!(status.success());
        assert!(!subprocess.running());
        assert!(!subprocess.killed());
    }

    #[tokio::test]
    async fn test_join_is_repeatable() {
        let subprocess = spawn_raw("true", &[]);
        let first = subprocess.join().await.expect("first join");
        let second = subprocess.join().await.expect("second join");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_kill_marks_handle_and_terminates() {
        let subprocess = spawn_raw("sleep", &["10"]);
        assert!(subprocess.running());
        assert!(!subprocess.killed());

        subprocess.kill().expect("Failed to kill");
        // The flag flips immediately, before the process has exited.
        assert!(subprocess.killed());

        let status = subprocess.join().await.expect("Failed to join");
        assert!(!status.success()); // terminated by SIGTERM
        assert!(!subprocess.running());
    }

    #[tokio::test]
    async fn test_kill_is_idempotent() {
        let subprocess = spawn_raw("sleep", &["10"]);
        subprocess.kill().expect("first kill");
        subprocess.kill().expect("second kill");
        subprocess.join().await.expect("Failed to join");
        // And again after the process is gone.
        subprocess.kill().expect("kill after exit");
    }

    #[tokio::test]
    async fn test_pid_is_reported() {
        let subprocess = spawn_raw("sleep", &["5"]);
        assert!(subprocess.pid() > 0);
        subprocess.kill().expect("Failed to kill");
        subprocess.join().await.expect("Failed to join");
    }
}
