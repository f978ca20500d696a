//! Launch configuration for tethered subprocesses
//!
//! The builder accumulates everything about a launch (program, runtime
//! arguments, working directory, entry point, stream wiring, termination
//! linkage) and `spawn()` snapshots it into the fixed-order trampoline
//! command line:
//!
//! ```text
//! <program> [runtime-args...] __tether-trampoline <ancestor-pid> <entry-name> [user-args...]
//! ```
//!
//! The ancestor pid is captured at spawn time, not at configuration time.
//! The spawned child is made a session and process group leader via
//! `setsid()`, so [`Subprocess::kill`] can signal the entire subprocess tree
//! with one `killpg`.
//!
//! For every stream configured as a pipe with a relay endpoint, `spawn()`
//! starts one background task copying bytes until the source is exhausted;
//! relay errors are logged and the relay stops, without touching the
//! subprocess's own lifecycle.

// Allow unsafe code for this module since spawning requires a libc::setsid() call
#![allow(unsafe_code)]

#[allow(unused_imports)]
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use nix::unistd::getpid;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Result, SpawnError};
use crate::subprocess::Subprocess;
use crate::trampoline::{Registry, SUBPROCESS_EXIT_CODE, TRAMPOLINE_COMMAND};

/// How one of the subprocess's standard streams is wired at launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdioMode {
    /// Share the spawner's own stream.
    Inherit,
    /// Create a pipe, readable/writable through the handle or a relay.
    Piped,
    /// Discard (/dev/null).
    Null,
}

impl StdioMode {
    fn to_stdio(self) -> Stdio {
        match self {
            StdioMode::Inherit => Stdio::inherit(),
            StdioMode::Piped => Stdio::piped(),
            StdioMode::Null => Stdio::null(),
        }
    }
}

type RelaySink = Box<dyn AsyncWrite + Send + Unpin>;
type RelaySource = Box<dyn AsyncRead + Send + Unpin>;

/// Create a builder for a new [`Subprocess`].
pub fn process() -> SubprocessBuilder {
    SubprocessBuilder::new()
}

/// Builder-style launch configuration, consumed by [`spawn`](SubprocessBuilder::spawn).
///
/// All three streams default to [`StdioMode::Piped`].
pub struct SubprocessBuilder {
    program: Option<PathBuf>,
    runtime_args: Vec<String>,
    directory: Option<PathBuf>,
    entry: Option<String>,
    args: Vec<String>,
    stdin: StdioMode,
    stdout: StdioMode,
    stderr: StdioMode,
    stdin_pipe: Option<RelaySource>,
    stdout_pipe: Option<RelaySink>,
    stderr_pipe: Option<RelaySink>,
    parent_exit_code: Option<i32>,
}

impl Default for SubprocessBuilder {
    fn default() -> Self {
        Self {
            program: None,
            runtime_args: Vec::new(),
            directory: None,
            entry: None,
            args: Vec::new(),
            stdin: StdioMode::Piped,
            stdout: StdioMode::Piped,
            stderr: StdioMode::Piped,
            stdin_pipe: None,
            stdout_pipe: None,
            stderr_pipe: None,
            parent_exit_code: None,
        }
    }
}

impl SubprocessBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the binary to launch as the subprocess runtime.
    ///
    /// Defaults to the current executable, which works whenever the spawner
    /// itself carries the registry and calls
    /// [`trampoline::maybe_run`](crate::trampoline::maybe_run) in `main`.
    pub fn program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = Some(program.into());
        self
    }

    /// Set extra arguments passed to the runtime binary, before the
    /// trampoline marker.
    pub fn runtime_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.runtime_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set the subprocess working directory.
    pub fn directory(mut self, directory: impl AsRef<Path>) -> Self {
        self.directory = Some(directory.as_ref().to_path_buf());
        self
    }

    /// Set the entry point to run in the subprocess, validated against the
    /// registry the subprocess binary will carry.
    ///
    /// Fails synchronously with [`SpawnError::EntryPoint`] before any process
    /// is started if the name is not registered.
    pub fn entry(mut self, registry: &Registry, name: &str) -> Result<Self> {
        if !registry.contains(name) {
            return Err(SpawnError::EntryPoint(format!(
                "Entry point not found in registry: {}",
                name
            )));
        }
        self.entry = Some(name.to_string());
        Ok(self)
    }

    /// Set the entry point by name without registry validation.
    ///
    /// Useful when the launched binary is not the current one, so its
    /// registry is not available here. An unknown name then surfaces only in
    /// the child, as an
    /// [`INVALID_ARGUMENTS_EXIT_CODE`](crate::trampoline::INVALID_ARGUMENTS_EXIT_CODE)
    /// exit.
    pub fn entry_unchecked(mut self, name: &str) -> Self {
        self.entry = Some(name.to_string());
        self
    }

    /// Set the arguments passed to the entry point.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Share all three standard streams with the spawner.
    pub fn inherit_io(mut self) -> Self {
        self.stdin = StdioMode::Inherit;
        self.stdout = StdioMode::Inherit;
        self.stderr = StdioMode::Inherit;
        self
    }

    /// Set how the subprocess stdin is wired.
    pub fn redirect_stdin(mut self, mode: StdioMode) -> Self {
        self.stdin = mode;
        self
    }

    /// Set how the subprocess stdout is wired.
    pub fn redirect_stdout(mut self, mode: StdioMode) -> Self {
        self.stdout = mode;
        self
    }

    /// Set how the subprocess stderr is wired.
    pub fn redirect_stderr(mut self, mode: StdioMode) -> Self {
        self.stderr = mode;
        self
    }

    /// Relay subprocess stdout into a sink on a background task.
    pub fn pipe_stdout(mut self, sink: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.stdout = StdioMode::Piped;
        self.stdout_pipe = Some(Box::new(sink));
        self
    }

    /// Relay subprocess stderr into a sink on a background task.
    pub fn pipe_stderr(mut self, sink: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.stderr = StdioMode::Piped;
        self.stderr_pipe = Some(Box::new(sink));
        self
    }

    /// Relay a source into subprocess stdin on a background task.
    ///
    /// The child sees EOF once the source is exhausted.
    pub fn pipe_stdin(mut self, source: impl AsyncRead + Send + Unpin + 'static) -> Self {
        self.stdin = StdioMode::Piped;
        self.stdin_pipe = Some(Box::new(source));
        self
    }

    /// Terminate the spawner with [`SUBPROCESS_EXIT_CODE`] if the subprocess
    /// exits without [`kill`](Subprocess::kill) having been called.
    pub fn terminate_parent_on_exit(self) -> Self {
        self.terminate_parent_on_exit_with(SUBPROCESS_EXIT_CODE)
    }

    /// Terminate the spawner with the given exit code if the subprocess
    /// exits without [`kill`](Subprocess::kill) having been called.
    pub fn terminate_parent_on_exit_with(mut self, exit_code: i32) -> Self {
        self.parent_exit_code = Some(exit_code);
        self
    }

    /// Spawn the subprocess described by this configuration.
    ///
    /// Must be called from within a tokio runtime. Configuration errors (no
    /// entry point set, bad working directory) and OS launch failures are
    /// reported synchronously;
    /// everything after a successful start is observable only through the
    /// returned handle, exit statuses and logs.
    pub fn spawn(self) -> Result<Subprocess> {
        let entry = self
            .entry
            .ok_or_else(|| SpawnError::Configuration("No entry point configured".to_string()))?;
        let program = match self.program {
            Some(program) => program,
            None => std::env::current_exe().map_err(|e| {
                SpawnError::Configuration(format!("Cannot resolve current executable: {}", e))
            })?,
        };

        // The ancestor expectation is our pid right now, not whatever it was
        // when the builder was created.
        let argv = trampoline_argv(getpid().as_raw(), &entry, &self.args);
        debug!(
            "Spawning subprocess: {} {:?} {:?}",
            program.display(),
            self.runtime_args,
            argv
        );

        let mut command = Command::new(&program);
        command.args(&self.runtime_args);
        command.args(&argv);
        if let Some(directory) = &self.directory {
            // Surface a bad working directory before any process exists.
            let metadata = std::fs::metadata(directory)?;
            if !metadata.is_dir() {
                return Err(SpawnError::Configuration(format!(
                    "Not a directory: {}",
                    directory.display()
                )));
            }
            command.current_dir(directory);
        }
        command.stdin(self.stdin.to_stdio());
        command.stdout(self.stdout.to_stdio());
        command.stderr(self.stderr.to_stdio());

        // Make the child a session and process group leader so kill() can
        // signal the entire subprocess tree.
        // Safety: setsid() is async-signal-safe and appropriate for use in pre_exec
        unsafe {
            command.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = command.spawn().map_err(|e| {
            SpawnError::ProcessSpawn(format!("Failed to spawn '{}': {}", program.display(), e))
        })?;

        if let Some(sink) = self.stdout_pipe {
            if let Some(stdout) = child.stdout.take() {
                relay(stdout, sink, "stdout");
            }
        }
        if let Some(sink) = self.stderr_pipe {
            if let Some(stderr) = child.stderr.take() {
                relay(stderr, sink, "stderr");
            }
        }
        if let Some(source) = self.stdin_pipe {
            if let Some(stdin) = child.stdin.take() {
                relay(source, stdin, "stdin");
            }
        }

        Subprocess::new(child, entry, self.parent_exit_code)
    }
}

/// Compose the fixed-order trampoline argument vector:
/// `<marker> <ancestor-pid> <entry-name> [user-args...]`.
fn trampoline_argv(ancestor_pid: i32, entry: &str, args: &[String]) -> Vec<String> {
    let mut argv = Vec::with_capacity(3 + args.len());
    argv.push(TRAMPOLINE_COMMAND.to_string());
    argv.push(ancestor_pid.to_string());
    argv.push(entry.to_string());
    argv.extend(args.iter().cloned());
    argv
}

/// Copy bytes from a source to a sink on a background task.
///
/// The task ends when the source is exhausted or either side reports an
/// error; errors are logged, never escalated to the subprocess lifecycle.
fn relay(
    mut source: impl AsyncRead + Send + Unpin + 'static,
    mut sink: impl AsyncWrite + Send + Unpin + 'static,
    stream: &'static str,
) {
    tokio::spawn(async move {
        if let Err(e) = tokio::io::copy(&mut source, &mut sink).await {
            warn!("{} relay error: {}", stream, e);
        }
        // Propagate EOF so downstream readers (or the child's stdin) close.
        let _ = sink.shutdown().await;
    });
}
