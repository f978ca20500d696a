//! Parent liveness probing for trampoline processes
//!
//! There is no portable "notify me when my parent dies" primitive, and by the
//! time a spawner has crashed or been OOM-killed it can no longer signal
//! anyone. What the OS does guarantee is that an orphaned process gets
//! reparented to an init-equivalent process, so `getppid(2)` stops answering
//! with the pid of the original spawner. The probe polls for exactly that:
//! it captures the expected ancestor pid once, re-checks the actual parent
//! pid on a fixed interval, and terminates the whole process the instant the
//! two disagree.
//!
//! ## Probe lifetime
//!
//! The probe runs on a plain background thread, fire-and-forget: a Rust
//! thread never keeps the process alive on its own and never blocks process
//! exit, which is exactly the daemon-style lifetime the trampoline needs. In
//! production the probe outlives everything else in its process; [`disarm`]
//! exists for clean shutdown in tests.
//!
//! [`disarm`]: ParentProbe::disarm

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nix::unistd::getppid;

use crate::trampoline::OK_EXIT_CODE;

/// How often the probe re-checks the parent pid.
///
/// Short enough to reap orphans promptly, long enough to avoid wasting CPU.
/// The interval is a pure latency/cost tradeoff, not a correctness knob.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Background watcher that exits the process when it is reparented.
///
/// Armed once at trampoline startup against the spawner's pid, before any
/// user code runs. Every tick compares the current parent pid against that
/// immutable expectation; a mismatch means the spawner is dead and the probe
/// exits the whole process with [`OK_EXIT_CODE`] (orphaned self-termination
/// is benign, but the stderr line it emits keeps it distinguishable from a
/// normal user-initiated exit).
#[derive(Debug)]
pub struct ParentProbe {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ParentProbe {
    /// Arm the probe against the expected ancestor pid with the default
    /// polling interval.
    pub fn arm(expected_ppid: i32) -> Self {
        Self::arm_with_interval(expected_ppid, DEFAULT_POLL_INTERVAL)
    }

    /// Arm the probe with an explicit polling interval.
    pub fn arm_with_interval(expected_ppid: i32, interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let thread = thread::spawn(move || loop {
            thread::sleep(interval);
            if stop_flag.load(Ordering::Relaxed) {
                return;
            }
            // getppid(2) always succeeds on POSIX, so a tick either confirms
            // the parent or proves the reparenting; there is no transient
            // failure that could be mistaken for an orphan signal.
            let ppid = getppid().as_raw();
            if ppid != expected_ppid {
                // Reparented: the spawning parent is dead. Tracing is not set
                // up in trampoline processes, so stderr is the diagnostic
                // channel of record here.
                eprintln!(
                    "tether: reparented from {} to {}, spawning parent is dead, exiting",
                    expected_ppid, ppid
                );
                std::process::exit(OK_EXIT_CODE);
            }
        });

        Self {
            stop,
            thread: Some(thread),
        }
    }

    /// Stop the probe and wait for its thread to finish.
    ///
    /// Production code never needs this (the probe is meant to tick for the
    /// whole process lifetime); tests use it to shut down cleanly. Dropping
    /// the handle without calling `disarm` leaves the probe running.
    pub fn disarm(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
