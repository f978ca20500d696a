//! Trampoline runtime: the thin intermediary hosting the parent probe
//!
//! Every subprocess launched by this crate is really the trampoline: the
//! command line composed by [`SubprocessBuilder`] is
//!
//! ```text
//! <program> [runtime-args...] __tether-trampoline <ancestor-pid> <entry-name> [user-args...]
//! ```
//!
//! A binary makes itself usable as the `<program>` by calling [`maybe_run`]
//! first thing in `main`. When the marker is present, the trampoline arms the
//! parent probe against the ancestor pid *before* anything else, then resolves
//! the entry name in the [`Registry`] and invokes it inline on the current
//! thread. No further process is forked: the probe keeps ticking in the
//! background for as long as the user code runs, and its self-termination
//! takes the user code with it.
//!
//! Entry-point dispatch is an explicit registration table rather than any kind
//! of runtime symbol lookup: the trampoline only needs "resolve a name to a
//! zero-state callable taking string arguments".
//!
//! Diagnostics here go to stderr. A trampoline process has no synchronous
//! channel back to its spawner and no initialised tracing subscriber, so exit
//! codes plus stderr are the whole error surface.
//!
//! [`SubprocessBuilder`]: crate::builder::SubprocessBuilder

use std::collections::HashMap;

use crate::probe::ParentProbe;

/// Reserved argv marker that re-enters a host binary as a trampoline.
pub const TRAMPOLINE_COMMAND: &str = "__tether-trampoline";

/// Normal exit.
pub const OK_EXIT_CODE: i32 = 0;
/// The trampoline was invoked with bad arguments or an unknown entry point.
pub const INVALID_ARGUMENTS_EXIT_CODE: i32 = 2;
/// The user entry point failed (or the ancestor pid did not parse).
pub const SUBPROCESS_EXCEPTION_EXIT_CODE: i32 = 3;
/// Default exit code for the spawner when termination linkage fires.
///
/// Never produced by the trampoline itself; see
/// [`SubprocessBuilder::terminate_parent_on_exit`](crate::builder::SubprocessBuilder::terminate_parent_on_exit).
pub const SUBPROCESS_EXIT_CODE: i32 = 4;

/// A subprocess entry point: a zero-state callable taking string arguments.
///
/// Returning `Err` makes the trampoline exit with
/// [`SUBPROCESS_EXCEPTION_EXIT_CODE`]; returning `Ok` lets the process exit
/// normally. An entry point that needs a specific exit code can call
/// [`std::process::exit`] itself.
pub type EntryPoint =
    fn(&[String]) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Table of named entry points available to spawned subprocesses.
///
/// A host binary builds one registry, hands it to [`maybe_run`] so re-exec'd
/// copies of itself can dispatch, and to
/// [`SubprocessBuilder::entry`](crate::builder::SubprocessBuilder::entry) so
/// unknown names are rejected before any process is started.
#[derive(Debug, Default)]
pub struct Registry {
    entries: HashMap<String, EntryPoint>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entry point under a name. Replaces any previous entry
    /// with the same name.
    pub fn register(&mut self, name: impl Into<String>, entry: EntryPoint) -> &mut Self {
        self.entries.insert(name.into(), entry);
        self
    }

    /// Resolve a name to its entry point.
    pub fn resolve(&self, name: &str) -> Option<EntryPoint> {
        self.entries.get(name).copied()
    }

    /// Whether a name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// The registered entry point names, in no particular order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

/// Run the trampoline with the arguments that followed [`TRAMPOLINE_COMMAND`]
/// and return the process exit code.
///
/// `args` is `[ancestor-pid, entry-name, user-args...]`. The probe is armed
/// before the entry point is resolved or invoked: resolution and the entry
/// point itself may take arbitrary time or block forever, and a process that
/// is born already orphaned must not get to run unsupervised work just
/// because its real work has not started yet.
pub fn run(registry: &Registry, args: &[String]) -> i32 {
    if args.len() < 2 {
        eprintln!("tether: invalid trampoline arguments: {:?}", args);
        return INVALID_ARGUMENTS_EXIT_CODE;
    }

    let ancestor_pid: i32 = match args[0].parse() {
        Ok(pid) => pid,
        Err(e) => {
            eprintln!("tether: bad ancestor pid '{}': {}", args[0], e);
            return SUBPROCESS_EXCEPTION_EXIT_CODE;
        }
    };

    // Keeps ticking for the rest of the process lifetime; the handle is held
    // only so the probe is visibly armed for the entire invocation below.
    let _probe = ParentProbe::arm(ancestor_pid);

    let name = &args[1];
    let Some(entry) = registry.resolve(name) else {
        eprintln!("tether: entry point not found: {}", name);
        return INVALID_ARGUMENTS_EXIT_CODE;
    };

    match entry(&args[2..]) {
        Ok(()) => OK_EXIT_CODE,
        Err(e) => {
            eprintln!("tether: entry point '{}' failed: {}", name, e);
            SUBPROCESS_EXCEPTION_EXIT_CODE
        }
    }
}

/// Dispatch to the trampoline if this process was launched as one.
///
/// Call this first thing in `main`, before argument parsing, logging setup or
/// anything else: if the trampoline marker is present in argv the process
/// runs the requested entry point and exits with the code from [`run`];
/// otherwise this returns and the host binary continues with its normal work.
///
/// Runtime arguments may sit between argv\[0\] and the marker, and user
/// arguments only ever appear after it, so the first occurrence of the
/// marker is always the dispatch point.
pub fn maybe_run(registry: &Registry) {
    let args: Vec<String> = std::env::args().collect();
    if let Some(found) = args.iter().skip(1).position(|arg| arg == TRAMPOLINE_COMMAND) {
        let marker = found + 1; // position() is relative to the skipped iterator
        std::process::exit(run(registry, &args[marker + 1..]));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    static MARK_CALLED: AtomicBool = AtomicBool::new(false);
    static MARK_ARG_COUNT: AtomicUsize = AtomicUsize::new(0);

    fn mark(args: &[String]) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
        MARK_CALLED.store(true, Ordering::SeqCst);
        MARK_ARG_COUNT.store(args.len(), Ordering::SeqCst);
        Ok(())
    }

    fn boom(_args: &[String]) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Err("boom".into())
    }

    fn test_registry() -> Registry {
        let mut registry = Registry::new();
        registry.register("mark", mark);
        registry.register("boom", boom);
        registry
    }

    // Our real parent pid; arming the probe against it is harmless because
    // the expectation holds for the life of the test process.
    fn own_ppid() -> String {
        nix::unistd::getppid().as_raw().to_string()
    }

    fn to_args(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_registry_resolution() {
        let registry = test_registry();
        assert!(registry.contains("mark"));
        assert!(registry.resolve("mark").is_some());
        assert!(!registry.contains("missing"));
        assert!(registry.resolve("missing").is_none());
        let mut names: Vec<_> = registry.names().collect();
        names.sort_unstable();
        assert_eq!(names, vec!["boom", "mark"]);
    }

    #[test]
    fn test_run_rejects_missing_arguments() {
        let registry = test_registry();
        assert_eq!(run(&registry, &[]), INVALID_ARGUMENTS_EXIT_CODE);
        assert_eq!(run(&registry, &to_args(&["123"])), INVALID_ARGUMENTS_EXIT_CODE);
    }

    #[test]
    fn test_run_rejects_unparseable_ancestor_pid() {
        // A bad pid is an uncaught-error class failure, distinct from the
        // invalid-arguments code, and must be reported before the probe or
        // any user code gets involved.
        let registry = test_registry();
        let code = run(&registry, &to_args(&["not-a-pid", "mark"]));
        assert_eq!(code, SUBPROCESS_EXCEPTION_EXIT_CODE);
    }

    #[test]
    fn test_run_rejects_unknown_entry_point() {
        let registry = test_registry();
        let args = vec![own_ppid(), "missing".to_string()];
        assert_eq!(run(&registry, &args), INVALID_ARGUMENTS_EXIT_CODE);
    }

    #[test]
    fn test_run_invokes_entry_point_with_remaining_args() {
        let registry = test_registry();
        let args = vec![
            own_ppid(),
            "mark".to_string(),
            "a".to_string(),
            "b".to_string(),
        ];
        assert_eq!(run(&registry, &args), OK_EXIT_CODE);
        assert!(MARK_CALLED.load(Ordering::SeqCst));
        assert_eq!(MARK_ARG_COUNT.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_run_maps_entry_point_error_to_exception_code() {
        let registry = test_registry();
        let args = vec![own_ppid(), "boom".to_string()];
        assert_eq!(run(&registry, &args), SUBPROCESS_EXCEPTION_EXIT_CODE);
    }
}
