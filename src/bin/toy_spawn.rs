//! Toy multi-entry binary for spawn integration tests
//!
//! Carries a registry of small entry points and re-enters itself through the
//! trampoline marker. The integration tests point
//! `SubprocessBuilder::program` at this binary via `CARGO_BIN_EXE_toy_spawn`.

use std::io::Write;
use std::time::Duration;

use tether::{process, Registry};

type EntryResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Write a fixed literal to stdout and exit cleanly.
fn foo(_args: &[String]) -> EntryResult {
    std::io::stdout().write_all(b"Foo!")?;
    std::io::stdout().flush()?;
    Ok(())
}

/// Write a fixed literal to stderr and exit cleanly.
fn noisy(_args: &[String]) -> EntryResult {
    std::io::stderr().write_all(b"Err!")?;
    std::io::stderr().flush()?;
    Ok(())
}

/// Always fail.
fn boom(_args: &[String]) -> EntryResult {
    Err("boom".into())
}

/// Copy stdin through to stdout.
fn echo_stdin(_args: &[String]) -> EntryResult {
    let mut buf = Vec::new();
    std::io::Read::read_to_end(&mut std::io::stdin(), &mut buf)?;
    std::io::stdout().write_all(&buf)?;
    std::io::stdout().flush()?;
    Ok(())
}

/// Write the current working directory to stdout.
fn print_cwd(_args: &[String]) -> EntryResult {
    let cwd = std::env::current_dir()?;
    std::io::stdout().write_all(cwd.display().to_string().as_bytes())?;
    std::io::stdout().flush()?;
    Ok(())
}

/// Write our own pid to the given file, then idle forever.
fn pidfile_child(args: &[String]) -> EntryResult {
    let path = args.first().ok_or("missing pid file argument")?;
    std::fs::write(path, std::process::id().to_string())?;
    loop {
        std::thread::sleep(Duration::from_secs(1));
    }
}

/// Spawn `pidfile-child` as our own tethered subprocess, then idle forever.
///
/// Used by the orphan test: the test kills this middle process and expects
/// the grandchild to notice the reparenting and exit on its own.
fn middle_parent(args: &[String]) -> EntryResult {
    let registry = build_registry();
    let _ = tether::utils::init_tracing("info");

    let runtime = tokio::runtime::Runtime::new()?;
    let _child = runtime.block_on(async {
        process()
            .entry(&registry, "pidfile-child")?
            .args(args.iter().cloned())
            .inherit_io()
            .spawn()
    })?;

    loop {
        std::thread::sleep(Duration::from_secs(1));
    }
}

/// Spawn a short-lived subprocess with termination linkage, then idle.
///
/// The linkage should take this whole process down with
/// `SUBPROCESS_EXIT_CODE` shortly after the child exits.
fn linked_parent(_args: &[String]) -> EntryResult {
    let registry = build_registry();
    let _ = tether::utils::init_tracing("info");

    let runtime = tokio::runtime::Runtime::new()?;
    let _child = runtime.block_on(async {
        process()
            .entry(&registry, "foo")?
            .inherit_io()
            .terminate_parent_on_exit()
            .spawn()
    })?;

    loop {
        std::thread::sleep(Duration::from_secs(1));
    }
}

fn build_registry() -> Registry {
    let mut registry = Registry::new();
    registry.register("foo", foo);
    registry.register("noisy", noisy);
    registry.register("boom", boom);
    registry.register("echo-stdin", echo_stdin);
    registry.register("print-cwd", print_cwd);
    registry.register("pidfile-child", pidfile_child);
    registry.register("middle-parent", middle_parent);
    registry.register("linked-parent", linked_parent);
    registry
}

fn main() {
    let registry = build_registry();
    tether::trampoline::maybe_run(&registry);

    // Invoked directly rather than as a trampoline: just list what we carry.
    let mut names: Vec<_> = registry.names().collect();
    names.sort_unstable();
    println!("entries: {}", names.join(", "));
}
