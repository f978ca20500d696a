//! Spawn subprocesses that terminate themselves when the spawning process dies
//!
//! When process A spawns process B and A dies abnormally (crash, OOM-kill,
//! force-kill), A gets no chance to signal B, and B would leak as an orphan.
//! This crate closes that gap with two cooperating mechanisms:
//!
//! - a **trampoline** runtime inserted between the spawner and the user's
//!   entry point, whose only job is to poll for reparenting and terminate
//!   the whole process the instant it is detected ([`trampoline`], [`probe`]);
//! - a **subprocess handle** held by the spawner that tracks lifecycle and
//!   exposes kill / running / join / raw streams, with optional termination
//!   linkage back into the spawner's own exit ([`subprocess`], [`builder`]).
//!
//! ## Exit codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | normal exit, including benign orphaned self-termination |
//! | 2 | invalid trampoline arguments or unknown entry point |
//! | 3 | user entry point failed |
//! | 4 | default spawner exit when termination linkage fires |
//!
//! ## Example
//!
//! ```no_run
//! use tether::{process, Registry};
//!
//! fn hello(_args: &[String]) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     println!("hello from the subprocess");
//!     Ok(())
//! }
//!
//! #[tokio::main]
//! async fn main() -> tether::Result<()> {
//!     let mut registry = Registry::new();
//!     registry.register("hello", hello);
//!     // Re-entered copies of this binary dispatch here and never fall through.
//!     tether::trampoline::maybe_run(&registry);
//!
//!     let subprocess = process().entry(&registry, "hello")?.inherit_io().spawn()?;
//!     subprocess.join().await?;
//!     Ok(())
//! }
//! ```
//!
//! Unix only: orphan detection is built on `getppid(2)` and process groups.

pub mod builder;
pub mod error;
pub mod probe;
pub mod subprocess;
pub mod trampoline;

pub use builder::{process, StdioMode, SubprocessBuilder};
pub use error::{Result, SpawnError};
pub use probe::ParentProbe;
pub use subprocess::Subprocess;
pub use trampoline::{
    EntryPoint, Registry, INVALID_ARGUMENTS_EXIT_CODE, OK_EXIT_CODE,
    SUBPROCESS_EXCEPTION_EXIT_CODE, SUBPROCESS_EXIT_CODE, TRAMPOLINE_COMMAND,
};

/// Core utilities and helper functions
pub mod utils {
    use tracing::info;

    /// Initialize tracing for the application
    pub fn init_tracing(level: &str) -> crate::Result<()> {
        use tracing_subscriber::{fmt, EnvFilter};

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

        fmt()
            .with_env_filter(filter)
            .try_init()
            .map_err(|e| crate::SpawnError::Configuration(e.to_string()))?;

        info!("Tracing initialized with level: {}", level);
        Ok(())
    }
}
