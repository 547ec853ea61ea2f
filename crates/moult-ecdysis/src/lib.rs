//! # moult-ecdysis
//!
//! Zero-downtime restarts by handing a bound listening socket from a running
//! process to a freshly spawned successor, in the spirit of the
//! [Cloudflare Ecdysis pattern](https://blog.cloudflare.com/ecdysis-rust-graceful-restarts/).
//!
//! ## Overview
//!
//! 1. The original process binds its listener and serves.
//! 2. On `SIGHUP` it spawns a successor (same binary, same arguments plus the
//!    `-continue` marker) with the listener passed at fd 3.
//! 3. The successor adopts fd 3 without binding and sends `SIGTSTP` to its
//!    predecessor.
//! 4. The predecessor closes its copy of the listener and exits.
//!
//! Only one restart may be in flight per process: the first `SIGHUP` consumes
//! the restart slot for good, even if spawning fails.
//!
//! ## Signal Conventions
//!
//! - `SIGHUP` — restart (spawn a successor)
//! - `SIGUSR1`, `SIGUSR2` — log a status report
//! - `SIGTSTP` — close the listener and exit with status 1
//!
//! ## Environment Variables
//!
//! Exported by the predecessor for its successor:
//!
//! - `LISTEN_FDS` — number of inherited file descriptors (always 1, at fd 3)
//! - `LISTEN_FD_NAMES` — name of the inherited listener (`http`)
//! - `MOULT_GENERATION` — restart generation of the successor
//! - `MOULT_PARENT_PID` — pid of the predecessor to signal after adoption
//!
//! ## Platform
//!
//! This crate requires Unix (Linux / macOS). It will not compile on other platforms.

#[cfg(not(unix))]
compile_error!("moult-ecdysis requires a Unix platform (Linux or macOS)");

mod invocation;
mod lifecycle;
mod listener;
mod manifest;
mod restart;
mod signals;

pub use invocation::{Invocation, ProcessRole, RESTART_MARKER};
pub use lifecycle::{Lifecycle, LifecycleState, Service, Shutdown, ShutdownCause, EXIT_STATUS};
pub use listener::{acquire, signal_predecessor, AcquireError, InheritError, ListenerHandle, NotifyError};
pub use manifest::{InheritManifest, INHERITED_LISTENER_FD, LISTENER_NAME};
pub use restart::{ProcessSpawner, RestartCoordinator, RestartError, RestartState, Spawner, SuccessorSpec};
pub use signals::{ControlSignal, SignalAction, SignalHandler, SignalRouter, SignalSource};
