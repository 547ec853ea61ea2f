//! Process lifecycle: Starting → Serving → Terminating.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{error, info, warn};

use crate::invocation::{Invocation, ProcessRole};
use crate::listener::{acquire, AcquireError, InheritError, ListenerHandle};
use crate::manifest::InheritManifest;
use crate::restart::{ProcessSpawner, RestartCoordinator, RestartError, RestartState, Spawner};
use crate::signals::{ControlSignal, SignalHandler, SignalRouter};

/// Exit status of every shutdown, deliberately not success.
pub const EXIT_STATUS: i32 = 1;

/// Accepts and handles connections on the process's listener.
pub trait Service {
    /// Serve until the listener fails. The future is dropped when the
    /// process starts terminating.
    fn serve(&self, listener: &TcpListener) -> impl Future<Output = io::Result<()>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Starting,
    Serving,
    Terminating,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Starting => write!(f, "starting"),
            LifecycleState::Serving => write!(f, "serving"),
            LifecycleState::Terminating => write!(f, "terminating"),
        }
    }
}

/// Why serving ended.
#[derive(Debug)]
pub enum ShutdownCause {
    /// A signal mapped to terminate.
    Signal(ControlSignal),
    /// The service's accept loop gave up.
    ServiceFailed(io::Error),
    /// The service returned without error.
    ServiceStopped,
}

/// Outcome of [`Lifecycle::serve`].
#[derive(Debug)]
pub struct Shutdown {
    pub cause: ShutdownCause,
    pub close_error: Option<io::Error>,
}

impl Shutdown {
    pub fn exit_code(&self) -> i32 {
        EXIT_STATUS
    }

    /// Leave the Terminating state: exit the process with [`EXIT_STATUS`].
    pub fn exit(self) -> ! {
        info!(pid = std::process::id(), cause = ?self.cause, code = self.exit_code(), "Exiting");
        std::process::exit(self.exit_code())
    }
}

/// Owns the listener and restart state of one process generation.
pub struct Lifecycle<S = ProcessSpawner> {
    invocation: Invocation,
    role: ProcessRole,
    generation: u64,
    listener: ListenerHandle,
    restart_state: RestartState,
    coordinator: RestartCoordinator<S>,
    state: LifecycleState,
}

impl Lifecycle<ProcessSpawner> {
    /// Determine the role from `invocation` and acquire the listener.
    pub async fn start(addr: SocketAddr, invocation: Invocation) -> Result<Self, AcquireError> {
        Self::start_with_spawner(addr, invocation, ProcessSpawner).await
    }
}

impl<S: Spawner> Lifecycle<S> {
    pub async fn start_with_spawner(
        addr: SocketAddr,
        invocation: Invocation,
        spawner: S,
    ) -> Result<Self, AcquireError> {
        let manifest = resolve_manifest(invocation.role(), |key| std::env::var(key).ok())?;
        Self::start_with_manifest(addr, invocation, manifest, spawner).await
    }

    /// Start with an explicit manifest instead of reading the environment.
    pub async fn start_with_manifest(
        addr: SocketAddr,
        invocation: Invocation,
        manifest: InheritManifest,
        spawner: S,
    ) -> Result<Self, AcquireError> {
        let role = invocation.role();
        info!(
            pid = std::process::id(),
            %role,
            generation = manifest.generation,
            state = %LifecycleState::Starting,
            "Acquiring listener"
        );

        let listener = acquire(addr, role, &manifest).await?;

        Ok(Self {
            invocation,
            role,
            generation: manifest.generation,
            listener,
            restart_state: RestartState::new(),
            coordinator: RestartCoordinator::with_spawner(spawner, manifest),
            state: LifecycleState::Starting,
        })
    }

    pub fn role(&self) -> ProcessRole {
        self.role
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn restart_state(&self) -> &RestartState {
        &self.restart_state
    }

    pub fn coordinator(&self) -> &RestartCoordinator<S> {
        &self.coordinator
    }

    /// Serve and route `signals` until a terminate signal arrives or the
    /// service fails, then close the listener.
    ///
    /// A closed signal channel leaves the process serving.
    pub async fn serve<Svc: Service>(
        mut self,
        service: &Svc,
        signals: UnboundedReceiver<ControlSignal>,
    ) -> Shutdown {
        self.state = LifecycleState::Serving;
        info!(
            pid = std::process::id(),
            role = %self.role,
            addr = %self.listener.local_addr(),
            state = %self.state,
            "Serving"
        );

        let mut router = SignalRouter::new(signals);
        let cause = {
            let mut dispatcher = Dispatcher {
                invocation: &self.invocation,
                role: self.role,
                generation: self.generation,
                listener: &self.listener,
                restart_state: &self.restart_state,
                coordinator: &self.coordinator,
            };

            tokio::select! {
                result = service.serve(self.listener.as_tcp()) => match result {
                    Ok(()) => ShutdownCause::ServiceStopped,
                    Err(e) => {
                        error!(error = %e, "Service stopped accepting connections");
                        ShutdownCause::ServiceFailed(e)
                    }
                },
                signal = async {
                    match router.run(&mut dispatcher).await {
                        Some(signal) => signal,
                        None => {
                            warn!("Signal channel closed; serving without signal handling");
                            std::future::pending().await
                        }
                    }
                } => ShutdownCause::Signal(signal),
            }
        };

        self.state = LifecycleState::Terminating;
        let addr = self.listener.local_addr();
        let pid = std::process::id();
        info!(pid, %addr, state = %self.state, "Closing listener");

        let close_error = match self.listener.close() {
            Ok(()) => {
                info!(pid, %addr, "Listener closed");
                None
            }
            Err(e) => {
                error!(pid, %addr, error = %e, "Listener close failed");
                Some(e)
            }
        };

        Shutdown { cause, close_error }
    }
}

/// Manifest describing this process's listener.
///
/// A successor started with the marker but without a manifest (a predecessor
/// that only passes the descriptor) assumes the well-known slot and hands off
/// to its live parent.
fn resolve_manifest<F>(role: ProcessRole, lookup: F) -> Result<InheritManifest, InheritError>
where
    F: Fn(&str) -> Option<String>,
{
    if !role.is_successor() {
        return Ok(InheritManifest::original());
    }
    let manifest = InheritManifest::from_lookup(lookup)
        .inspect_err(|e| error!(error = %e, "Unusable inherit manifest"))?;
    Ok(manifest.unwrap_or_else(|| {
        warn!("Started with restart marker but no manifest; assuming the well-known slot");
        InheritManifest {
            generation: 1,
            parent_pid: None,
            ..InheritManifest::original()
        }
    }))
}

/// Routes signal actions to the restart coordinator for the serving lifecycle.
struct Dispatcher<'a, S> {
    invocation: &'a Invocation,
    role: ProcessRole,
    generation: u64,
    listener: &'a ListenerHandle,
    restart_state: &'a RestartState,
    coordinator: &'a RestartCoordinator<S>,
}

impl<S: Spawner> SignalHandler for Dispatcher<'_, S> {
    fn restart(&mut self) {
        match self
            .coordinator
            .restart(self.restart_state, self.listener, self.invocation)
        {
            Ok(pid) => info!(successor = pid, "Restart in progress; still serving until told to stop"),
            Err(RestartError::AlreadyRestarting) => {
                warn!("Restart requested but a successor was already spawned; ignoring")
            }
            Err(e) => error!(error = %e, "Restart failed; restart slot stays consumed"),
        }
    }

    fn report(&mut self, signal: ControlSignal) {
        info!(
            pid = std::process::id(),
            %signal,
            signum = signal.as_raw(),
            role = %self.role,
            generation = self.generation,
            forked = self.restart_state.has_forked(),
            addr = %self.listener.local_addr(),
            "Status report"
        );
    }

    fn terminate(&mut self) {
        info!(pid = std::process::id(), "Terminate requested");
    }
}
