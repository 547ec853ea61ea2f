//! Single-flight restart: spawn one successor that inherits the listener.

use std::ffi::OsString;
use std::io;
use std::os::unix::io::{AsFd, AsRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::{Mutex, PoisonError};

use thiserror::Error;
use tracing::{error, info};

use crate::invocation::Invocation;
use crate::manifest::{InheritManifest, ENV_KEYS, INHERITED_LISTENER_FD};

#[derive(Debug, Error)]
pub enum RestartError {
    #[error("another restart already happened in this process; ignoring")]
    AlreadyRestarting,

    #[error("failed to launch successor {program:?}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Whether this process has already spawned its successor.
///
/// The flag goes from `false` to `true` at most once and never resets, even
/// when the spawn it guarded failed.
#[derive(Debug, Default)]
pub struct RestartState {
    has_forked: Mutex<bool>,
}

impl RestartState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_forked(&self) -> bool {
        *self.has_forked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check-and-set under the lock. Returns `true` for the single caller
    /// that flipped the flag.
    fn claim(&self) -> bool {
        let mut forked = self.has_forked.lock().unwrap_or_else(PoisonError::into_inner);
        if *forked {
            false
        } else {
            *forked = true;
            true
        }
    }
}

/// Everything needed to launch one successor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuccessorSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    /// Descriptor in this process that becomes [`INHERITED_LISTENER_FD`] in the child.
    pub inherited_fd: RawFd,
    pub manifest: InheritManifest,
}

impl SuccessorSpec {
    pub fn new(invocation: &Invocation, inherited_fd: RawFd, manifest: InheritManifest) -> Self {
        Self {
            program: invocation.program().clone(),
            args: invocation.successor_args(),
            inherited_fd,
            manifest,
        }
    }
}

/// Launches successor processes. Returns the child pid.
pub trait Spawner {
    fn spawn(&self, spec: SuccessorSpec) -> io::Result<u32>;
}

/// Spawns a real child process with the listener mapped onto the inherited slot.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessSpawner;

impl ProcessSpawner {
    /// Command for `spec`. Manifest variables this process inherited are
    /// dropped so the child sees only the values written for it.
    fn command(spec: &SuccessorSpec) -> Command {
        let mut cmd = Command::new(&spec.program);
        for key in ENV_KEYS {
            cmd.env_remove(key);
        }
        cmd.args(&spec.args)
            .envs(spec.manifest.to_env())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        cmd
    }
}

impl Spawner for ProcessSpawner {
    /// Forks and execs on the calling task; accepting resumes once this
    /// returns.
    fn spawn(&self, spec: SuccessorSpec) -> io::Result<u32> {
        let mut cmd = Self::command(&spec);

        let fd = spec.inherited_fd;
        // SAFETY: the hook only calls async-signal-safe functions (dup2, fcntl).
        unsafe {
            cmd.pre_exec(move || place_inherited_fd(fd));
        }

        // The child is never awaited: it outlives this process.
        let child = cmd.spawn()?;
        Ok(child.id())
    }
}

/// Runs in the forked child: make `fd` available at the inherited slot
/// across `exec`.
fn place_inherited_fd(fd: RawFd) -> io::Result<()> {
    if fd == INHERITED_LISTENER_FD {
        // Already in place; dup2 onto itself would leave FD_CLOEXEC set.
        if unsafe { libc::fcntl(fd, libc::F_SETFD, 0) } == -1 {
            return Err(io::Error::last_os_error());
        }
    } else if unsafe { libc::dup2(fd, INHERITED_LISTENER_FD) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Builds and launches successors, at most once per [`RestartState`].
#[derive(Debug)]
pub struct RestartCoordinator<S = ProcessSpawner> {
    spawner: S,
    manifest: InheritManifest,
    pid: i32,
}

impl<S: Spawner> RestartCoordinator<S> {
    /// `manifest` describes the current generation.
    pub fn with_spawner(spawner: S, manifest: InheritManifest) -> Self {
        Self {
            spawner,
            manifest,
            pid: std::process::id() as i32,
        }
    }

    #[cfg(test)]
    pub(crate) fn spawner(&self) -> &S {
        &self.spawner
    }

    /// Spawn the successor, handing it `listener`.
    ///
    /// Does not wait for the successor to start or adopt the listener. A
    /// failed spawn still consumes the restart slot.
    pub fn restart<L: AsFd>(
        &self,
        state: &RestartState,
        listener: &L,
        invocation: &Invocation,
    ) -> Result<u32, RestartError> {
        if !state.claim() {
            return Err(RestartError::AlreadyRestarting);
        }

        let spec = SuccessorSpec::new(
            invocation,
            listener.as_fd().as_raw_fd(),
            self.manifest.next_generation(self.pid),
        );
        let program = spec.program.clone();
        info!(
            program = ?spec.program,
            args = ?spec.args,
            fd = spec.inherited_fd,
            generation = spec.manifest.generation,
            "Restart: spawning successor"
        );

        match self.spawner.spawn(spec) {
            Ok(pid) => {
                info!(pid, "Restart: successor launched");
                Ok(pid)
            }
            Err(source) => {
                error!(program = ?program, error = %source, "Restart: failed to launch successor");
                Err(RestartError::Spawn { program, source })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Records every spec instead of launching anything.
    #[derive(Default)]
    struct RecordingSpawner {
        spawned: Mutex<Vec<SuccessorSpec>>,
        fail: bool,
    }

    impl RecordingSpawner {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        fn spawned(&self) -> Vec<SuccessorSpec> {
            self.spawned.lock().unwrap().clone()
        }
    }

    impl Spawner for RecordingSpawner {
        fn spawn(&self, spec: SuccessorSpec) -> io::Result<u32> {
            self.spawned.lock().unwrap().push(spec);
            if self.fail {
                Err(io::Error::new(io::ErrorKind::NotFound, "no such binary"))
            } else {
                Ok(4242)
            }
        }
    }

    impl<T: Spawner> Spawner for Arc<T> {
        fn spawn(&self, spec: SuccessorSpec) -> io::Result<u32> {
            (**self).spawn(spec)
        }
    }

    fn listener() -> std::net::TcpListener {
        std::net::TcpListener::bind("127.0.0.1:0").unwrap()
    }

    #[test]
    fn test_first_restart_spawns_with_marker_and_fd() {
        let coordinator = RestartCoordinator::with_spawner(RecordingSpawner::default(), InheritManifest::original());
        let state = RestartState::new();
        let listener = listener();
        let invocation = Invocation::new("/usr/bin/moult-server", ["--addr", ":8888"]);

        assert!(!state.has_forked());
        let pid = coordinator.restart(&state, &listener, &invocation).unwrap();
        assert_eq!(pid, 4242);
        assert!(state.has_forked());

        let spawned = coordinator.spawner().spawned();
        assert_eq!(spawned.len(), 1);
        let spec = &spawned[0];
        assert_eq!(spec.program, PathBuf::from("/usr/bin/moult-server"));
        assert_eq!(
            spec.args,
            vec![OsString::from("--addr"), OsString::from(":8888"), OsString::from("-continue")]
        );
        assert_eq!(spec.inherited_fd, listener.as_raw_fd());
        assert_eq!(spec.manifest.generation, 1);
        assert_eq!(spec.manifest.parent_pid, Some(std::process::id() as i32));
    }

    #[test]
    fn test_second_restart_is_already_restarting() {
        let coordinator = RestartCoordinator::with_spawner(RecordingSpawner::default(), InheritManifest::original());
        let state = RestartState::new();
        let listener = listener();
        let invocation = Invocation::new("moult-server", Vec::<OsString>::new());

        coordinator.restart(&state, &listener, &invocation).unwrap();
        let err = coordinator.restart(&state, &listener, &invocation).unwrap_err();
        assert!(matches!(err, RestartError::AlreadyRestarting));
        assert_eq!(coordinator.spawner().spawned().len(), 1);
    }

    #[test]
    fn test_concurrent_restarts_spawn_once() {
        let spawner = Arc::new(RecordingSpawner::default());
        let coordinator = RestartCoordinator::with_spawner(Arc::clone(&spawner), InheritManifest::original());
        let state = RestartState::new();
        let listener = listener();
        let invocation = Invocation::new("moult-server", ["-continue"]);

        let results: Vec<Result<u32, RestartError>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..32)
                .map(|_| s.spawn(|| coordinator.restart(&state, &listener, &invocation)))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, RestartError::AlreadyRestarting)));
        assert_eq!(spawner.spawned().len(), 1);
        assert!(state.has_forked());
    }

    #[test]
    fn test_failed_spawn_consumes_slot() {
        let coordinator = RestartCoordinator::with_spawner(RecordingSpawner::failing(), InheritManifest::original());
        let state = RestartState::new();
        let listener = listener();
        let invocation = Invocation::new("/nonexistent/moult", Vec::<OsString>::new());

        let err = coordinator.restart(&state, &listener, &invocation).unwrap_err();
        assert!(matches!(err, RestartError::Spawn { .. }));
        assert!(state.has_forked());

        let err = coordinator.restart(&state, &listener, &invocation).unwrap_err();
        assert!(matches!(err, RestartError::AlreadyRestarting));
        assert_eq!(coordinator.spawner().spawned().len(), 1);
    }

    #[test]
    fn test_generation_advances_from_current_manifest() {
        let current = InheritManifest {
            generation: 7,
            parent_pid: Some(100),
            ..InheritManifest::original()
        };
        let coordinator = RestartCoordinator::with_spawner(RecordingSpawner::default(), current);
        let state = RestartState::new();
        let invocation = Invocation::new("moult-server", ["-continue"]);

        coordinator.restart(&state, &listener(), &invocation).unwrap();
        let spec = &coordinator.spawner().spawned()[0];
        assert_eq!(spec.manifest.generation, 8);
        assert_eq!(spec.args, vec![OsString::from("-continue")]);
    }

    #[test]
    fn test_child_environment_carries_only_fresh_manifest() {
        use std::ffi::OsStr;

        let spec = SuccessorSpec::new(
            &Invocation::new("moult-server", ["-continue"]),
            listener().as_raw_fd(),
            InheritManifest {
                generation: 2,
                parent_pid: None,
                ..InheritManifest::original()
            },
        );
        let cmd = ProcessSpawner::command(&spec);
        let envs: Vec<(&OsStr, Option<&OsStr>)> = cmd.get_envs().collect();
        let value = |key: &str| {
            envs.iter()
                .find(|(k, _)| *k == OsStr::new(key))
                .map(|(_, v)| v.map(|v| v.to_string_lossy().into_owned()))
        };

        assert_eq!(value("LISTEN_FDS"), Some(Some("1".to_string())));
        assert_eq!(value("LISTEN_FD_NAMES"), Some(Some("http".to_string())));
        assert_eq!(value("MOULT_GENERATION"), Some(Some("2".to_string())));
        // Removed rather than passed through from this process.
        assert_eq!(value("MOULT_PARENT_PID"), Some(None));
    }

    #[test]
    fn test_process_spawner_reports_missing_binary() {
        let listener = listener();
        let spec = SuccessorSpec::new(
            &Invocation::new("/nonexistent/moult-server", Vec::<OsString>::new()),
            listener.as_raw_fd(),
            InheritManifest::original().next_generation(1234),
        );
        let err = ProcessSpawner.spawn(spec).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
