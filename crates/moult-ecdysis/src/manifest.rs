//! The inherited resource manifest.
//!
//! A predecessor describes the descriptor it hands over through environment
//! variables compatible with systemd socket activation (`LISTEN_FDS`,
//! `LISTEN_FD_NAMES`), plus the generation counter and its own pid.

use std::os::unix::io::RawFd;

use crate::listener::InheritError;

/// Descriptor slot the listener occupies in a successor (first slot after stdio).
pub const INHERITED_LISTENER_FD: RawFd = 3;

/// Name the listener is published under in `LISTEN_FD_NAMES`.
pub const LISTENER_NAME: &str = "http";

const ENV_LISTEN_FDS: &str = "LISTEN_FDS";
const ENV_LISTEN_FD_NAMES: &str = "LISTEN_FD_NAMES";
const ENV_GENERATION: &str = "MOULT_GENERATION";
const ENV_PARENT_PID: &str = "MOULT_PARENT_PID";

/// Every variable a manifest may occupy.
pub(crate) const ENV_KEYS: [&str; 4] = [ENV_LISTEN_FDS, ENV_LISTEN_FD_NAMES, ENV_GENERATION, ENV_PARENT_PID];

/// What a successor inherits from its predecessor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InheritManifest {
    /// Descriptor slot holding the listener.
    pub fd: RawFd,
    /// Listener name, matched against [`LISTENER_NAME`].
    pub name: String,
    /// Restart generation, 0 for an original process.
    pub generation: u64,
    /// Predecessor pid, if it recorded one.
    pub parent_pid: Option<i32>,
}

impl InheritManifest {
    /// Manifest of a process that bound its own listener.
    pub fn original() -> Self {
        Self {
            fd: INHERITED_LISTENER_FD,
            name: LISTENER_NAME.to_string(),
            generation: 0,
            parent_pid: None,
        }
    }

    /// Manifest to hand to the next generation, spawned by `parent_pid`.
    pub fn next_generation(&self, parent_pid: i32) -> Self {
        Self {
            fd: INHERITED_LISTENER_FD,
            name: LISTENER_NAME.to_string(),
            generation: self.generation + 1,
            parent_pid: Some(parent_pid),
        }
    }

    /// Environment variables that carry this manifest across `exec`.
    pub fn to_env(&self) -> Vec<(&'static str, String)> {
        let mut vars = vec![
            (ENV_LISTEN_FDS, "1".to_string()),
            (ENV_LISTEN_FD_NAMES, self.name.clone()),
            (ENV_GENERATION, self.generation.to_string()),
        ];
        if let Some(pid) = self.parent_pid {
            vars.push((ENV_PARENT_PID, pid.to_string()));
        }
        vars
    }

    /// Read the manifest through an arbitrary variable lookup.
    ///
    /// Returns `None` when `LISTEN_FDS` is absent or `0`. Anything other than
    /// exactly one descriptor named [`LISTENER_NAME`] is rejected: a
    /// half-described hand-off is a predecessor bug.
    pub fn from_lookup<F>(lookup: F) -> Result<Option<Self>, InheritError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen_fds = match lookup(ENV_LISTEN_FDS) {
            None => return Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<usize>()
                .map_err(|_| InheritError::Manifest(format!("{ENV_LISTEN_FDS}={raw:?} is not a number")))?,
        };

        if listen_fds == 0 {
            return Ok(None);
        }
        if listen_fds != 1 {
            return Err(InheritError::Manifest(format!(
                "{ENV_LISTEN_FDS} says {listen_fds} descriptors, expected exactly 1"
            )));
        }

        let name = lookup(ENV_LISTEN_FD_NAMES).unwrap_or_else(|| LISTENER_NAME.to_string());
        if name != LISTENER_NAME {
            return Err(InheritError::Manifest(format!(
                "inherited descriptor is named {name:?}, expected {LISTENER_NAME:?}"
            )));
        }

        let generation = match lookup(ENV_GENERATION) {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|_| InheritError::Manifest(format!("{ENV_GENERATION}={raw:?} is not a number")))?,
            None => 1,
        };

        let parent_pid = match lookup(ENV_PARENT_PID) {
            Some(raw) => Some(
                raw.trim()
                    .parse()
                    .map_err(|_| InheritError::Manifest(format!("{ENV_PARENT_PID}={raw:?} is not a pid")))?,
            ),
            None => None,
        };

        Ok(Some(Self {
            fd: INHERITED_LISTENER_FD,
            name,
            generation,
            parent_pid,
        }))
    }
}
