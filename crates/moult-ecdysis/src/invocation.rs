//! Process invocation: the command line a process was started with, and the
//! role it implies.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::PathBuf;

/// Marker appended to a successor's arguments.
pub const RESTART_MARKER: &str = "-continue";

/// Long-form spelling of the marker, also accepted on input.
const RESTART_MARKER_LONG: &str = "--continue";

/// Whether this process bound its own listener or inherited one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    /// Started without the restart marker: binds a fresh listener.
    Original,
    /// Started by a predecessor: adopts the listener at the inherited slot.
    Successor,
}

impl ProcessRole {
    pub fn is_successor(&self) -> bool {
        matches!(self, ProcessRole::Successor)
    }
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessRole::Original => write!(f, "original"),
            ProcessRole::Successor => write!(f, "successor"),
        }
    }
}

/// The executable path and arguments of the current process.
///
/// The program is kept as `argv[0]` rather than the resolved executable so
/// that a binary replaced on disk is picked up by the next generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    program: PathBuf,
    args: Vec<OsString>,
}

impl Invocation {
    pub fn new<P, I, A>(program: P, args: I) -> Self
    where
        P: Into<PathBuf>,
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Capture the invocation of the running process.
    pub fn from_env() -> Self {
        let mut argv = std::env::args_os();
        let program = argv.next().unwrap_or_default();
        Self::new(program, argv)
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    /// Role is fixed by the presence of the restart marker.
    pub fn role(&self) -> ProcessRole {
        if self.args.iter().any(|a| is_marker(a)) {
            ProcessRole::Successor
        } else {
            ProcessRole::Original
        }
    }

    /// Arguments with every restart marker removed.
    pub fn args_without_marker(&self) -> Vec<OsString> {
        self.args.iter().filter(|a| !is_marker(a)).cloned().collect()
    }

    /// `argv[0]` followed by the marker-free arguments, ready for a CLI parser.
    pub fn argv_without_marker(&self) -> Vec<OsString> {
        std::iter::once(self.program.clone().into_os_string())
            .chain(self.args_without_marker())
            .collect()
    }

    /// Arguments for the next generation: marker-free, plus exactly one marker.
    pub fn successor_args(&self) -> Vec<OsString> {
        let mut args = self.args_without_marker();
        args.push(OsString::from(RESTART_MARKER));
        args
    }

    /// The invocation a successor spawned from this one will observe.
    pub fn successor(&self) -> Self {
        Self {
            program: self.program.clone(),
            args: self.successor_args(),
        }
    }
}

fn is_marker(arg: &OsStr) -> bool {
    arg == RESTART_MARKER || arg == RESTART_MARKER_LONG
}
