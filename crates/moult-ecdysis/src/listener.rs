//! Listener acquisition: fresh bind for an original process, fd adoption for
//! a successor.
//!
//! A successor never binds. It validates the inherited slot with `fstat`,
//! adopts it, and then tells its predecessor to stand down with `SIGTSTP`.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, RawFd};

use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::invocation::ProcessRole;
use crate::manifest::InheritManifest;

/// Errors from descriptor inheritance.
#[derive(Debug, Error)]
pub enum InheritError {
    #[error("inherited fd {fd} is not open")]
    Missing { fd: RawFd },

    #[error("inherited fd {fd} is not a socket")]
    NotASocket { fd: RawFd },

    #[error("inherited fd {fd} is not a listening TCP socket")]
    NotListening { fd: RawFd },

    #[error("invalid inherit manifest: {0}")]
    Manifest(String),

    #[error("failed to adopt inherited fd {fd}: {source}")]
    Adopt {
        fd: RawFd,
        #[source]
        source: io::Error,
    },
}

/// Errors from [`acquire`]. Both are fatal to startup.
#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Inherit(#[from] InheritError),
}

/// Failure to deliver the hand-off signal to the predecessor.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("refusing to signal pid {0}")]
    InvalidPid(i32),

    #[error("failed to signal pid {pid}: {source}")]
    Kill {
        pid: i32,
        #[source]
        source: io::Error,
    },
}

/// The process's listening socket.
#[derive(Debug)]
pub struct ListenerHandle {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl ListenerHandle {
    fn new(listener: TcpListener) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;
        Ok(Self { listener, local_addr })
    }

    /// Bind a new listener.
    pub async fn bind(addr: SocketAddr) -> Result<Self, AcquireError> {
        let bound = TcpListener::bind(addr)
            .await
            .and_then(Self::new)
            .map_err(|source| AcquireError::Bind { addr, source })?;
        info!(addr = %bound.local_addr, "Bound listener");
        Ok(bound)
    }

    /// Adopt an inherited listening socket.
    ///
    /// The descriptor must be an open stream socket in the listening state;
    /// ownership passes to the returned handle.
    pub fn inherit(fd: RawFd) -> Result<Self, InheritError> {
        validate_fd(fd)?;

        // SAFETY: validate_fd confirmed an open listening socket; nothing else in this
        // process owns the inherited slot.
        let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
        let adopt = |source| InheritError::Adopt { fd, source };

        std_listener.set_nonblocking(true).map_err(adopt)?;
        let listener = TcpListener::from_std(std_listener).map_err(adopt)?;
        let handle = Self::new(listener).map_err(adopt)?;

        info!(fd, addr = %handle.local_addr, "Inherited listener from parent process");
        Ok(handle)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn as_tcp(&self) -> &TcpListener {
        &self.listener
    }

    /// Close the listener, reporting the `close(2)` result.
    pub fn close(self) -> io::Result<()> {
        let fd = self.listener.into_std()?.into_raw_fd();
        // SAFETY: fd was just released from the std listener and is owned here.
        if unsafe { libc::close(fd) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

impl AsFd for ListenerHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.listener.as_fd()
    }
}

impl AsRawFd for ListenerHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }
}

/// Obtain the listener for `role`.
///
/// An original process binds `addr`. A successor adopts the descriptor named
/// in `manifest`, then signals the predecessor recorded there (or its parent)
/// exactly once. The signal is sent as soon as the listener is adopted; the
/// successor has not yet served a request at that point.
pub async fn acquire(
    addr: SocketAddr,
    role: ProcessRole,
    manifest: &InheritManifest,
) -> Result<ListenerHandle, AcquireError> {
    match role {
        ProcessRole::Original => ListenerHandle::bind(addr).await.inspect_err(|e| {
            error!(error = %e, "Failed to bind listener");
        }),
        ProcessRole::Successor => {
            let handle = ListenerHandle::inherit(manifest.fd).inspect_err(|e| {
                error!(fd = manifest.fd, error = %e, "Failed to inherit listener");
            })?;

            if handle.local_addr() != addr {
                warn!(
                    configured = %addr,
                    inherited = %handle.local_addr(),
                    "Inherited listener address differs from configured address"
                );
            }

            let parent = predecessor_pid(manifest);
            match signal_predecessor(parent) {
                Ok(()) => info!(pid = parent, "Sent SIGTSTP to predecessor"),
                Err(e) => warn!(error = %e, "Could not signal predecessor; it keeps serving"),
            }

            Ok(handle)
        }
    }
}

/// Pid to hand off to: the recorded predecessor, else the live parent.
fn predecessor_pid(manifest: &InheritManifest) -> i32 {
    // SAFETY: getppid has no preconditions.
    let ppid = unsafe { libc::getppid() };
    match manifest.parent_pid {
        Some(recorded) => {
            if recorded != ppid {
                warn!(recorded, ppid, "Recorded predecessor is no longer our parent");
            }
            recorded
        }
        None => ppid,
    }
}

/// Send the suspend-request (`SIGTSTP`) that retires a predecessor.
pub fn signal_predecessor(pid: i32) -> Result<(), NotifyError> {
    // pid 1 would be init after reparenting; 0 and negatives address groups.
    if pid <= 1 {
        return Err(NotifyError::InvalidPid(pid));
    }
    // SAFETY: kill has no memory-safety preconditions.
    if unsafe { libc::kill(pid, libc::SIGTSTP) } == 0 {
        Ok(())
    } else {
        Err(NotifyError::Kill {
            pid,
            source: io::Error::last_os_error(),
        })
    }
}

/// Validate that a file descriptor is an open, listening stream socket.
fn validate_fd(fd: RawFd) -> Result<(), InheritError> {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    // SAFETY: stat is a valid, writable libc::stat.
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        return Err(InheritError::Missing { fd });
    }
    if (stat.st_mode & libc::S_IFMT) != libc::S_IFSOCK {
        return Err(InheritError::NotASocket { fd });
    }

    let adopt = |source| InheritError::Adopt { fd, source };
    let sock_type = socket_option(fd, libc::SO_TYPE).map_err(adopt)?;
    let accepting = socket_option(fd, libc::SO_ACCEPTCONN).map_err(adopt)?;
    if sock_type != libc::SOCK_STREAM || accepting == 0 {
        return Err(InheritError::NotListening { fd });
    }
    Ok(())
}

fn socket_option(fd: RawFd, option: libc::c_int) -> io::Result<libc::c_int> {
    let mut value: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: value and len describe a writable c_int buffer.
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            option,
            (&mut value as *mut libc::c_int).cast::<libc::c_void>(),
            &mut len,
        )
    };
    if rc == 0 {
        Ok(value)
    } else {
        Err(io::Error::last_os_error())
    }
}
