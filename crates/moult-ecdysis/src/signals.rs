//! Process-control signals.
//!
//! OS signals are forwarded into one unbounded, ordered channel; a single
//! [`SignalRouter`] drains it and dispatches each signal to completion before
//! looking at the next.

use std::fmt;
use std::io;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info};

/// A signal as seen by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// `SIGHUP`
    Hangup,
    /// `SIGUSR1`
    User1,
    /// `SIGUSR2`
    User2,
    /// `SIGTSTP`
    TerminalStop,
    /// Anything else, by raw number.
    Other(i32),
}

/// What to do about a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    Restart,
    ReportOnly,
    Terminate,
    Ignore,
}

impl ControlSignal {
    pub fn from_raw(signum: i32) -> Self {
        match signum {
            libc::SIGHUP => ControlSignal::Hangup,
            libc::SIGUSR1 => ControlSignal::User1,
            libc::SIGUSR2 => ControlSignal::User2,
            libc::SIGTSTP => ControlSignal::TerminalStop,
            other => ControlSignal::Other(other),
        }
    }

    pub fn as_raw(&self) -> i32 {
        match self {
            ControlSignal::Hangup => libc::SIGHUP,
            ControlSignal::User1 => libc::SIGUSR1,
            ControlSignal::User2 => libc::SIGUSR2,
            ControlSignal::TerminalStop => libc::SIGTSTP,
            ControlSignal::Other(signum) => *signum,
        }
    }

    pub fn action(&self) -> SignalAction {
        match self {
            ControlSignal::Hangup => SignalAction::Restart,
            ControlSignal::User1 | ControlSignal::User2 => SignalAction::ReportOnly,
            ControlSignal::TerminalStop => SignalAction::Terminate,
            ControlSignal::Other(_) => SignalAction::Ignore,
        }
    }
}

impl fmt::Display for ControlSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlSignal::Hangup => write!(f, "SIGHUP"),
            ControlSignal::User1 => write!(f, "SIGUSR1"),
            ControlSignal::User2 => write!(f, "SIGUSR2"),
            ControlSignal::TerminalStop => write!(f, "SIGTSTP"),
            ControlSignal::Other(signum) => write!(f, "signal {signum}"),
        }
    }
}

/// Forwards the hookable OS signals into a channel.
pub struct SignalSource;

impl SignalSource {
    /// Register handlers for `SIGHUP`, `SIGUSR1`, `SIGUSR2` and `SIGTSTP`.
    ///
    /// Registration happens before this returns, so the default dispositions
    /// (terminate, stop) no longer apply once it succeeds. Must be called
    /// within a tokio runtime.
    pub fn install() -> io::Result<UnboundedReceiver<ControlSignal>> {
        let (tx, rx) = mpsc::unbounded_channel();
        Self::install_into(tx)?;
        Ok(rx)
    }

    /// Like [`SignalSource::install`], forwarding into an existing channel.
    pub fn install_into(tx: UnboundedSender<ControlSignal>) -> io::Result<()> {
        let mut sighup = signal(SignalKind::hangup())?;
        let mut sigusr1 = signal(SignalKind::user_defined1())?;
        let mut sigusr2 = signal(SignalKind::user_defined2())?;
        let mut sigtstp = signal(SignalKind::from_raw(libc::SIGTSTP))?;

        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    Some(()) = sighup.recv() => ControlSignal::Hangup,
                    Some(()) = sigusr1.recv() => ControlSignal::User1,
                    Some(()) = sigusr2.recv() => ControlSignal::User2,
                    Some(()) = sigtstp.recv() => ControlSignal::TerminalStop,
                    else => break,
                };
                if tx.send(received).is_err() {
                    // Router gone
                    break;
                }
            }
            debug!("Signal forwarder stopped");
        });

        Ok(())
    }
}

/// Receives the actions the router dispatches.
pub trait SignalHandler {
    fn restart(&mut self);
    fn report(&mut self, signal: ControlSignal);
    fn terminate(&mut self);
}

/// Single consumer of control signals.
pub struct SignalRouter {
    rx: UnboundedReceiver<ControlSignal>,
    pid: u32,
}

impl SignalRouter {
    pub fn new(rx: UnboundedReceiver<ControlSignal>) -> Self {
        Self {
            rx,
            pid: std::process::id(),
        }
    }

    /// Dispatch signals in arrival order until one maps to
    /// [`SignalAction::Terminate`].
    ///
    /// Returns the terminating signal, or `None` if every sender is gone.
    /// Nothing queued behind the terminating signal is processed.
    pub async fn run<H: SignalHandler>(&mut self, handler: &mut H) -> Option<ControlSignal> {
        while let Some(received) = self.rx.recv().await {
            let action = received.action();
            info!(pid = self.pid, signal = %received, ?action, "Received signal");
            match action {
                SignalAction::Restart => handler.restart(),
                SignalAction::ReportOnly => handler.report(received),
                SignalAction::Terminate => {
                    handler.terminate();
                    return Some(received);
                }
                SignalAction::Ignore => {
                    debug!(pid = self.pid, signal = %received, "Nothing to do for signal");
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        calls: Vec<&'static str>,
    }

    impl SignalHandler for Recorder {
        fn restart(&mut self) {
            self.calls.push("restart");
        }

        fn report(&mut self, signal: ControlSignal) {
            self.calls.push(match signal {
                ControlSignal::User1 => "report-1",
                _ => "report-2",
            });
        }

        fn terminate(&mut self) {
            self.calls.push("terminate");
        }
    }

    #[test]
    fn test_action_mapping() {
        assert_eq!(ControlSignal::from_raw(libc::SIGHUP).action(), SignalAction::Restart);
        assert_eq!(ControlSignal::from_raw(libc::SIGUSR1).action(), SignalAction::ReportOnly);
        assert_eq!(ControlSignal::from_raw(libc::SIGUSR2).action(), SignalAction::ReportOnly);
        assert_eq!(ControlSignal::from_raw(libc::SIGTSTP).action(), SignalAction::Terminate);
        assert_eq!(ControlSignal::from_raw(libc::SIGINT).action(), SignalAction::Ignore);
        assert_eq!(ControlSignal::from_raw(libc::SIGTERM).action(), SignalAction::Ignore);
    }

    #[test]
    fn test_raw_round_trip() {
        for signum in [libc::SIGHUP, libc::SIGUSR1, libc::SIGUSR2, libc::SIGTSTP, libc::SIGWINCH] {
            assert_eq!(ControlSignal::from_raw(signum).as_raw(), signum);
        }
    }

    #[tokio::test]
    async fn test_dispatch_in_order_and_stop_at_terminate() {
        let (tx, rx) = mpsc::unbounded_channel();
        for sig in [
            ControlSignal::Hangup,
            ControlSignal::User1,
            ControlSignal::Other(libc::SIGWINCH),
            ControlSignal::User2,
            ControlSignal::TerminalStop,
            ControlSignal::Hangup,
        ] {
            tx.send(sig).unwrap();
        }

        let mut router = SignalRouter::new(rx);
        let mut recorder = Recorder::default();
        let stopped_by = router.run(&mut recorder).await;

        assert_eq!(stopped_by, Some(ControlSignal::TerminalStop));
        assert_eq!(recorder.calls, vec!["restart", "report-1", "report-2", "terminate"]);
    }

    #[tokio::test]
    async fn test_closed_channel_ends_router() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(ControlSignal::Hangup).unwrap();
        drop(tx);

        let mut recorder = Recorder::default();
        assert_eq!(SignalRouter::new(rx).run(&mut recorder).await, None);
        assert_eq!(recorder.calls, vec!["restart"]);
    }

    #[tokio::test]
    async fn test_os_signal_is_forwarded() {
        let mut rx = SignalSource::install().unwrap();
        unsafe {
            libc::kill(libc::getpid(), libc::SIGUSR2);
        }
        let received = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert_eq!(received, Some(ControlSignal::User2));
    }
}
