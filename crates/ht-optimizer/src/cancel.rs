//! Turns operator termination signals into cooperative cancellation.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Termination-intent signals the controller listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationSignal {
    Interrupt,
    Terminate,
    Quit,
}

impl std::fmt::Display for TerminationSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Interrupt => "SIGINT",
            Self::Terminate => "SIGTERM",
            Self::Quit => "SIGQUIT",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct Shared {
    token: CancellationToken,
    cause: Mutex<Option<TerminationSignal>>,
}

impl Shared {
    fn fire(&self, signal: TerminationSignal) -> bool {
        {
            let mut cause = self.cause.lock();
            if let Some(first) = *cause {
                debug!(%signal, %first, "already cancelling; ignoring signal");
                return false;
            }
            *cause = Some(signal);
        }
        self.token.cancel();
        warn!(%signal, "caught termination signal; cancelling trials");
        true
    }
}

/// Owns the signal listener for one run.
///
/// The first signal cancels the shared token and is remembered as the cause.
/// Later signals change nothing. The controller never kills workers itself;
/// the token does the unwinding.
#[derive(Debug)]
pub struct CancellationController {
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    listener: Option<JoinHandle<()>>,
}

impl CancellationController {
    /// Start listening for SIGINT, SIGTERM and SIGQUIT (Ctrl-C elsewhere).
    ///
    /// Must be called from inside a tokio runtime.
    pub fn install(token: CancellationToken) -> std::io::Result<Self> {
        let mut controller = Self::detached(token);
        let signals = Signals::register()?;
        let shared = Arc::clone(&controller.shared);
        let shutdown = controller.shutdown.clone();

        controller.listener = Some(tokio::spawn(async move {
            let received = tokio::select! {
                _ = shutdown.cancelled() => None,
                _ = shared.token.cancelled() => None,
                signal = signals.next() => signal,
            };
            if let Some(signal) = received {
                shared.fire(signal);
            }
            debug!("signal listener stopped");
        }));

        Ok(controller)
    }

    /// A controller with no OS listener; only [`Self::trigger`] fires it.
    pub fn detached(token: CancellationToken) -> Self {
        Self {
            shared: Arc::new(Shared {
                token,
                cause: Mutex::new(None),
            }),
            shutdown: CancellationToken::new(),
            listener: None,
        }
    }

    /// Fire cancellation as if `signal` had been delivered.
    ///
    /// Returns `true` only for the call that actually fired.
    pub fn trigger(&self, signal: TerminationSignal) -> bool {
        self.shared.fire(signal)
    }

    /// The signal that caused cancellation, if any.
    pub fn cause(&self) -> Option<TerminationSignal> {
        *self.shared.cause.lock()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.shared.token
    }

    pub fn is_listening(&self) -> bool {
        self.listener.as_ref().is_some_and(|l| !l.is_finished())
    }

    /// Stop listening and wait for the listener task to exit.
    pub async fn close(mut self) {
        self.shutdown.cancel();
        if let Some(listener) = self.listener.take() {
            if let Err(e) = listener.await {
                warn!(error = %e, "signal listener task failed");
            }
        }
    }
}

impl Drop for CancellationController {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(unix)]
struct Signals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
    quit: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn register() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            quit: signal(SignalKind::quit())?,
        })
    }

    async fn next(mut self) -> Option<TerminationSignal> {
        tokio::select! {
            Some(()) = self.interrupt.recv() => Some(TerminationSignal::Interrupt),
            Some(()) = self.terminate.recv() => Some(TerminationSignal::Terminate),
            Some(()) = self.quit.recv() => Some(TerminationSignal::Quit),
            else => None,
        }
    }
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn register() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn next(self) -> Option<TerminationSignal> {
        tokio::signal::ctrl_c()
            .await
            .ok()
            .map(|()| TerminationSignal::Interrupt)
    }
}
