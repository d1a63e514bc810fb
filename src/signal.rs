//! Reader interruption
//!
//! A [`SignalToken`] stands in for "a signal is pending on the reading
//! thread". Blocking waits select on [`SignalToken::receiver`] next to
//! whatever they are waiting for; raising the token disconnects that
//! channel, which wakes every waiter at once and stays observable until the
//! token is dropped. Busy and cooperative waits never look at it.

use crossbeam::channel::{self, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

#[derive(Debug)]
struct Inner {
    raised: AtomicBool,
    sender: Mutex<Option<Sender<()>>>,
    receiver: Receiver<()>,
}

/// Cloneable "signal pending" flag that blocking waits can select on
///
/// # Example
/// ```
/// use jitprobe::signal::SignalToken;
///
/// let token = SignalToken::new();
/// let raiser = token.clone();
/// assert!(!token.is_pending());
/// raiser.raise();
/// assert!(token.is_pending());
/// assert!(token.receiver().recv().is_err());
/// ```
#[derive(Debug, Clone)]
pub struct SignalToken {
    inner: Arc<Inner>,
}

impl Default for SignalToken {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalToken {
    /// Create a token with no signal pending
    pub fn new() -> Self {
        let (sender, receiver) = channel::bounded(0);
        Self {
            inner: Arc::new(Inner {
                raised: AtomicBool::new(false),
                sender: Mutex::new(Some(sender)),
                receiver,
            }),
        }
    }

    /// Mark a signal as pending and wake every blocked waiter
    pub fn raise(&self) {
        self.inner.raised.store(true, Ordering::SeqCst);
        let sender = self
            .inner
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if sender.is_some() {
            tracing::debug!("signal raised, waking blocked readers");
        }
    }

    /// Whether a signal has been raised
    pub fn is_pending(&self) -> bool {
        self.inner.raised.load(Ordering::SeqCst)
    }

    /// Channel that becomes ready (disconnected) once the token is raised
    pub fn receiver(&self) -> &Receiver<()> {
        &self.inner.receiver
    }
}

/// Route SIGINT and SIGTERM to `token`
///
/// Blocks both signals on the calling thread, so it must run before any other
/// thread is spawned; every later thread inherits the mask. A watcher thread
/// then reads them from a signalfd and raises the token.
pub fn forward_signals(token: SignalToken) -> std::io::Result<JoinHandle<()>> {
    use nix::sys::signal::{SigSet, Signal};
    use nix::sys::signalfd::SignalFd;

    let mut mask = SigSet::empty();
    mask.add(Signal::SIGINT);
    mask.add(Signal::SIGTERM);
    mask.thread_block()?;

    let fd = SignalFd::new(&mask)?;
    let handle = std::thread::Builder::new()
        .name("jit-signals".to_string())
        .spawn(move || loop {
            match fd.read_signal() {
                Ok(Some(info)) => {
                    tracing::debug!(signo = info.ssi_signo, "signal received");
                    token.raise();
                }
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!("signalfd read failed: {}", err);
                    break;
                }
            }
        })?;
    Ok(handle)
}
