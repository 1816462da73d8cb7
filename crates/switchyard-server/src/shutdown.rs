//! Shutdown coordination.
//!
//! [`ShutdownSignal`] is the cancellation input of
//! [`Server::start_and_wait`](crate::Server::start_and_wait); the server also
//! keeps a private one to stop its accept loop and connections once draining
//! is over. [`InFlight`] counts executing requests so the final stage of
//! shutdown can wait for them.
//!
//! # Example
//!
//! ```rust,ignore
//! use switchyard_server::ShutdownSignal;
//! use std::time::Duration;
//!
//! let shutdown = ShutdownSignal::with_os_signals();
//!
//! tokio::select! {
//!     () = shutdown.recv() => println!("Shutdown signal received"),
//!     () = tokio::time::sleep(Duration::from_secs(60)) => println!("Timeout"),
//! }
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// A clonable, one-shot cancellation signal.
///
/// All clones observe the same state.
///
/// # Example
///
/// ```rust
/// use switchyard_server::ShutdownSignal;
///
/// let shutdown = ShutdownSignal::new();
/// let observer = shutdown.clone();
///
/// shutdown.trigger();
/// assert!(observer.is_shutdown());
/// ```
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<SignalState>,
}

#[derive(Debug, Default)]
struct SignalState {
    triggered: AtomicBool,
    notify: Notify,
}

impl ShutdownSignal {
    /// Creates a signal that has not fired.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the signal, waking every pending [`recv`](Self::recv).
    ///
    /// Idempotent.
    pub fn trigger(&self) {
        if !self.inner.triggered.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    /// Returns `true` once [`trigger`](Self::trigger) has been called.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// Completes when the signal fires; immediately if it already has.
    pub async fn recv(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent trigger is not lost.
        notified.as_mut().enable();

        if self.is_shutdown() {
            return;
        }

        notified.await;
    }

    /// Creates a signal that fires on SIGTERM or SIGINT (Ctrl+C elsewhere).
    ///
    /// Must be called from within a Tokio runtime. If the handlers cannot be
    /// installed the failure is logged and the signal only fires through
    /// [`trigger`](Self::trigger).
    #[must_use]
    pub fn with_os_signals() -> Self {
        let signal = Self::new();
        let trigger = signal.clone();

        tokio::spawn(async move {
            match wait_for_os_signal().await {
                Ok(name) => {
                    tracing::info!(signal = name, "Received shutdown signal, draining");
                    trigger.trigger();
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to install OS signal handlers");
                }
            }
        });

        signal
    }
}

#[cfg(unix)]
async fn wait_for_os_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => Ok("SIGTERM"),
        _ = sigint.recv() => Ok("SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_os_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("Ctrl+C")
}

/// Counter of requests currently executing.
///
/// Each request holds an [`InFlightGuard`] from dispatch until its response
/// body is finished or dropped, including when the handler panics.
///
/// # Example
///
/// ```rust
/// use switchyard_server::InFlight;
///
/// let in_flight = InFlight::new();
///
/// let guard = in_flight.acquire();
/// assert_eq!(in_flight.count(), 1);
///
/// drop(guard);
/// assert_eq!(in_flight.count(), 0);
/// ```
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    inner: Arc<InFlightState>,
}

#[derive(Debug, Default)]
struct InFlightState {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    /// Creates a counter at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one executing request.
    #[must_use]
    pub fn acquire(&self) -> InFlightGuard {
        self.inner.count.fetch_add(1, Ordering::SeqCst);
        switchyard_telemetry::metrics::increment_in_flight();
        InFlightGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Number of requests currently executing.
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.count.load(Ordering::SeqCst)
    }

    /// Completes once no request is executing.
    pub async fn wait_for_zero(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.count() == 0 {
                return;
            }

            notified.await;
        }
    }
}

/// Marks one executing request; released on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    inner: Arc<InFlightState>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        switchyard_telemetry::metrics::decrement_in_flight();
        if self.inner.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}
