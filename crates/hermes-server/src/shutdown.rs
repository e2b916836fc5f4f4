//! Shutdown coordination.
//!
//! [`ShutdownSignal`] tells the accept loop and every receive loop to stop;
//! [`ConnectionTracker`] lets `stop` wait for the spawned connection tasks to
//! finish their cleanup.
//!
//! # Example
//!
//! ```rust,ignore
//! use hermes_server::ShutdownSignal;
//! use std::time::Duration;
//!
//! let shutdown = ShutdownSignal::new();
//! tokio::select! {
//!     _ = shutdown.recv() => println!("Shutdown signal received"),
//!     _ = tokio::time::sleep(Duration::from_secs(60)) => println!("Timeout"),
//! }
//! ```

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::future::BoxFuture;
use tokio::sync::{watch, Notify};

/// A one-way latch that stops the server's tasks.
///
/// Clones share the same latch; triggering any clone wakes every waiter,
/// including waiters created after the trigger.
///
/// # Example
///
/// ```rust
/// use hermes_server::ShutdownSignal;
///
/// let shutdown = ShutdownSignal::new();
/// let shutdown_clone = shutdown.clone();
///
/// shutdown.trigger();
/// assert!(shutdown_clone.is_shutdown());
/// ```
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    latch: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    /// Creates a new, untriggered signal.
    #[must_use]
    pub fn new() -> Self {
        let (latch, _) = watch::channel(false);
        Self {
            latch: Arc::new(latch),
        }
    }

    /// Triggers the signal. Idempotent.
    pub fn trigger(&self) {
        let flipped = self.latch.send_if_modified(|triggered| {
            let was = *triggered;
            *triggered = true;
            !was
        });
        if flipped {
            tracing::debug!("Shutdown triggered");
        }
    }

    /// Returns `true` if shutdown has been triggered.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        *self.latch.borrow()
    }

    /// Returns a future that completes once the signal is triggered.
    ///
    /// The future subscribes immediately, so a trigger that happens before
    /// the first poll is not missed. Completes at once if already triggered.
    pub fn recv(&self) -> ShutdownReceiver {
        let mut latch = self.latch.subscribe();
        ShutdownReceiver {
            wait: Box::pin(async move {
                // The sender outlives every receiver it hands out.
                let _ = latch.wait_for(|triggered| *triggered).await;
            }),
        }
    }

    /// Creates a signal that also triggers on SIGTERM or SIGINT (Ctrl+C).
    #[must_use]
    pub fn with_os_signals() -> Self {
        let signal = Self::new();
        let signal_clone = signal.clone();

        tokio::spawn(async move {
            wait_for_os_signal().await;
            signal_clone.trigger();
        });

        signal
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// A future that completes when the shutdown signal is triggered.
///
/// Created by [`ShutdownSignal::recv()`]. It is `Unpin`, so it can be polled
/// by reference across loop iterations in `tokio::select!`.
pub struct ShutdownReceiver {
    wait: BoxFuture<'static, ()>,
}

impl fmt::Debug for ShutdownReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownReceiver").finish_non_exhaustive()
    }
}

impl Future for ShutdownReceiver {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.wait.as_mut().poll(cx)
    }
}

/// Waits for SIGTERM or SIGINT on Unix, Ctrl+C elsewhere.
///
/// If a handler cannot be registered the failure is logged and this never
/// completes, leaving shutdown to the other triggers.
pub async fn wait_for_os_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    tracing::error!(error = %e, "Failed to register signal handlers");
                    return std::future::pending().await;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to wait for Ctrl+C");
            return std::future::pending().await;
        }
        tracing::info!("Received Ctrl+C, initiating graceful shutdown");
    }
}

/// Counts live connection tasks so shutdown can wait for them.
///
/// # Example
///
/// ```rust
/// use hermes_server::shutdown::ConnectionTracker;
///
/// let tracker = ConnectionTracker::new();
/// let token = tracker.acquire();
/// assert_eq!(tracker.active_connections(), 1);
///
/// drop(token);
/// assert_eq!(tracker.active_connections(), 0);
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    active: Arc<AtomicUsize>,
    notify: Arc<Notify>,
}

impl ConnectionTracker {
    /// Creates a new connection tracker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            active: Arc::new(AtomicUsize::new(0)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Acquires a token to hold for the lifetime of a task.
    #[must_use]
    pub fn acquire(&self) -> ConnectionToken {
        self.active.fetch_add(1, Ordering::SeqCst);
        ConnectionToken {
            active: Arc::clone(&self.active),
            notify: Arc::clone(&self.notify),
        }
    }

    /// Returns the number of live tokens.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Waits until every token has been dropped.
    ///
    /// Completes immediately if none are live.
    pub async fn wait_for_shutdown(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a drop in between is not missed.
            notified.as_mut().enable();

            if self.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// A live connection task. Dropping it releases the slot.
#[derive(Debug)]
pub struct ConnectionToken {
    active: Arc<AtomicUsize>,
    notify: Arc<Notify>,
}

impl Drop for ConnectionToken {
    fn drop(&mut self) {
        if self.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.notify.notify_waiters();
        }
    }
}
