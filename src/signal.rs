//! Signal handling and cancellation.
//!
//! SIGINT and SIGTERM cancel a [`ShutdownToken`]; SIGHUP asks the daemon for
//! an immediate cycle through its trigger.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tracing::{info, warn};

/// A token that can be shared across tasks to request and observe shutdown.
#[derive(Clone, Default)]
pub struct ShutdownToken {
    inner: Arc<TokenInner>,
}

#[derive(Default)]
struct TokenInner {
    flag: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if shutdown has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Request cancellation; wakes every task waiting in [`cancelled`](Self::cancelled).
    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before checking the flag so a concurrent cancel is not lost
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Spawn the signal listener for the daemon.
///
/// If a handler cannot be registered (restricted environments), that signal is
/// just not handled.
pub fn install_signal_handlers(token: ShutdownToken, trigger: Arc<Notify>) {
    tokio::spawn(async move {
        let mut sigint = register(SignalKind::interrupt(), "SIGINT");
        let mut sigterm = register(SignalKind::terminate(), "SIGTERM");
        let mut sighup = register(SignalKind::hangup(), "SIGHUP");

        loop {
            tokio::select! {
                Some(_) = recv(&mut sigint) => {
                    info!("Received SIGINT, initiating graceful shutdown...");
                    token.cancel();
                    return;
                }
                Some(_) = recv(&mut sigterm) => {
                    info!("Received SIGTERM, initiating graceful shutdown...");
                    token.cancel();
                    return;
                }
                Some(_) = recv(&mut sighup) => {
                    info!("Received SIGHUP, requesting an immediate sync");
                    trigger.notify_one();
                }
                _ = token.cancelled() => return,
            }
        }
    });
}

fn register(kind: SignalKind, name: &str) -> Option<tokio::signal::unix::Signal> {
    match signal(kind) {
        Ok(s) => Some(s),
        Err(e) => {
            warn!("Failed to register {} handler: {}", name, e);
            None
        }
    }
}

async fn recv(signal: &mut Option<tokio::signal::unix::Signal>) -> Option<()> {
    match signal {
        Some(s) => s.recv().await,
        None => std::future::pending().await,
    }
}
