//! Cancellation threaded through every network call.
//!
//! A `watch` channel carries the shutdown flag. Long-running loops check it at
//! iteration boundaries and network calls race against it through [`deadline`].

use std::future::Future;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;

use crate::error::{AppError, AppResult, SubmissionError};

#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

pub fn channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, ShutdownSignal { rx })
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal { rx: self.tx.subscribe() }
    }
}

impl ShutdownSignal {
    /// Signal that never fires.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // the receiver keeps reporting `false` once the sender is gone
        drop(tx);
        Self { rx }
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is requested. Pends forever if the trigger is
    /// dropped without firing.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Sleeps for `duration`; returns false if interrupted by shutdown.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.cancelled() => false,
        }
    }
}

/// Runs `call` under a timeout, aborting early on shutdown.
pub async fn deadline<T, F>(shutdown: &ShutdownSignal, timeout: Duration, call: F) -> AppResult<T>
where
    F: Future<Output = AppResult<T>>,
{
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => Err(AppError::Cancelled),
        result = tokio::time::timeout(timeout, call) => match result {
            Ok(inner) => inner,
            Err(_) => Err(SubmissionError::Timeout(timeout.as_millis() as u64).into()),
        },
    }
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
pub async fn os_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
