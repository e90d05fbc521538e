//! Graceful shutdown for the kulku daemon
//!
//! One `ShutdownController` fans a stop request out to every long-running
//! task: workers drain the queue, the canary scheduler and the resync timer
//! stop, the HTTP server finishes in-flight requests and the store flushes.

use tokio::sync::watch;
use tracing::info;

/// Cloneable handle a task waits on
#[derive(Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Resolve once shutdown was requested
    pub async fn wait(&mut self) {
        // A dropped controller counts as shutdown
        let _ = self.receiver.wait_for(|stopped| *stopped).await;
    }

    /// Owned variant for APIs that take a `'static` future, such as
    /// axum's graceful shutdown
    pub async fn stopped(mut self) {
        self.wait().await
    }

    pub fn is_shutdown(&self) -> bool {
        *self.receiver.borrow()
    }
}

pub struct ShutdownController {
    sender: watch::Sender<bool>,
}

impl ShutdownController {
    pub fn shutdown(&self) {
        if self.sender.send_replace(true) {
            return;
        }
        info!("Shutdown requested");
    }

    /// Another signal tied to this controller
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            receiver: self.sender.subscribe(),
        }
    }
}

pub fn shutdown_channel() -> (ShutdownController, ShutdownSignal) {
    let (sender, receiver) = watch::channel(false);
    (ShutdownController { sender }, ShutdownSignal { receiver })
}

/// Wait for SIGTERM or SIGINT and return the signal's name
///
/// Fails when the handlers cannot be registered.
#[cfg(unix)]
pub async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let name = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    info!(signal = name, "Received termination signal");
    Ok(name)
}

#[cfg(not(unix))]
pub async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    info!(signal = "CTRL_C", "Received termination signal");
    Ok("CTRL_C")
}
