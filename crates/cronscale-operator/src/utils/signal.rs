use snafu::{ResultExt, Snafu};
use tokio::{
    signal::unix::{SignalKind, signal},
    sync::watch,
};
use tracing::info;

#[derive(Debug, Snafu)]
#[snafu(display("failed to construct signal watcher"))]
pub struct SignalError {
    source: std::io::Error,
}

/// Watches for shutdown signals and multiplies them by sending them to all acquired handles.
#[derive(Clone, Debug)]
pub struct SignalWatcher {
    watch_rx: watch::Receiver<bool>,
}

impl SignalWatcher {
    /// Watches `SIGTERM` and `SIGINT` (Ctrl-C).
    pub fn shutdown() -> Result<Self, SignalError> {
        let mut sigterm = signal(SignalKind::terminate()).context(SignalSnafu)?;
        let mut sigint = signal(SignalKind::interrupt()).context(SignalSnafu)?;
        let (watch_tx, watch_rx) = watch::channel(false);

        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
                _ = sigint.recv() => info!("received SIGINT, shutting down"),
            }
            watch_tx.send(true)
        });

        Ok(Self { watch_rx })
    }

    /// Returns a watcher together with the sender that triggers it by sending `true`.
    pub fn manual() -> (watch::Sender<bool>, Self) {
        let (watch_tx, watch_rx) = watch::channel(false);
        (watch_tx, Self { watch_rx })
    }

    pub fn is_triggered(&self) -> bool {
        *self.watch_rx.borrow()
    }

    /// Acquire a new handle which will complete once a shutdown signal is received.
    ///
    /// This handle can be cheaply cloned to be able to gracefully shutdown multiple concurrent
    /// tasks. If the sending side is gone without ever signalling, the handle never completes.
    pub fn handle(&self) -> impl Future<Output = ()> + use<> {
        let mut watch_rx = self.watch_rx.clone();

        async move {
            if watch_rx.wait_for(|triggered| *triggered).await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
