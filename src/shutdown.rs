use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Outcome of joining the workers.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub finished: Vec<&'static str>,
    pub panicked: Vec<&'static str>,
    /// Workers still running when the timeout hit, they were aborted.
    pub timed_out: Vec<&'static str>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.panicked.is_empty() && self.timed_out.is_empty()
    }
}

/// Owns the cancellation token and every worker handle.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    timeout: Duration,
    workers: Vec<(&'static str, JoinHandle<()>)>,
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            timeout,
            workers: Vec::new(),
        }
    }

    /// The shared flag every worker watches.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn register(&mut self, name: &'static str, handle: JoinHandle<()>) {
        self.workers.push((name, handle));
    }

    /// Resolves on SIGINT, SIGTERM, or when something else cancelled the token.
    pub async fn wait_for_signal(&self) {
        tokio::select! {
            _ = self.token.cancelled() => info!("shutdown requested internally"),
            signal = termination_signal() => info!(signal, "received signal"),
        }
    }

    /// Cancels all workers and waits for them, at most `timeout` in total.
    pub async fn shutdown(self) -> ShutdownReport {
        info!(workers = self.workers.len(), timeout = ?self.timeout, "shutting down everything");
        self.token.cancel();

        let deadline = Instant::now() + self.timeout;
        let mut report = ShutdownReport::default();
        for (name, mut handle) in self.workers {
            match timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => report.finished.push(name),
                Ok(Err(e)) => {
                    error!(worker = name, error = %e, "worker panicked");
                    report.panicked.push(name);
                }
                Err(_) => {
                    warn!(worker = name, "worker did not stop in time, abandoning it");
                    handle.abort();
                    report.timed_out.push(name);
                }
            }
        }
        if report.is_clean() {
            info!("shutdown completed");
        }
        report
    }
}

#[cfg(unix)]
async fn termination_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            warn!(error = %e, "couldn't install SIGTERM handler, only SIGINT is handled");
            let _ = tokio::signal::ctrl_c().await;
            return "SIGINT";
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
    }
}

#[cfg(not(unix))]
async fn termination_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "SIGINT"
}
