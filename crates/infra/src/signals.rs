//! Stop-signal handling for the worker.
//!
//! The first SIGINT/SIGTERM asks for a graceful stop; a second one asks to
//! abort the jobs still running.

use std::io;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Listen for stop signals: the first cancels `stop`, the second `force`.
///
/// Must be called from within a Tokio runtime. Abort the returned handle to
/// uninstall.
pub fn install_stop_handler(
    stop: CancellationToken,
    force: CancellationToken,
) -> io::Result<JoinHandle<()>> {
    let signals = Signals::new()?;
    Ok(tokio::spawn(escalate(signals, stop, force)))
}

/// A stream of named stop signals.
#[async_trait]
trait StopSignals: Send {
    async fn recv(&mut self) -> &'static str;
}

async fn escalate<S: StopSignals>(mut signals: S, stop: CancellationToken, force: CancellationToken) {
    let signal = signals.recv().await;
    info!(
        action = "stop_worker_signal",
        signal,
        "received {signal}, stopping worker gracefully (send it again to abort running jobs)"
    );
    stop.cancel();

    let signal = signals.recv().await;
    warn!(
        action = "force_stop_worker",
        signal,
        "received {signal} again, aborting running jobs"
    );
    force.cancel();
}

#[cfg(unix)]
struct Signals {
    sigterm: tokio::signal::unix::Signal,
    sigint: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn new() -> io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};
        Ok(Self {
            sigterm: signal(SignalKind::terminate())?,
            sigint: signal(SignalKind::interrupt())?,
        })
    }
}

#[cfg(unix)]
#[async_trait]
impl StopSignals for Signals {
    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.sigterm.recv() => "SIGTERM",
            _ = self.sigint.recv() => "SIGINT",
        }
    }
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn new() -> io::Result<Self> {
        Ok(Self)
    }
}

#[cfg(not(unix))]
#[async_trait]
impl StopSignals for Signals {
    async fn recv(&mut self) -> &'static str {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
        "CTRL-C"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::sync::mpsc;

    struct Scripted(mpsc::UnboundedReceiver<&'static str>);

    #[async_trait]
    impl StopSignals for Scripted {
        async fn recv(&mut self) -> &'static str {
            match self.0.recv().await {
                Some(signal) => signal,
                None => std::future::pending().await,
            }
        }
    }

    #[tokio::test]
    async fn second_signal_forces_the_stop() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (stop, force) = (CancellationToken::new(), CancellationToken::new());
        let handler = tokio::spawn(escalate(Scripted(rx), stop.clone(), force.clone()));

        tx.send("SIGTERM").unwrap();
        tokio::time::timeout(Duration::from_secs(1), stop.cancelled())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!force.is_cancelled());

        tx.send("SIGINT").unwrap();
        tokio::time::timeout(Duration::from_secs(1), force.cancelled())
            .await
            .unwrap();
        handler.await.unwrap();
    }

    #[tokio::test]
    async fn installs_within_a_runtime() {
        let handler = install_stop_handler(CancellationToken::new(), CancellationToken::new()).unwrap();
        assert!(!handler.is_finished());
        handler.abort();
    }
}
