//! Bridging OS termination signals into a single shutdown action.
//!
//! [`on_signal`] is the generic form: it waits on any trigger future and then
//! runs the callback. [`on_shutdown_signal`] wires it to SIGINT and SIGTERM.

use std::future::Future;

use tokio::task::JoinHandle;
use tracing::info;

use crate::error::MempoolResult;

/// Run `callback` once, after `trigger` resolves.
///
/// Returns immediately; the wait happens on a spawned task whose handle is
/// returned. Aborting the handle before the trigger fires means the callback
/// never runs. Must be called from within a Tokio runtime.
pub fn on_signal<S, F>(trigger: S, callback: F) -> JoinHandle<()>
where
    S: Future<Output = ()> + Send + 'static,
    F: FnOnce() + Send + 'static,
{
    tokio::spawn(async move {
        trigger.await;
        callback();
    })
}

/// Run `callback` once on the first SIGINT or SIGTERM (Ctrl+C elsewhere).
///
/// Signal handlers are installed before this function returns, so a signal
/// delivered right after setup is not lost.
pub fn on_shutdown_signal<F>(callback: F) -> MempoolResult<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    #[cfg(unix)]
    let trigger = {
        use tokio::signal::unix::{signal, SignalKind};

        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;

        async move {
            tokio::select! {
                _ = interrupt.recv() => info!("received SIGINT"),
                _ = terminate.recv() => info!("received SIGTERM"),
            }
        }
    };

    #[cfg(not(unix))]
    let trigger = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received Ctrl+C"),
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        }
    };

    Ok(on_signal(trigger, callback))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn callback_runs_once_trigger_fires() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel::<()>();

        let counter = Arc::clone(&calls);
        let handle = on_signal(
            async move {
                let _ = rx.await;
            },
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );

        tokio::task::yield_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        tx.send(()).unwrap();
        handle.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn callback_does_not_run_without_trigger() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handle = on_signal(std::future::pending::<()>(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn registration_returns_without_blocking() {
        let (tx, rx) = oneshot::channel();
        let handle = on_shutdown_signal(move || {
            let _ = tx.send(());
        })
        .unwrap();

        assert!(!handle.is_finished());
        handle.abort();
        assert!(rx.await.is_err());
    }
}
