//! OS signal handling for the master and dispatcher processes.
//!
//! | Signal            | Effect                                    |
//! |-------------------|-------------------------------------------|
//! | `SIGINT`/`SIGTERM`| immediate shutdown                        |
//! | `SIGHUP`          | rolling restart of the worker pool        |

use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// What the pool master should do in response to a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolSignal {
    Shutdown,
    RollingRestart,
}

/// Installs signal handlers and spawns a task translating them.
///
/// Shutdown signals cancel `shutdown` and, when a pool runs in this process,
/// are forwarded to it. `SIGHUP` is forwarded to the pool or ignored.
pub fn spawn_listener(
    shutdown: CancellationToken,
    pool: Option<mpsc::UnboundedSender<PoolSignal>>,
) -> anyhow::Result<()> {
    #[cfg(unix)]
    let (mut terminate, mut hangup) = {
        use signal::unix::{SignalKind, signal};
        (
            signal(SignalKind::terminate())?,
            signal(SignalKind::hangup())?,
        )
    };

    tokio::spawn(async move {
        #[cfg(unix)]
        let terminated = async {
            terminate.recv().await;
        };
        #[cfg(not(unix))]
        let terminated = std::future::pending::<()>();
        tokio::pin!(terminated);

        loop {
            #[cfg(unix)]
            let hung_up = hangup.recv();
            #[cfg(not(unix))]
            let hung_up = std::future::pending::<Option<()>>();

            let received = tokio::select! {
                res = signal::ctrl_c() => {
                    if let Err(e) = res {
                        tracing::error!("Failed to listen for Ctrl+C: {e}");
                        return;
                    }
                    tracing::info!("Received SIGINT");
                    PoolSignal::Shutdown
                }
                () = &mut terminated => {
                    tracing::info!("Received SIGTERM");
                    PoolSignal::Shutdown
                }
                Some(()) = hung_up => {
                    tracing::info!("Received SIGHUP");
                    PoolSignal::RollingRestart
                }
            };

            match (received, &pool) {
                (PoolSignal::Shutdown, _) => {
                    shutdown.cancel();
                    if let Some(pool) = &pool {
                        let _ = pool.send(PoolSignal::Shutdown);
                    }
                    // Later signals change nothing.
                    return;
                }
                (PoolSignal::RollingRestart, Some(pool)) => {
                    if pool.send(PoolSignal::RollingRestart).is_err() {
                        return;
                    }
                }
                (PoolSignal::RollingRestart, None) => {
                    tracing::info!("No worker pool in this process, ignoring SIGHUP");
                }
            }
        }
    });

    Ok(())
}
