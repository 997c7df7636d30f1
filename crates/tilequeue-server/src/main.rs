#![doc = include_str!("../README.md")]

mod server;

use clap::Parser;
use server::config::{Cli, Command, DispatchConfig, PoolConfig, ServeConfig, WorkerConfig};
use server::dispatch::Dispatcher;
use server::pool::{EchoRenderer, Master, ProcessLauncher, run_worker};
use server::signal::{self, PoolSignal};
use server::telemetry::{TelemetryProviders, init_telemetry};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve(args) => {
            let config = ServeConfig::try_from(args)?;
            let providers = init_telemetry("serve")?;
            finish(providers, serve(config).await)
        }
        Command::Dispatch(args) => {
            let config = DispatchConfig::try_from(args)?;
            let providers = init_telemetry("dispatch")?;
            finish(providers, dispatch(config).await)
        }
        Command::Pool(args) => {
            let config = PoolConfig::try_from(args)?;
            let providers = init_telemetry("pool")?;
            finish(providers, pool(config).await)
        }
        Command::Worker(args) => {
            let config = WorkerConfig::from(args);
            let providers = init_telemetry("worker")?;
            let result = finish(providers, run_worker(config, EchoRenderer).await);
            // Stdin is read on a blocking thread that would hold the runtime
            // open after `main` returns.
            std::process::exit(match result {
                Ok(()) => 0,
                Err(e) => {
                    tracing::error!("Worker failed: {e:#}");
                    1
                }
            })
        }
    }
}

fn finish(providers: TelemetryProviders, result: anyhow::Result<()>) -> anyhow::Result<()> {
    providers.shutdown();
    result
}

/// Master and dispatcher in one process. The dispatcher forwards to the
/// port the workers share.
async fn serve(config: ServeConfig) -> anyhow::Result<()> {
    log_startup_info(&config);

    let shutdown = CancellationToken::new();
    let (pool_tx, pool_rx) = mpsc::unbounded_channel();
    signal::spawn_listener(shutdown.clone(), Some(pool_tx.clone()))?;

    let launcher = ProcessLauncher::current_exe(config.pool.clone())?;
    let master = Master::new(config.pool, launcher);
    let dispatcher = Dispatcher::new(config.dispatch);
    let listener = dispatcher.bind().await?;

    let dispatched = async {
        let result = dispatcher.serve(listener, shutdown).await;
        if result.is_err() {
            // Take the pool down with it.
            let _ = pool_tx.send(PoolSignal::Shutdown);
        }
        result
    };
    let (dispatched, pooled) = tokio::join!(dispatched, master.run(pool_rx));
    dispatched?;
    pooled?;

    tracing::info!("Service shut down successfully");
    Ok(())
}

async fn dispatch(config: DispatchConfig) -> anyhow::Result<()> {
    tracing::info!("Starting dispatcher with {config:?}");
    let shutdown = CancellationToken::new();
    signal::spawn_listener(shutdown.clone(), None)?;

    let dispatcher = Dispatcher::new(config);
    let listener = dispatcher.bind().await?;
    dispatcher.serve(listener, shutdown).await
}

async fn pool(config: PoolConfig) -> anyhow::Result<()> {
    tracing::info!("Starting pool master with {config:?}");
    let (pool_tx, pool_rx) = mpsc::unbounded_channel();
    signal::spawn_listener(CancellationToken::new(), Some(pool_tx))?;

    let launcher = ProcessLauncher::current_exe(config.clone())?;
    Master::new(config, launcher).run(pool_rx).await
}

fn log_startup_info(config: &ServeConfig) {
    if cfg!(debug_assertions) {
        tracing::info!(
            "Starting tile front door on {} with full config: {:#?}",
            config.dispatch.listen_addr,
            config
        );
    } else {
        tracing::info!(
            "Starting tile front door on {} with {} workers on {}",
            config.dispatch.listen_addr,
            config.pool.num_workers,
            config.pool.backend_addr
        );
    }
}
