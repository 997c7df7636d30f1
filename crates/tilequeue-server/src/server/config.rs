use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use core::num::{NonZeroU64, NonZeroUsize};
use core::time::Duration;
use std::net::SocketAddr;
use tilequeue::{QueueOrder, SchedulerConfig, TypePriority, WorkerId};

/// Command-line interface of the `tilequeue-server` binary.
///
/// Every option can also be given through the environment variable named in
/// its help text, or a `.env` file in the working directory.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "tilequeue-server",
    version,
    about = "Admission-controlling front door and worker pool for a tile renderer"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the dispatcher and supervise the worker pool in one process.
    Serve(ServeArgs),
    /// Run the dispatcher only, in front of an existing backend.
    Dispatch(DispatchOnlyArgs),
    /// Supervise the worker pool only.
    Pool(PoolOnlyArgs),
    /// Run one pool worker. Launched by the pool master.
    #[command(hide = true)]
    Worker(WorkerArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub backend: BackendArgs,
    #[command(flatten)]
    pub drain: DrainArgs,
    #[command(flatten)]
    pub dispatch: DispatchArgs,
    #[command(flatten)]
    pub pool: PoolArgs,
}

#[derive(Args, Debug, Clone)]
pub struct DispatchOnlyArgs {
    #[command(flatten)]
    pub backend: BackendArgs,
    #[command(flatten)]
    pub drain: DrainArgs,
    #[command(flatten)]
    pub dispatch: DispatchArgs,
}

#[derive(Args, Debug, Clone)]
pub struct PoolOnlyArgs {
    #[command(flatten)]
    pub backend: BackendArgs,
    #[command(flatten)]
    pub drain: DrainArgs,
    #[command(flatten)]
    pub pool: PoolArgs,
}

#[derive(Args, Debug, Clone)]
pub struct BackendArgs {
    /// Address of the rendering backend.
    ///
    /// The dispatcher forwards admitted requests here and pool workers bind
    /// it (all workers share the port).
    ///
    /// Environment variable: `BACKEND_ADDR`
    #[arg(long, env = "BACKEND_ADDR", default_value = "127.0.0.1:4001")]
    pub backend_addr: SocketAddr,
}

#[derive(Args, Debug, Clone)]
pub struct DrainArgs {
    /// How long a draining server waits for outstanding responses.
    ///
    /// Environment variable: `DRAIN_TIMEOUT_MS`
    #[arg(long, env = "DRAIN_TIMEOUT_MS", default_value_t = 2_000)]
    pub drain_timeout_ms: u64,

    /// Added to the drain timeout for the master's shutdown deadline and the
    /// spacing between rolling-restart stops.
    ///
    /// Environment variable: `SAFETY_MARGIN_MS`
    #[arg(long, env = "SAFETY_MARGIN_MS", default_value_t = 1_000)]
    pub safety_margin_ms: u64,
}

#[derive(Args, Debug, Clone)]
pub struct DispatchArgs {
    /// Address the dispatcher listens on.
    ///
    /// Environment variable: `LISTEN_ADDR`
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:4000")]
    pub listen_addr: SocketAddr,

    /// Requests a single client may have in flight at the backend.
    ///
    /// Environment variable: `REQUESTS_PER_CLIENT`
    #[arg(long, env = "REQUESTS_PER_CLIENT", default_value_t = 4)]
    pub requests_per_client: usize,

    /// Request types, highest priority first. The last one is the fallback.
    ///
    /// Environment variable: `REQUEST_TYPES`
    #[arg(
        long,
        env = "REQUEST_TYPES",
        value_delimiter = ',',
        default_value = "tile,grid,other"
    )]
    pub request_types: Vec<String>,

    /// Pop order within one request type: `lifo` or `fifo`.
    ///
    /// Environment variable: `QUEUE_ORDER`
    #[arg(long, env = "QUEUE_ORDER", default_value = "lifo")]
    pub queue_order: String,

    /// Soft cap on client sessions kept in memory.
    ///
    /// Environment variable: `SESSION_CAPACITY`
    #[arg(long, env = "SESSION_CAPACITY", default_value_t = 10_000)]
    pub session_capacity: usize,

    /// Idle time after which a client session is forgotten.
    ///
    /// Environment variable: `SESSION_TTL_SECS`
    #[arg(long, env = "SESSION_TTL_SECS", default_value_t = 600)]
    pub session_ttl_secs: u64,

    /// How often idle sessions are swept.
    ///
    /// Environment variable: `SESSION_SWEEP_SECS`
    #[arg(long, env = "SESSION_SWEEP_SECS", default_value_t = 30)]
    pub session_sweep_secs: u64,
}

#[derive(Args, Debug, Clone)]
pub struct PoolArgs {
    /// Number of worker processes.
    ///
    /// Environment variable: `NUM_WORKERS`
    #[arg(long, env = "NUM_WORKERS", default_value_t = num_cpus::get())]
    pub num_workers: usize,

    /// Requests a worker serves before recycling itself. `0` disables it.
    ///
    /// Environment variable: `WORKER_MAX_REQUESTS`
    #[arg(long, env = "WORKER_MAX_REQUESTS", default_value_t = 1_000)]
    pub worker_max_requests: u64,
}

#[derive(Args, Debug, Clone)]
pub struct WorkerArgs {
    #[command(flatten)]
    pub backend: BackendArgs,

    /// How long the worker waits for open connections once it drains.
    #[arg(long, default_value_t = 2_000)]
    pub drain_timeout_ms: u64,

    /// Slot id assigned by the master.
    #[arg(long)]
    pub worker_id: u64,

    #[arg(long, default_value_t = 0)]
    pub worker_max_requests: u64,
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub listen_addr: SocketAddr,
    pub backend_addr: SocketAddr,
    pub scheduler: SchedulerConfig,
    pub types: TypePriority,
    pub sweep_interval: Duration,
    pub drain_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub backend_addr: SocketAddr,
    pub num_workers: usize,
    /// `None` disables self-recycling.
    pub worker_max_requests: Option<NonZeroU64>,
    pub drain_timeout: Duration,
    pub safety_margin: Duration,
}

impl PoolConfig {
    /// Hard deadline for an immediate shutdown, and the spacing between
    /// workers during a rolling restart.
    pub fn stop_interval(&self) -> Duration {
        self.drain_timeout + self.safety_margin
    }

    /// Configuration handed to a worker launched into slot `id`.
    pub const fn worker(&self, id: WorkerId) -> WorkerConfig {
        WorkerConfig {
            id,
            backend_addr: self.backend_addr,
            max_requests: self.worker_max_requests,
            drain_timeout: self.drain_timeout,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub id: WorkerId,
    pub backend_addr: SocketAddr,
    pub max_requests: Option<NonZeroU64>,
    pub drain_timeout: Duration,
}

impl WorkerConfig {
    /// Command-line arguments that reproduce this configuration for the
    /// `worker` subcommand.
    pub fn to_args(&self) -> Vec<String> {
        vec![
            "worker".into(),
            "--worker-id".into(),
            self.id.to_raw().to_string(),
            "--backend-addr".into(),
            self.backend_addr.to_string(),
            "--drain-timeout-ms".into(),
            millis(self.drain_timeout).to_string(),
            "--worker-max-requests".into(),
            self.max_requests.map_or(0, NonZeroU64::get).to_string(),
        ]
    }
}

/// Both halves of `serve`.
#[derive(Debug, Clone)]
pub struct ServeConfig {
    pub dispatch: DispatchConfig,
    pub pool: PoolConfig,
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn dispatch_config(
    backend: &BackendArgs,
    drain: &DrainArgs,
    args: DispatchArgs,
) -> anyhow::Result<DispatchConfig> {
    let Some(requests_per_client) = NonZeroUsize::new(args.requests_per_client) else {
        bail!("REQUESTS_PER_CLIENT must be greater than 0");
    };
    if args.session_capacity == 0 {
        bail!("SESSION_CAPACITY must be greater than 0");
    }
    if args.session_sweep_secs == 0 {
        bail!("SESSION_SWEEP_SECS must be greater than 0");
    }
    if args.listen_addr == backend.backend_addr {
        bail!(
            "LISTEN_ADDR and BACKEND_ADDR are both {}; the dispatcher would forward to itself",
            args.listen_addr
        );
    }

    let order: QueueOrder = args.queue_order.parse().context("QUEUE_ORDER")?;
    let types = TypePriority::new(args.request_types).context("REQUEST_TYPES")?;

    Ok(DispatchConfig {
        listen_addr: args.listen_addr,
        backend_addr: backend.backend_addr,
        scheduler: SchedulerConfig {
            requests_per_client,
            order,
            session_capacity: args.session_capacity,
            session_ttl: Duration::from_secs(args.session_ttl_secs),
        },
        types,
        sweep_interval: Duration::from_secs(args.session_sweep_secs),
        drain_timeout: Duration::from_millis(drain.drain_timeout_ms),
    })
}

fn pool_config(backend: &BackendArgs, drain: &DrainArgs, args: PoolArgs) -> anyhow::Result<PoolConfig> {
    if args.num_workers == 0 {
        bail!("NUM_WORKERS must be greater than 0");
    }
    Ok(PoolConfig {
        backend_addr: backend.backend_addr,
        num_workers: args.num_workers,
        worker_max_requests: NonZeroU64::new(args.worker_max_requests),
        drain_timeout: Duration::from_millis(drain.drain_timeout_ms),
        safety_margin: Duration::from_millis(drain.safety_margin_ms),
    })
}

impl TryFrom<ServeArgs> for ServeConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        Ok(Self {
            dispatch: dispatch_config(&args.backend, &args.drain, args.dispatch)?,
            pool: pool_config(&args.backend, &args.drain, args.pool)?,
        })
    }
}

impl TryFrom<DispatchOnlyArgs> for DispatchConfig {
    type Error = anyhow::Error;

    fn try_from(args: DispatchOnlyArgs) -> Result<Self, Self::Error> {
        dispatch_config(&args.backend, &args.drain, args.dispatch)
    }
}

impl TryFrom<PoolOnlyArgs> for PoolConfig {
    type Error = anyhow::Error;

    fn try_from(args: PoolOnlyArgs) -> Result<Self, Self::Error> {
        pool_config(&args.backend, &args.drain, args.pool)
    }
}

impl From<WorkerArgs> for WorkerConfig {
    fn from(args: WorkerArgs) -> Self {
        Self {
            id: WorkerId::from_raw(args.worker_id),
            backend_addr: args.backend.backend_addr,
            max_requests: NonZeroU64::new(args.worker_max_requests),
            drain_timeout: Duration::from_millis(args.drain_timeout_ms),
        }
    }
}
