//! The pool supervisor and the worker role it launches.
//!
//! The master keeps `num_workers` worker processes alive on the shared
//! backend port. It talks to each over the line-based control channel from
//! [`tilequeue::pool`]: commands on the worker's stdin, reports on its
//! stdout. The scheduling decisions live in [`tilequeue::PoolState`]; this
//! module does the process plumbing, timers and signals.

mod launcher;
mod master;
mod render;
mod worker;

pub use launcher::{EventSender, Launcher, ProcessLauncher, WorkerEvent, WorkerHandle};
pub use master::Master;
pub use render::{EchoRenderer, Renderer};
pub use worker::{Worker, run as run_worker};
