#![doc = include_str!("../README.md")]

mod classify;
mod error;
mod fingerprint;
mod id;
pub mod pool;
mod scheduler;
mod time;

pub use crate::classify::*;
pub use crate::error::*;
pub use crate::fingerprint::*;
pub use crate::id::*;
pub use crate::pool::{ExitAction, PoolState, WorkerId, WorkerSlot, WorkerState};
pub use crate::scheduler::*;
pub use crate::time::*;
