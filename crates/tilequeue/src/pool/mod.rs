//! Worker-pool supervision state.
//!
//! [`PoolState`] is the master's bookkeeping for its fixed-size pool of
//! worker processes. It decides what happens on every worker event (respawn,
//! count down a shutdown, ignore) and which workers receive a stop command
//! during shutdowns and rolling restarts. The master process performs the
//! actual process management; this module only keeps the books.
//!
//! ## Lifecycle of a slot
//!
//! ```text
//! Starting ──► Serving ──► Draining ──► Terminated
//!     └────────────────────────┘
//! ```
//!
//! `Serving → Draining` happens on a stop command or when the worker hits its
//! request limit. Any state can jump to `Terminated` when the process exits.

pub mod control;
mod state;
#[cfg(test)]
mod tests;

pub use control::{ControlMessage, DrainReason, WorkerReport, decode_line, encode_line};
pub use state::*;
