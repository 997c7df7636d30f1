//! Wire format of the master/worker control channel.
//!
//! One JSON object per line. The master writes [`ControlMessage`]s to a
//! worker's stdin; the worker writes [`WorkerReport`]s to its stdout. Exit
//! notifications are not messages: the master learns about them from the
//! OS.

use crate::{Error, Result};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// Command sent from the master to one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Stop accepting connections, drain, exit.
    Stop,
}

/// Why a worker started draining.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainReason {
    /// The master sent [`ControlMessage::Stop`].
    Stop,
    /// The worker served its configured maximum number of requests.
    MaxRequests,
    /// The control channel closed: the master is gone.
    Orphaned,
}

/// Status report sent from a worker to the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerReport {
    /// The listener is bound and accepting.
    Serving { pid: u32 },
    /// The listener is closed and outstanding responses are finishing.
    Draining { reason: DrainReason, served: u64 },
}

/// Serializes `msg` as a single newline-terminated line.
pub fn encode_line<T: Serialize>(msg: &T) -> Result<String> {
    let mut line = serde_json::to_string(msg).map_err(|e| Error::ControlChannel {
        context: format!("encode: {e}"),
    })?;
    line.push('\n');
    Ok(line)
}

/// Parses one line produced by [`encode_line`].
pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T> {
    serde_json::from_str(line.trim()).map_err(|e| Error::ControlChannel {
        context: format!("decode `{}`: {e}", line.trim()),
    })
}
