//! Error types shared by the dispatcher and the pool supervisor.
//!
//! Every per-request error is terminal for that request only: the dispatcher
//! converts it into a slot release plus a log entry and never lets it unwind
//! further. Process-level errors are handled by the supervisor.
//!
//! ## Error Cases
//! - `BackendUnreachable`: connecting to the rendering backend failed.
//! - `BackendReset`: the backend accepted the connection but the exchange
//!   failed before response headers arrived.
//! - `ClientDisconnected`: the downstream client went away first.
//! - `WorkerCrash`: a worker process exited outside of a shutdown.
//! - `ShutdownDeadlineExceeded`: a drain did not finish in time.
//! - `ControlChannel`: a malformed message on the master/worker channel.
//! - `InvalidConfig`: configuration rejected at startup.
//! - `ServiceShutdown`: a request arrived after the dispatcher stopped.

use http::StatusCode;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Unified error type for the front door.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The backend target refused or could not be reached.
    #[error("Backend unreachable: {context}")]
    BackendUnreachable { context: String },

    /// The connection to the backend broke mid-exchange.
    #[error("Backend reset: {context}")]
    BackendReset { context: String },

    /// The downstream client closed before completion.
    #[error("Client disconnected")]
    ClientDisconnected,

    /// A worker process exited unexpectedly.
    #[error("Worker {worker} crashed: {status}")]
    WorkerCrash { worker: u64, status: String },

    /// A worker or the whole process failed to drain within its deadline.
    #[error("Shutdown deadline of {deadline_ms}ms exceeded")]
    ShutdownDeadlineExceeded { deadline_ms: u64 },

    /// A control-channel line could not be encoded or decoded.
    #[error("Control channel error: {context}")]
    ControlChannel { context: String },

    /// Configuration was rejected.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// The dispatcher is no longer accepting work.
    #[error("Service is shutting down")]
    ServiceShutdown,
}

impl From<&Error> for StatusCode {
    fn from(err: &Error) -> Self {
        match err {
            Error::BackendUnreachable { .. } | Error::BackendReset { .. } => Self::BAD_GATEWAY,
            Error::ShutdownDeadlineExceeded { .. } => Self::GATEWAY_TIMEOUT,
            Error::ServiceShutdown | Error::WorkerCrash { .. } => Self::SERVICE_UNAVAILABLE,
            // Never written to the wire, the client is gone.
            Error::ClientDisconnected => Self::BAD_REQUEST,
            Error::ControlChannel { .. } | Error::InvalidConfig { .. } => {
                Self::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<Error> for StatusCode {
    fn from(err: Error) -> Self {
        Self::from(&err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_errors_surface_as_gateway_errors() {
        let unreachable = Error::BackendUnreachable {
            context: "connection refused".into(),
        };
        let reset = Error::BackendReset {
            context: "connection reset by peer".into(),
        };
        assert_eq!(StatusCode::from(&unreachable), StatusCode::BAD_GATEWAY);
        assert_eq!(StatusCode::from(reset), StatusCode::BAD_GATEWAY);
        assert_eq!(
            StatusCode::from(Error::ServiceShutdown),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn display_carries_context() {
        let err = Error::WorkerCrash {
            worker: 3,
            status: "signal: 9".into(),
        };
        assert_eq!(err.to_string(), "Worker 3 crashed: signal: 9");
    }
}
