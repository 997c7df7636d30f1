pub mod config;
pub mod dispatch;
pub mod pool;
pub mod signal;
pub mod telemetry;
