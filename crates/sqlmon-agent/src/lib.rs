//! The sqlmon agent daemon.
//!
//! The supervisor owns the lifetime of every internal service: the ticker
//! manager hands out shared tick streams, the log relay ships the agent's
//! own log events, the spooler persists outbound telemetry, the transport
//! keeps the control-plane link alive, and one service manager per internal
//! service (`mm`, `sysconfig`, `qan`) runs the monitors.

pub mod config;
pub mod pidfile;
pub mod relay;
pub mod service;
pub mod spool;
pub mod supervisor;
pub mod ticker;
pub mod transport;

/// Agent version reported by `agent Version` and in the transport hello.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
