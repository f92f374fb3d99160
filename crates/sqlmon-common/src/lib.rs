//! Shared types for the sqlmon agent.
//!
//! Everything that crosses a crate boundary lives here: the command/reply
//! records exchanged with the control plane, the wire envelope they travel
//! in, the telemetry sample envelope, the agent-wide error taxonomy and the
//! status registry used by every long-running task.

pub mod error;
pub mod status;
pub mod task;
pub mod types;
