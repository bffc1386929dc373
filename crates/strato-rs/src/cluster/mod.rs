//! Multi-process clustering: the supervisor, worker runtime, IPC bus and
//! autoscaler.

pub mod autoscaler;
pub mod ipc;
pub mod supervisor;
pub mod worker;
